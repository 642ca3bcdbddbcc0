//! 事件总线（EventBus）
//!
//! 持久化队列之上的调度入口：
//! - 发布：序列化后入队，返回时事件已持久化，不会同步调用处理器；
//! - 启动：拉起若干 worker 循环，领取 → 分发 → 标记结果（见 `dispatcher`）；
//! - 结果信号：每个事件处理结束后广播 `Outcome`，供 saga 屏障提前唤醒。
//!
//! 注册表在启动前构建完成并移交给总线，运行期只读。
//!
use crate::config::EventBusConfig;
use crate::dispatcher::{DispatcherHandle, Worker};
use crate::error::EventingResult;
use crate::event::{EventId, IntegrationEvent, NewEvent};
use crate::publisher::EventPublisher;
use crate::registry::HandlerRegistry;
use crate::repository::EventRepository;
use crate::retry::RetryPolicy;
use crate::signal::{Outcome, OutcomeSignal};
use bon::Builder;
use futures_core::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Builder)]
pub struct EventBus {
    repository: Arc<dyn EventRepository>,
    #[builder(into)]
    registry: Arc<HandlerRegistry>,
    #[builder(default)]
    config: EventBusConfig,
    #[builder(default)]
    signal: OutcomeSignal,
}

impl EventBus {
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> EventingResult<EventId> {
        self.publisher().publish(event).await
    }

    pub async fn publish_new(&self, event: NewEvent) -> EventingResult<EventId> {
        self.publisher().publish_new(event).await
    }

    /// 可交给处理器的发布句柄
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.repository.clone())
    }

    /// 订阅处理结果
    pub fn outcomes(&self) -> BoxStream<'static, Outcome> {
        self.signal.subscribe()
    }

    pub fn signal(&self) -> &OutcomeSignal {
        &self.signal
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repository
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    /// 按配置的 worker 数启动
    pub fn start(self: &Arc<Self>, token: &CancellationToken) -> DispatcherHandle {
        self.start_workers(token, self.config.workers)
    }

    /// 启动 `workers` 个独立的轮询循环，直到 `token` 被取消
    pub fn start_workers(
        self: &Arc<Self>,
        token: &CancellationToken,
        workers: usize,
    ) -> DispatcherHandle {
        let token = token.child_token();
        let workers = workers.max(1);

        info!(
            workers,
            batch_size = self.config.batch_size,
            subscribed = self.registry.event_types().count(),
            "event bus starting"
        );

        let tasks = (0..workers)
            .map(|id| {
                let worker = Worker::new(id, self.clone());
                tokio::spawn(worker.run(token.clone()))
            })
            .collect();

        DispatcherHandle::new(token, tasks)
    }
}
