//! 调度循环（Worker）与运行句柄（DispatcherHandle）
//!
//! 每个 worker 独立运行，直到取消：
//! 1. 以 `dequeue_timeout` 为租约领取至多 `batch_size` 个事件；
//! 2. 逐个分发给该类型的全部订阅者，单次尝试受 `running_timeout` 约束，
//!    期间后台按租约一半的间隔续租；
//! 3. 成功 → `mark_completed`；可重试失败 → `mark_failed`；不可重试 → `mark_failed_permanently`；
//! 4. 领取为空或领取出错时休眠 `sync_period`。
//!
//! 处理器错误与 panic 都不会中断循环；标记结果失败只记日志，事件会在租约过期后被重新领取。
//! 续租发现租约已被接管（重新领取或被取消）时，本次尝试的结果直接丢弃，不再标记。
//! 取消只在两次领取之间与休眠期间生效，已领取的批次会处理完毕。
//!
use crate::bus::EventBus;
use crate::event::{EventRecord, EventStatus};
use crate::handler::{Delivery, HandlerError, HandlerResult};
use crate::registry::Subscription;
use crate::signal::Outcome;
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct Worker {
    id: usize,
    bus: Arc<EventBus>,
}

impl Worker {
    pub(crate) fn new(id: usize, bus: Arc<EventBus>) -> Self {
        Self { id, bus }
    }

    pub(crate) async fn run(self, token: CancellationToken) {
        let config = *self.bus.config();
        debug!(worker = self.id, "worker started");

        while !token.is_cancelled() {
            let idle = match self
                .bus
                .repository()
                .claim_batch(config.batch_size, config.dequeue_timeout)
                .await
            {
                Ok(batch) if batch.is_empty() => true,
                Ok(batch) => {
                    debug!(worker = self.id, claimed = batch.len(), "batch claimed");
                    for event in batch {
                        self.process(event).await;
                    }
                    false
                }
                Err(err) => {
                    warn!(worker = self.id, error = %err, "claim failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.sync_period) => {}
                }
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, event: EventRecord) {
        let delivery = Delivery::from(&event);
        let subscriptions = self.bus.registry().handlers_for(event.event_type());

        let attempt = if subscriptions.is_empty() {
            debug!(
                worker = self.id,
                event_id = %delivery.event_id,
                event_type = %delivery.event_type,
                "no subscriber, completing"
            );
            Attempt::Finished(Ok(()))
        } else {
            self.invoke(&delivery, event.payload(), subscriptions).await
        };

        let result = match attempt {
            Attempt::Finished(result) => result,
            Attempt::LeaseLost(result) => {
                warn!(
                    worker = self.id,
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    attempt = delivery.attempt,
                    ok = result.is_ok(),
                    "lease lost during handling, outcome discarded"
                );
                return;
            }
        };

        if let Some(status) = self.settle(&delivery, result).await {
            self.bus.signal().notify(Outcome {
                event_id: delivery.event_id,
                event_type: delivery.event_type,
                correlation_id: delivery.correlation_id,
                status,
            });
        }
    }

    /// 并发调用全部订阅者，同时续租；超过 `running_timeout` 即放弃本次尝试
    async fn invoke(
        &self,
        delivery: &Delivery,
        payload: &Value,
        subscriptions: &[Subscription],
    ) -> Attempt {
        let running_timeout = self.bus.config().running_timeout;
        let calls = subscriptions.iter().map(|sub| {
            let name = sub.name().to_string();
            let call = AssertUnwindSafe(sub.call(delivery.clone(), payload.clone())).catch_unwind();
            async move {
                match call.await {
                    Ok(result) => result.map_err(|e| (name, e)),
                    Err(panic) => Err((
                        name,
                        HandlerError::transient(format!("handler panicked: {}", panic_message(&*panic))),
                    )),
                }
            }
        });

        let work = tokio::time::timeout(running_timeout, join_all(calls));
        tokio::pin!(work);
        let heartbeat = self.heartbeat(delivery);
        tokio::pin!(heartbeat);

        let (finished, lease_held) = tokio::select! {
            biased;
            finished = &mut work => (finished, true),
            () = &mut heartbeat => (work.await, false),
        };

        let result = match finished {
            Ok(results) => combine(results),
            Err(_) => Err(HandlerError::transient(format!(
                "handler exceeded running timeout of {running_timeout:?}"
            ))),
        };
        if lease_held {
            Attempt::Finished(result)
        } else {
            Attempt::LeaseLost(result)
        }
    }

    /// 周期续租；租约被他人接管时停止续租（处理器继续运行到结束或超时）
    async fn heartbeat(&self, delivery: &Delivery) {
        let lease = self.bus.config().dequeue_timeout;
        let period = (lease / 2).max(Duration::from_millis(1));

        loop {
            tokio::time::sleep(period).await;
            match self
                .bus
                .repository()
                .renew_lease(&delivery.event_id, delivery.attempt, lease)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        worker = self.id,
                        event_id = %delivery.event_id,
                        attempt = delivery.attempt,
                        "lease lost, no longer renewing"
                    );
                    return;
                }
                Err(err) => {
                    warn!(worker = self.id, event_id = %delivery.event_id, error = %err, "lease renewal failed");
                }
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, result: HandlerResult) -> Option<EventStatus> {
        let repository = self.bus.repository();
        let id = &delivery.event_id;
        let attempt = delivery.attempt;

        let settled = match &result {
            Ok(()) => repository
                .mark_completed(id, attempt)
                .await
                .map(|_| EventStatus::Completed),
            Err(e) if e.is_permanent() => repository
                .mark_failed_permanently(id, attempt, e.reason())
                .await
                .map(|_| EventStatus::Failed),
            Err(e) => repository.mark_failed(id, attempt, e.reason()).await,
        };

        let status = match settled {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    worker = self.id,
                    event_id = %id,
                    event_type = %delivery.event_type,
                    error = %err,
                    "failed to record outcome, event will be redelivered after lease expiry"
                );
                return None;
            }
        };

        match (&result, status) {
            (Ok(()), _) => info!(
                worker = self.id,
                event_id = %id,
                event_type = %delivery.event_type,
                correlation_id = delivery.correlation_id.as_deref().unwrap_or_default(),
                attempt = delivery.attempt,
                "event completed"
            ),
            (Err(e), EventStatus::Pending) => warn!(
                worker = self.id,
                event_id = %id,
                event_type = %delivery.event_type,
                attempt = delivery.attempt,
                error = %e,
                "handler failed, will retry"
            ),
            (Err(e), _) => error!(
                worker = self.id,
                event_id = %id,
                event_type = %delivery.event_type,
                correlation_id = delivery.correlation_id.as_deref().unwrap_or_default(),
                attempt = delivery.attempt,
                error = %e,
                "event failed"
            ),
        }

        Some(status)
    }
}

/// 一次尝试的结局
enum Attempt {
    Finished(HandlerResult),
    /// 处理期间租约被接管，结果不得再写回
    LeaseLost(HandlerResult),
}

/// 多个订阅者的结果合并：任一不可重试则整体不可重试
fn combine(results: Vec<Result<(), (String, HandlerError)>>) -> HandlerResult {
    let failures: Vec<(String, HandlerError)> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        return Ok(());
    }

    let permanent = failures.iter().any(|(_, e)| e.is_permanent());
    let reason = failures
        .iter()
        .map(|(name, e)| format!("{name}: {}", e.reason()))
        .collect::<Vec<_>>()
        .join("; ");

    Err(if permanent {
        HandlerError::permanent(reason)
    } else {
        HandlerError::transient(reason)
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// 调度运行句柄：用于优雅关闭与等待 worker 结束
pub struct DispatcherHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub(crate) fn new(token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { token, tasks }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            if let Err(err) = t.await {
                error!(error = %err, "worker task aborted");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
