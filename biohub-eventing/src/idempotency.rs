//! 幂等辅助（Idempotency）
//!
//! 投递语义为“至少一次”：领取后处理成功但未来得及标记完成、或租约过期被重新领取，
//! 都会让同一事件再次到达处理器。`Idempotent` 包装器按 `(处理器名, 事件 ID)`
//! 记录成功处理过的投递，重复投递直接跳过。
//!
//! `ProcessedLog` 的默认实现仅在进程内有效；跨进程去重需要处理器自身的业务幂等
//! （例如 upsert、“已存在则跳过”）或持久化的 `ProcessedLog` 实现。
//!
use crate::event::{EventId, IntegrationEvent};
use crate::handler::{Delivery, EventHandler, HandlerResult};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::debug;

/// 已处理投递的记录
#[async_trait]
pub trait ProcessedLog: Send + Sync {
    async fn contains(&self, handler: &str, event_id: &EventId) -> bool;

    async fn record(&self, handler: &str, event_id: &EventId);
}

#[derive(Debug, Default)]
pub struct InMemoryProcessedLog {
    seen: DashSet<(String, EventId)>,
}

impl InMemoryProcessedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[async_trait]
impl ProcessedLog for InMemoryProcessedLog {
    async fn contains(&self, handler: &str, event_id: &EventId) -> bool {
        self.seen.contains(&(handler.to_string(), *event_id))
    }

    async fn record(&self, handler: &str, event_id: &EventId) {
        self.seen.insert((handler.to_string(), *event_id));
    }
}

/// 为任意处理器加上按事件 ID 去重的能力
pub struct Idempotent<H> {
    inner: H,
    log: Arc<dyn ProcessedLog>,
}

impl<H> Idempotent<H> {
    pub fn new(inner: H, log: Arc<dyn ProcessedLog>) -> Self {
        Self { inner, log }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<E, H> EventHandler<E> for Idempotent<H>
where
    E: IntegrationEvent,
    H: EventHandler<E>,
{
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    async fn handle(&self, delivery: &Delivery, event: E) -> HandlerResult {
        let name = self.inner.handler_name();
        if self.log.contains(name, &delivery.event_id).await {
            debug!(
                handler = name,
                event_id = %delivery.event_id,
                attempt = delivery.attempt,
                "duplicate delivery skipped"
            );
            return Ok(());
        }

        self.inner.handle(delivery, event).await?;
        self.log.record(name, &delivery.event_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Purge {
        workspace_id: String,
    }

    impl IntegrationEvent for Purge {
        const TYPE: &'static str = "WorkspaceDeleted";
    }

    struct Flaky {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl EventHandler<Purge> for Flaky {
        fn handler_name(&self) -> &str {
            "purge-notebooks"
        }

        async fn handle(&self, _delivery: &Delivery, _event: Purge) -> HandlerResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(HandlerError::transient("storage busy"));
            }
            Ok(())
        }
    }

    fn delivery(id: EventId, attempt: u32) -> Delivery {
        Delivery {
            event_id: id,
            event_type: Purge::TYPE.into(),
            correlation_id: Some("w1".into()),
            attempt,
        }
    }

    fn purge() -> Purge {
        Purge {
            workspace_id: "w1".into(),
        }
    }

    #[tokio::test]
    async fn repeated_delivery_runs_inner_once() {
        let log = Arc::new(InMemoryProcessedLog::new());
        let handler = Idempotent::new(
            Flaky {
                calls: AtomicUsize::new(0),
                fail_first: false,
            },
            log.clone(),
        );
        let id = EventId::new();

        handler.handle(&delivery(id, 1), purge()).await.unwrap();
        handler.handle(&delivery(id, 2), purge()).await.unwrap();

        assert_eq!(handler.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_is_not_recorded() {
        let log = Arc::new(InMemoryProcessedLog::new());
        let handler = Idempotent::new(
            Flaky {
                calls: AtomicUsize::new(0),
                fail_first: true,
            },
            log.clone(),
        );
        let id = EventId::new();

        assert!(handler.handle(&delivery(id, 1), purge()).await.is_err());
        assert!(log.is_empty());
        handler.handle(&delivery(id, 2), purge()).await.unwrap();
        assert_eq!(handler.inner().calls.load(Ordering::SeqCst), 2);
    }
}
