//! 事件发布器（EventPublisher）
//!
//! 仅持有仓储的轻量句柄，可克隆后交给处理器用于扇出发布，
//! 避免处理器反向持有总线。发布只负责持久化，返回时事件已落库；
//! 处理器永远不会在发布调用中被同步执行。
//!
use crate::error::EventingResult;
use crate::event::{EventId, IntegrationEvent, NewEvent, dedup_key};
use crate::repository::EventRepository;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct EventPublisher {
    repository: Arc<dyn EventRepository>,
}

impl EventPublisher {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self { repository }
    }

    /// 发布强类型事件，立即可领取
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> EventingResult<EventId> {
        self.publish_new(NewEvent::from_event(event)?).await
    }

    /// 延迟发布
    pub async fn publish_delayed<E: IntegrationEvent>(
        &self,
        event: &E,
        delay: Duration,
    ) -> EventingResult<EventId> {
        self.publish_new(NewEvent::from_event(event)?.with_delay(delay))
            .await
    }

    /// 以 `<类型>:<关联 ID>` 为去重键发布；同一关联下重复发布返回已有事件。
    /// 事件没有关联 ID 时退化为普通发布。
    pub async fn publish_once<E: IntegrationEvent>(&self, event: &E) -> EventingResult<EventId> {
        let mut new_event = NewEvent::from_event(event)?;
        if let Some(correlation_id) = event.correlation_id() {
            new_event = new_event.with_dedup_key(dedup_key(E::TYPE, &correlation_id));
        }
        self.publish_new(new_event).await
    }

    pub async fn publish_new(&self, event: NewEvent) -> EventingResult<EventId> {
        let event_type = event.event_type().to_string();
        let id = self.repository.enqueue(event).await?;
        debug!(event_id = %id, event_type = %event_type, "event enqueued");
        Ok(id)
    }

    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repository
    }
}
