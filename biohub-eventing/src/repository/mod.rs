//! 事件仓储（EventRepository）协议
//!
//! 持久化队列的最小契约：入队、在租约下原子领取一批、标记结果、按类型/状态/关联 ID 查询。
//! `claim_batch` 是整个子系统唯一的正确性关键操作：并发调用者（多个 worker、
//! 多个进程实例）绝不能同时领取同一行。
//!
//! - `InMemoryEventRepository`：参考实现，单互斥临界区保证原子性；
//! - `PgEventRepository`（feature `postgres`）：`FOR UPDATE SKIP LOCKED` + 条件更新。
//!
mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryEventRepository;
#[cfg(feature = "postgres")]
pub use postgres::PgEventRepository;

use crate::error::EventingResult;
use crate::event::{EventId, EventRecord, EventStatus, NewEvent};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// 持久化一条 `Pending` 事件；去重键冲突时返回已有事件的 ID
    async fn enqueue(&self, event: NewEvent) -> EventingResult<EventId>;

    /// 原子领取至多 `batch_size` 条可领取事件并授予 `lease` 时长的租约
    async fn claim_batch(&self, batch_size: usize, lease: Duration)
    -> EventingResult<Vec<EventRecord>>;

    /// 续租；事件已被他人重新领取或已结束时返回 `false`
    async fn renew_lease(&self, id: &EventId, attempt: u32, lease: Duration)
    -> EventingResult<bool>;

    /// 终态成功，幂等。
    ///
    /// 标记类操作都以领取时的 `attempt` 作为 fencing token：事件已被重新领取或取消后，
    /// 旧领取者的结果以 `StaleAttempt`/`InvalidTransition` 拒绝，不会覆盖新持有者。
    async fn mark_completed(&self, id: &EventId, attempt: u32) -> EventingResult<()>;

    /// 可重试失败，返回迁移后的状态（`Pending` 或 `Failed`）
    async fn mark_failed(&self, id: &EventId, attempt: u32, error: &str)
    -> EventingResult<EventStatus>;

    /// 不可重试失败，直接 `Failed`
    async fn mark_failed_permanently(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<()>;

    /// 取消一个未结束的事件（`Pending`/`Running` → `Failed`）；已结束时返回 `false`
    async fn cancel(&self, id: &EventId, reason: &str) -> EventingResult<bool>;

    /// 只读查询（saga 协调与运维使用，不在处理热路径上）
    async fn search(&self, query: &EventQuery) -> EventingResult<Vec<EventRecord>>;

    async fn get(&self, id: &EventId) -> EventingResult<Option<EventRecord>>;
}

#[async_trait]
impl<T> EventRepository for Arc<T>
where
    T: EventRepository + ?Sized,
{
    async fn enqueue(&self, event: NewEvent) -> EventingResult<EventId> {
        (**self).enqueue(event).await
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> EventingResult<Vec<EventRecord>> {
        (**self).claim_batch(batch_size, lease).await
    }

    async fn renew_lease(
        &self,
        id: &EventId,
        attempt: u32,
        lease: Duration,
    ) -> EventingResult<bool> {
        (**self).renew_lease(id, attempt, lease).await
    }

    async fn mark_completed(&self, id: &EventId, attempt: u32) -> EventingResult<()> {
        (**self).mark_completed(id, attempt).await
    }

    async fn mark_failed(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<EventStatus> {
        (**self).mark_failed(id, attempt, error).await
    }

    async fn mark_failed_permanently(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<()> {
        (**self).mark_failed_permanently(id, attempt, error).await
    }

    async fn cancel(&self, id: &EventId, reason: &str) -> EventingResult<bool> {
        (**self).cancel(id, reason).await
    }

    async fn search(&self, query: &EventQuery) -> EventingResult<Vec<EventRecord>> {
        (**self).search(query).await
    }

    async fn get(&self, id: &EventId) -> EventingResult<Option<EventRecord>> {
        (**self).get(id).await
    }
}

/// 查询条件；空列表表示不过滤该维度
#[derive(Clone, Debug, Default, Builder)]
pub struct EventQuery {
    #[builder(default)]
    event_types: Vec<String>,
    #[builder(default)]
    statuses: Vec<EventStatus>,
    #[builder(into)]
    correlation_id: Option<String>,
}

impl EventQuery {
    /// 同一关联 ID 下、指定类型与状态的事件
    pub fn correlated<T, S>(correlation_id: impl Into<String>, event_types: T, statuses: S) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        S: IntoIterator<Item = EventStatus>,
    {
        Self {
            event_types: event_types.into_iter().map(Into::into).collect(),
            statuses: statuses.into_iter().collect(),
            correlation_id: Some(correlation_id.into()),
        }
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    pub fn statuses(&self) -> &[EventStatus] {
        &self.statuses
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        (self.event_types.is_empty() || self.event_types.iter().any(|t| t == event.event_type()))
            && (self.statuses.is_empty() || self.statuses.contains(&event.status()))
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| event.correlation_id() == Some(c))
    }
}
