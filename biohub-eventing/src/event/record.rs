//! 事件持久化模型（EventRecord）
//!
//! 不可变的事实（类型 + 载荷 + 关联 ID）与可变的投递状态（状态、尝试次数、租约）。
//! 状态机迁移只在这里实现一次，所有仓储实现共用，以保证终态不可逆。
//!
use super::{EventId, EventStatus, NewEvent};
use crate::clock::delta;
use crate::error::{EventingError, EventingResult};
use crate::retry::RetryPolicy;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const LEASE_EXHAUSTED: &str = "lease expired after final attempt";
const BUDGET_EXHAUSTED: &str = "retry budget exhausted";

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct EventRecord {
    /// 事件唯一标识，入队时分配
    id: EventId,
    /// 事件类型，用于路由到处理器
    event_type: String,
    /// 事件载荷（按类型约定的 JSON 对象）
    payload: Value,
    /// 关联 ID（saga 以此聚合同一批兄弟事件）
    correlation_id: Option<String>,
    /// 去重键：相同键的重复入队不会产生新事件
    dedup_key: Option<String>,
    status: EventStatus,
    /// 已领取（claim）次数
    attempts: u32,
    /// 最早可被领取的时间（发布延迟与重试退避）
    available_at: DateTime<Utc>,
    /// 租约到期时间，仅 `Running` 时有意义
    lease_expiry: Option<DateTime<Utc>>,
    /// 最近一次领取时间
    claimed_at: Option<DateTime<Utc>>,
    /// 最近一次失败原因
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// 以 `Pending` 状态创建新事件，`available_at = now + delay`
    pub fn pending(event: NewEvent, now: DateTime<Utc>) -> Self {
        let NewEvent {
            event_type,
            payload,
            correlation_id,
            dedup_key,
            delay,
        } = event;

        Self {
            id: EventId::new(),
            event_type,
            payload,
            correlation_id,
            dedup_key,
            status: EventStatus::Pending,
            attempts: 0,
            available_at: now + delta(delay),
            lease_expiry: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn dedup_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn available_at(&self) -> DateTime<Utc> {
        self.available_at
    }

    pub fn lease_expiry(&self) -> Option<DateTime<Utc>> {
        self.lease_expiry
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// 领取资格：到期的 `Pending`，或租约已过期（被遗弃）的 `Running`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Pending => self.available_at <= now,
            EventStatus::Running => self.lease_expiry.is_some_and(|expiry| expiry < now),
            EventStatus::Completed | EventStatus::Failed => false,
        }
    }

    /// 领取事件：置为 `Running`、递增尝试次数并授予租约。
    ///
    /// 若重试预算已耗尽（例如最后一次尝试的租约过期），事件直接转为 `Failed`，
    /// 返回 `false`，从而保证 `Pending`/`Running` 状态下 `attempts <= max_retries`。
    pub fn claim(&mut self, now: DateTime<Utc>, lease: Duration, policy: &RetryPolicy) -> bool {
        if !self.is_claimable(now) {
            return false;
        }

        if policy.is_exhausted(self.attempts) {
            let reason = match self.status {
                EventStatus::Running => LEASE_EXHAUSTED,
                _ => BUDGET_EXHAUSTED,
            };
            self.status = EventStatus::Failed;
            self.lease_expiry = None;
            self.last_error = Some(reason.to_string());
            self.updated_at = now;
            return false;
        }

        self.status = EventStatus::Running;
        self.attempts += 1;
        self.claimed_at = Some(now);
        self.lease_expiry = Some(now + delta(lease));
        self.updated_at = now;
        true
    }

    /// 续租：仅当事件仍由 `attempt` 这次领取持有时成功（attempt 充当 fencing token）
    pub fn renew_lease(&mut self, attempt: u32, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.status != EventStatus::Running || self.attempts != attempt {
            return false;
        }
        self.lease_expiry = Some(now + delta(lease));
        self.updated_at = now;
        true
    }

    /// 标记成功。重复标记为 no-op（返回 `Ok(false)`）；`Failed` 不可再迁移。
    /// `attempt` 必须是当前这次领取，否则返回 `StaleAttempt`。
    pub fn complete(&mut self, attempt: u32, now: DateTime<Utc>) -> EventingResult<bool> {
        self.fence(attempt)?;
        match self.status {
            EventStatus::Completed => Ok(false),
            EventStatus::Pending | EventStatus::Failed => Err(self.invalid(EventStatus::Completed)),
            EventStatus::Running => {
                self.status = EventStatus::Completed;
                self.lease_expiry = None;
                self.updated_at = now;
                Ok(true)
            }
        }
    }

    /// 标记一次可重试的失败：预算耗尽则 `Failed`，否则按退避回到 `Pending`
    pub fn fail(
        &mut self,
        attempt: u32,
        now: DateTime<Utc>,
        error: &str,
        policy: &RetryPolicy,
    ) -> EventingResult<EventStatus> {
        self.fence(attempt)?;
        if self.status != EventStatus::Running {
            return Err(self.invalid(EventStatus::Failed));
        }

        self.last_error = Some(error.to_string());
        self.lease_expiry = None;
        self.updated_at = now;

        if policy.is_exhausted(self.attempts) {
            self.status = EventStatus::Failed;
        } else {
            self.status = EventStatus::Pending;
            self.available_at = now + delta(policy.backoff(self.attempts));
        }

        Ok(self.status)
    }

    /// 不可重试的失败：直接进入 `Failed`
    pub fn fail_permanently(
        &mut self,
        attempt: u32,
        now: DateTime<Utc>,
        error: &str,
    ) -> EventingResult<()> {
        self.fence(attempt)?;
        if self.status != EventStatus::Running {
            return Err(self.invalid(EventStatus::Failed));
        }

        self.status = EventStatus::Failed;
        self.last_error = Some(error.to_string());
        self.lease_expiry = None;
        self.updated_at = now;
        Ok(())
    }

    /// 外部取消（不经过领取者）：未结束的事件直接 `Failed`，已结束返回 `false`。
    /// 正在运行的领取者之后的续租与标记都会被拒绝。
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = EventStatus::Failed;
        self.last_error = Some(reason.to_string());
        self.lease_expiry = None;
        self.updated_at = now;
        true
    }

    fn fence(&self, attempt: u32) -> EventingResult<()> {
        if self.attempts != attempt {
            return Err(EventingError::StaleAttempt {
                id: self.id,
                attempt,
                current: self.attempts,
            });
        }
        Ok(())
    }

    fn invalid(&self, to: EventStatus) -> EventingError {
        EventingError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}
