//! 事件处理器（EventHandler）
//!
//! 处理器按事件类型订阅，收到的是解码后的强类型载荷与一次投递的元信息（`Delivery`）。
//! 返回 `HandlerError` 时需区分两类失败：
//! - `Transient`：可重试，交由退避策略在之后重新投递；
//! - `Permanent`：重试也不会成功（例如载荷无法解码、业务前置条件不满足），直接判定失败。
//!
use crate::error::EventingError;
use crate::event::{EventId, EventRecord, IntegrationEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// 一次投递的元信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub event_id: EventId,
    pub event_type: String,
    pub correlation_id: Option<String>,
    /// 第几次领取（从 1 开始）
    pub attempt: u32,
}

impl From<&EventRecord> for Delivery {
    fn from(record: &EventRecord) -> Self {
        Self {
            event_id: record.id(),
            event_type: record.event_type().to_string(),
            correlation_id: record.correlation_id().map(str::to_string),
            attempt: record.attempts(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// 处理器错误
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerError {
    kind: ErrorKind,
    reason: String,
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Transient => write!(f, "{}", self.reason),
            ErrorKind::Permanent => write!(f, "permanent: {}", self.reason),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }
}

impl From<EventingError> for HandlerError {
    fn from(err: EventingError) -> Self {
        Self::transient(err.to_string())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// 强类型事件处理器
#[async_trait]
pub trait EventHandler<E: IntegrationEvent>: Send + Sync {
    /// 处理器名称（日志与审计使用）
    fn handler_name(&self) -> &str;

    async fn handle(&self, delivery: &Delivery, event: E) -> HandlerResult;
}

#[async_trait]
impl<E, T> EventHandler<E> for Arc<T>
where
    E: IntegrationEvent,
    T: EventHandler<E> + ?Sized,
{
    fn handler_name(&self) -> &str {
        (**self).handler_name()
    }

    async fn handle(&self, delivery: &Delivery, event: E) -> HandlerResult {
        (**self).handle(delivery, event).await
    }
}

/// 直接消费原始 JSON 载荷的处理器（无需强类型，例如审计、转发）
#[async_trait]
pub trait RawEventHandler: Send + Sync {
    fn handler_name(&self) -> &str;

    async fn handle_raw(&self, delivery: &Delivery, payload: &Value) -> HandlerResult;
}
