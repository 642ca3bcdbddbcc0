//! 事件子系统统一错误定义
//!
//! 聚焦序列化、仓储、状态机迁移与配置等最小必要集合，
//! 便于在各实现层统一转换为 `EventingError`。
//!
use crate::config::ConfigError;
use crate::event::{EventId, EventStatus};
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventingError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },

    // --- 仓储/持久化 ---
    #[error("event repository error: {reason}")]
    Repository { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("event not found: {id}")]
    NotFound { id: EventId },

    // --- 状态机 ---
    #[error("invalid transition: event={id}, from={from}, to={to}")]
    InvalidTransition {
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    },
    /// 调用方持有的领取已被接管（租约过期后重新领取）
    #[error("stale attempt: event={id}, attempt={attempt}, current={current}")]
    StaleAttempt { id: EventId, attempt: u32, current: u32 },

    // --- 配置 ---
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EventingError {
    pub fn repository(reason: impl Into<String>) -> Self {
        Self::Repository {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type EventingResult<T> = Result<T, EventingError>;

// 允许在基础设施层直接使用 `?` 将 sqlx 错误转换为 EventingError
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for EventingError {
    fn from(err: sqlx::Error) -> Self {
        EventingError::Database {
            reason: err.to_string(),
        }
    }
}

impl From<uuid::Error> for EventingError {
    fn from(err: uuid::Error) -> Self {
        EventingError::Parse {
            reason: err.to_string(),
        }
    }
}
