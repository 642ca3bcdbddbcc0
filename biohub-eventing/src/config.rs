//! 事件总线与 saga 屏障的配置
//!
//! 所有取值均可从环境变量覆盖（`from_env`），缺省值仅适用于开发环境。
//! 时长类变量以毫秒为单位。
//!
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ENV_MAX_RETRIES: &str = "BIOHUB_BUS_MAX_RETRIES";
pub const ENV_SYNC_PERIOD_MS: &str = "BIOHUB_BUS_SYNC_PERIOD_MS";
pub const ENV_BATCH_SIZE: &str = "BIOHUB_BUS_BATCH_SIZE";
pub const ENV_WORKERS: &str = "BIOHUB_BUS_WORKERS";
pub const ENV_DEQUEUE_TIMEOUT_MS: &str = "BIOHUB_BUS_DEQUEUE_TIMEOUT_MS";
pub const ENV_RUNNING_TIMEOUT_MS: &str = "BIOHUB_BUS_RUNNING_TIMEOUT_MS";
pub const ENV_MAX_BACKOFF_MS: &str = "BIOHUB_BUS_MAX_BACKOFF_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "BIOHUB_SAGA_POLL_INTERVAL_MS";
pub const ENV_DEADLINE_MS: &str = "BIOHUB_SAGA_DEADLINE_MS";

/// 配置加载/校验错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// 事件总线配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// 单个事件允许的最大领取次数
    pub max_retries: u32,
    /// 空轮询后的休眠间隔，同时是重试退避的基数
    pub sync_period: Duration,
    /// 单次领取的最大事件数
    pub batch_size: usize,
    /// 并发 worker 数
    pub workers: usize,
    /// 每次领取/续租授予的租约时长
    pub dequeue_timeout: Duration,
    /// 单次尝试的处理上限，超时即放弃并记一次失败
    pub running_timeout: Duration,
    /// 重试退避上限
    pub max_backoff: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            sync_period: Duration::from_secs(1),
            batch_size: 16,
            workers: 4,
            dequeue_timeout: Duration::from_secs(30),
            running_timeout: Duration::from_secs(5 * 60),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl EventBusConfig {
    /// 从环境变量加载，未设置的项使用缺省值，并执行校验
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_retries: env_or(ENV_MAX_RETRIES, defaults.max_retries)?,
            sync_period: env_millis_or(ENV_SYNC_PERIOD_MS, defaults.sync_period)?,
            batch_size: env_or(ENV_BATCH_SIZE, defaults.batch_size)?,
            workers: env_or(ENV_WORKERS, defaults.workers)?,
            dequeue_timeout: env_millis_or(ENV_DEQUEUE_TIMEOUT_MS, defaults.dequeue_timeout)?,
            running_timeout: env_millis_or(ENV_RUNNING_TIMEOUT_MS, defaults.running_timeout)?,
            max_backoff: env_millis_or(ENV_MAX_BACKOFF_MS, defaults.max_backoff)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Validation("workers must be > 0".into()));
        }
        if self.sync_period.is_zero() {
            return Err(ConfigError::Validation("sync_period must be > 0".into()));
        }
        if self.dequeue_timeout.is_zero() || self.running_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "dequeue_timeout and running_timeout must be > 0".into(),
            ));
        }
        if self.max_backoff < self.sync_period {
            return Err(ConfigError::Validation(
                "max_backoff must be >= sync_period".into(),
            ));
        }
        Ok(())
    }
}

/// 完成屏障（saga 轮询）配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// 两次查询之间的间隔
    pub poll_interval: Duration,
    /// 硬性截止时长
    pub deadline: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(30 * 60),
        }
    }
}

impl BarrierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            poll_interval: env_millis_or(ENV_POLL_INTERVAL_MS, defaults.poll_interval)?,
            deadline: env_millis_or(ENV_DEADLINE_MS, defaults.deadline)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll_interval must be > 0".into()));
        }
        if self.deadline < self.poll_interval {
            return Err(ConfigError::Validation(
                "deadline must be >= poll_interval".into(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    parse_or(var, std::env::var(var).ok(), default)
}

fn env_millis_or(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    let fallback = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(var, std::env::var(var).ok(), fallback).map(Duration::from_millis)
}

fn parse_or<T: std::str::FromStr>(
    var: &str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
    }
}
