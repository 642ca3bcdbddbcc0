//! 重试策略（RetryPolicy）
//!
//! 以 `sync_period` 为基数做指数退避：`backoff(n) = base * 2^(n-1)`，
//! 并以 `max_delay` 封顶。`attempts >= max_retries` 视为重试预算耗尽。
//!
use crate::config::EventBusConfig;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// 第 `attempts` 次尝试失败后的等待时长
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&EventBusConfig::default())
    }
}

impl From<&EventBusConfig> for RetryPolicy {
    fn from(config: &EventBusConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.sync_period,
            max_delay: config.max_backoff,
        }
    }
}
