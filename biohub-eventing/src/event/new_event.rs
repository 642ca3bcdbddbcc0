use super::IntegrationEvent;
use crate::error::EventingResult;
use bon::Builder;
use serde_json::Value;
use std::time::Duration;

/// 待入队的事件（发布侧输入）
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct NewEvent {
    #[builder(into)]
    pub(crate) event_type: String,
    pub(crate) payload: Value,
    #[builder(into)]
    pub(crate) correlation_id: Option<String>,
    #[builder(into)]
    pub(crate) dedup_key: Option<String>,
    /// 发布延迟，默认立即可领取
    #[builder(default)]
    pub(crate) delay: Duration,
}

impl NewEvent {
    /// 由强类型事件构造，关联 ID 取自事件自身
    pub fn from_event<E: IntegrationEvent>(event: &E) -> EventingResult<Self> {
        Ok(Self {
            event_type: E::TYPE.to_string(),
            payload: event.encode()?,
            correlation_id: event.correlation_id(),
            dedup_key: None,
            delay: Duration::ZERO,
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
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

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// 约定的去重键格式：`<事件类型>:<关联 ID>`
pub fn dedup_key(event_type: &str, correlation_id: &str) -> String {
    format!("{event_type}:{correlation_id}")
}
