//! 事件（Event）与投递状态机
//!
//! - `EventRecord`：存储层的事件行，内含状态机迁移；
//! - `NewEvent`：发布侧的入队请求；
//! - `IntegrationEvent`：强类型载荷的类型标签、关联 ID 与编解码。

mod integration;
mod new_event;
mod record;
mod status;

pub use integration::IntegrationEvent;
pub use new_event::{NewEvent, dedup_key};
pub use record::EventRecord;
pub use status::EventStatus;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 事件全局唯一标识（UUID v4）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = crate::error::EventingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
