use crate::error::EventingResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 跨限界上下文传递的事件载荷需要满足的能力边界
///
/// `TYPE` 为稳定的类型标签（存储与路由使用，不随重构变化）；
/// `correlation_id` 用于把同一 saga 的兄弟事件归到一起。
/// 载荷仅允许追加字段式演进。
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    fn correlation_id(&self) -> Option<String> {
        None
    }

    fn encode(&self) -> EventingResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn decode(payload: &Value) -> EventingResult<Self>
    where
        Self: Sized,
    {
        Ok(serde_json::from_value(payload.clone())?)
    }
}
