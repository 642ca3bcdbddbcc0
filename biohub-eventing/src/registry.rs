//! 处理器注册表（HandlerRegistry）
//!
//! 以事件类型为键保存订阅者。强类型处理器在注册时被擦除为统一的
//! `Fn(Delivery, Value) -> BoxFuture` 形式，由注册闭包负责载荷解码；
//! 解码失败属于不可重试错误。
//!
//! 注册表在总线启动前构建完成，之后只读共享（`Arc<HandlerRegistry>`）。
//!
use crate::event::IntegrationEvent;
use crate::handler::{Delivery, EventHandler, HandlerError, HandlerResult, RawEventHandler};
use futures_core::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type HandlerFn = Arc<dyn Fn(Delivery, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// 单个订阅：处理器名称 + 擦除后的调用入口
#[derive(Clone)]
pub struct Subscription {
    name: String,
    call: HandlerFn,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, delivery: Delivery, payload: Value) -> BoxFuture<'static, HandlerResult> {
        (self.call)(delivery, payload)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Vec<Subscription>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅强类型事件 `E`
    pub fn subscribe<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: IntegrationEvent,
        H: EventHandler<E> + 'static,
    {
        let handler = Arc::new(handler);
        let name = handler.handler_name().to_string();
        let call = erase(move |delivery: Delivery, payload: Value| {
            let handler = handler.clone();
            async move {
                let event = E::decode(&payload).map_err(|e| {
                    HandlerError::permanent(format!("undecodable {} payload: {e}", E::TYPE))
                })?;
                handler.handle(&delivery, event).await
            }
        });

        self.push(E::TYPE, name, call)
    }

    /// 订阅原始载荷
    pub fn subscribe_raw(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn RawEventHandler>,
    ) -> &mut Self {
        let name = handler.handler_name().to_string();
        let call = erase(move |delivery: Delivery, payload: Value| {
            let handler = handler.clone();
            async move { handler.handle_raw(&delivery, &payload).await }
        });

        self.push(event_type, name, call)
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Subscription] {
        self.by_type.get(event_type).map_or(&[], Vec::as_slice)
    }

    pub fn is_subscribed(&self, event_type: &str) -> bool {
        !self.handlers_for(event_type).is_empty()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }

    fn push(&mut self, event_type: impl Into<String>, name: String, call: HandlerFn) -> &mut Self {
        self.by_type
            .entry(event_type.into())
            .or_default()
            .push(Subscription { name, call });
        self
    }
}

fn erase<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Delivery, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |delivery: Delivery, payload: Value| -> BoxFuture<'static, HandlerResult> {
            Box::pin(f(delivery, payload))
        },
    )
}
