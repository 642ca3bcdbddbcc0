//! 持久化事件总线（biohub-eventing）
//!
//! 以一张共享的持久化事件表作为传输层，为应用提供异步的集成事件：
//! - 事件模型与投递状态机（`event`）
//! - 仓储协议与内存/PostgreSQL 实现（`repository`），核心是租约下的原子领取
//! - 处理器注册（`registry`）与幂等辅助（`idempotency`）
//! - 总线与 worker 池（`bus`、`dispatcher`），失败按指数退避重试
//! - 完成屏障（`barrier`），供 saga 协调等待一组兄弟事件结束
//!
//! 投递语义为“至少一次”：处理器必须是幂等的。
//!
//! 典型用法：
//! 1. 为载荷实现 `IntegrationEvent`（或使用 `#[integration_event]` 宏）；
//! 2. 在 `HandlerRegistry` 上注册处理器；
//! 3. 以仓储与注册表构建 `EventBus`，`start` 后通过 `publish` 发布事件；
//! 4. 关闭时调用 `DispatcherHandle::shutdown` 并 `join`。
//!
pub mod barrier;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod idempotency;
pub mod publisher;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod signal;

pub use barrier::{BarrierOutcome, CompletionBarrier, SiblingSet};
pub use bus::EventBus;
pub use config::{BarrierConfig, ConfigError, EventBusConfig};
pub use dispatcher::DispatcherHandle;
pub use error::{EventingError, EventingResult};
pub use event::{EventId, EventRecord, EventStatus, IntegrationEvent, NewEvent};
pub use handler::{Delivery, EventHandler, HandlerError, HandlerResult, RawEventHandler};
pub use publisher::EventPublisher;
pub use registry::HandlerRegistry;
pub use repository::{EventQuery, EventRepository, InMemoryEventRepository};
pub use retry::RetryPolicy;
pub use signal::{Outcome, OutcomeSignal};

// 允许在本 crate 内部通过 ::biohub_eventing 进行自引用，
// 以便过程宏在本 crate 的测试中也能解析到 ::biohub_eventing 路径。
extern crate self as biohub_eventing;
