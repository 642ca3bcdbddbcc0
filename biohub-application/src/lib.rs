//! BioHub 应用层
//!
//! - 命令/查询总线（CQRS）与应用上下文；
//! - 集成事件载荷定义；
//! - workspace 导入 saga：事件处理器、监控协调器与补偿；
//! - 外部端口及其内存/文件系统实现。
//!
pub mod adapters;
pub mod command;
pub mod command_bus;
pub mod command_handler;
pub mod context;
pub mod dto;
pub mod error;
pub mod events;
pub mod import;
pub mod inmemory_command_bus;
pub mod inmemory_query_bus;
pub mod ports;
pub mod query;
pub mod query_bus;
pub mod query_handler;

pub use context::AppContext;
pub use error::{AppError, AppResult};
pub use import::WorkspaceImportModule;
pub use inmemory_command_bus::InMemoryCommandBus;
pub use inmemory_query_bus::InMemoryQueryBus;
