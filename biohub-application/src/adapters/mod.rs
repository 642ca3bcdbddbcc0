//! 端口的内置实现：内存版用于测试与演示，文件系统暂存区可直接用于单机部署
//!
pub mod fs_staging;
pub mod memory;

pub use fs_staging::FsImportStaging;
pub use memory::{InMemoryResourceImporter, InMemoryWorkspaceRepository};
