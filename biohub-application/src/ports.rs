//! 应用层依赖的外部端口
//!
//! 具体实现由基础设施提供；本 crate 内置的内存/文件系统实现见 `adapters`。
//!
use crate::error::AppResult;
use crate::events::BoundedContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Workspace 聚合（导入 saga 只关心其存在性与基本属性）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub storage: String,
    /// 创建它的那次导入；手工创建的 workspace 为空
    #[serde(default)]
    pub import_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// 是否由指定导入创建
    pub fn created_by(&self, import_id: &str) -> bool {
        self.import_id.as_deref() == Some(import_id)
    }
}

#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    /// 新增或覆盖
    async fn save(&self, workspace: &Workspace) -> AppResult<()>;

    async fn get(&self, id: &str) -> AppResult<Option<Workspace>>;

    /// 删除；不存在时返回 `false`
    async fn delete(&self, id: &str) -> AppResult<bool>;
}

/// 导入暂存区：把导入源准备成各上下文可读取的基础目录
#[async_trait]
pub trait ImportStaging: Send + Sync {
    /// 为 workspace 准备导入基础目录并返回其路径；重复调用应返回同一路径
    async fn stage(&self, workspace_id: &str, storage: &str) -> AppResult<PathBuf>;

    /// 删除导入基础目录；目录不存在视为成功
    async fn cleanup(&self, import_base_dir: &Path) -> AppResult<()>;
}

/// 单个限界上下文的资源导入器
#[async_trait]
pub trait ResourceImporter: Send + Sync {
    fn context(&self) -> BoundedContext;

    /// 从导入基础目录导入本上下文的资源；需可重入（同一事件可能被多次投递）
    async fn import(&self, workspace_id: &str, import_base_dir: &Path) -> AppResult<()>;

    /// 清理 workspace 在本上下文下的全部资源
    async fn purge(&self, workspace_id: &str) -> AppResult<()>;
}
