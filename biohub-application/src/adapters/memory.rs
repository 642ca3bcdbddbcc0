use crate::error::{AppError, AppResult};
use crate::events::BoundedContext;
use crate::ports::{ResourceImporter, Workspace, WorkspaceRepository};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

#[derive(Default)]
pub struct InMemoryWorkspaceRepository {
    workspaces: DashMap<String, Workspace>,
}

impl InMemoryWorkspaceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workspaces.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

#[async_trait]
impl WorkspaceRepository for InMemoryWorkspaceRepository {
    async fn save(&self, workspace: &Workspace) -> AppResult<()> {
        self.workspaces
            .insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> AppResult<Option<Workspace>> {
        Ok(self.workspaces.get(id).map(|w| w.value().clone()))
    }

    async fn delete(&self, id: &str) -> AppResult<bool> {
        Ok(self.workspaces.remove(id).is_some())
    }
}

/// 记录导入/清理调用的内存导入器
///
/// 可注入两类失败：`fail_times(n)` 让前 n 次导入返回基础设施错误（可重试），
/// `reject_with(reason)` 让导入始终以校验错误结束（不可重试）。
pub struct InMemoryResourceImporter {
    context: BoundedContext,
    imported: DashSet<String>,
    purged: DashSet<String>,
    remaining_failures: AtomicU32,
    rejection: Option<String>,
}

impl InMemoryResourceImporter {
    pub fn new(context: BoundedContext) -> Self {
        Self {
            context,
            imported: DashSet::new(),
            purged: DashSet::new(),
            remaining_failures: AtomicU32::new(0),
            rejection: None,
        }
    }

    pub fn fail_times(self, times: u32) -> Self {
        self.remaining_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn reject_with(mut self, reason: impl Into<String>) -> Self {
        self.rejection = Some(reason.into());
        self
    }

    pub fn has_imported(&self, workspace_id: &str) -> bool {
        self.imported.contains(workspace_id)
    }

    pub fn has_purged(&self, workspace_id: &str) -> bool {
        self.purged.contains(workspace_id)
    }
}

#[async_trait]
impl ResourceImporter for InMemoryResourceImporter {
    fn context(&self) -> BoundedContext {
        self.context
    }

    async fn import(&self, workspace_id: &str, import_base_dir: &Path) -> AppResult<()> {
        if let Some(reason) = &self.rejection {
            return Err(AppError::Validation(format!("{}: {reason}", self.context)));
        }

        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::infra(format!("{} store unavailable", self.context)));
        }

        self.imported.insert(workspace_id.to_string());
        info!(
            context = %self.context,
            workspace_id,
            base_dir = %import_base_dir.display(),
            "resources imported"
        );
        Ok(())
    }

    async fn purge(&self, workspace_id: &str) -> AppResult<()> {
        self.imported.remove(workspace_id);
        self.purged.insert(workspace_id.to_string());
        info!(context = %self.context, workspace_id, "resources purged");
        Ok(())
    }
}
