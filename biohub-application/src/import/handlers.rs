use crate::error::AppError;
use crate::events::{
    ImportDataModelsEvent, ImportNotebookServersEvent, ImportNotebooksEvent, ImportWorkflowsEvent,
    ImportWorkspaceEvent, ResourceImportEvent, WorkspaceDeletedEvent, WorkspaceImportedEvent,
};
use crate::ports::{ImportStaging, ResourceImporter, Workspace, WorkspaceRepository};
use async_trait::async_trait;
use biohub_eventing::{Delivery, EventHandler, EventPublisher, HandlerError, HandlerResult};
use chrono::Utc;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 消费 `ImportWorkspace`：准备导入目录、落库 workspace、扇出兄弟导入事件
///
/// 一次导入以该 `ImportWorkspace` 事件的 ID 作为 `import_id`。每一步都可安全重放：
/// 本次导入已创建的 workspace 不会被覆盖，所有发布都带 `<类型>:<import_id>` 去重键。
/// workspace 已由另一次导入创建时直接拒绝（不可重试）。
pub struct ImportWorkspaceHandler {
    workspaces: Arc<dyn WorkspaceRepository>,
    staging: Arc<dyn ImportStaging>,
    publisher: EventPublisher,
}

impl ImportWorkspaceHandler {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        staging: Arc<dyn ImportStaging>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            workspaces,
            staging,
            publisher,
        }
    }

    async fn fan_out(&self, workspace_id: &str, import_id: &str, base_dir: &Path) -> HandlerResult {
        self.publish_sibling::<ImportNotebooksEvent>(workspace_id, import_id, base_dir)
            .await?;
        self.publish_sibling::<ImportWorkflowsEvent>(workspace_id, import_id, base_dir)
            .await?;
        self.publish_sibling::<ImportDataModelsEvent>(workspace_id, import_id, base_dir)
            .await?;
        self.publish_sibling::<ImportNotebookServersEvent>(workspace_id, import_id, base_dir)
            .await
    }

    async fn publish_sibling<E: ResourceImportEvent>(
        &self,
        workspace_id: &str,
        import_id: &str,
        base_dir: &Path,
    ) -> HandlerResult {
        let event = E::new(
            workspace_id.to_string(),
            import_id.to_string(),
            base_dir.to_path_buf(),
        );
        self.publisher.publish_once(&event).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ImportWorkspaceEvent> for ImportWorkspaceHandler {
    fn handler_name(&self) -> &str {
        "import-workspace"
    }

    async fn handle(&self, delivery: &Delivery, event: ImportWorkspaceEvent) -> HandlerResult {
        let workspace_id = event.workspace_id.clone();
        let import_id = delivery.event_id.to_string();

        let existing = self.workspaces.get(&workspace_id).await?;
        if existing.as_ref().is_some_and(|ws| !ws.created_by(&import_id)) {
            return Err(
                AppError::Validation(format!("workspace {workspace_id} already exists")).into(),
            );
        }

        // 暂存成功后才落库 workspace
        let import_base_dir = self.staging.stage(&workspace_id, &event.storage).await?;

        if existing.is_none() {
            let workspace = Workspace {
                id: workspace_id.clone(),
                name: event.name,
                owner: event.owner,
                storage: event.storage,
                import_id: Some(import_id.clone()),
                created_at: Utc::now(),
            };
            self.workspaces.save(&workspace).await?;
            info!(workspace_id = %workspace_id, import_id = %import_id, "workspace created");
        } else {
            debug!(
                workspace_id = %workspace_id,
                attempt = delivery.attempt,
                "workspace already created by this import"
            );
        }

        self.publisher
            .publish_once(&WorkspaceImportedEvent {
                workspace_id: workspace_id.clone(),
                import_id: import_id.clone(),
                import_base_dir: import_base_dir.clone(),
            })
            .await?;
        self.fan_out(&workspace_id, &import_id, &import_base_dir)
            .await?;

        info!(
            workspace_id = %workspace_id,
            import_id = %import_id,
            base_dir = %import_base_dir.display(),
            "resource imports fanned out"
        );
        Ok(())
    }
}

/// 把一种兄弟导入事件交给对应上下文的导入器
///
/// 导入前后都确认 workspace 仍属于本次导入：saga 补偿可能与导入并发发生，
/// 补偿之后才写入的资源由这里自行清理。
pub struct ResourceImportHandler<E> {
    importer: Arc<dyn ResourceImporter>,
    workspaces: Arc<dyn WorkspaceRepository>,
    name: String,
    _event: PhantomData<fn(E)>,
}

impl<E: ResourceImportEvent> ResourceImportHandler<E> {
    pub fn new(
        importer: Arc<dyn ResourceImporter>,
        workspaces: Arc<dyn WorkspaceRepository>,
    ) -> Self {
        Self {
            name: format!("{}-import", E::CONTEXT),
            importer,
            workspaces,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E: ResourceImportEvent> EventHandler<E> for ResourceImportHandler<E> {
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _delivery: &Delivery, event: E) -> HandlerResult {
        let workspace_id = event.workspace_id();
        let import_id = event.import_id();

        match self.workspaces.get(workspace_id).await? {
            Some(ws) if ws.created_by(import_id) => {}
            _ => {
                return Err(HandlerError::permanent(format!(
                    "workspace {workspace_id} is no longer part of import {import_id}"
                )));
            }
        }

        self.importer
            .import(workspace_id, event.import_base_dir())
            .await?;

        match self.workspaces.get(workspace_id).await? {
            Some(ws) if ws.created_by(import_id) => Ok(()),
            Some(_) => Err(HandlerError::permanent(format!(
                "workspace {workspace_id} was re-imported during import {import_id}"
            ))),
            None => {
                warn!(
                    context = %E::CONTEXT,
                    workspace_id,
                    import_id,
                    "workspace deleted during import, purging"
                );
                self.importer.purge(workspace_id).await?;
                Err(HandlerError::permanent(format!(
                    "workspace {workspace_id} deleted during import"
                )))
            }
        }
    }
}

/// 补偿：workspace 删除后清理本上下文的资源
///
/// 同一 workspace 已被后一次导入重新创建时跳过，避免清掉新导入的资源。
pub struct PurgeResourcesHandler {
    importer: Arc<dyn ResourceImporter>,
    workspaces: Arc<dyn WorkspaceRepository>,
    name: String,
}

impl PurgeResourcesHandler {
    pub fn new(
        importer: Arc<dyn ResourceImporter>,
        workspaces: Arc<dyn WorkspaceRepository>,
    ) -> Self {
        Self {
            name: format!("{}-purge", importer.context()),
            importer,
            workspaces,
        }
    }
}

#[async_trait]
impl EventHandler<WorkspaceDeletedEvent> for PurgeResourcesHandler {
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _delivery: &Delivery, event: WorkspaceDeletedEvent) -> HandlerResult {
        if let Some(ws) = self.workspaces.get(&event.workspace_id).await? {
            if !ws.created_by(&event.import_id) {
                debug!(
                    context = %self.importer.context(),
                    workspace_id = %event.workspace_id,
                    import_id = %event.import_id,
                    "workspace re-imported since, skipping purge"
                );
                return Ok(());
            }
        }
        self.importer.purge(&event.workspace_id).await?;
        Ok(())
    }
}
