use crate::command::Command;
use crate::command_handler::CommandHandler;
use crate::context::AppContext;
use crate::error::AppError;
use crate::events::ImportWorkspaceEvent;
use async_trait::async_trait;
use biohub_eventing::{EventPublisher, IntegrationEvent, NewEvent};
use tracing::info;

/// 导入一个导出的 workspace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportWorkspace {
    pub workspace_id: String,
    pub name: String,
    pub owner: String,
    pub storage: String,
}

impl Command for ImportWorkspace {
    const NAME: &'static str = "ImportWorkspace";
}

/// 只负责发布 `ImportWorkspace` 事件；后续步骤全部由事件驱动
pub struct ImportWorkspaceCommandHandler {
    publisher: EventPublisher,
}

impl ImportWorkspaceCommandHandler {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl CommandHandler<ImportWorkspace> for ImportWorkspaceCommandHandler {
    async fn handle(&self, ctx: &AppContext, cmd: ImportWorkspace) -> Result<(), AppError> {
        if cmd.workspace_id.trim().is_empty() {
            return Err(AppError::Validation("workspace_id must not be empty".into()));
        }
        if cmd.storage.trim().is_empty() {
            return Err(AppError::Validation("storage must not be empty".into()));
        }

        let event = ImportWorkspaceEvent {
            workspace_id: cmd.workspace_id,
            name: cmd.name,
            owner: cmd.owner,
            storage: cmd.storage,
        };

        let mut new_event = NewEvent::from_event(&event)?;
        // 调用方给出幂等键时，重复提交只会落一条事件
        if let Some(key) = &ctx.idempotency_key {
            new_event = new_event.with_dedup_key(format!("{}:{key}", ImportWorkspaceEvent::TYPE));
        }
        let event_id = self.publisher.publish_new(new_event).await?;

        info!(
            %event_id,
            workspace_id = %event.workspace_id,
            actor = ctx.actor(),
            "workspace import requested"
        );
        Ok(())
    }
}
