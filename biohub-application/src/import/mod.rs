//! Workspace 导入 saga
//!
//! ```text
//! ImportWorkspace(命令) ─▶ ImportWorkspace(事件) ─▶ WorkspaceImported ─▶ 监控任务
//!                                               └▶ ImportNotebooks / ImportWorkflows /
//!                                                  ImportDataModels / ImportNotebookServers
//! 失败/超时 ─▶ 删除 workspace + WorkspaceDeleted ─▶ 各上下文清理资源
//! ```
//!
pub mod command;
pub mod coordinator;
pub mod handlers;
pub mod status;

pub use command::{ImportWorkspace, ImportWorkspaceCommandHandler};
pub use coordinator::{
    ImportCoordinator, ImportSagaConfig, SagaOutcome, TimeoutPolicy, WorkspaceImportedHandler,
};
pub use handlers::{ImportWorkspaceHandler, PurgeResourcesHandler, ResourceImportHandler};
pub use status::{GetImportStatus, GetImportStatusHandler, ImportPhase, ImportStatusDto};

use crate::error::{AppError, AppResult};
use crate::events::{
    BoundedContext, ImportDataModelsEvent, ImportNotebookServersEvent, ImportNotebooksEvent,
    ImportWorkflowsEvent, ImportWorkspaceEvent, ResourceImportEvent, WorkspaceDeletedEvent,
    WorkspaceImportedEvent,
};
use crate::inmemory_command_bus::InMemoryCommandBus;
use crate::inmemory_query_bus::InMemoryQueryBus;
use crate::ports::{ImportStaging, ResourceImporter, WorkspaceRepository};
use biohub_eventing::idempotency::{Idempotent, InMemoryProcessedLog, ProcessedLog};
use biohub_eventing::{EventPublisher, EventRepository, HandlerRegistry, OutcomeSignal};
use bon::Builder;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// 把导入 saga 的全部处理器装配到注册表与命令/查询总线上
///
/// 每个限界上下文最多一个导入器；缺少某个上下文的导入器时，
/// 对应的兄弟事件无人订阅，会被直接标记完成。
/// 资源导入处理器外包一层 `Idempotent`，已成功处理的投递再次到达时直接跳过。
#[derive(Builder)]
pub struct WorkspaceImportModule {
    repository: Arc<dyn EventRepository>,
    workspaces: Arc<dyn WorkspaceRepository>,
    staging: Arc<dyn ImportStaging>,
    #[builder(default)]
    importers: Vec<Arc<dyn ResourceImporter>>,
    #[builder(default)]
    config: ImportSagaConfig,
    /// 应与总线使用同一个信号源
    signal: Option<OutcomeSignal>,
    /// 资源导入的已处理记录；缺省为进程内记录
    processed: Option<Arc<dyn ProcessedLog>>,
}

impl WorkspaceImportModule {
    /// 注册事件处理器、命令与查询；返回协调器以便关闭时等待监控任务退出
    pub fn install(
        self,
        registry: &mut HandlerRegistry,
        commands: &InMemoryCommandBus,
        queries: &InMemoryQueryBus,
    ) -> AppResult<Arc<ImportCoordinator>> {
        let mut contexts = HashSet::new();
        for importer in &self.importers {
            if !contexts.insert(importer.context()) {
                return Err(AppError::Validation(format!(
                    "duplicate importer for context {}",
                    importer.context()
                )));
            }
        }

        let processed = self
            .processed
            .unwrap_or_else(|| Arc::new(InMemoryProcessedLog::new()));
        let publisher = EventPublisher::new(self.repository.clone());
        let coordinator = Arc::new(
            ImportCoordinator::builder()
                .repository(self.repository.clone())
                .workspaces(self.workspaces.clone())
                .staging(self.staging.clone())
                .config(self.config)
                .maybe_signal(self.signal)
                .build(),
        );

        registry
            .subscribe::<ImportWorkspaceEvent, _>(ImportWorkspaceHandler::new(
                self.workspaces.clone(),
                self.staging,
                publisher.clone(),
            ))
            .subscribe::<WorkspaceImportedEvent, _>(WorkspaceImportedHandler::new(
                coordinator.clone(),
            ));

        for importer in self.importers {
            let resources = Resources {
                importer: importer.clone(),
                workspaces: self.workspaces.clone(),
                processed: processed.clone(),
            };
            resources.subscribe(registry);
            registry.subscribe::<WorkspaceDeletedEvent, _>(PurgeResourcesHandler::new(
                importer,
                self.workspaces.clone(),
            ));
        }

        commands.register::<ImportWorkspace, _>(Arc::new(ImportWorkspaceCommandHandler::new(
            publisher,
        )))?;
        queries.register::<GetImportStatus, _>(Arc::new(GetImportStatusHandler::new(
            self.repository,
        )))?;

        info!(
            contexts = ?contexts.iter().map(BoundedContext::as_str).collect::<Vec<_>>(),
            "workspace import module installed"
        );
        Ok(coordinator)
    }
}

/// 一个上下文的导入器及其处理器依赖
struct Resources {
    importer: Arc<dyn ResourceImporter>,
    workspaces: Arc<dyn WorkspaceRepository>,
    processed: Arc<dyn ProcessedLog>,
}

impl Resources {
    fn subscribe(self, registry: &mut HandlerRegistry) {
        match self.importer.context() {
            BoundedContext::Notebook => self.subscribe_to::<ImportNotebooksEvent>(registry),
            BoundedContext::Workflow => self.subscribe_to::<ImportWorkflowsEvent>(registry),
            BoundedContext::DataModel => self.subscribe_to::<ImportDataModelsEvent>(registry),
            BoundedContext::NotebookServer => {
                self.subscribe_to::<ImportNotebookServersEvent>(registry)
            }
        }
    }

    fn subscribe_to<E: ResourceImportEvent>(self, registry: &mut HandlerRegistry) {
        let handler = ResourceImportHandler::<E>::new(self.importer, self.workspaces);
        registry.subscribe::<E, _>(Idempotent::new(handler, self.processed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryResourceImporter, InMemoryWorkspaceRepository};
    use crate::ports::Workspace;
    use biohub_eventing::{Delivery, EventId, InMemoryEventRepository, IntegrationEvent};
    use chrono::Utc;
    use std::path::{Path, PathBuf};

    struct NoopStaging;

    #[async_trait::async_trait]
    impl ImportStaging for NoopStaging {
        async fn stage(&self, workspace_id: &str, _storage: &str) -> AppResult<PathBuf> {
            Ok(PathBuf::from(workspace_id))
        }

        async fn cleanup(&self, _import_base_dir: &Path) -> AppResult<()> {
            Ok(())
        }
    }

    fn module(importers: Vec<Arc<dyn ResourceImporter>>) -> WorkspaceImportModule {
        WorkspaceImportModule::builder()
            .repository(Arc::new(InMemoryEventRepository::default()))
            .workspaces(Arc::new(InMemoryWorkspaceRepository::new()))
            .staging(Arc::new(NoopStaging))
            .importers(importers)
            .build()
    }

    #[test]
    fn install_wires_every_handler() {
        let importers: Vec<Arc<dyn ResourceImporter>> = BoundedContext::ALL
            .into_iter()
            .map(|c| Arc::new(InMemoryResourceImporter::new(c)) as Arc<dyn ResourceImporter>)
            .collect();
        let mut registry = HandlerRegistry::new();
        let commands = InMemoryCommandBus::new();
        let queries = InMemoryQueryBus::new();

        module(importers)
            .install(&mut registry, &commands, &queries)
            .unwrap();

        assert!(registry.is_subscribed(ImportWorkspaceEvent::TYPE));
        assert!(registry.is_subscribed(WorkspaceImportedEvent::TYPE));
        for context in BoundedContext::ALL {
            assert_eq!(registry.handlers_for(context.import_event_type()).len(), 1);
        }
        assert_eq!(registry.handlers_for(WorkspaceDeletedEvent::TYPE).len(), 4);
        assert_eq!(commands.registered_commands(), vec!["ImportWorkspace"]);
        assert_eq!(queries.registered_queries(), vec!["GetImportStatus"]);
    }

    #[tokio::test]
    async fn redelivered_resource_import_is_skipped() {
        let workspaces = Arc::new(InMemoryWorkspaceRepository::new());
        workspaces
            .save(&Workspace {
                id: "w1".into(),
                name: "genomics".into(),
                owner: "alice".into(),
                storage: "/exports/w1".into(),
                import_id: Some("run-1".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let processed = Arc::new(InMemoryProcessedLog::new());
        let mut registry = HandlerRegistry::new();
        WorkspaceImportModule::builder()
            .repository(Arc::new(InMemoryEventRepository::default()))
            .workspaces(workspaces.clone())
            .staging(Arc::new(NoopStaging))
            .importers(vec![
                Arc::new(InMemoryResourceImporter::new(BoundedContext::Notebook))
                    as Arc<dyn ResourceImporter>,
            ])
            .processed(processed.clone())
            .build()
            .install(&mut registry, &InMemoryCommandBus::new(), &InMemoryQueryBus::new())
            .unwrap();

        let subscription = &registry.handlers_for(ImportNotebooksEvent::TYPE)[0];
        assert_eq!(subscription.name(), "notebook-import");
        let payload = ImportNotebooksEvent::new("w1".into(), "run-1".into(), PathBuf::from("w1"))
            .encode()
            .unwrap();
        let delivery = Delivery {
            event_id: EventId::new(),
            event_type: ImportNotebooksEvent::TYPE.into(),
            correlation_id: Some("run-1".into()),
            attempt: 1,
        };

        subscription
            .call(delivery.clone(), payload.clone())
            .await
            .unwrap();
        // 未去重时 workspace 已不存在的重复投递会被拒绝
        workspaces.delete("w1").await.unwrap();
        subscription
            .call(Delivery { attempt: 2, ..delivery }, payload)
            .await
            .unwrap();
        assert_eq!(processed.len(), 1);
    }

    #[test]
    fn duplicate_context_is_rejected() {
        let importers: Vec<Arc<dyn ResourceImporter>> = vec![
            Arc::new(InMemoryResourceImporter::new(BoundedContext::Notebook)),
            Arc::new(InMemoryResourceImporter::new(BoundedContext::Notebook)),
        ];
        let err = module(importers)
            .install(
                &mut HandlerRegistry::new(),
                &InMemoryCommandBus::new(),
                &InMemoryQueryBus::new(),
            )
            .err().unwrap();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
