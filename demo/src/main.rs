use anyhow::Context;
use biohub_application::adapters::{
    FsImportStaging, InMemoryResourceImporter, InMemoryWorkspaceRepository,
};
use biohub_application::command_bus::CommandBus;
use biohub_application::events::BoundedContext;
use biohub_application::import::{
    GetImportStatus, ImportPhase, ImportSagaConfig, ImportWorkspace,
};
use biohub_application::ports::ResourceImporter;
use biohub_application::query_bus::QueryBus;
use biohub_application::{
    AppContext, InMemoryCommandBus, InMemoryQueryBus, WorkspaceImportModule,
};
use biohub_eventing::{
    EventBus, EventBusConfig, HandlerRegistry, InMemoryEventRepository, OutcomeSignal,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// 设置后对应上下文的导入始终失败，用于演示补偿流程（取值如 `workflow`）
const ENV_REJECT_CONTEXT: &str = "DEMO_REJECT_CONTEXT";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bus_config = EventBusConfig::from_env().context("load event bus config")?;
    let saga_config = ImportSagaConfig::from_env().context("load saga config")?;
    let reject = std::env::var(ENV_REJECT_CONTEXT).ok();

    let work_dir = std::env::temp_dir().join(format!("biohub-demo-{}", std::process::id()));
    let export_dir = prepare_export(&work_dir).await?;

    let repository = Arc::new(InMemoryEventRepository::default());
    let signal = OutcomeSignal::default();
    let commands = InMemoryCommandBus::new();
    let queries = InMemoryQueryBus::new();
    let mut registry = HandlerRegistry::new();

    let importers: Vec<Arc<dyn ResourceImporter>> = BoundedContext::ALL
        .into_iter()
        .map(|context| {
            let importer = InMemoryResourceImporter::new(context);
            let importer = match &reject {
                Some(name) if name == context.as_str() => {
                    importer.reject_with("rejected by demo")
                }
                _ => importer,
            };
            Arc::new(importer) as Arc<dyn ResourceImporter>
        })
        .collect();

    let coordinator = WorkspaceImportModule::builder()
        .repository(repository.clone())
        .workspaces(Arc::new(InMemoryWorkspaceRepository::new()))
        .staging(Arc::new(FsImportStaging::new(work_dir.join("staging"))))
        .importers(importers)
        .config(saga_config)
        .signal(signal.clone())
        .build()
        .install(&mut registry, &commands, &queries)?;

    let bus = Arc::new(
        EventBus::builder()
            .repository(repository)
            .registry(registry)
            .config(bus_config)
            .signal(signal)
            .build(),
    );
    let token = CancellationToken::new();
    let dispatcher = bus.start(&token);

    let ctx = AppContext {
        actor_id: Some("demo".into()),
        idempotency_key: Some("demo-import-1".into()),
        ..Default::default()
    };
    commands
        .dispatch(
            &ctx,
            ImportWorkspace {
                workspace_id: "ws-demo".into(),
                name: "Demo workspace".into(),
                owner: "demo".into(),
                storage: export_dir.to_string_lossy().into_owned(),
            },
        )
        .await?;

    tokio::select! {
        phase = wait_for_import(&queries, &ctx, "ws-demo") => {
            info!(?phase, "import finished");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
        }
    }

    // 留出时间让补偿事件被各上下文消费
    tokio::time::sleep(bus.config().sync_period * 2).await;

    coordinator.shutdown().await;
    dispatcher.shutdown();
    dispatcher.join().await;
    tokio::fs::remove_dir_all(&work_dir).await.ok();
    Ok(())
}

/// 构造一个最小的导出目录
async fn prepare_export(work_dir: &Path) -> anyhow::Result<PathBuf> {
    let export_dir = work_dir.join("export");
    for sub in ["notebooks", "workflows", "data_models", "notebook_servers"] {
        tokio::fs::create_dir_all(export_dir.join(sub)).await?;
    }
    tokio::fs::write(export_dir.join("manifest.json"), br#"{"version":1}"#).await?;
    tokio::fs::write(export_dir.join("notebooks/qc.ipynb"), b"{}").await?;
    Ok(export_dir)
}

async fn wait_for_import(
    queries: &InMemoryQueryBus,
    ctx: &AppContext,
    workspace_id: &str,
) -> ImportPhase {
    loop {
        let status = queries
            .dispatch(
                ctx,
                GetImportStatus {
                    workspace_id: workspace_id.into(),
                },
            )
            .await;
        match status {
            Ok(dto) if dto.phase != ImportPhase::InProgress => {
                for stage in &dto.stages {
                    info!(
                        stage = %stage.event_type,
                        status = ?stage.status,
                        attempts = stage.attempts,
                        last_error = ?stage.last_error,
                        "import stage"
                    );
                }
                return dto.phase;
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "status not available yet"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
