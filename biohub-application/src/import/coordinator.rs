//! 导入 saga 的监控与补偿
//!
//! `WorkspaceImported` 被消费后，为这次导入启动一个后台监控任务，
//! 通过 `CompletionBarrier` 等待四个兄弟导入事件结束：
//! - 全部完成：清理导入目录；
//! - 任一失败：补偿，再清理导入目录；
//! - 超时：记录错误并按 `TimeoutPolicy` 处理。
//!
//! 补偿先把仍在排队或执行中的兄弟事件取消，再删除本次导入创建的 workspace，
//! 最后发布 `WorkspaceDeleted`（去重键保证每次导入只发布一次）。
//! 补偿是尽力而为的：失败只记录日志，不会重试。
//!
use crate::events::{WorkspaceDeletedEvent, WorkspaceImportedEvent, sibling_event_types};
use crate::ports::{ImportStaging, WorkspaceRepository};
use async_trait::async_trait;
use biohub_eventing::config::ConfigError;
use biohub_eventing::{
    BarrierConfig, BarrierOutcome, CompletionBarrier, Delivery, EventHandler, EventPublisher,
    EventQuery, EventRepository, EventStatus, HandlerResult, OutcomeSignal, SiblingSet,
};
use bon::Builder;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const ENV_TIMEOUT_POLICY: &str = "BIOHUB_SAGA_TIMEOUT_POLICY";

/// 截止时间到达后如何处理仍未结束的导入
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// 与失败相同：取消未结束的导入、删除 workspace 并发布 `WorkspaceDeleted`
    #[default]
    Compensate,
    /// 只记录错误，保留 workspace 与导入目录
    ReportOnly,
}

impl TimeoutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutPolicy::Compensate => "compensate",
            TimeoutPolicy::ReportOnly => "report_only",
        }
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "compensate" => Ok(TimeoutPolicy::Compensate),
            "report_only" => Ok(TimeoutPolicy::ReportOnly),
            other => Err(format!("unknown timeout policy: {other}")),
        }
    }
}

/// saga 配置：屏障参数 + 超时策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSagaConfig {
    pub barrier: BarrierConfig,
    pub timeout_policy: TimeoutPolicy,
}

impl ImportSagaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let timeout_policy = match std::env::var(ENV_TIMEOUT_POLICY) {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_TIMEOUT_POLICY.to_string(),
                value,
            })?,
            Err(_) => TimeoutPolicy::default(),
        };
        Ok(Self {
            barrier: BarrierConfig::from_env()?,
            timeout_policy,
        })
    }
}

/// 一次监控的结局
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SagaOutcome {
    Completed,
    /// 兄弟导入失败，已执行补偿
    Compensated { reason: String },
    TimedOut {
        outstanding: Vec<String>,
        compensated: bool,
    },
    Cancelled,
}

#[derive(Builder)]
pub struct ImportCoordinator {
    repository: Arc<dyn EventRepository>,
    workspaces: Arc<dyn WorkspaceRepository>,
    staging: Arc<dyn ImportStaging>,
    #[builder(default)]
    config: ImportSagaConfig,
    /// 事件结果的进程内广播，用于提前唤醒屏障
    signal: Option<OutcomeSignal>,
    /// 正在监控的 import_id
    #[builder(skip)]
    monitors: DashSet<String>,
    #[builder(skip)]
    tracker: TaskTracker,
    #[builder(skip)]
    token: CancellationToken,
}

impl ImportCoordinator {
    pub fn config(&self) -> &ImportSagaConfig {
        &self.config
    }

    pub fn is_monitoring(&self, import_id: &str) -> bool {
        self.monitors.contains(import_id)
    }

    /// 在后台启动监控；同一次导入在本进程内已有监控时返回 `false`
    pub fn spawn_monitor(
        self: &Arc<Self>,
        workspace_id: String,
        import_id: String,
        import_base_dir: PathBuf,
    ) -> bool {
        if !self.monitors.insert(import_id.clone()) {
            debug!(workspace_id = %workspace_id, import_id = %import_id, "import monitor already running");
            return false;
        }

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let outcome = this
                .monitor(&workspace_id, &import_id, &import_base_dir)
                .await;
            this.monitors.remove(&import_id);
            debug!(workspace_id = %workspace_id, import_id = %import_id, ?outcome, "import monitor finished");
        });
        true
    }

    /// 等待兄弟导入结束并执行收尾/补偿
    pub async fn monitor(
        &self,
        workspace_id: &str,
        import_id: &str,
        import_base_dir: &Path,
    ) -> SagaOutcome {
        let barrier = CompletionBarrier::builder()
            .repository(self.repository.clone())
            .config(self.config.barrier)
            .maybe_signal(self.signal.clone())
            .build();
        let set = SiblingSet::new(import_id, sibling_event_types());

        info!(workspace_id, import_id, "import monitor started");
        match barrier.wait(&set, &self.token).await {
            BarrierOutcome::Completed => {
                self.cleanup(workspace_id, import_base_dir).await;
                info!(workspace_id, import_id, "workspace import completed");
                SagaOutcome::Completed
            }
            BarrierOutcome::Failed { failed } => {
                let reason = failed
                    .iter()
                    .map(|r| {
                        format!("{}: {}", r.event_type(), r.last_error().unwrap_or("failed"))
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(workspace_id, import_id, %reason, "resource import failed, compensating");
                self.compensate(workspace_id, import_id, &reason).await;
                self.cleanup(workspace_id, import_base_dir).await;
                SagaOutcome::Compensated { reason }
            }
            BarrierOutcome::TimedOut { outstanding } => {
                error!(
                    workspace_id,
                    import_id,
                    ?outstanding,
                    deadline_ms = self.config.barrier.deadline.as_millis() as u64,
                    policy = %self.config.timeout_policy,
                    "workspace import timed out"
                );
                let compensated = match self.config.timeout_policy {
                    TimeoutPolicy::Compensate => {
                        let reason = format!("timed out waiting for {}", outstanding.join(", "));
                        self.compensate(workspace_id, import_id, &reason).await;
                        self.cleanup(workspace_id, import_base_dir).await;
                        true
                    }
                    TimeoutPolicy::ReportOnly => false,
                };
                SagaOutcome::TimedOut {
                    outstanding,
                    compensated,
                }
            }
            BarrierOutcome::Cancelled => {
                info!(workspace_id, import_id, "import monitor cancelled");
                SagaOutcome::Cancelled
            }
        }
    }

    /// 取消全部监控并等待其退出
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn compensate(&self, workspace_id: &str, import_id: &str, reason: &str) {
        let cancelled = self.cancel_outstanding(import_id, reason).await;
        if cancelled > 0 {
            info!(workspace_id, import_id, cancelled, "outstanding imports cancelled");
        }

        match self.workspaces.get(workspace_id).await {
            Ok(Some(ws)) if ws.created_by(import_id) => {
                match self.workspaces.delete(workspace_id).await {
                    Ok(true) => info!(workspace_id, "workspace deleted"),
                    Ok(false) => debug!(workspace_id, "workspace already deleted"),
                    Err(err) => error!(workspace_id, error = %err, "failed to delete workspace"),
                }
            }
            Ok(Some(_)) => warn!(workspace_id, import_id, "workspace re-imported since, keeping it"),
            Ok(None) => debug!(workspace_id, "workspace already deleted"),
            Err(err) => error!(workspace_id, error = %err, "failed to load workspace"),
        }

        let event = WorkspaceDeletedEvent {
            workspace_id: workspace_id.to_string(),
            import_id: import_id.to_string(),
            reason: Some(reason.to_string()),
        };
        let publisher = EventPublisher::new(self.repository.clone());
        if let Err(err) = publisher.publish_once(&event).await {
            error!(workspace_id, error = %err, "failed to publish WorkspaceDeleted");
        }
    }

    /// 把本次导入仍在排队或执行中的兄弟事件置为失败，返回取消的数量
    async fn cancel_outstanding(&self, import_id: &str, reason: &str) -> usize {
        let query = EventQuery::correlated(
            import_id,
            sibling_event_types(),
            [EventStatus::Pending, EventStatus::Running],
        );
        let open = match self.repository.search(&query).await {
            Ok(open) => open,
            Err(err) => {
                error!(import_id, error = %err, "failed to load outstanding imports");
                return 0;
            }
        };

        let mut cancelled = 0;
        for record in open {
            match self.repository.cancel(&record.id(), reason).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    event_id = %record.id(),
                    error = %err,
                    "failed to cancel outstanding import"
                ),
            }
        }
        cancelled
    }

    async fn cleanup(&self, workspace_id: &str, import_base_dir: &Path) {
        if let Err(err) = self.staging.cleanup(import_base_dir).await {
            warn!(
                workspace_id,
                base_dir = %import_base_dir.display(),
                error = %err,
                "failed to clean up import directory"
            );
        }
    }
}

/// 消费 `WorkspaceImported`：启动监控后立即返回
pub struct WorkspaceImportedHandler {
    coordinator: Arc<ImportCoordinator>,
}

impl WorkspaceImportedHandler {
    pub fn new(coordinator: Arc<ImportCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl EventHandler<WorkspaceImportedEvent> for WorkspaceImportedHandler {
    fn handler_name(&self) -> &str {
        "import-monitor"
    }

    async fn handle(&self, _delivery: &Delivery, event: WorkspaceImportedEvent) -> HandlerResult {
        self.coordinator
            .spawn_monitor(event.workspace_id, event.import_id, event.import_base_dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryWorkspaceRepository;
    use crate::error::AppResult;
    use crate::ports::Workspace;
    use biohub_eventing::{EventId, InMemoryEventRepository, IntegrationEvent, NewEvent};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStaging {
        cleaned: DashSet<PathBuf>,
    }

    #[async_trait]
    impl ImportStaging for RecordingStaging {
        async fn stage(&self, workspace_id: &str, _storage: &str) -> AppResult<PathBuf> {
            Ok(PathBuf::from("/staging").join(workspace_id))
        }

        async fn cleanup(&self, import_base_dir: &Path) -> AppResult<()> {
            self.cleaned.insert(import_base_dir.to_path_buf());
            Ok(())
        }
    }

    const RUN: &str = "run-1";

    struct Fixture {
        repo: Arc<InMemoryEventRepository>,
        workspaces: Arc<InMemoryWorkspaceRepository>,
        staging: Arc<RecordingStaging>,
        coordinator: Arc<ImportCoordinator>,
    }

    fn workspace(import_id: &str) -> Workspace {
        Workspace {
            id: "w1".into(),
            name: "genomics".into(),
            owner: "alice".into(),
            storage: "/exports/w1".into(),
            import_id: Some(import_id.into()),
            created_at: Utc::now(),
        }
    }

    async fn fixture(policy: TimeoutPolicy) -> Fixture {
        let repo = Arc::new(InMemoryEventRepository::default());
        let workspaces = Arc::new(InMemoryWorkspaceRepository::new());
        let staging = Arc::new(RecordingStaging::default());
        workspaces.save(&workspace(RUN)).await.unwrap();

        let coordinator = Arc::new(
            ImportCoordinator::builder()
                .repository(repo.clone())
                .workspaces(workspaces.clone())
                .staging(staging.clone())
                .config(ImportSagaConfig {
                    barrier: BarrierConfig {
                        poll_interval: Duration::from_millis(100),
                        deadline: Duration::from_secs(5),
                    },
                    timeout_policy: policy,
                })
                .build(),
        );
        Fixture {
            repo,
            workspaces,
            staging,
            coordinator,
        }
    }

    /// 发布四个兄弟事件并全部领取
    async fn claim_siblings(repo: &InMemoryEventRepository) -> Vec<EventId> {
        for ty in sibling_event_types() {
            let event = NewEvent::builder()
                .event_type(ty)
                .payload(json!({"workspace_id": "w1", "import_id": RUN}))
                .correlation_id(RUN)
                .build();
            repo.enqueue(event).await.unwrap();
        }
        repo.claim_batch(16, Duration::from_secs(30))
            .await
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect()
    }

    async fn deleted_events(repo: &InMemoryEventRepository) -> usize {
        repo.search(&EventQuery::correlated(
            RUN,
            [WorkspaceDeletedEvent::TYPE],
            EventStatus::ALL,
        ))
        .await
        .unwrap()
        .len()
    }

    fn base_dir() -> PathBuf {
        PathBuf::from("/staging/w1")
    }

    #[tokio::test]
    async fn completed_siblings_clean_up_without_deletion() {
        let f = fixture(TimeoutPolicy::Compensate).await;
        for id in claim_siblings(&f.repo).await {
            f.repo.mark_completed(&id, 1).await.unwrap();
        }

        let outcome = f.coordinator.monitor("w1", RUN, &base_dir()).await;
        assert_eq!(outcome, SagaOutcome::Completed);
        assert!(f.workspaces.contains("w1"));
        assert!(f.staging.cleaned.contains(&base_dir()));
        assert_eq!(deleted_events(&f.repo).await, 0);
    }

    #[tokio::test]
    async fn failed_sibling_compensates_once() {
        let f = fixture(TimeoutPolicy::Compensate).await;
        let ids = claim_siblings(&f.repo).await;
        f.repo
            .mark_failed_permanently(&ids[0], 1, "corrupt archive")
            .await
            .unwrap();

        let outcome = f.coordinator.monitor("w1", RUN, &base_dir()).await;
        let SagaOutcome::Compensated { reason } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert!(reason.contains("corrupt archive"));
        assert!(!f.workspaces.contains("w1"));

        // 其余仍在执行的兄弟导入被一并取消
        for id in &ids[1..] {
            let record = f.repo.get(id).await.unwrap().unwrap();
            assert_eq!(record.status(), EventStatus::Failed);
        }

        // 重复监控（例如事件被再次投递）不会再发布一次删除事件
        f.coordinator.monitor("w1", RUN, &base_dir()).await;
        assert_eq!(deleted_events(&f.repo).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_compensates_by_default() {
        let f = fixture(TimeoutPolicy::Compensate).await;

        let outcome = f.coordinator.monitor("w1", RUN, &base_dir()).await;
        let SagaOutcome::TimedOut {
            outstanding,
            compensated,
        } = outcome
        else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(outstanding.len(), 4);
        assert!(compensated);
        assert!(!f.workspaces.contains("w1"));
        assert_eq!(deleted_events(&f.repo).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_stalled_imports_before_deleting() {
        let f = fixture(TimeoutPolicy::Compensate).await;
        let ids = claim_siblings(&f.repo).await;
        f.repo.mark_completed(&ids[0], 1).await.unwrap();
        f.repo.mark_completed(&ids[1], 1).await.unwrap();

        let outcome = f.coordinator.monitor("w1", RUN, &base_dir()).await;
        assert!(matches!(
            outcome,
            SagaOutcome::TimedOut {
                compensated: true,
                ..
            }
        ));

        for id in &ids[2..] {
            let record = f.repo.get(id).await.unwrap().unwrap();
            assert_eq!(record.status(), EventStatus::Failed);
            assert!(record.last_error().unwrap().contains("timed out"));
            // 被取消的执行者再结算会被拒绝
            assert!(f.repo.mark_completed(id, 1).await.is_err());
        }
        assert_eq!(
            f.repo.get(&ids[0]).await.unwrap().unwrap().status(),
            EventStatus::Completed
        );
    }

    #[tokio::test]
    async fn compensation_keeps_workspace_recreated_by_another_import() {
        let f = fixture(TimeoutPolicy::Compensate).await;
        f.workspaces.save(&workspace("run-2")).await.unwrap();
        let ids = claim_siblings(&f.repo).await;
        f.repo
            .mark_failed_permanently(&ids[0], 1, "corrupt archive")
            .await
            .unwrap();

        let outcome = f.coordinator.monitor("w1", RUN, &base_dir()).await;
        assert!(matches!(outcome, SagaOutcome::Compensated { .. }));
        assert!(f.workspaces.contains("w1"));
        assert_eq!(deleted_events(&f.repo).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn report_only_timeout_keeps_workspace() {
        let f = fixture(TimeoutPolicy::ReportOnly).await;

        let outcome = f.coordinator.monitor("w1", RUN, &base_dir()).await;
        assert!(matches!(
            outcome,
            SagaOutcome::TimedOut {
                compensated: false,
                ..
            }
        ));
        assert!(f.workspaces.contains("w1"));
        assert!(f.staging.cleaned.is_empty());
        assert_eq!(deleted_events(&f.repo).await, 0);
    }

    #[tokio::test]
    async fn one_monitor_per_import() {
        let f = fixture(TimeoutPolicy::ReportOnly).await;

        assert!(f.coordinator.spawn_monitor("w1".into(), RUN.into(), base_dir()));
        assert!(!f.coordinator.spawn_monitor("w1".into(), RUN.into(), base_dir()));
        assert!(f.coordinator.is_monitoring(RUN));

        f.coordinator.shutdown().await;
        assert!(!f.coordinator.is_monitoring(RUN));
        assert!(f.workspaces.contains("w1"));
    }

    #[test]
    fn timeout_policy_parses_both_spellings() {
        assert_eq!(
            "report-only".parse::<TimeoutPolicy>(),
            Ok(TimeoutPolicy::ReportOnly)
        );
        assert_eq!(
            " Compensate ".parse::<TimeoutPolicy>(),
            Ok(TimeoutPolicy::Compensate)
        );
        assert!("ignore".parse::<TimeoutPolicy>().is_err());
    }
}
