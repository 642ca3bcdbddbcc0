use crate::context::AppContext;
use crate::dto::Dto;
use crate::error::AppError;
use crate::events::{
    ImportWorkspaceEvent, WorkspaceDeletedEvent, WorkspaceImportedEvent, sibling_event_types,
};
use crate::query::Query;
use crate::query_handler::QueryHandler;
use async_trait::async_trait;
use biohub_eventing::barrier::{Progress, evaluate};
use biohub_eventing::{
    EventQuery, EventRecord, EventRepository, EventStatus, IntegrationEvent, SiblingSet,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// 查询 workspace 最近一次导入的进度
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetImportStatus {
    pub workspace_id: String,
}

impl Query for GetImportStatus {
    const NAME: &'static str = "GetImportStatus";
    type Dto = ImportStatusDto;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    InProgress,
    Completed,
    Failed,
}

/// 单个阶段（事件类型）的最新状态；尚未发布时 `status` 为空
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageStatusDto {
    pub event_type: String,
    pub status: Option<EventStatus>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportStatusDto {
    pub workspace_id: String,
    /// 最近一次导入请求的事件 ID
    pub import_id: String,
    pub phase: ImportPhase,
    pub stages: Vec<StageStatusDto>,
}

impl Dto for ImportStatusDto {}

pub struct GetImportStatusHandler {
    repository: Arc<dyn EventRepository>,
}

impl GetImportStatusHandler {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl QueryHandler<GetImportStatus> for GetImportStatusHandler {
    async fn handle(
        &self,
        _ctx: &AppContext,
        q: GetImportStatus,
    ) -> Result<ImportStatusDto, AppError> {
        let requests = self
            .repository
            .search(&EventQuery::correlated(
                q.workspace_id.clone(),
                [ImportWorkspaceEvent::TYPE],
                EventStatus::ALL,
            ))
            .await?;
        let Some(request) = requests.into_iter().max_by_key(|r| r.created_at()) else {
            return Err(AppError::NotFound(format!(
                "import of workspace {}",
                q.workspace_id
            )));
        };
        let import_id = request.id().to_string();

        let mut run_types = vec![WorkspaceImportedEvent::TYPE];
        run_types.extend(sibling_event_types());
        run_types.push(WorkspaceDeletedEvent::TYPE);

        let mut records = self
            .repository
            .search(&EventQuery::correlated(
                import_id.clone(),
                run_types.iter().copied(),
                EventStatus::ALL,
            ))
            .await?;
        records.push(request);

        let stages: Vec<StageStatusDto> = std::iter::once(ImportWorkspaceEvent::TYPE)
            .chain(run_types)
            .filter_map(|ty| stage_status(ty, &records))
            .collect();
        let phase = phase_of(&import_id, &records);

        Ok(ImportStatusDto {
            workspace_id: q.workspace_id,
            import_id,
            phase,
            stages,
        })
    }
}

/// 同一次导入内每种类型通常只有一条记录，防御性地取最近更新的一条。
/// `WorkspaceDeleted` 只有在发生补偿时才会出现。
fn stage_status(event_type: &str, records: &[EventRecord]) -> Option<StageStatusDto> {
    let latest = records
        .iter()
        .filter(|r| r.event_type() == event_type)
        .max_by_key(|r| r.updated_at());

    match latest {
        Some(r) => Some(StageStatusDto {
            event_type: event_type.to_string(),
            status: Some(r.status()),
            attempts: r.attempts(),
            last_error: r.last_error().map(str::to_string),
            updated_at: Some(r.updated_at()),
        }),
        None if event_type == WorkspaceDeletedEvent::TYPE => None,
        None => Some(StageStatusDto {
            event_type: event_type.to_string(),
            status: None,
            attempts: 0,
            last_error: None,
            updated_at: None,
        }),
    }
}

fn phase_of(import_id: &str, records: &[EventRecord]) -> ImportPhase {
    let compensated = records
        .iter()
        .any(|r| r.event_type() == WorkspaceDeletedEvent::TYPE);
    let request_failed = records
        .iter()
        .any(|r| {
            r.event_type() == ImportWorkspaceEvent::TYPE && r.status() == EventStatus::Failed
        });
    if compensated || request_failed {
        return ImportPhase::Failed;
    }

    match evaluate(&SiblingSet::new(import_id, sibling_event_types()), records) {
        Progress::Completed => ImportPhase::Completed,
        Progress::Failed { .. } => ImportPhase::Failed,
        Progress::Waiting { .. } => ImportPhase::InProgress,
    }
}
