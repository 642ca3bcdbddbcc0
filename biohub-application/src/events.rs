//! 集成事件载荷（workspace 导入 saga）
//!
//! 每个类型对应一个 JSON 对象，类型标签即 `IntegrationEvent::TYPE`；载荷只允许追加字段式演进。
//!
//! 关联 ID：`ImportWorkspace` 取 `workspace_id`；其后的事件都取 `import_id`
//! （即该 `ImportWorkspace` 事件的 ID），同一 workspace 的多次导入因此互不干扰。
//!
use biohub_eventing::IntegrationEvent;
use biohub_macros::integration_event;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// 导入请求：由命令处理器发布，触发 saga
#[integration_event(name = "ImportWorkspace", correlation = workspace_id)]
pub struct ImportWorkspaceEvent {
    pub workspace_id: String,
    pub name: String,
    pub owner: String,
    /// 导入源（导出包所在目录）
    pub storage: String,
}

/// workspace 已落库、导入目录已就绪；其处理器启动 saga 监控
#[integration_event(name = "WorkspaceImported", correlation = import_id)]
pub struct WorkspaceImportedEvent {
    pub workspace_id: String,
    pub import_id: String,
    pub import_base_dir: PathBuf,
}

#[integration_event(name = "ImportNotebooks", correlation = import_id)]
pub struct ImportNotebooksEvent {
    pub workspace_id: String,
    pub import_id: String,
    pub import_base_dir: PathBuf,
}

#[integration_event(name = "ImportWorkflows", correlation = import_id)]
pub struct ImportWorkflowsEvent {
    pub workspace_id: String,
    pub import_id: String,
    pub import_base_dir: PathBuf,
}

#[integration_event(name = "ImportDataModels", correlation = import_id)]
pub struct ImportDataModelsEvent {
    pub workspace_id: String,
    pub import_id: String,
    pub import_base_dir: PathBuf,
}

#[integration_event(name = "ImportNotebookServers", correlation = import_id)]
pub struct ImportNotebookServersEvent {
    pub workspace_id: String,
    pub import_id: String,
    pub import_base_dir: PathBuf,
}

/// workspace 已删除（补偿）；各限界上下文订阅后清理自身资源
#[integration_event(name = "WorkspaceDeleted", correlation = import_id)]
pub struct WorkspaceDeletedEvent {
    pub workspace_id: String,
    /// 被补偿的那次导入
    pub import_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// 参与导入的限界上下文
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundedContext {
    Notebook,
    Workflow,
    DataModel,
    NotebookServer,
}

impl BoundedContext {
    pub const ALL: [BoundedContext; 4] = [
        BoundedContext::Notebook,
        BoundedContext::Workflow,
        BoundedContext::DataModel,
        BoundedContext::NotebookServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BoundedContext::Notebook => "notebook",
            BoundedContext::Workflow => "workflow",
            BoundedContext::DataModel => "data_model",
            BoundedContext::NotebookServer => "notebook_server",
        }
    }

    /// 该上下文负责的导入事件类型
    pub fn import_event_type(&self) -> &'static str {
        match self {
            BoundedContext::Notebook => ImportNotebooksEvent::TYPE,
            BoundedContext::Workflow => ImportWorkflowsEvent::TYPE,
            BoundedContext::DataModel => ImportDataModelsEvent::TYPE,
            BoundedContext::NotebookServer => ImportNotebookServersEvent::TYPE,
        }
    }
}

impl fmt::Display for BoundedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 四个兄弟导入事件的公共形状
pub trait ResourceImportEvent: IntegrationEvent + Clone {
    const CONTEXT: BoundedContext;

    fn new(workspace_id: String, import_id: String, import_base_dir: PathBuf) -> Self;

    fn workspace_id(&self) -> &str;

    fn import_id(&self) -> &str;

    fn import_base_dir(&self) -> &Path;
}

macro_rules! resource_import_event {
    ($ty:ty, $ctx:expr) => {
        impl ResourceImportEvent for $ty {
            const CONTEXT: BoundedContext = $ctx;

            fn new(workspace_id: String, import_id: String, import_base_dir: PathBuf) -> Self {
                Self {
                    workspace_id,
                    import_id,
                    import_base_dir,
                }
            }

            fn workspace_id(&self) -> &str {
                &self.workspace_id
            }

            fn import_id(&self) -> &str {
                &self.import_id
            }

            fn import_base_dir(&self) -> &Path {
                &self.import_base_dir
            }
        }
    };
}

resource_import_event!(ImportNotebooksEvent, BoundedContext::Notebook);
resource_import_event!(ImportWorkflowsEvent, BoundedContext::Workflow);
resource_import_event!(ImportDataModelsEvent, BoundedContext::DataModel);
resource_import_event!(ImportNotebookServersEvent, BoundedContext::NotebookServer);

/// saga 等待的兄弟事件类型
pub fn sibling_event_types() -> [&'static str; 4] {
    BoundedContext::ALL.map(|c| c.import_event_type())
}
