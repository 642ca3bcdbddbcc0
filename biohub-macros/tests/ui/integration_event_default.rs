use biohub_eventing::IntegrationEvent;
use biohub_macros::integration_event;
use serde::{Deserialize, Serialize};

#[integration_event]
#[derive(Serialize, Deserialize, Eq)]
#[serde(rename_all = "camelCase")]
struct WorkspaceDeletedEvent {
    workspace_id: String,
    reason: Option<String>,
}

fn main() {
    let event = WorkspaceDeletedEvent {
        workspace_id: "w1".into(),
        reason: None,
    };
    assert_eq!(WorkspaceDeletedEvent::TYPE, "WorkspaceDeleted");
    assert_eq!(event.correlation_id(), None);

    let encoded = event.encode().unwrap();
    assert!(encoded.get("workspaceId").is_some());
    assert_eq!(WorkspaceDeletedEvent::decode(&encoded).unwrap(), event);
}
