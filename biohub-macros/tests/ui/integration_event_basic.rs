use biohub_eventing::IntegrationEvent;
use biohub_macros::integration_event;

#[integration_event(name = "ImportNotebooks", correlation = workspace_id)]
struct ImportNotebooksEvent {
    workspace_id: String,
    import_base_dir: std::path::PathBuf,
}

fn main() {
    let event = ImportNotebooksEvent {
        workspace_id: "w1".into(),
        import_base_dir: "/tmp/w1".into(),
    };
    assert_eq!(<ImportNotebooksEvent as IntegrationEvent>::TYPE, "ImportNotebooks");
    assert_eq!(event.correlation_id().as_deref(), Some("w1"));
    let copy = event.clone();
    assert_eq!(copy, event);
}
