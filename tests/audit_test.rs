use std::future::Future;

use frontier_host::audit::AuditReport;
use frontier_host::guest::methods::CREATE_AND_ATTACH_GUEST;
use frontier_host::ipc::{InboundMessage, InvokeReply, MessageKind, Reply};
use frontier_host::surface::preferences::Preferences;
use frontier_host::surface::{FrameId, SurfaceKind};
use frontier_host::{HeadlessBackend, Host, HostConfig, SurfaceId};
use serde_json::{json, Value};

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn events(report: &AuditReport) -> Vec<Value> {
    report.entries().unwrap()
}

fn names(entries: &[Value]) -> Vec<&str> {
    entries
        .iter()
        .map(|entry| entry["event"].as_str().unwrap())
        .collect()
}

#[test]
fn records_registrations_and_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.jsonl");
    let backend = HeadlessBackend::new();
    let config = HostConfig {
        audit_report: Some(path.clone()),
        ..HostConfig::default()
    };
    let host = Host::new(config, backend.clone()).unwrap();
    let report = AuditReport::new(&path);

    // the guest-view channels register themselves on construction
    let entries = events(&report);
    assert_eq!(names(&entries), vec!["handler-registered", "handler-registered"]);
    assert!(entries
        .iter()
        .all(|entry| entry["scope"] == json!("ipcMainInternal")));
    assert_eq!(entries[0]["channel"], json!(CREATE_AND_ATTACH_GUEST));

    let embedder = host
        .create_surface(
            SurfaceKind::TopLevel,
            Preferences {
                webview_tag: Some(true),
                ..Preferences::default()
            },
        )
        .unwrap();
    host.router()
        .ipc_main()
        .handle("ping", |_event, _args| async { anyhow::Ok(json!("pong")) })
        .unwrap();
    assert!(host
        .router()
        .ipc_main()
        .handle("ping", |_event, _args| async { anyhow::Ok(Value::Null) })
        .is_err());
    host.set_window_open_handler(embedder, |_details| json!({ "action": "deny" }));

    let message = InboundMessage {
        sender: embedder,
        process_id: host.surface(embedder).unwrap().process_id,
        frame_id: FrameId(1),
        internal: true,
        channel: CREATE_AND_ATTACH_GUEST.to_string(),
        args: vec![json!(3), json!(8), json!({ "src": "https://guest.test/" })],
        kind: MessageKind::Invoke { request_id: 1 },
    };
    block_on(host.handle_message(message).unwrap());
    let guest = match backend.log().reply_to(embedder, 1).cloned() {
        Some(Reply::Invoke(InvokeReply::Result(value))) => SurfaceId(value.as_u64().unwrap() as u32),
        other => panic!("expected guest id, got {other:?}"),
    };
    assert!(host.surface(guest).is_some());

    let entries = events(&report);
    assert_eq!(
        &names(&entries)[2..],
        &[
            "surface-created",
            "handler-registered",
            "window-open-handler-set",
            "will-attach-webview",
        ]
    );
    assert_eq!(entries[2]["surface"], json!(embedder.0));
    assert_eq!(entries[2]["webPreferences"]["webviewTag"], json!(true));
    assert_eq!(entries[3]["scope"], json!("ipcMain"));
    assert_eq!(entries[3]["channel"], json!("ping"));
    assert_eq!(entries[4]["surface"], json!(embedder.0));
    assert_eq!(entries[5]["embedder"], json!(embedder.0));
    assert_eq!(entries[5]["embedderFrameId"], json!(3));
    assert_eq!(entries[5]["elementInstanceId"], json!(8));
    assert_eq!(entries[5]["params"]["src"], json!("https://guest.test/"));
    assert_eq!(entries[5]["webPreferences"]["sandbox"], json!(true));
}

#[test]
fn scoped_registrations_name_their_scope() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.jsonl");
    let config = HostConfig {
        audit_report: Some(path.clone()),
        ..HostConfig::default()
    };
    let host = Host::new(config, HeadlessBackend::new()).unwrap();
    let surface = host
        .create_surface(SurfaceKind::Offscreen, Preferences::default())
        .unwrap();
    host.router()
        .surface_scope(surface)
        .handle("local", |_event, _args| async { anyhow::Ok(Value::Null) })
        .unwrap();

    let entries = events(&AuditReport::new(&path));
    // offscreen surfaces are not top-level windows
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2]["scope"], json!(format!("surface {surface}")));
    assert_eq!(entries[2]["channel"], json!("local"));
}
