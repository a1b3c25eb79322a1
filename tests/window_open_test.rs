use std::cell::RefCell;
use std::rc::Rc;

use frontier_host::config::WindowOpenConfig;
use frontier_host::surface::preferences::Preferences;
use frontier_host::surface::SurfaceKind;
use frontier_host::window_open::{Disposition, HandlerDetails, PostDataElement, WindowOpenRequest};
use frontier_host::{HeadlessBackend, Host, HostConfig, SurfaceId, SurfaceSignal};
use serde_json::{json, Value};

fn host() -> (Host, HeadlessBackend, SurfaceId) {
    let backend = HeadlessBackend::new();
    let host = Host::new(HostConfig::default(), backend.clone()).unwrap();
    let opener = host
        .create_surface(
            SurfaceKind::TopLevel,
            Preferences {
                sandbox: Some(true),
                webview_tag: Some(false),
                node_integration: Some(true),
                ..Preferences::default()
            },
        )
        .unwrap();
    (host, backend, opener)
}

fn request(opener: SurfaceId, url: &str) -> WindowOpenRequest {
    WindowOpenRequest {
        opener,
        url: url.to_string(),
        frame_name: "popup".into(),
        features: "width=400,nodeIntegration=yes".into(),
        disposition: Disposition::ForegroundTab,
        referrer: Default::default(),
        post_data: None,
    }
}

#[test]
fn denied_request_creates_nothing() {
    let (host, backend, opener) = host();
    let calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&calls);
    host.set_window_open_handler(opener, move |_details| {
        *counter.borrow_mut() += 1;
        json!({ "action": "deny" })
    });

    let outcome = host.handle_signal(SurfaceSignal::WillAddNewContents(request(
        opener,
        "https://ads.test/",
    )));
    assert!(outcome.prevented);
    assert!(outcome.created.is_none());
    assert!(!host.has_pending_window(opener));
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(host.surface_ids(), vec![opener]);
    assert!(backend.log().next_child_preferences.is_empty());

    let outcome = host.handle_signal(SurfaceSignal::NewWindow(request(opener, "https://ads.test/")));
    assert!(outcome.prevented);
    assert_eq!(host.surface_ids(), vec![opener]);
    assert_eq!(*calls.borrow(), 2);
}

#[test]
fn malformed_decisions_are_denied() {
    let (host, _backend, opener) = host();
    for response in [Value::Null, json!(7), json!({ "action": "open" }), json!({})] {
        let response = response.clone();
        host.set_window_open_handler(opener, move |_details| response.clone());
        let outcome = host.handle_signal(SurfaceSignal::WillAddNewContents(request(
            opener,
            "https://a.test/",
        )));
        assert!(outcome.prevented);
    }
    assert_eq!(host.surface_ids(), vec![opener]);
}

#[test]
fn allowed_overrides_reach_the_child() {
    let (host, backend, opener) = host();
    let seen = Rc::new(RefCell::new(Vec::<HandlerDetails>::new()));
    let sink = Rc::clone(&seen);
    host.set_window_open_handler(opener, move |details| {
        sink.borrow_mut().push(details.clone());
        json!({
            "action": "allow",
            "overrideOptions": {
                "backgroundColor": "#101010",
                "transparent": true,
                "webPreferences": { "sandbox": false }
            }
        })
    });

    let outcome = host.handle_signal(SurfaceSignal::WillAddNewContents(request(
        opener,
        "https://docs.test/",
    )));
    assert!(!outcome.prevented);
    assert!(host.has_pending_window(opener));
    {
        let log = backend.log();
        let next = log.next_child_preferences.get(&opener).unwrap();
        assert_eq!(next.background_color.as_deref(), Some("#101010"));
        assert_eq!(next.transparent, Some(true));
        assert_eq!(next.sandbox, Some(false));
        assert_eq!(next.webview_tag, Some(false));
        assert_eq!(next.node_integration, Some(true));
    }

    let outcome = host.handle_signal(SurfaceSignal::AddNewContents(request(
        opener,
        "https://docs.test/",
    )));
    let child = outcome.created.expect("child created");
    assert!(!host.has_pending_window(opener));

    let surface = host.surface(child).unwrap();
    assert_eq!(surface.kind, SurfaceKind::TopLevel);
    assert_eq!(surface.opener, Some(opener));
    assert_eq!(surface.preferences.background_color.as_deref(), Some("#101010"));

    let details = seen.borrow();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].url, "https://docs.test/");
    assert_eq!(details[0].frame_name, "popup");
    assert_eq!(details[0].disposition, Disposition::ForegroundTab);
}

#[test]
fn stashed_decision_is_consumed_once() {
    let (host, _backend, opener) = host();
    host.set_window_open_handler(opener, |_details| {
        json!({ "action": "allow", "overrideOptions": { "backgroundColor": "#fff" } })
    });
    host.handle_signal(SurfaceSignal::WillAddNewContents(request(opener, "https://a.test/")));
    let first = host
        .handle_signal(SurfaceSignal::AddNewContents(request(opener, "https://a.test/")))
        .created
        .unwrap();

    // A creation signal with no decision in front of it gets no overrides.
    let second = host
        .handle_signal(SurfaceSignal::AddNewContents(request(opener, "https://b.test/")))
        .created
        .unwrap();
    assert_eq!(
        host.surface(first).unwrap().preferences.background_color.as_deref(),
        Some("#fff")
    );
    assert!(host.surface(second).unwrap().preferences.background_color.is_none());
}

#[test]
fn disposition_filter_blocks_creation() {
    let backend = HeadlessBackend::new();
    let config = HostConfig {
        window_open: WindowOpenConfig {
            allowed_dispositions: vec![Disposition::NewWindow],
        },
        ..HostConfig::default()
    };
    let host = Host::new(config, backend).unwrap();
    let opener = host
        .create_surface(SurfaceKind::TopLevel, Preferences::default())
        .unwrap();

    host.handle_signal(SurfaceSignal::WillAddNewContents(request(opener, "https://a.test/")));
    let outcome = host.handle_signal(SurfaceSignal::AddNewContents(request(opener, "https://a.test/")));
    assert!(outcome.prevented);
    assert!(!host.has_pending_window(opener));

    let mut allowed = request(opener, "https://a.test/");
    allowed.disposition = Disposition::NewWindow;
    assert!(host.handle_signal(SurfaceSignal::AddNewContents(allowed)).created.is_some());
}

#[test]
fn children_close_with_opener_unless_they_outlive_it() {
    let (host, backend, opener) = host();
    let outlive = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&outlive);
    host.set_window_open_handler(opener, move |_details| {
        json!({ "action": "allow", "outlivesOpener": *flag.borrow() })
    });

    host.handle_signal(SurfaceSignal::WillAddNewContents(request(opener, "https://a.test/")));
    let dependent = host
        .handle_signal(SurfaceSignal::AddNewContents(request(opener, "https://a.test/")))
        .created
        .unwrap();

    *outlive.borrow_mut() = true;
    host.handle_signal(SurfaceSignal::WillAddNewContents(request(opener, "https://b.test/")));
    let independent = host
        .handle_signal(SurfaceSignal::AddNewContents(request(opener, "https://b.test/")))
        .created
        .unwrap();
    assert!(host.window_child(independent).unwrap().outlives_opener);

    host.destroy_surface(opener);
    assert!(host.surface(dependent).is_none());
    assert!(host.surface(independent).is_some());
    assert!(host.window_child(independent).is_none());
    assert!(backend.log().destroyed.contains(&dependent));
}

#[test]
fn without_handler_requests_are_allowed() {
    let (host, _backend, opener) = host();
    let outcome = host.handle_signal(SurfaceSignal::WillAddNewContents(request(
        opener,
        "https://a.test/",
    )));
    assert!(!outcome.prevented);
    let child = host
        .handle_signal(SurfaceSignal::AddNewContents(request(opener, "https://a.test/")))
        .created
        .unwrap();
    let prefs = host.surface(child).unwrap().preferences;
    assert_eq!(prefs.sandbox, Some(true));
    assert_eq!(prefs.node_integration, Some(true));
}

#[test]
fn default_opener_children_stay_on_secure_defaults() {
    let (host, _backend, _) = host();
    let opener = host
        .create_surface(SurfaceKind::TopLevel, Preferences::default())
        .unwrap();
    let child = host
        .handle_signal(SurfaceSignal::NewWindow(request(opener, "https://a.test/")))
        .created
        .unwrap();
    let prefs = host.surface(child).unwrap().preferences;
    assert_eq!(prefs.node_integration, Some(false));
    assert_eq!(prefs.context_isolation, Some(true));
    assert_eq!(prefs.sandbox, Some(true));
    assert_eq!(prefs.webview_tag, Some(false));
}

#[test]
fn legacy_path_navigates_the_new_window() {
    let (host, backend, opener) = host();
    let created = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&created);
    host.on_did_create_window(move |child, details| {
        sink.borrow_mut().push((child, details.post_body.clone()));
    });
    host.set_window_open_handler(opener, |details| {
        assert_eq!(details.referrer.url, "https://opener.test/");
        json!({ "action": "allow" })
    });

    let mut legacy = request(opener, "https://search.test/results");
    legacy.disposition = Disposition::NewWindow;
    legacy.referrer.url = "https://opener.test/".into();
    legacy.post_data = Some(vec![PostDataElement::RawData {
        bytes: "q=frontier&lang=en".into(),
    }]);
    let child = host
        .handle_signal(SurfaceSignal::NewWindow(legacy))
        .created
        .unwrap();

    {
        let log = backend.log();
        assert_eq!(log.loads_for(child), 1);
        let (_, url, options) = &log.loads[0];
        assert_eq!(url.as_str(), "https://search.test/results");
        assert_eq!(options.http_referrer.as_deref(), Some("https://opener.test/"));
    }

    let created = created.borrow();
    assert_eq!(created.len(), 1);
    let (id, body) = &created[0];
    assert_eq!(*id, child);
    let body = body.as_ref().unwrap();
    assert_eq!(body.content_type, "application/x-www-form-urlencoded");
    assert_eq!(body.fields[0], ("q".to_string(), "frontier".to_string()));
}

#[test]
fn signals_from_dead_openers_are_prevented() {
    let (host, _backend, opener) = host();
    host.destroy_surface(opener);
    let outcome = host.handle_signal(SurfaceSignal::NewWindow(request(opener, "https://a.test/")));
    assert!(outcome.prevented);
    assert!(host.surface_ids().is_empty());
}

#[test]
fn requests_decode_from_signal_json() {
    let signal: SurfaceSignal = serde_json::from_value(json!({
        "signal": "will-add-new-contents",
        "opener": 1,
        "url": "https://a.test/",
        "features": "width=300",
        "disposition": "background-tab",
        "postData": [{ "type": "rawData", "bytes": "a=1" }]
    }))
    .unwrap();
    let SurfaceSignal::WillAddNewContents(request) = signal else {
        panic!("wrong signal");
    };
    assert_eq!(request.disposition, Disposition::BackgroundTab);
    assert_eq!(request.frame_name, "");
    assert_eq!(request.post_data.unwrap().len(), 1);
}
