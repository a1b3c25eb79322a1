//! Static tables of the guest-view surface: channel names, the operations a
//! remote embedder may perform on its guests, and the guest event catalog.

use serde_json::{Map, Value};

pub const CREATE_AND_ATTACH_GUEST: &str = "GUEST_VIEW_MANAGER_CREATE_AND_ATTACH_GUEST";
pub const DETACH_GUEST: &str = "GUEST_VIEW_MANAGER_DETACH_GUEST";
pub const FOCUS_CHANGE: &str = "GUEST_VIEW_MANAGER_FOCUS_CHANGE";
pub const CALL: &str = "GUEST_VIEW_MANAGER_CALL";
pub const PROPERTY_GET: &str = "GUEST_VIEW_MANAGER_PROPERTY_GET";
pub const PROPERTY_SET: &str = "GUEST_VIEW_MANAGER_PROPERTY_SET";
pub const DISPATCH_EVENT: &str = "GUEST_VIEW_INTERNAL_DISPATCH_EVENT";
pub const VISIBILITY_CHANGE: &str = "GUEST_INSTANCE_VISIBILITY_CHANGE";

/// Sentinel returned to the embedder when attachment was canceled.
pub const CREATION_CANCELED: i64 = -1;

pub const SYNC_METHODS: &[&str] = &[
    "getURL",
    "getTitle",
    "isLoading",
    "isLoadingMainFrame",
    "isWaitingForResponse",
    "stop",
    "reload",
    "reloadIgnoringCache",
    "canGoBack",
    "canGoForward",
    "canGoToOffset",
    "clearHistory",
    "goBack",
    "goForward",
    "goToIndex",
    "goToOffset",
    "isCrashed",
    "setUserAgent",
    "getUserAgent",
    "openDevTools",
    "closeDevTools",
    "isDevToolsOpened",
    "isDevToolsFocused",
    "inspectElement",
    "setAudioMuted",
    "isAudioMuted",
    "isCurrentlyAudible",
    "undo",
    "redo",
    "cut",
    "copy",
    "paste",
    "pasteAndMatchStyle",
    "delete",
    "selectAll",
    "unselect",
    "replace",
    "replaceMisspelling",
    "findInPage",
    "stopFindInPage",
    "downloadURL",
    "inspectSharedWorker",
    "inspectServiceWorker",
    "showDefinitionForSelection",
    "getZoomFactor",
    "getZoomLevel",
    "setZoomFactor",
    "setZoomLevel",
];

pub const ASYNC_METHODS: &[&str] = &[
    "loadURL",
    "executeJavaScript",
    "insertCSS",
    "insertText",
    "removeInsertedCSS",
    "send",
    "sendInputEvent",
    "setLayoutZoomLevelLimits",
    "setVisualZoomLevelLimits",
    "print",
    "printToPDF",
    "capturePage",
];

pub const PROPERTIES: &[&str] = &[
    "audioMuted",
    "userAgent",
    "zoomLevel",
    "zoomFactor",
    "frameRate",
];

/// Guest events relayed to the embedder, with the names of their positional
/// arguments.
pub const WEB_VIEW_EVENTS: &[(&str, &[&str])] = &[
    ("load-commit", &["url", "isMainFrame"]),
    ("did-attach", &[]),
    ("did-finish-load", &[]),
    (
        "did-fail-load",
        &[
            "errorCode",
            "errorDescription",
            "validatedURL",
            "isMainFrame",
            "frameProcessId",
            "frameRoutingId",
        ],
    ),
    (
        "did-frame-finish-load",
        &["isMainFrame", "frameProcessId", "frameRoutingId"],
    ),
    ("did-start-loading", &[]),
    ("did-stop-loading", &[]),
    ("dom-ready", &[]),
    ("console-message", &["level", "message", "line", "sourceId"]),
    ("context-menu", &["params"]),
    ("devtools-opened", &[]),
    ("devtools-closed", &[]),
    ("devtools-focused", &[]),
    ("will-navigate", &["url"]),
    (
        "did-start-navigation",
        &["url", "isInPlace", "isMainFrame", "frameProcessId", "frameRoutingId"],
    ),
    (
        "did-redirect-navigation",
        &["url", "isInPlace", "isMainFrame", "frameProcessId", "frameRoutingId"],
    ),
    ("did-navigate", &["url", "httpResponseCode", "httpStatusText"]),
    (
        "did-frame-navigate",
        &[
            "url",
            "httpResponseCode",
            "httpStatusText",
            "isMainFrame",
            "frameProcessId",
            "frameRoutingId",
        ],
    ),
    (
        "did-navigate-in-page",
        &["url", "isMainFrame", "frameProcessId", "frameRoutingId"],
    ),
    ("-focus-change", &["focus"]),
    ("close", &[]),
    ("crashed", &[]),
    ("render-process-gone", &["details"]),
    ("plugin-crashed", &["name", "version"]),
    ("destroyed", &[]),
    ("page-title-updated", &["title", "explicitSet"]),
    ("page-favicon-updated", &["favicons"]),
    ("enter-html-full-screen", &[]),
    ("leave-html-full-screen", &[]),
    ("media-started-playing", &[]),
    ("media-paused", &[]),
    ("found-in-page", &["result"]),
    ("did-change-theme-color", &["themeColor"]),
    ("update-target-url", &["url"]),
];

pub fn is_sync_method(name: &str) -> bool {
    SYNC_METHODS.contains(&name)
}

pub fn is_async_method(name: &str) -> bool {
    ASYNC_METHODS.contains(&name)
}

pub fn is_property(name: &str) -> bool {
    PROPERTIES.contains(&name)
}

/// Name the positional arguments of a catalogued event. `None` for events
/// outside the catalog; missing arguments become `null`.
pub fn event_props(event: &str, args: &[Value]) -> Option<Map<String, Value>> {
    let (_, names) = WEB_VIEW_EVENTS.iter().find(|(name, _)| *name == event)?;
    Some(
        names
            .iter()
            .enumerate()
            .map(|(index, prop)| {
                (
                    (*prop).to_string(),
                    args.get(index).cloned().unwrap_or(Value::Null),
                )
            })
            .collect(),
    )
}

/// Channel a guest's events travel on, unique per view instance.
pub fn embedder_channel(channel: &str, view_instance_id: i64) -> String {
    format!("{channel}-{view_instance_id}")
}
