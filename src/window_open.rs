//! Window-open negotiation.
//!
//! A surface asking for a new top-level surface is run through the
//! application's decision callback. The decision is taken on the
//! pre-creation signal and stashed per opener; the creation signal one loop
//! turn later consumes it. A stash is consumed exactly once.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::host::{HostState, SignalOutcome};
use crate::surface::preferences::{
    inherit_security_preferences, parse_features, Preferences, WINDOW_INHERITED_PREFERENCES,
};
use crate::surface::{CreateSurfaceParams, LoadUrlOptions, SurfaceId, SurfaceKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    #[default]
    Default,
    ForegroundTab,
    BackgroundTab,
    NewWindow,
    SaveToDisk,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Referrer {
    pub url: String,
    pub policy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PostDataElement {
    RawData { bytes: String },
    #[serde(rename_all = "camelCase")]
    File { file_path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostBody {
    pub data: Vec<PostDataElement>,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary: Option<String>,
    /// Decoded fields of a urlencoded form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<(String, String)>,
}

const MULTIPART: &str = "multipart/form-data";
const URLENCODED: &str = "application/x-www-form-urlencoded";

impl PostBody {
    /// Classify a form submission. Multipart bodies open with their
    /// boundary line; everything else is treated as urlencoded.
    pub fn parse(data: Vec<PostDataElement>) -> Self {
        let first = match data.first() {
            Some(PostDataElement::RawData { bytes }) => Some(bytes.as_str()),
            _ => None,
        };
        if let Some(boundary) = first.and_then(multipart_boundary) {
            return Self {
                data,
                content_type: MULTIPART.to_string(),
                boundary: Some(boundary),
                fields: Vec::new(),
            };
        }
        let fields = first
            .and_then(|bytes| serde_urlencoded::from_str::<Vec<(String, String)>>(bytes).ok())
            .unwrap_or_default();
        Self {
            data,
            content_type: URLENCODED.to_string(),
            boundary: None,
            fields,
        }
    }
}

fn multipart_boundary(body: &str) -> Option<String> {
    let line = body.split(['\r', '\n']).next()?;
    if !line.starts_with("--") {
        return None;
    }
    let trimmed = line.trim_end_matches('-');
    (trimmed.len() > 2).then(|| trimmed[2..].to_string())
}

/// What the decision callback sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDetails {
    pub url: String,
    pub frame_name: String,
    pub features: String,
    pub referrer: Referrer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_body: Option<PostBody>,
    pub disposition: Disposition,
}

/// A window-open request as signalled by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowOpenRequest {
    pub opener: SurfaceId,
    pub url: String,
    #[serde(default)]
    pub frame_name: String,
    #[serde(default)]
    pub features: String,
    #[serde(default)]
    pub disposition: Disposition,
    #[serde(default)]
    pub referrer: Referrer,
    #[serde(default)]
    pub post_data: Option<Vec<PostDataElement>>,
}

impl WindowOpenRequest {
    pub fn details(&self) -> HandlerDetails {
        HandlerDetails {
            url: self.url.clone(),
            frame_name: self.frame_name.clone(),
            features: self.features.clone(),
            referrer: self.referrer.clone(),
            post_body: self.post_data.clone().map(PostBody::parse),
            disposition: self.disposition,
        }
    }
}

/// Options the application may override for the new surface.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowOptions {
    pub background_color: Option<String>,
    pub transparent: Option<bool>,
    pub web_preferences: Preferences,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WindowOptions {
    /// The fields that must be known when the child is constructed.
    pub fn secure_preferences(&self) -> Preferences {
        Preferences {
            background_color: self.background_color.clone(),
            transparent: self.transparent,
            ..Preferences::default()
        }
        .overlay(&self.web_preferences)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOpenDecision {
    Deny,
    Allow {
        options: Option<WindowOptions>,
        outlives_opener: bool,
    },
}

impl WindowOpenDecision {
    fn allow_default() -> Self {
        Self::Allow {
            options: None,
            outlives_opener: false,
        }
    }
}

/// Validate the callback's answer. Anything other than a well-formed allow
/// or deny is logged and treated as deny.
pub fn interpret_response(response: &Value) -> WindowOpenDecision {
    let Some(object) = response.as_object() else {
        error!(
            target = "window_open",
            response = %response,
            "window open handler response must be an object"
        );
        return WindowOpenDecision::Deny;
    };
    match object.get("action").and_then(Value::as_str) {
        Some("deny") => WindowOpenDecision::Deny,
        Some("allow") => {
            let overrides = object
                .get("overrideOptions")
                .or_else(|| object.get("overrideBrowserWindowOptions"))
                .filter(|value| value.is_object());
            let options = match overrides {
                Some(value) => match serde_json::from_value::<WindowOptions>(value.clone()) {
                    Ok(options) => options,
                    Err(err) => {
                        warn!(target = "window_open", error = %err, "ignoring malformed override options");
                        WindowOptions::default()
                    }
                },
                None => WindowOptions::default(),
            };
            WindowOpenDecision::Allow {
                options: Some(options),
                outlives_opener: object
                    .get("outlivesOpener")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        }
        _ => {
            error!(
                target = "window_open",
                "window open handler response must have an 'action' of 'allow' or 'deny'"
            );
            WindowOpenDecision::Deny
        }
    }
}

/// Preferences of a window-open child: the renderer-supplied features, then
/// the security keys forced from the opener, then the application overrides.
pub fn window_preferences(
    opener: &Preferences,
    parsed: &Preferences,
    secure: Option<&Preferences>,
) -> Preferences {
    let mut prefs = parsed.clone();
    inherit_security_preferences(&mut prefs, opener, WINDOW_INHERITED_PREFERENCES);
    match secure {
        Some(secure) => prefs.overlay(secure),
        None => prefs,
    }
}

pub type WindowOpenHandler = Rc<dyn Fn(&HandlerDetails) -> Value>;

#[derive(Debug, Clone, PartialEq)]
struct PendingWindow {
    preferences: Preferences,
    outlives_opener: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildWindow {
    pub opener: SurfaceId,
    pub outlives_opener: bool,
}

#[derive(Default)]
pub struct WindowOpenNegotiator {
    handlers: HashMap<SurfaceId, WindowOpenHandler>,
    stash: HashMap<SurfaceId, PendingWindow>,
    children: HashMap<SurfaceId, ChildWindow>,
}

impl WindowOpenNegotiator {
    pub fn set_handler(&mut self, surface: SurfaceId, handler: Option<WindowOpenHandler>) {
        match handler {
            Some(handler) => {
                self.handlers.insert(surface, handler);
            }
            None => {
                self.handlers.remove(&surface);
            }
        }
    }

    pub fn handler(&self, surface: SurfaceId) -> Option<WindowOpenHandler> {
        self.handlers.get(&surface).cloned()
    }

    pub fn has_pending(&self, opener: SurfaceId) -> bool {
        self.stash.contains_key(&opener)
    }

    fn stash(&mut self, opener: SurfaceId, pending: PendingWindow) {
        self.stash.insert(opener, pending);
    }

    fn take_pending(&mut self, opener: SurfaceId) -> Option<PendingWindow> {
        self.stash.remove(&opener)
    }

    fn clear_pending(&mut self, opener: SurfaceId) {
        self.stash.remove(&opener);
    }

    pub fn child(&self, child: SurfaceId) -> Option<ChildWindow> {
        self.children.get(&child).copied()
    }

    fn record_child(&mut self, child: SurfaceId, window: ChildWindow) {
        self.children.insert(child, window);
    }

    /// Forget everything about `surface`. Returns its children that must
    /// close along with it.
    pub(crate) fn forget_surface(&mut self, surface: SurfaceId) -> Vec<SurfaceId> {
        self.handlers.remove(&surface);
        self.stash.remove(&surface);
        self.children.remove(&surface);
        let mut closing = Vec::new();
        self.children.retain(|child, window| {
            if window.opener != surface {
                return true;
            }
            if !window.outlives_opener {
                closing.push(*child);
            }
            false
        });
        closing.sort();
        closing
    }
}

fn decide(state: &HostState, opener: SurfaceId, details: &HandlerDetails) -> WindowOpenDecision {
    let Some(handler) = state.windows.borrow().handler(opener) else {
        return WindowOpenDecision::allow_default();
    };
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(details))) {
        Ok(response) => interpret_response(&response),
        Err(_) => {
            error!(target = "window_open", opener = %opener, "window open handler panicked");
            WindowOpenDecision::Deny
        }
    }
}

fn child_preferences(
    state: &HostState,
    opener: SurfaceId,
    features: &str,
    options: Option<&WindowOptions>,
) -> Option<Preferences> {
    let opener_prefs = state.surfaces.borrow().live(opener).ok()?.preferences.clone();
    let parsed = parse_features(features).web_preferences;
    let secure = options.map(WindowOptions::secure_preferences);
    Some(window_preferences(&opener_prefs, &parsed, secure.as_ref()))
}

/// Pre-creation signal: take the decision and stash it for the creation
/// signal that follows.
pub(crate) fn will_add_new_contents(state: &HostState, request: &WindowOpenRequest) -> SignalOutcome {
    let details = request.details();
    let opener = request.opener;
    let WindowOpenDecision::Allow {
        options,
        outlives_opener,
    } = decide(state, opener, &details)
    else {
        state.windows.borrow_mut().clear_pending(opener);
        info!(target = "window_open", opener = %opener, url = %request.url, "window open denied");
        return SignalOutcome::prevented();
    };
    let Some(preferences) = child_preferences(state, opener, &request.features, options.as_ref())
    else {
        return SignalOutcome::prevented();
    };
    state.windows.borrow_mut().stash(
        opener,
        PendingWindow {
            preferences: preferences.clone(),
            outlives_opener,
        },
    );
    state.with_backend(|backend| backend.set_next_child_preferences(opener, &preferences));
    SignalOutcome::default()
}

/// Creation signal: consume the stash and create the child surface.
pub(crate) fn add_new_contents(state: &HostState, request: &WindowOpenRequest) -> SignalOutcome {
    let opener = request.opener;
    let pending = state.windows.borrow_mut().take_pending(opener);
    if !state
        .config
        .window_open
        .allowed_dispositions
        .contains(&request.disposition)
    {
        debug!(
            target = "window_open",
            opener = %opener,
            disposition = ?request.disposition,
            "disposition does not open a surface"
        );
        return SignalOutcome::prevented();
    }
    let (preferences, outlives_opener) = match pending {
        Some(pending) => (pending.preferences, pending.outlives_opener),
        None => match child_preferences(state, opener, &request.features, None) {
            Some(preferences) => (preferences, false),
            None => return SignalOutcome::prevented(),
        },
    };
    open_window(state, request, preferences, outlives_opener, false)
}

/// One-step path: decide and create in the same signal.
pub(crate) fn new_window(state: &HostState, request: &WindowOpenRequest) -> SignalOutcome {
    let details = request.details();
    let WindowOpenDecision::Allow {
        options,
        outlives_opener,
    } = decide(state, request.opener, &details)
    else {
        info!(target = "window_open", opener = %request.opener, url = %request.url, "window open denied");
        return SignalOutcome::prevented();
    };
    let Some(preferences) =
        child_preferences(state, request.opener, &request.features, options.as_ref())
    else {
        return SignalOutcome::prevented();
    };
    open_window(state, request, preferences, outlives_opener, true)
}

fn open_window(
    state: &HostState,
    request: &WindowOpenRequest,
    preferences: Preferences,
    outlives_opener: bool,
    navigate: bool,
) -> SignalOutcome {
    let opener = request.opener;
    let child = match state.create_surface(CreateSurfaceParams {
        kind: SurfaceKind::TopLevel,
        preferences,
        embedder: None,
        opener: Some(opener),
    }) {
        Ok(child) => child,
        Err(err) => {
            error!(target = "window_open", opener = %opener, error = %err, "failed to create window");
            return SignalOutcome::prevented();
        }
    };
    state.windows.borrow_mut().record_child(
        child,
        ChildWindow {
            opener,
            outlives_opener,
        },
    );

    if navigate {
        match Url::parse(&request.url) {
            Ok(url) => {
                let options = LoadUrlOptions {
                    http_referrer: Some(request.referrer.url.clone()).filter(|url| !url.is_empty()),
                    user_agent: None,
                };
                state.with_backend(|backend| backend.load_url(child, &url, &options));
            }
            Err(err) => warn!(target = "window_open", url = %request.url, error = %err, "not navigating new window"),
        }
    }

    info!(
        target = "window_open",
        opener = %opener,
        child = %child,
        outlives_opener,
        "window opened"
    );
    state.hooks.emit_did_create_window(child, &request.details());
    SignalOutcome::created(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_responses_deny() {
        for response in [json!(null), json!("allow"), json!({}), json!({ "action": "maybe" })] {
            assert_eq!(interpret_response(&response), WindowOpenDecision::Deny);
        }
        assert_eq!(
            interpret_response(&json!({ "action": "deny" })),
            WindowOpenDecision::Deny
        );
    }

    #[test]
    fn allow_carries_overrides() {
        let decision = interpret_response(&json!({
            "action": "allow",
            "outlivesOpener": true,
            "overrideOptions": {
                "backgroundColor": "#000",
                "width": 300,
                "webPreferences": { "sandbox": false }
            }
        }));
        let WindowOpenDecision::Allow {
            options: Some(options),
            outlives_opener,
        } = decision
        else {
            panic!("expected allow");
        };
        assert!(outlives_opener);
        assert_eq!(options.extra.get("width"), Some(&json!(300)));
        let secure = options.secure_preferences();
        assert_eq!(secure.background_color.as_deref(), Some("#000"));
        assert_eq!(secure.sandbox, Some(false));
    }

    #[test]
    fn override_beats_inherited_security() {
        let opener = Preferences {
            sandbox: Some(true),
            webview_tag: Some(false),
            node_integration: Some(true),
            ..Preferences::default()
        };
        let parsed = parse_features("nodeIntegration=yes,webviewTag=yes").web_preferences;
        let secure = Preferences {
            sandbox: Some(false),
            ..Preferences::default()
        };
        let prefs = window_preferences(&opener, &parsed, Some(&secure));
        assert_eq!(prefs.webview_tag, Some(false));
        assert_eq!(prefs.node_integration, Some(true));
        assert_eq!(prefs.sandbox, Some(false));
    }

    #[test]
    fn default_opener_strips_node_integration_from_features() {
        let parsed = parse_features("nodeIntegration=yes,contextIsolation=no").web_preferences;
        let prefs = window_preferences(&Preferences::default(), &parsed, None);
        assert_eq!(prefs.node_integration, Some(false));
        assert_eq!(prefs.context_isolation, Some(true));
        assert_eq!(prefs.webview_tag, Some(false));
    }

    #[test]
    fn detects_multipart_boundary() {
        let body = PostBody::parse(vec![PostDataElement::RawData {
            bytes: "------WebKitFormBoundaryAbc\r\nContent-Disposition: form-data".into(),
        }]);
        assert_eq!(body.content_type, MULTIPART);
        assert_eq!(body.boundary.as_deref(), Some("----WebKitFormBoundaryAbc"));

        let form = PostBody::parse(vec![PostDataElement::RawData {
            bytes: "q=rust+host&page=2".into(),
        }]);
        assert_eq!(form.content_type, URLENCODED);
        assert_eq!(
            form.fields,
            vec![("q".to_string(), "rust host".to_string()), ("page".to_string(), "2".to_string())]
        );

        assert_eq!(PostBody::parse(Vec::new()).content_type, URLENCODED);
    }

    #[test]
    fn unknown_disposition_deserializes() {
        let disposition: Disposition = serde_json::from_value(json!("new-popup")).unwrap();
        assert_eq!(disposition, Disposition::Other);
    }

    #[test]
    fn closing_opener_takes_dependent_children() {
        let mut negotiator = WindowOpenNegotiator::default();
        let opener = SurfaceId(1);
        negotiator.record_child(
            SurfaceId(2),
            ChildWindow {
                opener,
                outlives_opener: false,
            },
        );
        negotiator.record_child(
            SurfaceId(3),
            ChildWindow {
                opener,
                outlives_opener: true,
            },
        );
        assert_eq!(negotiator.forget_surface(opener), vec![SurfaceId(2)]);
        assert!(negotiator.child(SurfaceId(3)).is_none());
    }
}
