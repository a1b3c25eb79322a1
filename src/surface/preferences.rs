//! The configuration record a surface is created with, plus the rules that
//! derive a child's configuration from its parent.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Preferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_integration: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_integration_in_sub_frames: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_popups: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_security: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_blink_features: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_blink_features: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_isolation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub javascript: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<bool>,
    #[serde(rename = "enableWebSQL", skip_serializing_if = "Option::is_none")]
    pub enable_web_sql: Option<bool>,
    /// Enables the embedding feature (guest-view IPC) for this surface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webview_tag: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transparent: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! overlay_fields {
    ($target:ident, $source:ident; $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field.clone();
            }
        )+
    };
}

impl Preferences {
    /// Returns `self` with every value set in `other` taking precedence.
    pub fn overlay(&self, other: &Preferences) -> Preferences {
        let mut merged = self.clone();
        overlay_fields!(merged, other;
            node_integration,
            node_integration_in_sub_frames,
            plugins,
            zoom_factor,
            disable_popups,
            web_security,
            enable_blink_features,
            disable_blink_features,
            partition,
            preload,
            context_isolation,
            javascript,
            sandbox,
            enable_web_sql,
            webview_tag,
            background_color,
            transparent,
        );
        for (key, value) in &other.extra {
            merged.extra.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn webview_tag_enabled(&self) -> bool {
        self.webview_tag.unwrap_or(false)
    }
}

/// Security-relevant keys a child may be forced to inherit from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityKey {
    ContextIsolation,
    Javascript,
    NodeIntegration,
    Sandbox,
    NodeIntegrationInSubFrames,
    EnableWebSql,
    WebviewTag,
}

impl SecurityKey {
    fn get(self, prefs: &Preferences) -> Option<bool> {
        match self {
            Self::ContextIsolation => prefs.context_isolation,
            Self::Javascript => prefs.javascript,
            Self::NodeIntegration => prefs.node_integration,
            Self::Sandbox => prefs.sandbox,
            Self::NodeIntegrationInSubFrames => prefs.node_integration_in_sub_frames,
            Self::EnableWebSql => prefs.enable_web_sql,
            Self::WebviewTag => prefs.webview_tag,
        }
    }

    /// The value a surface actually runs with: the explicit setting, or the
    /// default the renderer applies when none was given.
    fn effective(self, prefs: &Preferences) -> bool {
        self.get(prefs).unwrap_or_else(|| match self {
            Self::ContextIsolation | Self::Javascript | Self::EnableWebSql => true,
            Self::NodeIntegration | Self::NodeIntegrationInSubFrames | Self::WebviewTag => false,
            // Sandboxed unless node integration was turned on.
            Self::Sandbox => !Self::NodeIntegration.effective(prefs),
        })
    }

    fn slot(self, prefs: &mut Preferences) -> &mut Option<bool> {
        match self {
            Self::ContextIsolation => &mut prefs.context_isolation,
            Self::Javascript => &mut prefs.javascript,
            Self::NodeIntegration => &mut prefs.node_integration,
            Self::Sandbox => &mut prefs.sandbox,
            Self::NodeIntegrationInSubFrames => &mut prefs.node_integration_in_sub_frames,
            Self::EnableWebSql => &mut prefs.enable_web_sql,
            Self::WebviewTag => &mut prefs.webview_tag,
        }
    }
}

/// Safe baselines a guest inherits from its embedder.
pub const GUEST_INHERITED_PREFERENCES: &[(SecurityKey, bool)] = &[
    (SecurityKey::ContextIsolation, true),
    (SecurityKey::Javascript, false),
    (SecurityKey::NodeIntegration, false),
    (SecurityKey::Sandbox, true),
    (SecurityKey::NodeIntegrationInSubFrames, false),
    (SecurityKey::EnableWebSql, false),
];

/// Safe baselines a window-open child inherits from its opener.
pub const WINDOW_INHERITED_PREFERENCES: &[(SecurityKey, bool)] = &[
    (SecurityKey::ContextIsolation, true),
    (SecurityKey::Javascript, false),
    (SecurityKey::NodeIntegration, false),
    (SecurityKey::Sandbox, true),
    (SecurityKey::WebviewTag, false),
    (SecurityKey::NodeIntegrationInSubFrames, false),
    (SecurityKey::EnableWebSql, false),
];

/// Force `target` to the baseline for every key where `parent` effectively
/// sits on it. Keys where the parent deviates keep whatever `target` requested.
pub fn inherit_security_preferences(
    target: &mut Preferences,
    parent: &Preferences,
    table: &[(SecurityKey, bool)],
) {
    for (key, baseline) in table {
        if key.effective(parent) == *baseline {
            *key.slot(target) = Some(*baseline);
        }
    }
}

/// Only the subset of web preferences a window-open features string may carry.
const WINDOW_FEATURE_PREFERENCES: &[&str] = &[
    "zoomFactor",
    "nodeIntegration",
    "javascript",
    "contextIsolation",
    "webviewTag",
];

const NUMERIC_FEATURES: &[&str] = &["zoomFactor", "left", "top", "width", "height", "x", "y"];

/// Parses `key=value, key2` into a JSON map. Missing values mean `true`,
/// yes/no style values become booleans, numeric keys become numbers.
pub fn parse_comma_separated(source: &str) -> Map<String, Value> {
    let mut parsed = Map::new();
    for pair in source.split(',') {
        let mut parts = pair.splitn(2, '=').map(str::trim);
        let Some(key) = parts.next().filter(|key| !key.is_empty()) else {
            continue;
        };
        parsed.insert(key.to_string(), coerce(key, parts.next()));
    }
    parsed
}

fn coerce(key: &str, value: Option<&str>) -> Value {
    let Some(value) = value else {
        return Value::Bool(true);
    };
    if NUMERIC_FEATURES.contains(&key) {
        if let Some(number) = value.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(number);
        }
    }
    match value {
        "yes" | "true" | "1" => Value::Bool(true),
        "no" | "false" | "0" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

/// Build preferences key by key so one ill-typed entry does not discard the rest.
fn preferences_from_map(map: Map<String, Value>) -> Preferences {
    let mut prefs = Preferences::default();
    for (key, value) in map {
        let mut single = Map::new();
        single.insert(key.clone(), value);
        match serde_json::from_value::<Preferences>(Value::Object(single)) {
            Ok(parsed) => prefs = prefs.overlay(&parsed),
            Err(err) => {
                warn!(target = "preferences", key = %key, error = %err, "ignoring malformed preference");
            }
        }
    }
    prefs
}

/// Parse the `webpreferences` attribute of an embedded element.
pub fn parse_web_preferences(source: &str) -> Preferences {
    preferences_from_map(parse_comma_separated(source))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeatures {
    /// Window geometry and other non-preference options.
    pub options: Map<String, Value>,
    pub web_preferences: Preferences,
}

/// Split a window-open features string into window options and the allowed
/// subset of web preferences.
pub fn parse_features(source: &str) -> ParsedFeatures {
    let mut options = parse_comma_separated(source);
    let mut preference_map = Map::new();
    for key in WINDOW_FEATURE_PREFERENCES {
        if let Some(value) = options.remove(*key) {
            preference_map.insert((*key).to_string(), value);
        }
    }
    if let Some(left) = options.get("left").cloned() {
        options.insert("x".into(), left);
    }
    if let Some(top) = options.get("top").cloned() {
        options.insert("y".into(), top);
    }
    ParsedFeatures {
        options,
        web_preferences: preferences_from_map(preference_map),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_comma_separated_pairs() {
        let parsed = parse_comma_separated("width=400, resizable, scrollbars=no,title=Docs,,");
        assert_eq!(parsed.get("width"), Some(&json!(400.0)));
        assert_eq!(parsed.get("resizable"), Some(&json!(true)));
        assert_eq!(parsed.get("scrollbars"), Some(&json!(false)));
        assert_eq!(parsed.get("title"), Some(&json!("Docs")));
        assert_eq!(parsed.len(), 4);
    }

    #[test]
    fn features_split_preferences_from_options() {
        let parsed = parse_features("left=10,top=20,nodeIntegration=yes,zoomFactor=1.5,sandbox=no");
        assert_eq!(parsed.web_preferences.node_integration, Some(true));
        assert_eq!(parsed.web_preferences.zoom_factor, Some(1.5));
        // sandbox is not settable from a features string
        assert!(parsed.web_preferences.sandbox.is_none());
        assert_eq!(parsed.options.get("sandbox"), Some(&json!(false)));
        assert_eq!(parsed.options.get("x"), Some(&json!(10.0)));
        assert_eq!(parsed.options.get("y"), Some(&json!(20.0)));
    }

    #[test]
    fn malformed_preference_is_dropped() {
        let prefs = parse_web_preferences("contextIsolation=maybe, sandbox=yes");
        assert!(prefs.context_isolation.is_none());
        assert_eq!(prefs.sandbox, Some(true));
    }

    #[test]
    fn inherits_only_baseline_values() {
        let parent = Preferences {
            sandbox: Some(true),
            context_isolation: Some(false),
            node_integration: Some(false),
            ..Default::default()
        };
        let mut child = Preferences {
            sandbox: Some(false),
            context_isolation: Some(false),
            node_integration: Some(true),
            javascript: Some(true),
            ..Default::default()
        };
        inherit_security_preferences(&mut child, &parent, GUEST_INHERITED_PREFERENCES);
        assert_eq!(child.sandbox, Some(true));
        assert_eq!(child.node_integration, Some(false));
        // parent deviates from the baseline, so the child keeps its own value
        assert_eq!(child.context_isolation, Some(false));
        // javascript is on by default, which is not the baseline
        assert_eq!(child.javascript, Some(true));
    }

    #[test]
    fn default_parent_forces_baseline() {
        let mut child = Preferences {
            node_integration: Some(true),
            node_integration_in_sub_frames: Some(true),
            context_isolation: Some(false),
            sandbox: Some(false),
            javascript: Some(false),
            enable_web_sql: Some(true),
            webview_tag: Some(true),
            ..Default::default()
        };
        inherit_security_preferences(&mut child, &Preferences::default(), WINDOW_INHERITED_PREFERENCES);
        assert_eq!(child.node_integration, Some(false));
        assert_eq!(child.node_integration_in_sub_frames, Some(false));
        assert_eq!(child.context_isolation, Some(true));
        assert_eq!(child.sandbox, Some(true));
        assert_eq!(child.webview_tag, Some(false));
        // defaults of javascript and enableWebSQL are not the baseline
        assert_eq!(child.javascript, Some(false));
        assert_eq!(child.enable_web_sql, Some(true));
    }

    #[test]
    fn node_integration_parent_is_not_sandboxed_by_default() {
        let parent = Preferences {
            node_integration: Some(true),
            ..Default::default()
        };
        let mut child = Preferences {
            node_integration: Some(true),
            sandbox: Some(false),
            ..Default::default()
        };
        inherit_security_preferences(&mut child, &parent, GUEST_INHERITED_PREFERENCES);
        assert_eq!(child.node_integration, Some(true));
        assert_eq!(child.sandbox, Some(false));
    }

    #[test]
    fn overlay_prefers_set_values() {
        let base = Preferences {
            partition: Some("persist:a".into()),
            sandbox: Some(false),
            ..Default::default()
        };
        let mut top = Preferences {
            sandbox: Some(true),
            ..Default::default()
        };
        top.extra.insert("spellcheck".into(), json!(false));
        let merged = base.overlay(&top);
        assert_eq!(merged.partition.as_deref(), Some("persist:a"));
        assert_eq!(merged.sandbox, Some(true));
        assert_eq!(merged.extra.get("spellcheck"), Some(&json!(false)));
    }
}
