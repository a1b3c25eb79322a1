//! Audit trail of security-relevant registrations.
//!
//! With `audit_report` configured, every invoke-handler registration, every
//! guest about to be attached, every window-open handler and every top-level
//! surface appends one JSON line to the report. Failures to write are logged
//! and never reach the caller.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::HostConfig;
use crate::guest::GuestParams;
use crate::surface::preferences::Preferences;
use crate::surface::{FrameId, SurfaceId, SurfaceKind};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to access audit report: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed audit record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AuditRecord {
    /// An invoke handler was registered on a scope.
    #[serde(rename_all = "camelCase")]
    HandlerRegistered {
        scope: String,
        channel: String,
        handler: String,
    },
    /// A guest is about to be created, before will-attach listeners run.
    #[serde(rename_all = "camelCase")]
    WillAttachWebview {
        embedder: SurfaceId,
        embedder_frame_id: FrameId,
        element_instance_id: i64,
        params: GuestParams,
        web_preferences: Preferences,
    },
    #[serde(rename_all = "camelCase")]
    WindowOpenHandlerSet { surface: SurfaceId, handler: String },
    #[serde(rename_all = "camelCase")]
    SurfaceCreated {
        surface: SurfaceId,
        kind: SurfaceKind,
        web_preferences: Preferences,
    },
}

/// JSON-lines report file.
#[derive(Debug)]
pub struct AuditReport {
    path: PathBuf,
}

impl AuditReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Every record written so far. A missing report has no entries.
    pub fn entries(&self) -> Result<Vec<Value>, AuditError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }
}

/// Shared handle onto the report; does nothing when auditing is off.
#[derive(Debug, Clone, Default)]
pub struct Audit(Option<Rc<AuditReport>>);

impl Audit {
    pub fn to_report(path: impl Into<PathBuf>) -> Self {
        Self(Some(Rc::new(AuditReport::new(path))))
    }

    pub fn from_config(config: &HostConfig) -> Self {
        config
            .audit_report
            .clone()
            .map(Self::to_report)
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    /// Append the record built by `build`; it is only built when enabled.
    pub fn record(&self, build: impl FnOnce() -> AuditRecord) {
        let Some(report) = &self.0 else {
            return;
        };
        if let Err(err) = report.append(&build()) {
            warn!(
                target = "audit",
                path = %report.path().display(),
                error = %err,
                "failed to append audit record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        let audit = Audit::to_report(&path);
        audit.record(|| AuditRecord::WindowOpenHandlerSet {
            surface: SurfaceId(4),
            handler: "app::deny_all".into(),
        });
        audit.record(|| AuditRecord::HandlerRegistered {
            scope: "ipcMain".into(),
            channel: "ping".into(),
            handler: "app::ping".into(),
        });

        let entries = AuditReport::new(&path).entries().unwrap();
        assert_eq!(
            entries,
            vec![
                json!({ "event": "window-open-handler-set", "surface": 4, "handler": "app::deny_all" }),
                json!({ "event": "handler-registered", "scope": "ipcMain", "channel": "ping", "handler": "app::ping" }),
            ]
        );
    }

    #[test]
    fn disabled_audit_never_builds_records() {
        let audit = Audit::default();
        assert!(!audit.is_enabled());
        audit.record(|| panic!("record built while auditing is off"));
    }

    #[test]
    fn missing_report_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let report = AuditReport::new(dir.path().join("absent.jsonl"));
        assert!(report.entries().unwrap().is_empty());
    }

    #[test]
    fn write_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for appending
        let audit = Audit::to_report(dir.path());
        audit.record(|| AuditRecord::WindowOpenHandlerSet {
            surface: SurfaceId(1),
            handler: "app::handler".into(),
        });
        assert!(dir.path().is_dir());
    }

    #[test]
    fn will_attach_record_carries_attributes() {
        let record = AuditRecord::WillAttachWebview {
            embedder: SurfaceId(1),
            embedder_frame_id: FrameId(3),
            element_instance_id: 7,
            params: GuestParams {
                src: Some("https://a.test/".into()),
                ..GuestParams::default()
            },
            web_preferences: Preferences {
                sandbox: Some(true),
                ..Preferences::default()
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], json!("will-attach-webview"));
        assert_eq!(value["embedderFrameId"], json!(3));
        assert_eq!(value["elementInstanceId"], json!(7));
        assert_eq!(value["params"]["src"], json!("https://a.test/"));
        assert_eq!(value["webPreferences"], json!({ "sandbox": true }));
    }
}
