//! Application history persisted on the instance
//!
//! The history file is the only wire format owned by this crate:
//!
//! ```json
//! {"history":[{"templateID":"ml","templateVersion":"1.2.0",
//!   "appliedAt":"2026-03-01T12:00:00Z","checkpointID":4,"status":"Applied"}]}
//! ```
//!
//! Records are append-only. Readers ignore fields they do not know, and the
//! optional `overrides`/`diffSummary` fields are omitted when empty.

use crate::diff::ConflictCategory;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use remotekit::{ExecContext, InstanceRef, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use tempfile::TempDir;

/// Final status recorded for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Applied,
    RolledBack,
    RollbackFailed,
    /// Status written by a newer or older tool
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "Applied"),
            Self::RolledBack => write!(f, "RolledBack"),
            Self::RollbackFailed => write!(f, "RollbackFailed"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// One application (or manual rollback) of a template to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    #[serde(rename = "templateID")]
    pub template_id: String,
    pub template_version: String,
    pub applied_at: DateTime<Utc>,
    #[serde(rename = "checkpointID")]
    pub checkpoint_id: u64,
    pub status: RecordStatus,
    /// Conflict categories the caller overrode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<ConflictCategory>,
    /// One-line summary of the applied diff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    history: Vec<ApplicationRecord>,
}

/// Parse a history file; malformed content is reported, not fatal.
pub fn parse(contents: &[u8]) -> std::result::Result<Vec<ApplicationRecord>, String> {
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice::<HistoryFile>(contents)
        .map(|f| f.history)
        .map_err(|e| e.to_string())
}

/// Render records in the history wire format.
pub fn render(records: &[ApplicationRecord]) -> Result<Vec<u8>> {
    let file = HistoryFile {
        history: records.to_vec(),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Reads and appends to the on-instance history file.
pub struct HistoryStore<'a> {
    executor: &'a dyn RemoteExecutor,
    path: &'a str,
}

impl<'a> HistoryStore<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, path: &'a str) -> Self {
        Self { executor, path }
    }

    /// Load history. A missing or malformed file reads as empty plus a warning.
    pub fn load(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
    ) -> Result<(Vec<ApplicationRecord>, Option<String>)> {
        let staging = TempDir::new()?;
        let local = staging.path().join("history.json");
        match self.executor.get_file(ctx, instance, &local, self.path) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok((Vec::new(), None)),
            Err(remotekit::Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => return Err(e.into()),
        }
        let bytes = fs::read(&local)?;
        match parse(&bytes) {
            Ok(records) => Ok((records, None)),
            Err(message) => {
                log::warn!("{instance}: ignoring malformed history {}: {message}", self.path);
                Ok((
                    Vec::new(),
                    Some(format!("history file {} is malformed: {message}", self.path)),
                ))
            }
        }
    }

    /// Append one record and write the file back.
    ///
    /// A malformed existing file is replaced rather than extended.
    pub fn append(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        record: ApplicationRecord,
    ) -> Result<()> {
        let (mut records, _) = self.load(ctx, instance)?;
        records.push(record);

        let staging = TempDir::new()?;
        let local = staging.path().join("history.json");
        fs::write(&local, render(&records)?)?;
        self.executor.copy_file(ctx, instance, &local, self.path)?;
        log::debug!("{instance}: history now has {} records", records.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotekit::ScriptedExecutor;

    const PATH: &str = "/var/lib/retrofit/history.json";

    fn record(id: u64, status: RecordStatus) -> ApplicationRecord {
        ApplicationRecord {
            template_id: "ml-research".into(),
            template_version: "1.2.0".into(),
            applied_at: "2026-03-01T12:00:00Z".parse().unwrap(),
            checkpoint_id: id,
            status,
            overrides: vec![],
            diff_summary: None,
        }
    }

    #[test]
    fn test_wire_format_field_names() {
        let bytes = render(&[record(4, RecordStatus::Applied)]).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entry = &json["history"][0];
        assert_eq!(entry["templateID"], "ml-research");
        assert_eq!(entry["templateVersion"], "1.2.0");
        assert_eq!(entry["appliedAt"], "2026-03-01T12:00:00Z");
        assert_eq!(entry["checkpointID"], 4);
        assert_eq!(entry["status"], "Applied");
        assert!(entry.get("overrides").is_none());
    }

    #[test]
    fn test_parse_foreign_status_and_extra_fields() {
        let records = parse(
            br#"{"history":[{"templateID":"a","templateVersion":"1","appliedAt":"2025-01-01T00:00:00+00:00",
                "checkpointID":1,"status":"partial","extra":true}]}"#,
        )
        .unwrap();
        assert_eq!(records[0].status, RecordStatus::Other("partial".into()));
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(parse(b"").unwrap().is_empty());
        assert!(parse(b"{not json").is_err());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let exec = ScriptedExecutor::new();
        let store = HistoryStore::new(&exec, PATH);
        let (records, warning) = store
            .load(&ExecContext::default(), &InstanceRef::new("lab"))
            .unwrap();
        assert!(records.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn test_load_malformed_file_warns() {
        let exec = ScriptedExecutor::new();
        exec.put_remote_file(PATH, "garbage");
        let store = HistoryStore::new(&exec, PATH);
        let (records, warning) = store
            .load(&ExecContext::default(), &InstanceRef::new("lab"))
            .unwrap();
        assert!(records.is_empty());
        assert!(warning.unwrap().contains("malformed"));
    }

    #[test]
    fn test_append_preserves_existing_records() {
        let exec = ScriptedExecutor::new();
        exec.put_remote_file(PATH, render(&[record(1, RecordStatus::Applied)]).unwrap());
        let store = HistoryStore::new(&exec, PATH);
        let ctx = ExecContext::default();
        let instance = InstanceRef::new("lab");

        store
            .append(&ctx, &instance, record(2, RecordStatus::RolledBack))
            .unwrap();

        let records = parse(&exec.remote_file(PATH).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].checkpoint_id, 2);
        assert_eq!(records[1].status, RecordStatus::RolledBack);
    }
}
