//! Persisted workspace records.
//!
//! Three independent records (projects, terminals, layouts) plus the font
//! size, each a JSON value under a fixed key in a durable key-value store.
//! The substrate is pluggable through [`StateStore`]; the default
//! implementation keeps one JSON file per key. Loss or corruption of a
//! record is non-fatal — the caller falls back to the first-run flow.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workspace::{LayoutNode, Project, SessionStatus, TerminalSession, TreeNode};

pub const PROJECTS_KEY: &str = "dispatcher-projects";
pub const TERMINALS_KEY: &str = "dispatcher-terminals";
pub const LAYOUTS_KEY: &str = "dispatcher-layouts";
pub const FONT_SIZE_KEY: &str = "dispatcher-font-size";

pub const FONT_SIZE_MIN: u32 = 8;
pub const FONT_SIZE_MAX: u32 = 32;
pub const FONT_SIZE_DEFAULT: u32 = 13;

/// Failure reading or writing a record on the disk substrate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A durable key → JSON-value store. Implementations are free to put the
/// bytes anywhere; the records never assume more than get/set/remove.
/// Failures are absorbed at this boundary — a lost record is a first run,
/// a failed write is retried at the next opportunistic flush.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
}

/// `StateStore` keeping one pretty-printed JSON file per key.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the platform data directory.
    pub fn default_location() -> Option<Self> {
        directories::ProjectDirs::from("", "", "dispatcher")
            .map(|dirs| Self::new(dirs.data_dir()))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn try_get(&self, key: &str) -> Result<Value, StoreError> {
        let content = std::fs::read_to_string(self.path_for(key))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn try_set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root)?;
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(self.path_for(key), json)?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        match self.try_get(key) {
            Ok(value) => Some(value),
            Err(StoreError::Io(_)) => None, // missing record: first run
            Err(e) => {
                log::warn!("Discarding corrupt record {key}: {e}");
                None
            }
        }
    }

    fn set(&self, key: &str, value: Value) {
        if let Err(e) = self.try_set(key, &value) {
            log::warn!("Cannot write record {key}: {e}");
        }
    }

    fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}

/// `dispatcher-projects` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectsRecord {
    pub projects: HashMap<String, Project>,
    pub nodes: HashMap<String, TreeNode>,
    pub active_project_id: Option<String>,
    #[serde(default)]
    pub project_order: Vec<String>,
}

/// `dispatcher-terminals` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalsRecord {
    pub sessions: HashMap<String, TerminalSession>,
    pub active_terminal_id: Option<String>,
}

/// `dispatcher-layouts` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutsRecord {
    pub layouts: HashMap<String, LayoutNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FontSizeRecord {
    font_size: u32,
}

/// Loads the projects record. A missing or empty `projectOrder` is
/// backfilled from the project keys.
pub fn load_projects(store: &dyn StateStore) -> Option<ProjectsRecord> {
    let mut record: ProjectsRecord =
        serde_json::from_value(store.get(PROJECTS_KEY)?).ok()?;
    if record.project_order.is_empty() {
        record.project_order = record.projects.keys().cloned().collect();
    }
    Some(record)
}

pub fn save_projects(store: &dyn StateStore, record: &ProjectsRecord) {
    if let Ok(value) = serde_json::to_value(record) {
        store.set(PROJECTS_KEY, value);
    }
}

/// Loads the terminals record. PTYs do not survive a restart, so every
/// restored session is normalized to `done` with no exit code.
pub fn load_terminals(store: &dyn StateStore) -> Option<TerminalsRecord> {
    let mut record: TerminalsRecord =
        serde_json::from_value(store.get(TERMINALS_KEY)?).ok()?;
    for session in record.sessions.values_mut() {
        session.status = SessionStatus::Done;
        session.exit_code = None;
    }
    Some(record)
}

pub fn save_terminals(store: &dyn StateStore, record: &TerminalsRecord) {
    if let Ok(value) = serde_json::to_value(record) {
        store.set(TERMINALS_KEY, value);
    }
}

pub fn load_layouts(store: &dyn StateStore) -> Option<LayoutsRecord> {
    serde_json::from_value(store.get(LAYOUTS_KEY)?).ok()
}

pub fn save_layouts(store: &dyn StateStore, record: &LayoutsRecord) {
    if let Ok(value) = serde_json::to_value(record) {
        store.set(LAYOUTS_KEY, value);
    }
}

/// Loads the font size, clamped to [8, 32]. Missing or unreadable → 13.
pub fn load_font_size(store: &dyn StateStore) -> u32 {
    store
        .get(FONT_SIZE_KEY)
        .and_then(|v| serde_json::from_value::<FontSizeRecord>(v).ok())
        .map(|r| r.font_size.clamp(FONT_SIZE_MIN, FONT_SIZE_MAX))
        .unwrap_or(FONT_SIZE_DEFAULT)
}

pub fn save_font_size(store: &dyn StateStore, font_size: u32) {
    let record = FontSizeRecord {
        font_size: font_size.clamp(FONT_SIZE_MIN, FONT_SIZE_MAX),
    };
    if let Ok(value) = serde_json::to_value(&record) {
        store.set(FONT_SIZE_KEY, value);
    }
}

/// Resets the stored font size and returns the default.
pub fn reset_font_size(store: &dyn StateStore) -> u32 {
    save_font_size(store, FONT_SIZE_DEFAULT);
    FONT_SIZE_DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn file_store() -> (JsonFileStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (JsonFileStore::new(dir.path()), dir)
    }

    #[test]
    fn test_missing_records_load_as_none() {
        let (store, _dir) = file_store();
        assert!(load_projects(&store).is_none());
        assert!(load_terminals(&store).is_none());
        assert!(load_layouts(&store).is_none());
        assert_eq!(load_font_size(&store), FONT_SIZE_DEFAULT);
    }

    #[test]
    fn test_corrupt_record_loads_as_none() {
        let (store, dir) = file_store();
        std::fs::write(
            dir.path().join(format!("{PROJECTS_KEY}.json")),
            "{not json",
        )
        .unwrap();
        assert!(load_projects(&store).is_none());
    }

    #[test]
    fn test_projects_roundtrip_and_order_backfill() {
        let (store, _dir) = file_store();
        let mut record = ProjectsRecord::default();
        record.projects.insert(
            "p1".into(),
            Project {
                id: "p1".into(),
                name: "api".into(),
                cwd: "/tmp".into(),
                root_group_id: "g1".into(),
                expanded: true,
            },
        );
        // Deliberately empty order: load must backfill it.
        save_projects(&store, &record);

        let loaded = load_projects(&store).unwrap();
        assert_eq!(loaded.project_order, ["p1"]);
        assert_eq!(loaded.projects["p1"].name, "api");
    }

    #[test]
    fn test_terminals_normalized_on_load() {
        let (store, _dir) = file_store();
        let mut record = TerminalsRecord::default();
        record.sessions.insert(
            "t1".into(),
            TerminalSession {
                id: "t1".into(),
                title: "Terminal 1".into(),
                notes: String::new(),
                status: SessionStatus::Running,
                exit_code: Some(1),
                cwd: None,
            },
        );
        record.active_terminal_id = Some("t1".into());
        save_terminals(&store, &record);

        let loaded = load_terminals(&store).unwrap();
        let session = &loaded.sessions["t1"];
        assert_eq!(session.status, SessionStatus::Done);
        assert_eq!(session.exit_code, None);
        assert_eq!(loaded.active_terminal_id, Some("t1".into()));
    }

    #[test]
    fn test_terminal_notes_default_when_missing() {
        let (store, _dir) = file_store();
        store.set(
            TERMINALS_KEY,
            json!({
                "sessions": {
                    "t1": { "id": "t1", "title": "Terminal 1", "status": "error", "exitCode": 9 }
                },
                "activeTerminalId": null
            }),
        );
        let loaded = load_terminals(&store).unwrap();
        assert_eq!(loaded.sessions["t1"].notes, "");
    }

    #[test]
    fn test_layouts_roundtrip_preserves_tree_shape() {
        let (store, _dir) = file_store();
        let mut layouts = crate::workspace::LayoutStore::new();
        layouts.init_layout("t1", "t1");
        layouts.split_terminal("t1", "t1", "s1", crate::workspace::SplitDirection::Vertical);
        let record = LayoutsRecord {
            layouts: layouts.layouts().clone(),
        };
        save_layouts(&store, &record);

        let loaded = load_layouts(&store).unwrap();
        assert_eq!(loaded.layouts["t1"], record.layouts["t1"]);
    }

    #[test]
    fn test_font_size_clamping_and_reset() {
        let (store, _dir) = file_store();
        save_font_size(&store, 99);
        assert_eq!(load_font_size(&store), FONT_SIZE_MAX);
        save_font_size(&store, 1);
        assert_eq!(load_font_size(&store), FONT_SIZE_MIN);
        save_font_size(&store, 16);
        assert_eq!(load_font_size(&store), 16);
        assert_eq!(reset_font_size(&store), FONT_SIZE_DEFAULT);
        assert_eq!(load_font_size(&store), FONT_SIZE_DEFAULT);
    }

    #[test]
    fn test_remove_clears_record() {
        let (store, _dir) = file_store();
        save_font_size(&store, 20);
        store.remove(FONT_SIZE_KEY);
        assert_eq!(load_font_size(&store), FONT_SIZE_DEFAULT);
    }
}
