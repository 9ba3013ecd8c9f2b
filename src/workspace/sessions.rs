//! Terminal session registry.
//!
//! One [`TerminalSession`] per live PTY. Sessions exist independently of the
//! sidebar tree — split panes are sessions with a layout leaf but no tree
//! node. Insertion order is tracked explicitly so the active-terminal
//! fallback on removal is deterministic (most recently added survivor).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide counter behind `Terminal <N>` default titles.
static TERMINAL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Run state of a session, driven by the shell-integration OSC channel and
/// by PTY exit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub notes: String,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// In-memory session store plus the active-terminal pointer.
#[derive(Default)]
pub struct TerminalStore {
    sessions: HashMap<String, TerminalSession>,
    /// Insertion order of the keys in `sessions`.
    order: Vec<String>,
    active_terminal_id: Option<String>,
}

impl TerminalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session and makes it active. A missing title defaults to
    /// `Terminal <N>` from the process-wide counter. Existing ids are not
    /// overwritten (no-op returning `false`).
    pub fn add_session(&mut self, id: &str, title: Option<String>, cwd: Option<String>) -> bool {
        if self.sessions.contains_key(id) {
            return false;
        }
        let title = title.unwrap_or_else(|| {
            format!("Terminal {}", TERMINAL_COUNTER.fetch_add(1, Ordering::Relaxed))
        });
        self.sessions.insert(
            id.to_string(),
            TerminalSession {
                id: id.to_string(),
                title,
                notes: String::new(),
                status: SessionStatus::Done,
                exit_code: None,
                cwd,
            },
        );
        self.order.push(id.to_string());
        self.active_terminal_id = Some(id.to_string());
        true
    }

    /// Removes a session. If it was active, the most recently added survivor
    /// becomes active (or no terminal is active when none remain).
    pub fn remove_session(&mut self, id: &str) -> Option<TerminalSession> {
        let removed = self.sessions.remove(id)?;
        self.order.retain(|k| k != id);
        if self.active_terminal_id.as_deref() == Some(id) {
            self.active_terminal_id = self.order.last().cloned();
        }
        Some(removed)
    }

    /// Sets the active terminal. `Some(id)` for an unknown id is a no-op.
    pub fn set_active_terminal(&mut self, id: Option<&str>) -> bool {
        match id {
            None => {
                self.active_terminal_id = None;
                true
            }
            Some(id) if self.sessions.contains_key(id) => {
                self.active_terminal_id = Some(id.to_string());
                true
            }
            Some(_) => false,
        }
    }

    /// Updates the session's status (and exit code) in place. Returns `false`
    /// if the session does not exist (no error is raised).
    pub fn update_status(&mut self, id: &str, status: SessionStatus, exit_code: Option<i32>) -> bool {
        if let Some(session) = self.sessions.get_mut(id) {
            session.status = status;
            session.exit_code = exit_code;
            true
        } else {
            false
        }
    }

    pub fn update_title(&mut self, id: &str, title: &str) -> bool {
        if let Some(session) = self.sessions.get_mut(id) {
            session.title = title.to_string();
            true
        } else {
            false
        }
    }

    pub fn update_notes(&mut self, id: &str, notes: &str) -> bool {
        if let Some(session) = self.sessions.get_mut(id) {
            session.notes = notes.to_string();
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<&TerminalSession> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn active_terminal_id(&self) -> Option<&str> {
        self.active_terminal_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the session map, for persistence.
    pub fn sessions(&self) -> &HashMap<String, TerminalSession> {
        &self.sessions
    }

    /// Replaces the store contents from a persisted record. Insertion order
    /// is rebuilt from map iteration; the active id is kept only if it still
    /// names a session.
    pub fn restore(&mut self, sessions: HashMap<String, TerminalSession>, active: Option<String>) {
        self.order = sessions.keys().cloned().collect();
        self.sessions = sessions;
        self.active_terminal_id = active.filter(|id| self.sessions.contains_key(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_session_auto_titles_monotonically() {
        let mut store = TerminalStore::new();
        store.add_session("a", None, None);
        store.add_session("b", None, None);
        let a: u64 = store.get("a").unwrap().title["Terminal ".len()..]
            .parse()
            .unwrap();
        let b: u64 = store.get("b").unwrap().title["Terminal ".len()..]
            .parse()
            .unwrap();
        assert!(b > a, "later sessions get larger numbers");
    }

    #[test]
    fn test_add_session_sets_active_and_rejects_duplicates() {
        let mut store = TerminalStore::new();
        assert!(store.add_session("a", Some("mine".into()), None));
        assert_eq!(store.active_terminal_id(), Some("a"));
        assert!(!store.add_session("a", None, None));
        assert_eq!(store.get("a").unwrap().title, "mine");
    }

    #[test]
    fn test_remove_active_falls_back_to_most_recent_survivor() {
        let mut store = TerminalStore::new();
        store.add_session("a", None, None);
        store.add_session("b", None, None);
        store.add_session("c", None, None);
        store.set_active_terminal(Some("c"));

        store.remove_session("c");
        assert_eq!(store.active_terminal_id(), Some("b"));

        // Removing a non-active session leaves the active pointer alone.
        store.remove_session("a");
        assert_eq!(store.active_terminal_id(), Some("b"));

        store.remove_session("b");
        assert_eq!(store.active_terminal_id(), None);
    }

    #[test]
    fn test_set_active_rejects_unknown() {
        let mut store = TerminalStore::new();
        store.add_session("a", None, None);
        assert!(!store.set_active_terminal(Some("ghost")));
        assert_eq!(store.active_terminal_id(), Some("a"));
        assert!(store.set_active_terminal(None));
        assert_eq!(store.active_terminal_id(), None);
    }

    #[test]
    fn test_update_status_and_notes() {
        let mut store = TerminalStore::new();
        store.add_session("a", None, None);
        assert!(store.update_status("a", SessionStatus::Error, Some(127)));
        let s = store.get("a").unwrap();
        assert_eq!(s.status, SessionStatus::Error);
        assert_eq!(s.exit_code, Some(127));
        assert!(store.update_notes("a", "flaky deploy box"));
        assert!(!store.update_status("ghost", SessionStatus::Done, None));
    }

    #[test]
    fn test_restore_drops_stale_active() {
        let mut store = TerminalStore::new();
        store.add_session("a", None, None);
        let map = store.sessions().clone();
        let mut fresh = TerminalStore::new();
        fresh.restore(map, Some("ghost".into()));
        assert_eq!(fresh.active_terminal_id(), None);
        assert!(fresh.contains("a"));
    }
}
