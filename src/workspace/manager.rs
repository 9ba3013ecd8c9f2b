//! Composite workspace operations.
//!
//! The three stores (projects+tree, sessions, layouts) live behind one lock
//! and are only mutated here, so every composite operation is atomic with
//! respect to observers. PTY work (close, cwd introspection, `cd` writes)
//! happens after the lock is released — the engine tolerates ids that have
//! no PTY yet or no longer, which is also what makes rollback after a failed
//! spawn a plain `close_pane`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::core::pty_engine::shell_escape;
use crate::core::PtyEngine;
use super::layout::{LayoutStore, SplitDirection};
use super::sessions::{SessionStatus, TerminalStore};
use super::tree::{Project, ProjectStore, TreeNode};

/// How long a pane waits for its PTY to attach before giving up on the
/// inherited-cwd `cd`.
const CWD_INHERIT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDirection {
    Forward,
    Backward,
}

/// Ids minted by a tab-creating composite operation.
#[derive(Debug, Clone)]
pub struct CreatedTab {
    pub project_id: String,
    pub node_id: String,
    pub terminal_id: String,
}

/// The three stores plus the per-tab focus memory.
#[derive(Default)]
pub struct WorkspaceState {
    pub projects: ProjectStore,
    pub terminals: TerminalStore,
    pub layouts: LayoutStore,
    /// Tab root terminal id → pane focused when the tab was last active.
    pub last_focused: HashMap<String, String>,
}

impl WorkspaceState {
    /// Records the pane focus for whatever tab contains `terminal_id`.
    fn note_focus(&mut self, terminal_id: &str) {
        if let Some(key) = self.layouts.find_layout_key_for_terminal(terminal_id) {
            self.last_focused.insert(key, terminal_id.to_string());
        }
    }

    /// Drops focus memory pointing at a terminal that no longer exists.
    fn purge_focus_of(&mut self, terminal_id: &str) {
        self.last_focused.retain(|_, v| v != terminal_id);
    }

    /// Checks the cross-store invariants. Used by tests after every mutation
    /// scenario; a violation here means an operation failed to be atomic.
    pub fn verify_invariants(&self) -> Result<(), String> {
        // Tree terminal nodes point at layout keys whose tree holds the id.
        for node in self.projects.nodes().values() {
            if let Some(tid) = node.terminal_id() {
                let root = self
                    .layouts
                    .get(tid)
                    .ok_or_else(|| format!("tab node {} has no layout keyed {tid}", node.id()))?;
                if !root.contains_terminal(tid) {
                    return Err(format!("layout {tid} does not contain its own key"));
                }
            }
        }
        // Every leaf names a session; no terminal appears in two layouts.
        let mut seen = std::collections::HashSet::new();
        for (key, root) in self.layouts.layouts() {
            let ids = root.terminal_ids();
            if ids.is_empty() {
                return Err(format!("layout {key} is empty"));
            }
            for tid in ids {
                if !self.terminals.contains(&tid) {
                    return Err(format!("layout {key} leaf {tid} has no session"));
                }
                if !seen.insert(tid.clone()) {
                    return Err(format!("terminal {tid} appears in two layouts"));
                }
            }
        }
        // Active pointers are live.
        if let Some(active) = self.terminals.active_terminal_id() {
            if !self.terminals.contains(active) {
                return Err(format!("active terminal {active} has no session"));
            }
        }
        if let Some(active) = self.projects.active_project_id() {
            if self.projects.get_project(active).is_none() {
                return Err(format!("active project {active} does not exist"));
            }
        }
        // projectOrder is a permutation of the project keys.
        let mut order = self.projects.project_order().to_vec();
        order.sort();
        let mut keys: Vec<String> = self.projects.projects().keys().cloned().collect();
        keys.sort();
        if order != keys {
            return Err("projectOrder is not a permutation of projects".to_string());
        }
        // Group children are unique, existing, and point back at the group.
        for node in self.projects.nodes().values() {
            if let Some(children) = node.children() {
                let mut dedup = children.to_vec();
                dedup.sort();
                dedup.dedup();
                if dedup.len() != children.len() {
                    return Err(format!("group {} has duplicate children", node.id()));
                }
                for child in children {
                    let child_node = self
                        .projects
                        .get_node(child)
                        .ok_or_else(|| format!("group {} lists missing child {child}", node.id()))?;
                    if child_node.parent_id() != Some(node.id()) {
                        return Err(format!("child {child} does not point back at {}", node.id()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Owns the workspace state and coordinates it with the PTY engine.
pub struct WorkspaceManager {
    engine: PtyEngine,
    state: Mutex<WorkspaceState>,
}

impl WorkspaceManager {
    pub fn new(engine: PtyEngine) -> Self {
        Self {
            engine,
            state: Mutex::new(WorkspaceState::default()),
        }
    }

    /// Locks the workspace state. All mutations flow through this single
    /// lock, which is what makes composite operations atomic to observers.
    pub fn state(&self) -> MutexGuard<'_, WorkspaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn engine(&self) -> &PtyEngine {
        &self.engine
    }

    // ---- composite operations -------------------------------------------

    /// Creates a project with its root group, one tab, one session and one
    /// single-leaf layout.
    pub fn create_project_with_terminal(&self, name: &str, cwd: &str) -> CreatedTab {
        let project_id = Uuid::new_v4().to_string();
        let root_group_id = Uuid::new_v4().to_string();
        let node_id = Uuid::new_v4().to_string();
        let terminal_id = Uuid::new_v4().to_string();

        let mut st = self.state();
        st.projects.add_project(Project {
            id: project_id.clone(),
            name: name.to_string(),
            cwd: cwd.to_string(),
            root_group_id: root_group_id.clone(),
            expanded: true,
        });
        st.projects.add_node(TreeNode::Group {
            id: root_group_id.clone(),
            name: name.to_string(),
            children: Vec::new(),
            parent_id: None,
        });
        st.projects.add_node(TreeNode::Terminal {
            id: node_id.clone(),
            name: String::new(),
            terminal_id: terminal_id.clone(),
            parent_id: None,
        });
        st.projects.add_child_to_node(&root_group_id, &node_id);
        st.terminals.add_session(&terminal_id, None, Some(cwd.to_string()));
        st.layouts.init_layout(&terminal_id, &terminal_id);
        st.note_focus(&terminal_id);

        CreatedTab {
            project_id,
            node_id,
            terminal_id,
        }
    }

    /// Creates a tab (node + session + layout) in an existing project. The
    /// new terminal inherits the working directory of an existing sibling
    /// tab, asynchronously, once its PTY attaches.
    pub fn create_terminal_in_project(&self, project_id: &str) -> Option<CreatedTab> {
        let node_id = Uuid::new_v4().to_string();
        let terminal_id = Uuid::new_v4().to_string();

        let sibling = {
            let mut st = self.state();
            let project = st.projects.get_project(project_id)?.clone();

            // Any existing tab of this project can donate its cwd.
            let sibling = st
                .projects
                .get_node(&project.root_group_id)
                .and_then(|g| g.children())
                .map(|children| children.to_vec())
                .unwrap_or_default()
                .iter()
                .filter_map(|child| st.projects.get_node(child))
                .filter_map(|n| n.terminal_id())
                .find(|tid| st.terminals.contains(tid))
                .map(str::to_string);

            st.projects.add_node(TreeNode::Terminal {
                id: node_id.clone(),
                name: String::new(),
                terminal_id: terminal_id.clone(),
                parent_id: None,
            });
            st.projects.add_child_to_node(&project.root_group_id, &node_id);
            st.terminals.add_session(&terminal_id, None, None);
            st.layouts.init_layout(&terminal_id, &terminal_id);
            st.note_focus(&terminal_id);
            sibling
        };

        if let Some(source) = sibling {
            spawn_cwd_inheritance(self.engine.clone(), source, terminal_id.clone());
        }

        Some(CreatedTab {
            project_id: project_id.to_string(),
            node_id,
            terminal_id,
        })
    }

    /// Splits the pane holding `target_terminal_id`. The new pane gets a
    /// session and a layout leaf but no tree node, and inherits the source
    /// pane's working directory once its PTY attaches. Returns the new
    /// terminal id, or `None` when the target is in no layout.
    pub fn split_pane(
        &self,
        target_terminal_id: &str,
        direction: SplitDirection,
    ) -> Option<String> {
        let new_terminal_id = Uuid::new_v4().to_string();
        {
            let mut st = self.state();
            let key = st
                .layouts
                .find_layout_key_for_terminal(target_terminal_id)?;
            st.terminals.add_session(&new_terminal_id, None, None);
            st.layouts
                .split_terminal(&key, target_terminal_id, &new_terminal_id, direction);
            st.note_focus(&new_terminal_id);
        }

        spawn_cwd_inheritance(
            self.engine.clone(),
            target_terminal_id.to_string(),
            new_terminal_id.clone(),
        );
        Some(new_terminal_id)
    }

    /// Closes one pane: removes it from its layout (collapsing or re-keying
    /// as needed), deletes its session, repairs focus, and tears down its
    /// PTY. Deletes the whole project when the last tab of the project went
    /// away with this pane.
    pub async fn close_pane(&self, terminal_id: &str) -> bool {
        let existed = {
            let mut st = self.state();
            match st.layouts.find_layout_key_for_terminal(terminal_id) {
                None => {
                    // Dangling session without a layout; just drop it.
                    let existed = st.terminals.remove_session(terminal_id).is_some();
                    st.purge_focus_of(terminal_id);
                    existed
                }
                Some(key) => {
                    let root = st.layouts.get(&key).expect("key came from lookup");
                    let leaves = root.terminal_ids();
                    let sibling = root.sibling_terminal_id(terminal_id);
                    let was_active =
                        st.terminals.active_terminal_id() == Some(terminal_id);

                    if leaves.len() <= 1 {
                        self.remove_sole_pane_tab(&mut st, &key, terminal_id);
                    } else if terminal_id == key {
                        self.remove_tab_root_with_siblings(&mut st, &key, terminal_id);
                    } else {
                        st.layouts.remove_terminal(&key, terminal_id);
                        st.terminals.remove_session(terminal_id);
                    }
                    st.purge_focus_of(terminal_id);

                    if was_active {
                        if let Some(sibling) = sibling {
                            if st.terminals.set_active_terminal(Some(sibling.as_str())) {
                                st.note_focus(&sibling);
                            }
                        }
                    }
                    true
                }
            }
        };

        match self.engine.close(terminal_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!("Closing PTY {terminal_id}: {e}"),
        }
        existed
    }

    /// Sole-leaf case of `close_pane`: delete the layout, tree node and
    /// session; delete the project too when this was its last tab.
    fn remove_sole_pane_tab(&self, st: &mut WorkspaceState, key: &str, terminal_id: &str) {
        st.layouts.remove_layout(key);
        st.last_focused.remove(key);
        st.terminals.remove_session(terminal_id);

        let node_id = st
            .projects
            .find_node_for_terminal(key)
            .map(|n| n.id().to_string());
        if let Some(node_id) = node_id {
            let project = st.projects.project_of_node(&node_id).cloned();
            st.projects.remove_node(&node_id);
            if let Some(project) = project {
                let empty = st
                    .projects
                    .get_node(&project.root_group_id)
                    .and_then(|g| g.children())
                    .map(|c| c.is_empty())
                    .unwrap_or(true);
                if empty {
                    st.projects.remove_node(&project.root_group_id);
                    st.projects.remove_project(&project.id);
                }
            }
        }
    }

    /// Tab-root-with-siblings case of `close_pane`: the layout is re-keyed
    /// under a surviving leaf and the tree node follows it.
    fn remove_tab_root_with_siblings(
        &self,
        st: &mut WorkspaceState,
        key: &str,
        terminal_id: &str,
    ) {
        st.layouts.remove_terminal(key, terminal_id);
        let new_key = st
            .layouts
            .get(key)
            .expect("siblings remain")
            .terminal_ids()
            .first()
            .cloned()
            .expect("layout is never empty");
        st.layouts.rekey(key, &new_key);

        let node_id = st
            .projects
            .find_node_for_terminal(key)
            .map(|n| n.id().to_string());
        if let Some(node_id) = node_id {
            st.projects.set_node_terminal_id(&node_id, &new_key);
        }

        // The tab's focus memory follows the new key.
        if let Some(focused) = st.last_focused.remove(key) {
            if focused != terminal_id {
                st.last_focused.insert(new_key.clone(), focused);
            }
        }
        st.terminals.remove_session(terminal_id);
    }

    /// Deletes a tab from the sidebar: every pane of its layout (session and
    /// PTY), the layout entry, and the tree node.
    pub async fn delete_tab(&self, node_id: &str) -> Vec<String> {
        let closed = {
            let mut st = self.state();
            let Some(key) = st
                .projects
                .get_node(node_id)
                .and_then(|n| n.terminal_id())
                .map(str::to_string)
            else {
                return Vec::new();
            };

            let tids = st
                .layouts
                .get(&key)
                .map(|root| root.terminal_ids())
                .unwrap_or_else(|| vec![key.clone()]);
            st.layouts.remove_layout(&key);
            st.last_focused.remove(&key);
            for tid in &tids {
                st.terminals.remove_session(tid);
                st.purge_focus_of(tid);
            }
            st.projects.remove_node(node_id);
            tids
        };

        for tid in &closed {
            match self.engine.close(tid).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => log::warn!("Closing PTY {tid}: {e}"),
            }
        }
        closed
    }

    /// Deletes a project: every terminal in every tab layout, every tree
    /// node, then the project itself.
    pub async fn delete_project(&self, project_id: &str) -> Vec<String> {
        let closed = {
            let mut st = self.state();
            let Some(project) = st.projects.get_project(project_id).cloned() else {
                return Vec::new();
            };

            let children = st
                .projects
                .get_node(&project.root_group_id)
                .and_then(|g| g.children())
                .map(|c| c.to_vec())
                .unwrap_or_default();

            let mut closed = Vec::new();
            for child in children {
                let key = st
                    .projects
                    .get_node(&child)
                    .and_then(|n| n.terminal_id())
                    .map(str::to_string);
                if let Some(key) = key {
                    let tids = st
                        .layouts
                        .get(&key)
                        .map(|root| root.terminal_ids())
                        .unwrap_or_else(|| vec![key.clone()]);
                    st.layouts.remove_layout(&key);
                    st.last_focused.remove(&key);
                    for tid in &tids {
                        st.terminals.remove_session(tid);
                        st.purge_focus_of(tid);
                    }
                    closed.extend(tids);
                }
                st.projects.remove_node(&child);
            }
            st.projects.remove_node(&project.root_group_id);
            st.projects.remove_project(project_id);
            closed
        };

        for tid in &closed {
            match self.engine.close(tid).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => log::warn!("Closing PTY {tid}: {e}"),
            }
        }
        closed
    }

    /// Moves a tab's tree node to another project. Session and layout are
    /// untouched — layouts are keyed by terminal id, not by project.
    pub fn move_terminal_to_project(&self, node_id: &str, target_project_id: &str) -> bool {
        let mut st = self.state();
        let Some(root_group_id) = st
            .projects
            .get_project(target_project_id)
            .map(|p| p.root_group_id.clone())
        else {
            return false;
        };
        st.projects.move_node(node_id, &root_group_id)
    }

    /// Makes a terminal active and records it as its tab's focused pane.
    pub fn set_active_terminal(&self, terminal_id: Option<&str>) -> bool {
        let mut st = self.state();
        let ok = st.terminals.set_active_terminal(terminal_id);
        if ok {
            if let Some(tid) = terminal_id {
                st.note_focus(tid);
            }
        }
        ok
    }

    /// Applies a status transition from the shell-integration channel or an
    /// exit event.
    pub fn update_status(
        &self,
        terminal_id: &str,
        status: SessionStatus,
        exit_code: Option<i32>,
    ) -> bool {
        self.state()
            .terminals
            .update_status(terminal_id, status, exit_code)
    }

    /// Cycles the active tab across projects.
    ///
    /// The flat order is: projects in display order, collapsed ones skipped,
    /// each contributing its root-group tabs whose terminal has a session.
    /// Landing on a tab restores that tab's last focused pane. Returns the
    /// `(project_id, terminal_id)` made active, or `None` when fewer than
    /// two tabs exist.
    pub fn cycle_tab(&self, direction: CycleDirection) -> Option<(String, String)> {
        let mut st = self.state();

        let mut entries: Vec<(String, String)> = Vec::new();
        for project_id in st.projects.project_order().to_vec() {
            let Some(project) = st.projects.get_project(&project_id) else {
                continue;
            };
            if !project.expanded {
                continue;
            }
            let children = st
                .projects
                .get_node(&project.root_group_id)
                .and_then(|g| g.children())
                .map(|c| c.to_vec())
                .unwrap_or_default();
            for child in children {
                if let Some(tid) = st.projects.get_node(&child).and_then(|n| n.terminal_id()) {
                    if st.terminals.contains(tid) {
                        entries.push((project_id.clone(), tid.to_string()));
                    }
                }
            }
        }

        let n = entries.len();
        if n < 2 {
            return None;
        }

        let current = match st.terminals.active_terminal_id() {
            Some(active) => entries
                .iter()
                .position(|(_, tid)| tid == active)
                .or_else(|| {
                    // The active terminal is a split pane; find its tab root.
                    let key = st.layouts.find_layout_key_for_terminal(active)?;
                    entries.iter().position(|(_, tid)| *tid == key)
                })
                .map(|i| i as isize)
                .unwrap_or(-1),
            None => -1,
        };

        let next = match direction {
            CycleDirection::Forward => {
                if current == -1 {
                    0
                } else {
                    ((current + 1) as usize) % n
                }
            }
            CycleDirection::Backward => {
                if current == -1 {
                    n - 1
                } else {
                    ((current as usize) + n - 1) % n
                }
            }
        };

        let (project_id, tab_root) = entries[next].clone();
        st.projects.set_active_project(Some(project_id.as_str()));

        // Restore the pane that was focused when this tab was last active.
        let target = st
            .last_focused
            .get(&tab_root)
            .filter(|tid| st.terminals.contains(tid))
            .cloned()
            .unwrap_or_else(|| tab_root.clone());
        st.terminals.set_active_terminal(Some(target.as_str()));
        st.note_focus(&target);

        Some((project_id, target))
    }
}

/// Resolves the source terminal's cwd and types a `cd` into the destination
/// once its PTY attaches. Fire-and-forget: a missing PTY on either side just
/// means the new pane starts in its default directory.
fn spawn_cwd_inheritance(engine: PtyEngine, source_tid: String, dest_tid: String) {
    tokio::spawn(async move {
        let cwd = match engine.get_cwd(&source_tid) {
            Ok(Some(cwd)) => cwd,
            _ => return,
        };
        let deadline = tokio::time::Instant::now() + CWD_INHERIT_WAIT;
        while tokio::time::Instant::now() < deadline {
            if engine.is_registered(&dest_tid) {
                let cmd = format!(" cd '{}' && clear\n", shell_escape(&cwd));
                let _ = engine.write(&dest_tid, cmd.as_bytes());
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        log::debug!("Terminal {dest_tid} never attached; skipping inherited cd");
    });
}
