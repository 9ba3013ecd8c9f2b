//! Dispatcher core — a hierarchical terminal multiplexer engine.
//!
//! Projects contain tabs; each tab owns a binary split-tree of panes; each
//! pane is bound to a live PTY. The [`Dispatcher`] facade wires the three
//! parts together: the [`core::PtyEngine`] owns the OS processes, the
//! [`workspace::WorkspaceManager`] owns the structure, and every PTY's output
//! flows through a per-terminal [`core::ShellIntegration`] (status side
//! channel) and [`core::OutputBatcher`] (render coalescing) before reaching
//! the embedding UI's emulator sink.

pub mod core;
pub mod storage;
pub mod workspace;

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::shell_integration::IntegrationHost;
use crate::core::{OutputBatcher, OutputSink, PtyEngine, PtyError, ShellIntegration};
use crate::storage::{
    LayoutsRecord, ProjectsRecord, StateStore, TerminalsRecord,
};
use crate::workspace::{
    CreatedTab, CycleDirection, SessionStatus, SplitDirection, WorkspaceManager,
};

/// Pipes raw PTY chunks through the shell-integration filter into the
/// per-terminal batcher. Status transitions happen inside `process_chunk`,
/// before the cleaned bytes are queued — the ordering guarantee the UI
/// relies on.
struct ProcessedSink {
    integration: ShellIntegration,
    batcher: OutputBatcher,
}

impl OutputSink for ProcessedSink {
    fn on_output(&self, bytes: &[u8]) {
        let cleaned = self.integration.process_chunk(bytes);
        self.batcher.write(&cleaned);
    }
}

/// Host half of the shell-integration contract: hook writes go to the PTY,
/// status transitions go to the session store.
struct Host {
    engine: PtyEngine,
    workspace: Arc<WorkspaceManager>,
}

impl IntegrationHost for Host {
    fn write_to_pty(&self, terminal_id: &str, bytes: &[u8]) {
        let _ = self.engine.write(terminal_id, bytes);
    }

    fn set_status(&self, terminal_id: &str, status: SessionStatus, exit_code: Option<i32>) {
        self.workspace.update_status(terminal_id, status, exit_code);
    }
}

struct Attachment {
    integration: ShellIntegration,
    batcher: OutputBatcher,
}

/// Process-wide entry point tying engine, workspace and persistence together.
///
/// Construct with [`Dispatcher::init`] inside a tokio runtime; call
/// [`Dispatcher::shutdown`] before exit. State is flushed opportunistically
/// after every composite operation — there is no crash-consistency guarantee.
pub struct Dispatcher {
    engine: PtyEngine,
    workspace: Arc<WorkspaceManager>,
    store: Arc<dyn StateStore>,
    attached: DashMap<String, Attachment>,
}

impl Dispatcher {
    /// Builds the facade, restores persisted state, and starts the
    /// exit-event loop. Missing or unreadable records mean a first run.
    pub fn init(store: Arc<dyn StateStore>) -> Arc<Self> {
        let engine = PtyEngine::new();
        let workspace = Arc::new(WorkspaceManager::new(engine.clone()));

        {
            let mut st = workspace.state();
            if let Some(record) = storage::load_projects(store.as_ref()) {
                st.projects.restore(
                    record.projects,
                    record.nodes,
                    record.active_project_id,
                    record.project_order,
                );
            }
            if let Some(record) = storage::load_terminals(store.as_ref()) {
                st.terminals.restore(record.sessions, record.active_terminal_id);
            }
            if let Some(record) = storage::load_layouts(store.as_ref()) {
                st.layouts.restore(record.layouts);
            }
        }

        let dispatcher = Arc::new(Self {
            engine: engine.clone(),
            workspace,
            store,
            attached: DashMap::new(),
        });

        if let Some(mut exits) = engine.take_exit_events() {
            let this = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                while let Some(event) = exits.recv().await {
                    this.apply_exit(&event.terminal_id, event.exit_code);
                }
            });
        }

        dispatcher
    }

    /// An exit reported by the OS closes the session status loop: a clean
    /// code maps to done/error by value, a missing code (broken PTY) is an
    /// error.
    fn apply_exit(&self, terminal_id: &str, exit_code: Option<i32>) {
        let status = match exit_code {
            Some(0) => SessionStatus::Done,
            Some(_) | None => SessionStatus::Error,
        };
        self.workspace.update_status(terminal_id, status, exit_code);
        self.detach(terminal_id);
        log::info!("Terminal {terminal_id} ended ({status:?}, code {exit_code:?})");
    }

    fn detach(&self, terminal_id: &str) {
        if let Some((_, attachment)) = self.attached.remove(terminal_id) {
            attachment.batcher.dispose();
            attachment.integration.dispose();
        }
    }

    fn host(&self) -> Arc<dyn IntegrationHost> {
        Arc::new(Host {
            engine: self.engine.clone(),
            workspace: Arc::clone(&self.workspace),
        })
    }

    // ---- PTY command surface --------------------------------------------

    /// Binds a terminal to a live PTY and begins streaming cleaned output
    /// into `emulator_sink`. Called on first mount of a pane; the PTY
    /// survives UI remounts, so a second attach of a live id fails with
    /// `AlreadyExists`.
    pub async fn attach_terminal(
        &self,
        terminal_id: &str,
        cols: u16,
        rows: u16,
        emulator_sink: Box<dyn OutputSink>,
    ) -> Result<(), PtyError> {
        let cwd = self
            .workspace
            .state()
            .terminals
            .get(terminal_id)
            .and_then(|s| s.cwd.clone());

        let integration = ShellIntegration::new(terminal_id, self.host());
        let batcher = OutputBatcher::new(emulator_sink);
        let sink = ProcessedSink {
            integration: integration.clone(),
            batcher: batcher.clone(),
        };

        if let Err(e) = self
            .engine
            .create(terminal_id, cwd.as_deref(), cols, rows, Box::new(sink))
            .await
        {
            // The flush task must not outlive a failed attach.
            batcher.dispose();
            return Err(e);
        }

        let injector = integration.clone();
        tokio::spawn(async move { injector.inject_initial().await });

        self.attached.insert(
            terminal_id.to_string(),
            Attachment {
                integration,
                batcher,
            },
        );
        Ok(())
    }

    /// Forwards user keystrokes to the PTY. An Enter keypress also feeds the
    /// unhooked-sub-shell detector.
    pub fn write_terminal(&self, terminal_id: &str, data: &[u8]) -> Result<(), PtyError> {
        if data.contains(&b'\r') || data.contains(&b'\n') {
            if let Some(attachment) = self.attached.get(terminal_id) {
                attachment.integration.notify_enter_pressed();
            }
        }
        self.engine.write(terminal_id, data)
    }

    pub fn resize_terminal(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.engine.resize(terminal_id, cols, rows)
    }

    pub fn get_terminal_cwd(&self, terminal_id: &str) -> Option<String> {
        self.engine.get_cwd(terminal_id).ok().flatten()
    }

    pub fn warm_pool(&self, count: usize) {
        self.engine.warm_pool(count);
    }

    // ---- composite operations -------------------------------------------

    /// Creates a project with one terminal and attaches its PTY. Rolls all
    /// store changes back if the spawn fails.
    pub async fn open_project(
        &self,
        name: &str,
        cwd: &str,
        cols: u16,
        rows: u16,
        emulator_sink: Box<dyn OutputSink>,
    ) -> Result<CreatedTab, PtyError> {
        let tab = self.workspace.create_project_with_terminal(name, cwd);
        self.attach_rolled_back(&tab.terminal_id, cols, rows, emulator_sink)
            .await?;
        self.save_all();
        Ok(tab)
    }

    /// Creates a tab in an existing project and attaches its PTY, rolling
    /// back on spawn failure.
    pub async fn open_terminal(
        &self,
        project_id: &str,
        cols: u16,
        rows: u16,
        emulator_sink: Box<dyn OutputSink>,
    ) -> Result<CreatedTab, PtyError> {
        let tab = self
            .workspace
            .create_terminal_in_project(project_id)
            .ok_or_else(|| PtyError::spawn_failed(format!("No project {project_id}")))?;
        self.attach_rolled_back(&tab.terminal_id, cols, rows, emulator_sink)
            .await?;
        self.save_all();
        Ok(tab)
    }

    /// Splits a pane and attaches the new PTY, rolling back on spawn failure.
    pub async fn split_pane(
        &self,
        target_terminal_id: &str,
        direction: SplitDirection,
        cols: u16,
        rows: u16,
        emulator_sink: Box<dyn OutputSink>,
    ) -> Result<String, PtyError> {
        let new_id = self
            .workspace
            .split_pane(target_terminal_id, direction)
            .ok_or_else(|| {
                PtyError::spawn_failed(format!("Terminal {target_terminal_id} is in no layout"))
            })?;
        self.attach_rolled_back(&new_id, cols, rows, emulator_sink)
            .await?;
        self.save_all();
        Ok(new_id)
    }

    async fn attach_rolled_back(
        &self,
        terminal_id: &str,
        cols: u16,
        rows: u16,
        emulator_sink: Box<dyn OutputSink>,
    ) -> Result<(), PtyError> {
        match self
            .attach_terminal(terminal_id, cols, rows, emulator_sink)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Undo the session/layout/tree entries minted for this
                // terminal; there is no PTY to tear down.
                self.workspace.close_pane(terminal_id).await;
                self.save_all();
                Err(e)
            }
        }
    }

    /// Closes one pane (PTY, session, layout slot; the tab and project too
    /// when this was their last pane).
    pub async fn close_pane(&self, terminal_id: &str) -> bool {
        self.detach(terminal_id);
        let existed = self.workspace.close_pane(terminal_id).await;
        self.save_all();
        existed
    }

    /// Deletes a tab with all of its panes.
    pub async fn delete_tab(&self, node_id: &str) -> Vec<String> {
        let closed = self.workspace.delete_tab(node_id).await;
        for tid in &closed {
            self.detach(tid);
        }
        self.save_all();
        closed
    }

    /// Deletes a project with every tab and pane in it.
    pub async fn delete_project(&self, project_id: &str) -> Vec<String> {
        let closed = self.workspace.delete_project(project_id).await;
        for tid in &closed {
            self.detach(tid);
        }
        self.save_all();
        closed
    }

    pub fn move_terminal_to_project(&self, node_id: &str, target_project_id: &str) -> bool {
        let moved = self.workspace.move_terminal_to_project(node_id, target_project_id);
        if moved {
            self.save_all();
        }
        moved
    }

    pub fn set_active_terminal(&self, terminal_id: Option<&str>) -> bool {
        let ok = self.workspace.set_active_terminal(terminal_id);
        if ok {
            self.save_all();
        }
        ok
    }

    /// Cycles the active tab across projects (see
    /// [`WorkspaceManager::cycle_tab`]).
    pub fn cycle_tab(&self, direction: CycleDirection) -> Option<(String, String)> {
        let cycled = self.workspace.cycle_tab(direction);
        if cycled.is_some() {
            self.save_all();
        }
        cycled
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    // ---- font size -------------------------------------------------------

    pub fn font_size(&self) -> u32 {
        storage::load_font_size(self.store.as_ref())
    }

    pub fn set_font_size(&self, size: u32) {
        storage::save_font_size(self.store.as_ref(), size);
    }

    pub fn reset_font_size(&self) -> u32 {
        storage::reset_font_size(self.store.as_ref())
    }

    // ---- persistence -----------------------------------------------------

    /// Flushes the three records from the in-memory stores.
    pub fn save_all(&self) {
        let (projects, terminals, layouts) = {
            let st = self.workspace.state();
            (
                ProjectsRecord {
                    projects: st.projects.projects().clone(),
                    nodes: st.projects.nodes().clone(),
                    active_project_id: st.projects.active_project_id().map(str::to_string),
                    project_order: st.projects.project_order().to_vec(),
                },
                TerminalsRecord {
                    sessions: st.terminals.sessions().clone(),
                    active_terminal_id: st.terminals.active_terminal_id().map(str::to_string),
                },
                LayoutsRecord {
                    layouts: st.layouts.layouts().clone(),
                },
            )
        };
        storage::save_projects(self.store.as_ref(), &projects);
        storage::save_terminals(self.store.as_ref(), &terminals);
        storage::save_layouts(self.store.as_ref(), &layouts);
    }

    /// Flushes state, disposes all output plumbing, and tears down every PTY
    /// (500 ms budget each, SIGKILL for stragglers).
    pub async fn shutdown(&self) {
        self.save_all();
        let ids: Vec<String> = self.attached.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.detach(&id);
        }
        self.engine.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonFileStore;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    struct CollectSink(Arc<StdMutex<Vec<u8>>>);

    impl OutputSink for CollectSink {
        fn on_output(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    fn sink() -> (Box<dyn OutputSink>, Arc<StdMutex<Vec<u8>>>) {
        let buf = Arc::new(StdMutex::new(Vec::new()));
        (Box::new(CollectSink(Arc::clone(&buf))), buf)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_project_attach_and_echo() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::init(Arc::new(JsonFileStore::new(dir.path())));
        let (emulator, buf) = sink();

        let tab = dispatcher
            .open_project("api", "/tmp", 80, 24, emulator)
            .await
            .unwrap();
        dispatcher
            .write_terminal(&tab.terminal_id, b"echo facade-roundtrip\n")
            .unwrap();

        let seen = wait_for(
            || String::from_utf8_lossy(&buf.lock().unwrap()).contains("facade-roundtrip"),
            Duration::from_secs(10),
        )
        .await;
        assert!(seen, "echoed output should reach the emulator sink");

        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_event_marks_session_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::init(Arc::new(JsonFileStore::new(dir.path())));
        let (emulator, _buf) = sink();

        let tab = dispatcher
            .open_project("api", "/tmp", 80, 24, emulator)
            .await
            .unwrap();
        dispatcher
            .write_terminal(&tab.terminal_id, b" exit 7\n")
            .unwrap();

        let tid = tab.terminal_id.clone();
        let ws = Arc::clone(&dispatcher.workspace);
        let errored = wait_for(
            || {
                ws.state()
                    .terminals
                    .get(&tid)
                    .map(|s| s.status == SessionStatus::Error && s.exit_code == Some(7))
                    .unwrap_or(false)
            },
            Duration::from_secs(10),
        )
        .await;
        assert!(errored, "nonzero exit should mark the session as error");
        assert!(!dispatcher.attached.contains_key(&tid));

        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_survives_restart_with_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(dir.path()));

        let (project_id, terminal_id) = {
            let dispatcher = Dispatcher::init(Arc::clone(&store));
            let tab = dispatcher.workspace.create_project_with_terminal("api", "/tmp");
            dispatcher
                .workspace
                .update_status(&tab.terminal_id, SessionStatus::Running, None);
            dispatcher.save_all();
            dispatcher.shutdown().await;
            (tab.project_id, tab.terminal_id)
        };

        let dispatcher = Dispatcher::init(store);
        let st = dispatcher.workspace.state();
        assert!(st.projects.get_project(&project_id).is_some());
        let session = st.terminals.get(&terminal_id).unwrap();
        // PTYs do not survive restart: restored sessions are normalized.
        assert_eq!(session.status, SessionStatus::Done);
        assert_eq!(session.exit_code, None);
        assert_eq!(
            st.layouts.get(&terminal_id).unwrap().terminal_ids(),
            [terminal_id.clone()]
        );
        st.verify_invariants().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_open_rolls_back_stores() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::init(Arc::new(JsonFileStore::new(dir.path())));
        let (emulator, _buf) = sink();

        // A nonexistent cwd makes the PTY spawn fail; the project, session
        // and layout minted for the terminal must all be rolled back.
        let err = dispatcher
            .open_project("api", "/definitely/not/a/dir", 80, 24, emulator)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::core::PtyErrorCode::SpawnFailed);

        let st = dispatcher.workspace.state();
        assert!(st.projects.projects().is_empty());
        assert!(st.terminals.is_empty());
        assert!(st.layouts.layouts().is_empty());
        st.verify_invariants().unwrap();
        drop(st);

        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_font_size_surface() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::init(Arc::new(JsonFileStore::new(dir.path())));
        assert_eq!(dispatcher.font_size(), storage::FONT_SIZE_DEFAULT);
        dispatcher.set_font_size(99);
        assert_eq!(dispatcher.font_size(), storage::FONT_SIZE_MAX);
        assert_eq!(dispatcher.reset_font_size(), storage::FONT_SIZE_DEFAULT);
    }
}
