//! PTY session engine: spawn, write, resize, close, and output plumbing.
//!
//! Each terminal id owns one PTY. A dedicated OS thread reads PTY output into
//! a bounded channel (backpressure flows to the child through the PTY buffer),
//! and a tokio task drains it into the per-terminal [`OutputSink`]. Exit is
//! reported once per PTY on the engine-wide exit channel.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::mpsc;

use super::cwd;
use super::error::PtyError;
use super::warm_pool::WarmPool;

/// Maximum chunks buffered between the blocking reader thread and the
/// dispatch task. When full, the reader blocks, which backpressures the
/// child process through the kernel PTY buffer.
const READER_CHANNEL_CAPACITY: usize = 64;

/// Grace period between SIGTERM and SIGKILL when closing a terminal.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Per-PTY join budget during whole-engine shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_millis(500);

/// Receives the output byte stream of one terminal.
///
/// Chunk boundaries are arbitrary (typically ≤ 4 KiB, as produced by the OS).
/// Chunks for one terminal arrive in read order, exactly once, always from the
/// terminal's dispatch task. No ordering holds across terminals.
pub trait OutputSink: Send + Sync {
    fn on_output(&self, bytes: &[u8]);
}

impl<F> OutputSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_output(&self, bytes: &[u8]) {
        self(bytes)
    }
}

/// Published when a PTY's child terminates. `exit_code` is `None` when the
/// child died without a collectable status (read error, external SIGKILL).
#[derive(Debug, Clone, Serialize)]
pub struct ExitEvent {
    pub terminal_id: String,
    pub exit_code: Option<i32>,
}

/// Shared child handle so the reader thread can call `try_wait()` at EOF
/// while the close path still owns the handle for the kill ladder.
type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// A freshly opened PTY with its shell child, before engine registration.
/// Also the unit the warm pool holds while a PTY waits for adoption.
pub(crate) struct SpawnedPty {
    pub(crate) master: Box<dyn MasterPty + Send>,
    pub(crate) child: Box<dyn Child + Send + Sync>,
    pub(crate) writer: Box<dyn Write + Send>,
}

/// A single registered PTY session with its associated resources.
struct PtyHandle {
    /// Writer half of the PTY master — used for stdin.
    writer: Mutex<Box<dyn Write + Send>>,
    /// Master PTY handle — used for resize operations.
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Child process, shared with the reader thread.
    child: SharedChild,
    /// PID of the child process (shell).
    child_pid: i32,
    /// Process group ID for signal delivery (Unix only). portable-pty calls
    /// setsid() on spawn, so the child is a session+group leader.
    #[cfg(unix)]
    pgid: i32,
    /// Raw master fd, kept for foreground-process-group introspection.
    #[cfg(unix)]
    master_fd: Option<i32>,
    /// Set by `close` so the dispatch task suppresses the exit event for a
    /// terminal the caller is already tearing down.
    closing: Arc<AtomicBool>,
    /// Handle to the dedicated reader OS thread.
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    sessions: DashMap<String, PtyHandle>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<ExitEvent>>>,
    pool: WarmPool,
}

/// Owns and manages all PTY sessions for the application lifetime.
///
/// Wraps an `Arc<Inner>` so it can be cheaply cloned into shared state and
/// used across async operation handlers without lifetime issues. Terminal ids
/// are caller-supplied opaque strings (UUIDs in practice) and are never
/// reused while registered.
#[derive(Clone)]
pub struct PtyEngine {
    inner: Arc<Inner>,
}

impl Default for PtyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyEngine {
    /// Creates a new engine with no active sessions and an empty warm pool.
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                exit_tx,
                exit_rx: Mutex::new(Some(exit_rx)),
                pool: WarmPool::new(),
            }),
        }
    }

    /// Takes the exit-event receiver. `Some` exactly once; the embedding
    /// layer drains it for the lifetime of the engine.
    pub fn take_exit_events(&self) -> Option<mpsc::UnboundedReceiver<ExitEvent>> {
        self.inner.exit_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Spawns (or adopts from the warm pool) a shell PTY registered under `id`
    /// and begins forwarding its output to `sink`.
    ///
    /// Uses `$SHELL` (falling back to `/bin/bash` on Unix, `%COMSPEC%` on
    /// Windows) with `-l` for a login environment. `cwd`, when given, must
    /// exist and be a directory. Pool adoption keeps new-tab latency low; the
    /// adopted shell is `cd`-ed to the requested directory. Returns once the
    /// spawn is acknowledged and the reader is running.
    pub async fn create(
        &self,
        id: &str,
        cwd: Option<&str>,
        cols: u16,
        rows: u16,
        sink: Box<dyn OutputSink>,
    ) -> Result<(), PtyError> {
        if self.inner.sessions.contains_key(id) {
            return Err(PtyError::already_exists(id));
        }

        // Validate cwd up front: a bad directory should fail the create, not
        // silently spawn a shell somewhere else.
        let canonical_cwd = match cwd {
            Some(dir) => {
                let canonical = std::path::Path::new(dir)
                    .canonicalize()
                    .map_err(|e| PtyError::spawn_failed(format!("Invalid cwd '{dir}': {e}")))?;
                if !canonical.is_dir() {
                    return Err(PtyError::spawn_failed(format!(
                        "cwd '{dir}' is not a directory"
                    )));
                }
                Some(canonical.to_string_lossy().into_owned())
            }
            None => None,
        };

        let (spawned, adopted) = match self.inner.pool.claim() {
            Some(pooled) => (pooled, true),
            None => {
                let env = [("DISPATCHER_TERMINAL_ID".to_string(), id.to_string())];
                (
                    spawn_shell_pty(canonical_cwd.as_deref(), cols, rows, &env)?,
                    false,
                )
            }
        };

        self.register(id, spawned, cols, rows, sink)?;

        if adopted {
            // Pooled shells idle at a transient directory and the wrong size.
            let _ = self.resize(id, cols, rows);
            if let Some(dir) = canonical_cwd {
                let _ = self.write(id, format!(" cd '{}' && clear\n", shell_escape(&dir)).as_bytes());
            }
            log::info!("Adopted pooled PTY as terminal {id}");
        }

        Ok(())
    }

    /// Wires a spawned PTY into the registry: clones the reader, starts the
    /// reader thread and the dispatch task, and inserts the handle.
    fn register(
        &self,
        id: &str,
        spawned: SpawnedPty,
        _cols: u16,
        _rows: u16,
        sink: Box<dyn OutputSink>,
    ) -> Result<(), PtyError> {
        let SpawnedPty {
            master,
            child,
            writer,
        } = spawned;

        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| PtyError::spawn_failed("Could not obtain child PID"))?;

        #[cfg(unix)]
        let pgid = master.process_group_leader().unwrap_or(child_pid);
        #[cfg(unix)]
        let master_fd = master.as_raw_fd();

        let mut reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::spawn_failed(format!("Failed to clone PTY reader: {e}")))?;

        let child: SharedChild = Arc::new(Mutex::new(child));
        let closing = Arc::new(AtomicBool::new(false));
        let exit_code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(READER_CHANNEL_CAPACITY);

        // Dedicated OS thread for reading PTY output. The thread terminates
        // when the master/writer FDs are dropped (read returns EOF) or the
        // child exits.
        let reader_child = Arc::clone(&child);
        let reader_exit_code = Arc::clone(&exit_code);
        let reader_id = id.to_string();
        let reader_handle = std::thread::Builder::new()
            .name(format!("pty-reader-{id}"))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            // EOF — shell exited. Capture the exit code while
                            // the process is freshly reapable.
                            if let Ok(mut guard) = reader_child.lock() {
                                if let Ok(Some(status)) = guard.try_wait() {
                                    *reader_exit_code.lock().unwrap_or_else(|e| e.into_inner()) =
                                        Some(status.exit_code() as i32);
                                }
                            }
                            break;
                        }
                        Ok(n) => {
                            // blocking_send applies backpressure from the
                            // dispatch side; a closed channel means teardown.
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // EAGAIN/EINTR are retriable on Unix; anything else is fatal
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("PTY reader {reader_id} error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("PTY reader {reader_id} exited");
            })
            .map_err(|e| PtyError::spawn_failed(format!("Failed to spawn reader thread: {e}")))?;

        // Tokio task: drain the channel into the sink, then report exit once
        // the reader is done — unless a close() is already tearing us down.
        let dispatch_id = id.to_string();
        let dispatch_closing = Arc::clone(&closing);
        let dispatch_exit_code = Arc::clone(&exit_code);
        let dispatch_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                sink.on_output(&bytes);
            }
            if !dispatch_closing.load(Ordering::Acquire) {
                let code = dispatch_exit_code
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                dispatch_inner.sessions.remove(&dispatch_id);
                log::info!("Terminal {dispatch_id} exited with code {code:?}");
                let _ = dispatch_inner.exit_tx.send(ExitEvent {
                    terminal_id: dispatch_id.clone(),
                    exit_code: code,
                });
            }
            log::debug!("PTY dispatch {dispatch_id} exited");
        });

        let handle = PtyHandle {
            writer: Mutex::new(writer),
            master: Mutex::new(master),
            child,
            child_pid,
            #[cfg(unix)]
            pgid,
            #[cfg(unix)]
            master_fd,
            closing,
            reader_handle: Mutex::new(Some(reader_handle)),
        };

        self.inner.sessions.insert(id.to_string(), handle);
        log::info!("Registered PTY terminal {id} (pid={child_pid})");
        Ok(())
    }

    /// Writes raw bytes to a terminal's PTY stdin and flushes immediately.
    ///
    /// Unknown ids are an error; I/O failures against a dying PTY are logged
    /// and swallowed — the exit event will tear the session down shortly.
    pub fn write(&self, id: &str, bytes: &[u8]) -> Result<(), PtyError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .ok_or_else(|| PtyError::terminal_not_found(id))?;

        let mut writer = session
            .writer
            .lock()
            .map_err(|e| PtyError::write_failed(format!("Writer lock poisoned: {e}")))?;

        if let Err(e) = writer.write_all(bytes).and_then(|_| writer.flush()) {
            log::debug!("Write to terminal {id} failed (dead PTY?): {e}");
        }
        Ok(())
    }

    /// Resizes the PTY to the given dimensions, propagating SIGWINCH to the
    /// child. Rejects dimensions that are zero or exceed 500.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 || rows > 500 || cols > 500 {
            return Err(PtyError::resize_failed("Invalid dimensions"));
        }
        let session = self
            .inner
            .sessions
            .get(id)
            .ok_or_else(|| PtyError::terminal_not_found(id))?;

        let master = session
            .master
            .lock()
            .map_err(|e| PtyError::resize_failed(format!("Master lock poisoned: {e}")))?;

        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::resize_failed(format!("Resize failed: {e}")))
    }

    /// Returns the working directory of the terminal's foreground process,
    /// best-effort. `Ok(None)` when introspection is unavailable.
    pub fn get_cwd(&self, id: &str) -> Result<Option<String>, PtyError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .ok_or_else(|| PtyError::terminal_not_found(id))?;

        #[cfg(unix)]
        let pid = session
            .master_fd
            .and_then(cwd::foreground_pid)
            .unwrap_or(session.child_pid);
        #[cfg(not(unix))]
        let pid = session.child_pid;

        Ok(cwd::process_cwd(pid))
    }

    /// True when a PTY is registered under `id`.
    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.sessions.contains_key(id)
    }

    /// Returns all registered terminal ids.
    pub fn terminal_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Terminates a terminal's PTY with graceful escalation.
    ///
    /// On Unix: SIGTERM to the process group, 100 ms grace, then SIGKILL.
    /// On Windows: taskkill on the process tree. Afterwards the master and
    /// writer FDs are dropped to EOF the reader thread, which is joined off
    /// the async runtime. The session is removed from the registry before
    /// signaling, so concurrent calls with the same id get `TerminalNotFound`.
    /// No exit event is published for an explicitly closed terminal.
    pub async fn close(&self, id: &str) -> Result<(), PtyError> {
        let session = self
            .inner
            .sessions
            .remove(id)
            .ok_or_else(|| PtyError::terminal_not_found(id))?
            .1;

        session.closing.store(true, Ordering::Release);
        let pid = session.child_pid;

        #[cfg(unix)]
        {
            let pgid = session.pgid;

            let term_result = unsafe { libc::kill(-pgid, libc::SIGTERM) };
            if term_result != 0 {
                log::warn!(
                    "Failed to SIGTERM terminal {id} (pgid={pgid}): {}",
                    std::io::Error::last_os_error()
                );
            }

            let exited = tokio::time::timeout(KILL_GRACE, async {
                loop {
                    if unsafe { libc::kill(pid, 0) } != 0 {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;

            if exited.is_err() {
                let kill_result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
                if kill_result != 0 {
                    log::warn!(
                        "Failed to SIGKILL terminal {id} (pgid={pgid}): {}",
                        std::io::Error::last_os_error()
                    );
                }
            }

            // Reap so the pid does not linger as a zombie.
            if let Ok(mut child) = session.child.lock() {
                let _ = child.try_wait();
            }
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            let result = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
            if let Err(e) = result {
                log::warn!("Failed to taskkill terminal {id} (pid={pid}): {e}");
            }
        }

        // Drop the writer and master — this closes the PTY fd, which causes
        // the reader thread to get EOF and exit.
        drop(session.writer);
        drop(session.master);

        // Join the reader thread off the async runtime to avoid blocking tokio
        let reader_handle = session
            .reader_handle
            .lock()
            .map_err(|e| log::warn!("Reader handle lock poisoned during cleanup: {e}"))
            .ok()
            .and_then(|mut h| h.take());

        if let Some(handle) = reader_handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        log::info!("Closed terminal {id}");
        Ok(())
    }

    /// Tops the warm pool up to `n` pre-spawned PTYs in the background.
    /// Idempotent; pool failure is non-fatal (creates fall back to spawning).
    pub fn warm_pool(&self, n: usize) {
        self.inner.pool.ensure(n);
    }

    /// Number of idle pooled PTYs, for diagnostics and tests.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.size()
    }

    /// Closes every terminal and drains the warm pool. Each close gets a
    /// 500 ms budget; survivors are SIGKILL-ed outright. Returns the number
    /// of terminals that were closed.
    pub async fn shutdown_all(&self) -> usize {
        let ids = self.terminal_ids();
        let count = ids.len();
        for id in ids {
            #[cfg(unix)]
            let pgid = self.inner.sessions.get(&id).map(|s| s.pgid);

            if tokio::time::timeout(SHUTDOWN_BUDGET, self.close(&id))
                .await
                .is_err()
            {
                log::warn!("Terminal {id} did not close within budget");
                #[cfg(unix)]
                if let Some(pgid) = pgid {
                    unsafe { libc::kill(-pgid, libc::SIGKILL) };
                }
                self.inner.sessions.remove(&id);
            }
        }
        self.inner.pool.drain();
        log::info!("Engine shutdown complete ({count} terminals)");
        count
    }
}

/// Opens a PTY of the given size and spawns a login shell in it.
///
/// Shared by direct creates and the warm pool so both paths produce
/// identically configured shells.
pub(crate) fn spawn_shell_pty(
    cwd: Option<&str>,
    cols: u16,
    rows: u16,
    env: &[(String, String)],
) -> Result<SpawnedPty, PtyError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::resource_exhausted(format!("Failed to open PTY: {e}")))?;

    #[cfg(unix)]
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
    #[cfg(windows)]
    let shell = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());

    let mut cmd = CommandBuilder::new(&shell);
    #[cfg(unix)]
    cmd.arg("-l"); // Login shell for proper env on Unix

    for (key, value) in env {
        cmd.env(key, value);
    }

    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::spawn_failed(format!("Failed to spawn shell: {e}")))?;

    // Drop the slave — the master keeps the PTY alive
    drop(pair.slave);

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::spawn_failed(format!("Failed to take PTY writer: {e}")))?;

    Ok(SpawnedPty {
        master: pair.master,
        child,
        writer,
    })
}

/// Escapes a path for interpolation inside single quotes in a shell command.
pub(crate) fn shell_escape(path: &str) -> String {
    path.replace('\'', r"'\''")
}
