//! Pre-spawned PTY pool.
//!
//! New-tab latency is dominated by shell startup. The pool keeps up to `n`
//! shells already running (idling in the user's home directory); `create`
//! adopts one when available and `cd`s it to the requested directory. The
//! pool is strictly an optimization — when empty or failing, callers fall
//! back to a direct spawn.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::pty_engine::{spawn_shell_pty, SpawnedPty};

/// Size pooled shells are spawned at; adopters resize immediately.
const POOL_COLS: u16 = 80;
const POOL_ROWS: u16 = 24;

struct PoolInner {
    idle: Mutex<Vec<SpawnedPty>>,
    desired: AtomicUsize,
    topping_up: AtomicBool,
}

/// A cache of spawned-but-unclaimed PTYs.
#[derive(Clone)]
pub(crate) struct WarmPool {
    inner: Arc<PoolInner>,
}

impl WarmPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                desired: AtomicUsize::new(0),
                topping_up: AtomicBool::new(false),
            }),
        }
    }

    /// Tops the pool up to `n` entries on a blocking worker. Idempotent: a
    /// top-up already in flight simply picks up the new target.
    pub(crate) fn ensure(&self, n: usize) {
        self.inner.desired.store(n, Ordering::Release);
        if self.inner.topping_up.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let home = directories::BaseDirs::new()
                .map(|d| d.home_dir().to_string_lossy().into_owned());
            loop {
                let target = inner.desired.load(Ordering::Acquire);
                let current = inner.idle.lock().unwrap_or_else(|e| e.into_inner()).len();
                if current >= target {
                    break;
                }
                match spawn_shell_pty(home.as_deref(), POOL_COLS, POOL_ROWS, &[]) {
                    Ok(pty) => {
                        inner
                            .idle
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(pty);
                    }
                    Err(e) => {
                        log::warn!("Warm pool spawn failed, stopping top-up: {e}");
                        break;
                    }
                }
            }
            inner.topping_up.store(false, Ordering::Release);
            let size = inner.idle.lock().unwrap_or_else(|e| e.into_inner()).len();
            log::debug!("Warm pool topped up to {size}");
        });
    }

    /// Pops an idle PTY whose shell is still alive. Dead pool entries are
    /// discarded on the way.
    pub(crate) fn claim(&self) -> Option<SpawnedPty> {
        let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(mut pty) = idle.pop() {
            match pty.child.try_wait() {
                Ok(None) => return Some(pty),
                _ => {
                    log::debug!("Discarding dead pooled PTY");
                }
            }
        }
        None
    }

    pub(crate) fn size(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Kills and drops every idle pooled shell.
    pub(crate) fn drain(&self) {
        let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
        for mut pty in idle.drain(..) {
            let _ = pty.child.kill();
            let _ = pty.child.try_wait();
        }
    }
}
