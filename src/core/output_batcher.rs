//! Emulator-bound output coalescing.
//!
//! PTY output arrives in many small chunks; feeding each one to the emulator
//! individually wastes render work. The batcher accumulates bytes and flushes
//! them as one bulk write per animation tick (~16 ms). Batching is strictly
//! per terminal — bytes are never coalesced across session ids.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::pty_engine::OutputSink;

/// One flush per animation frame.
const FLUSH_TICK: Duration = Duration::from_millis(16);

struct BatcherInner {
    pending: Mutex<Vec<u8>>,
    sink: Box<dyn OutputSink>,
    wake: Notify,
    disposed: AtomicBool,
}

impl BatcherInner {
    fn flush(&self) {
        let buf = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if !buf.is_empty() {
            self.sink.on_output(&buf);
        }
    }
}

/// Per-terminal write coalescer in front of the emulator sink.
#[derive(Clone)]
pub struct OutputBatcher {
    inner: Arc<BatcherInner>,
}

impl OutputBatcher {
    /// Creates a batcher flushing into `sink` and starts its flush task.
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        let inner = Arc::new(BatcherInner {
            pending: Mutex::new(Vec::new()),
            sink,
            wake: Notify::new(),
            disposed: AtomicBool::new(false),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                task_inner.wake.notified().await;
                if task_inner.disposed.load(Ordering::Acquire) {
                    break;
                }
                // Everything written within the tick rides the same flush.
                tokio::time::sleep(FLUSH_TICK).await;
                if task_inner.disposed.load(Ordering::Acquire) {
                    break;
                }
                task_inner.flush();
            }
        });

        Self { inner }
    }

    /// Queues bytes for the next flush. Writes after `dispose` are dropped.
    pub fn write(&self, bytes: &[u8]) {
        if self.inner.disposed.load(Ordering::Acquire) || bytes.is_empty() {
            return;
        }
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(bytes);
        self.inner.wake.notify_one();
    }

    /// Flushes whatever is queued synchronously and stops the flush task.
    /// Later writes are dropped.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.flush();
        self.inner.wake.notify_one();
    }
}
