pub mod cwd;
pub mod error;
pub mod output_batcher;
pub mod pty_engine;
pub mod shell_integration;
pub mod warm_pool;

pub use error::{PtyError, PtyErrorCode};
pub use output_batcher::OutputBatcher;
pub use pty_engine::{ExitEvent, OutputSink, PtyEngine};
pub use shell_integration::{IntegrationHost, ShellIntegration, HOOK_SCRIPT};
