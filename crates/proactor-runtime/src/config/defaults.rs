//! Compile-time defaults for `ProactorConfig`.
//!
//! Every value here can be overridden at runtime through the matching
//! `PROACTOR_*` environment variable.

/// Upper bound on one readiness wait. Only governs how quickly `stop()` is
/// observed; operations have no deadlines.
pub const POLL_TIMEOUT_MS: u64 = 500;

/// Events harvested per wait.
pub const MAX_EVENTS: usize = 64;

/// Scratch buffer for one read completion.
pub const READ_BUFFER_SIZE: usize = 4096;

pub const LISTEN_BACKLOG: i32 = 128;

pub const THREAD_NAME: &str = "proactor-loop";
