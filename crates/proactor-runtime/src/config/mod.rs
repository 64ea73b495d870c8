//! Proactor configuration
//!
//! Compile-time defaults (see [`defaults`]) with runtime environment
//! overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use proactor_runtime::config::ProactorConfig;
//!
//! // Defaults with env overrides
//! let config = ProactorConfig::from_env();
//!
//! // Or fully programmatic
//! let config = ProactorConfig::new()
//!     .poll_timeout(Duration::from_millis(50))
//!     .read_buffer_size(16 * 1024);
//! ```

pub mod defaults;

use std::time::Duration;

use proactor_core::env::{env_get, env_get_millis, env_get_str};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProactorConfig {
    /// Bound on a single readiness wait
    pub poll_timeout: Duration,
    /// Events harvested per wait
    pub max_events: usize,
    /// Scratch buffer size for read completions
    pub read_buffer_size: usize,
    /// `listen()` backlog used by servers
    pub listen_backlog: i32,
    /// Name of the event loop thread
    pub thread_name: String,
}

impl Default for ProactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ProactorConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PROACTOR_POLL_TIMEOUT_MS` - Wait bound in milliseconds
    /// - `PROACTOR_MAX_EVENTS` - Events per wait
    /// - `PROACTOR_READ_BUFFER_SIZE` - Bytes per read completion
    /// - `PROACTOR_LISTEN_BACKLOG` - Server listen backlog
    /// - `PROACTOR_THREAD_NAME` - Loop thread name
    pub fn from_env() -> Self {
        Self {
            poll_timeout: env_get_millis(
                "PROACTOR_POLL_TIMEOUT_MS",
                Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            ),
            max_events: env_get("PROACTOR_MAX_EVENTS", defaults::MAX_EVENTS),
            read_buffer_size: env_get("PROACTOR_READ_BUFFER_SIZE", defaults::READ_BUFFER_SIZE),
            listen_backlog: env_get("PROACTOR_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            thread_name: env_get_str("PROACTOR_THREAD_NAME", defaults::THREAD_NAME),
        }
        .sanitized()
    }

    /// Compile-time defaults only, environment ignored.
    pub fn new() -> Self {
        Self {
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            max_events: defaults::MAX_EVENTS,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            listen_backlog: defaults::LISTEN_BACKLOG,
            thread_name: defaults::THREAD_NAME.to_string(),
        }
    }

    // Builder methods

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }

    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n.max(1);
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    // Zero-sized event arrays and read buffers would turn every wait or
    // read into a no-op.
    fn sanitized(mut self) -> Self {
        self.max_events = self.max_events.max(1);
        self.read_buffer_size = self.read_buffer_size.max(1);
        if self.thread_name.is_empty() {
            self.thread_name = defaults::THREAD_NAME.to_string();
        }
        self
    }
}
