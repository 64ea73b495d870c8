//! # proactor-core
//!
//! Core types shared by every layer of the proactor workspace.
//!
//! This crate performs no I/O of its own. Sockets, the readiness backend
//! and the dispatcher live in `proactor-runtime`; the session layer lives in
//! `proactor-net`.
//!
//! ## Modules
//!
//! - `buffer` - Owned, growable byte storage with explicit size/capacity
//! - `error` - Operational `Error` values and fatal `SetupError`s
//! - `log` - Injected logging capability (`LogSink`) and leveled macros
//! - `env` - Environment variable helpers for configuration overrides
//!
//! ## Error boundary
//!
//! Constructors that acquire OS resources return `SetupError` and never
//! hand out a half-built value. Everything else reports through `Error`
//! values (or negative completion results) and never panics.

pub mod buffer;
pub mod error;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use buffer::Buffer;
pub use error::{Error, SetupError};
pub use log::{CaptureSink, LogLevel, LogSink, Logger, NullSink, StderrSink};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
