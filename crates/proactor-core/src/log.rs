//! Leveled logging through an injected sink.
//!
//! There is no process-global logger. A [`Logger`] (`Arc<dyn LogSink>`) is
//! handed to the proactor at construction and every component logs through
//! the one it got from there.
//!
//! # Environment Variables (read by [`StderrSink::from_env`])
//!
//! - `PROACTOR_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!   (names are accepted too)
//! - `PROACTOR_FLUSH_EPRINT=1` - Flush stderr after each line
//! - `PROACTOR_LOG_FILE=<path>` - Also append every line to this file
//!
//! # Usage
//!
//! ```ignore
//! use proactor_core::log::{Logger, StderrSink};
//! use proactor_core::{log_info, log_warn};
//!
//! let logger: Logger = StderrSink::from_env().into_logger();
//! log_info!(logger, "listening on port {}", port);
//! log_warn!(logger, "no operation for fd {}", fd);
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::env::{env_get_bool, env_get_opt, env_get_str};

/// Log levels, most severe first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse(s).ok_or(())
    }
}

/// Destination for log lines.
///
/// Implementations must tolerate concurrent calls from the loop thread and
/// any caller thread.
pub trait LogSink: Send + Sync {
    /// Cheap pre-check so disabled levels skip formatting.
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }

    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>);
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn enabled(&self, level: LogLevel) -> bool {
        (**self).enabled(level)
    }

    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        (**self).write(level, args)
    }
}

/// Shared logging capability.
pub type Logger = Arc<dyn LogSink>;

// ============================================================================
// StderrSink
// ============================================================================

/// Writes to stderr (one lock per line) and optionally appends to a file.
pub struct StderrSink {
    level: AtomicU8,
    flush: AtomicBool,
    file: Option<Mutex<File>>,
}

impl StderrSink {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
            flush: AtomicBool::new(false),
            file: None,
        }
    }

    /// Configure from `PROACTOR_LOG_LEVEL`, `PROACTOR_FLUSH_EPRINT` and
    /// `PROACTOR_LOG_FILE`. An unopenable log file is reported on stderr and
    /// skipped.
    pub fn from_env() -> Self {
        let level = env_get_opt::<LogLevel>("PROACTOR_LOG_LEVEL").unwrap_or(LogLevel::Info);
        let mut sink = Self::new(level);
        sink.set_flush_enabled(env_get_bool("PROACTOR_FLUSH_EPRINT", false));

        let path = env_get_str("PROACTOR_LOG_FILE", "");
        if !path.is_empty() {
            match open_append(Path::new(&path)) {
                Ok(file) => sink.file = Some(Mutex::new(file)),
                Err(e) => {
                    let _ = writeln!(
                        std::io::stderr().lock(),
                        "{} cannot open log file {}: {}",
                        LogLevel::Warn.prefix(),
                        path,
                        e
                    );
                }
            }
        }
        sink
    }

    /// Also append every line to `path` (created if missing).
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> std::io::Result<Self> {
        self.file = Some(Mutex::new(open_append(path.as_ref())?));
        Ok(self)
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn set_flush_enabled(&self, enabled: bool) {
        self.flush.store(enabled, Ordering::Relaxed);
    }

    pub fn into_logger(self) -> Logger {
        Arc::new(self)
    }
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LogSink for StderrSink {
    fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= self.level()
    }

    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let current = std::thread::current();
        let thread = current.name().unwrap_or("-");

        {
            let stderr = std::io::stderr();
            let mut handle = stderr.lock();
            let _ = writeln!(handle, "{} [{}] {}", level.prefix(), thread, args);
            if self.flush.load(Ordering::Relaxed) {
                let _ = handle.flush();
            }
        }

        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{} {} [{}] {}", timestamp(), level.prefix(), thread, args);
                let _ = f.flush();
            }
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Seconds.millis since the Unix epoch.
fn timestamp() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

// ============================================================================
// NullSink / CaptureSink
// ============================================================================

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NullSink {
    pub fn logger() -> Logger {
        Arc::new(NullSink)
    }
}

impl LogSink for NullSink {
    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }

    fn write(&self, _level: LogLevel, _args: fmt::Arguments<'_>) {}
}

/// Records every line in memory. Used for log assertions in tests.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl CaptureSink {
    /// A fresh sink behind an `Arc`, ready to coerce into a `Logger`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of recorded lines at `level`.
    pub fn count(&self, level: LogLevel) -> usize {
        self.lines
            .lock()
            .map(|l| l.iter().filter(|(lv, _)| *lv == level).count())
            .unwrap_or(0)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .map(|l| l.iter().any(|(_, msg)| msg.contains(needle)))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut l) = self.lines.lock() {
            l.clear();
        }
    }
}

impl LogSink for CaptureSink {
    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if let Ok(mut l) = self.lines.lock() {
            l.push((level, args.to_string()));
        }
    }
}

/// Internal: leveled write with the enabled pre-check.
#[doc(hidden)]
#[inline]
pub fn _log<S: LogSink + ?Sized>(sink: &S, level: LogLevel, args: fmt::Arguments<'_>) {
    if sink.enabled(level) {
        sink.write(level, args);
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Error level log
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {{
        $crate::log::_log(&*$logger, $crate::log::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {{
        $crate::log::_log(&*$logger, $crate::log::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {{
        $crate::log::_log(&*$logger, $crate::log::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {{
        $crate::log::_log(&*$logger, $crate::log::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! log_trace {
    ($logger:expr, $($arg:tt)*) => {{
        $crate::log::_log(&*$logger, $crate::log::LogLevel::Trace, format_args!($($arg)*));
    }};
}

// ============================================================================
// Tests
// ============================================================================
