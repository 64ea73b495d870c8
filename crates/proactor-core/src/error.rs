//! Error types for the proactor.
//!
//! Two tiers:
//!
//! - [`SetupError`] is fatal and only returned by constructors that acquire
//!   OS resources (poller, wake pipe, listening socket, loop thread).
//! - [`Error`] is an operational value. The zero value means success, so a
//!   callback can always receive one even when nothing went wrong.

use std::fmt;

use nix::errno::Errno;

/// Operational error value: an OS code plus a formatted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Error {
    code: i32,
    message: String,
}

impl Error {
    /// The success value.
    pub fn none() -> Self {
        Self::default()
    }

    /// Capture the calling thread's `errno`.
    ///
    /// Must be called right after the failing syscall, before anything else
    /// can overwrite `errno`.
    pub fn from_errno(context: &str) -> Self {
        Self::from_code(Errno::last_raw(), context)
    }

    /// Build from a known OS code. Formats as `"<context>: <desc> (<code>)"`.
    pub fn from_code(code: i32, context: &str) -> Self {
        let desc = Errno::from_raw(code).desc();
        Self {
            code,
            message: format!("{}: {} ({})", context, desc, code),
        }
    }

    /// Rebuild an error from a negative completion result.
    ///
    /// `-1` is shared by `EPERM` and errors without an OS code (see
    /// [`Error::as_result`]). It decodes as the code-less error, with a
    /// message that names both readings.
    pub fn from_result(result: isize, context: &str) -> Self {
        if result < -1 && result >= -(i32::MAX as isize) {
            Self::from_code((-result) as i32, context)
        } else if result == -1 {
            Self::other(format!("{}: failed (-1, EPERM or unspecified)", context))
        } else {
            Self::other(format!("{}: failed ({})", context, result))
        }
    }

    /// Error without an OS code. Uses `-1` so it still reads as a failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: -1,
            message: message.into(),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    #[inline]
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Completion result for this error: `-code` for an OS code, `-1`
    /// otherwise. Never 0 or positive.
    ///
    /// `EPERM` (code 1) also encodes as `-1`, so it does not survive a trip
    /// through [`Error::from_result`]. Callers that must tell it apart keep
    /// the `Error` itself.
    pub fn as_result(&self) -> isize {
        if self.code > 0 {
            -(self.code as isize)
        } else {
            -1
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            write!(f, "success")
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Fatal construction failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// epoll_create1 / kqueue failed.
    Poller(i32),
    /// Self-pipe creation or configuration failed.
    WakePipe(i32),
    /// socket() failed.
    Socket(i32),
    /// Loop thread could not be spawned.
    Thread(String),
}

impl SetupError {
    /// OS code when one is known.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Poller(e) | Self::WakePipe(e) | Self::Socket(e) => Some(*e),
            Self::Thread(_) => None,
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poller(e) => write!(f, "poller creation failed: {} ({})", Errno::from_raw(*e).desc(), e),
            Self::WakePipe(e) => write!(f, "wake pipe setup failed: {} ({})", Errno::from_raw(*e).desc(), e),
            Self::Socket(e) => write!(f, "socket creation failed: {} ({})", Errno::from_raw(*e).desc(), e),
            Self::Thread(msg) => write!(f, "loop thread spawn failed: {}", msg),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<SetupError> for Error {
    fn from(e: SetupError) -> Self {
        match e.code() {
            Some(code) => Error::from_code(code, "setup"),
            None => Error::other(e.to_string()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
