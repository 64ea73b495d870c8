//! # Asynchronous operations
//!
//! One `AsyncOperation` is a single pending Accept, Connect, Read or Write
//! on a descriptor, plus the handler that receives its result. The kind is
//! a closed set: [`OpKind`] tags it and the Proactor dispatches on the tag
//! through a table.
//!
//! ## State machine
//!
//! ```text
//! Created ──initiate──► Initiated ──complete──► Completed
//!    ▲                      │
//!    └──initiate failed─────┤
//!                           └──cancel──► Cancelled
//! ```
//!
//! `complete` fires the handler at most once and never after `cancel`.
//!
//! ## Results
//!
//! Handlers receive `(result, buffer)`:
//!
//! | Kind | Success | Buffer |
//! |---|---|---|
//! | Accept | `0` | accepted descriptor (`Buffer::as_raw_fd`) |
//! | Connect | `0` | empty |
//! | Read | bytes read, `0` on peer close | the bytes |
//! | Write | total bytes written | empty |
//!
//! Failures are negative: `-errno` when the OS reported a code, `-1`
//! otherwise.
//!
//! Operations do not own their descriptor. The caller keeps the `Socket`
//! alive until the operation completes or is cancelled.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use proactor_core::{log_debug, log_warn, Buffer, Error};

use crate::event_queue::Filter;
use crate::proactor::Proactor;
use crate::socket::{Socket, Transfer};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Receives the result of one operation. Runs on the loop thread, or on the
/// initiating thread when a Write drains synchronously.
pub trait CompletionHandler: Send + Sync {
    fn handle_completion(&self, result: isize, buffer: Buffer);
}

impl<F> CompletionHandler for F
where
    F: Fn(isize, Buffer) + Send + Sync,
{
    fn handle_completion(&self, result: isize, buffer: Buffer) {
        self(result, buffer)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Accept = 0,
    Connect = 1,
    Read = 2,
    Write = 3,
}

impl OpKind {
    /// Readiness direction the kind waits on.
    pub fn filter(self) -> Filter {
        match self {
            OpKind::Accept | OpKind::Read => Filter::Read,
            OpKind::Connect | OpKind::Write => Filter::Write,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Accept => "accept",
            OpKind::Connect => "connect",
            OpKind::Read => "read",
            OpKind::Write => "write",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Created = 0,
    Initiated = 1,
    Completed = 2,
    Cancelled = 3,
}

impl OpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OpState::Created,
            1 => OpState::Initiated,
            2 => OpState::Completed,
            _ => OpState::Cancelled,
        }
    }
}

/// Kind-specific data.
enum OpPayload {
    Accept,
    Connect { host: String, port: u16 },
    Read,
    Write { buffer: Buffer, written: AtomicUsize },
}

/// Progress of a write after one drain attempt.
enum WriteProgress {
    Drained(usize),
    Pending,
}

pub struct AsyncOperation {
    id: u64,
    kind: OpKind,
    fd: RawFd,
    handler: Arc<dyn CompletionHandler>,
    cancelled: AtomicBool,
    state: AtomicU8,
    payload: OpPayload,
}

impl AsyncOperation {
    fn build(kind: OpKind, fd: RawFd, handler: Arc<dyn CompletionHandler>, payload: OpPayload) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            fd,
            handler,
            cancelled: AtomicBool::new(false),
            state: AtomicU8::new(OpState::Created as u8),
            payload,
        })
    }

    pub fn accept<H: CompletionHandler + 'static>(handler: H, listener: &Socket) -> Arc<Self> {
        Self::build(OpKind::Accept, listener.fd(), Arc::new(handler), OpPayload::Accept)
    }

    pub fn connect<H: CompletionHandler + 'static>(
        handler: H,
        socket: &Socket,
        host: &str,
        port: u16,
    ) -> Arc<Self> {
        Self::build(
            OpKind::Connect,
            socket.fd(),
            Arc::new(handler),
            OpPayload::Connect {
                host: host.to_string(),
                port,
            },
        )
    }

    pub fn read<H: CompletionHandler + 'static>(handler: H, socket: &Socket) -> Arc<Self> {
        Self::build(OpKind::Read, socket.fd(), Arc::new(handler), OpPayload::Read)
    }

    pub fn write<H: CompletionHandler + 'static>(handler: H, socket: &Socket, buffer: Buffer) -> Arc<Self> {
        Self::build(
            OpKind::Write,
            socket.fd(),
            Arc::new(handler),
            OpPayload::Write {
                buffer,
                written: AtomicUsize::new(0),
            },
        )
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Bytes of a Write already handed to the kernel. Always 0 for other
    /// kinds.
    pub fn bytes_written(&self) -> usize {
        match &self.payload {
            OpPayload::Write { written, .. } => written.load(Ordering::Acquire),
            _ => 0,
        }
    }

    /// Start the operation.
    ///
    /// All or nothing: on `Err` nothing stays registered, the handler has not
    /// run and the state is back to `Created`. A Write that drains
    /// synchronously completes before this returns.
    pub fn initiate(self: &Arc<Self>, proactor: &Proactor) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(
                OpState::Created as u8,
                OpState::Initiated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::from_code(libc::EALREADY, self.kind.name()));
        }

        let result = self.start(proactor);
        if let Err(e) = &result {
            log_debug!(proactor.logger(), "{} on fd {} not started: {}", self.kind.name(), self.fd, e);
            let _ = self.state.compare_exchange(
                OpState::Initiated as u8,
                OpState::Created as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        result
    }

    fn start(self: &Arc<Self>, proactor: &Proactor) -> Result<(), Error> {
        if self.fd < 0 {
            return Err(Error::from_code(libc::EBADF, self.kind.name()));
        }
        let sock = Socket::borrow_raw(self.fd);

        match &self.payload {
            OpPayload::Accept => proactor.register_operation(self.fd, Arc::clone(self)),
            OpPayload::Connect { host, port } => {
                sock.set_non_blocking()?;
                if sock.socket_type()? != libc::SOCK_STREAM {
                    return Err(Error::from_code(libc::EPROTOTYPE, "connect"));
                }
                sock.connect(host, *port)?;
                proactor.register_operation(self.fd, Arc::clone(self))
            }
            OpPayload::Read => {
                sock.take_error()?;
                sock.peek_probe()?;
                proactor.register_operation(self.fd, Arc::clone(self))
            }
            OpPayload::Write { .. } => match self.drain_write(&sock)? {
                WriteProgress::Drained(total) => {
                    self.complete(total as isize, Buffer::new());
                    Ok(())
                }
                WriteProgress::Pending => proactor.register_operation(self.fd, Arc::clone(self)),
            },
        }
    }

    /// Deliver the result. Returns `false` (handler not run) when the
    /// operation was cancelled or already completed.
    pub fn complete(&self, result: isize, buffer: Buffer) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if self
            .state
            .compare_exchange(
                OpState::Initiated as u8,
                OpState::Completed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.handler.handle_completion(result, buffer);
        true
    }

    /// Suppress any later completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let mut cur = self.state.load(Ordering::Acquire);
        while cur == OpState::Created as u8 || cur == OpState::Initiated as u8 {
            match self.state.compare_exchange_weak(
                cur,
                OpState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Continue a Write after write readiness: push the rest of the buffer,
    /// then complete with the total or re-register for the next event.
    pub fn resume_write(self: &Arc<Self>, proactor: &Proactor) {
        if self.is_cancelled() {
            return;
        }
        let sock = Socket::borrow_raw(self.fd);
        match self.drain_write(&sock) {
            Ok(WriteProgress::Drained(total)) => {
                self.complete(total as isize, Buffer::new());
            }
            Ok(WriteProgress::Pending) => {
                if let Err(e) = proactor.register_operation(self.fd, Arc::clone(self)) {
                    self.complete(e.as_result(), Buffer::new());
                }
            }
            Err(e) => {
                log_warn!(proactor.logger(), "write on fd {} failed: {}", self.fd, e);
                self.complete(e.as_result(), Buffer::new());
            }
        }
    }

    // Write until the buffer is drained or the kernel pushes back. The
    // offset only grows and never passes the buffer size.
    fn drain_write(&self, sock: &Socket) -> Result<WriteProgress, Error> {
        let OpPayload::Write { buffer, written } = &self.payload else {
            return Err(Error::from_code(libc::EINVAL, "resume_write on a non-write operation"));
        };
        let data = buffer.as_slice();
        loop {
            let offset = written.load(Ordering::Acquire);
            if offset >= data.len() {
                return Ok(WriteProgress::Drained(data.len()));
            }
            match sock.write(&data[offset..])? {
                Transfer::Bytes(0) | Transfer::WouldBlock | Transfer::Eof => {
                    return Ok(WriteProgress::Pending)
                }
                Transfer::Bytes(n) => {
                    written.store((offset + n).min(data.len()), Ordering::Release);
                }
            }
        }
    }
}

impl std::fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fd", &self.fd)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
