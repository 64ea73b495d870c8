//! # Client - one TCP connection driven by the proactor
//!
//! `Client` is a cheap `Clone` handle. All clones share one connection.
//! Completion handlers only hold a `Weak` to the shared state, so dropping
//! the last handle cancels whatever is outstanding and closes the socket.
//!
//! The proactor keeps one operation per descriptor, so the client
//! serializes its own traffic:
//!
//! - sends are queued and written one at a time;
//! - a `receive()` issued while a write is in flight is deferred until that
//!   write completes, and a read that a write displaced is re-issued the
//!   same way.
//!
//! Callbacks run on the loop thread (or inline when a write drains
//! synchronously) and are never called with a client lock held.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use proactor_core::{log_debug, log_warn, Buffer, Error, Logger};
use proactor_runtime::{AsyncOperation, Proactor, Socket};

/// Connection status: `(connected, error)`. `error` is `Error::none()` for
/// a clean connect or an orderly peer close.
pub type StatusCallback = Arc<dyn Fn(bool, &Error) + Send + Sync>;

/// Bytes from one read completion.
pub type DataCallback = Arc<dyn Fn(Buffer) + Send + Sync>;

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    proactor: Weak<Proactor>,
    logger: Logger,
    socket: Mutex<Socket>,
    connected: AtomicBool,
    /// A Write is registered or completing
    writing: AtomicBool,
    /// A Read is registered
    reading: AtomicBool,
    /// Start a Read once the current write finishes
    pending_receive: AtomicBool,
    write_queue: Mutex<VecDeque<Buffer>>,
    on_status: Mutex<Option<StatusCallback>>,
    on_data: Mutex<Option<DataCallback>>,
}

impl Client {
    pub fn new(proactor: &Arc<Proactor>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                proactor: Arc::downgrade(proactor),
                logger: Arc::clone(proactor.logger()),
                socket: Mutex::new(Socket::invalid()),
                connected: AtomicBool::new(false),
                writing: AtomicBool::new(false),
                reading: AtomicBool::new(false),
                pending_receive: AtomicBool::new(false),
                write_queue: Mutex::new(VecDeque::new()),
                on_status: Mutex::new(None),
                on_data: Mutex::new(None),
            }),
        }
    }

    pub fn set_connection_callback<F>(&self, f: F)
    where
        F: Fn(bool, &Error) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_status.lock() {
            *slot = Some(Arc::new(f));
        }
    }

    pub fn set_data_callback<F>(&self, f: F)
    where
        F: Fn(Buffer) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_data.lock() {
            *slot = Some(Arc::new(f));
        }
    }

    /// Start connecting. The status callback reports the outcome.
    ///
    /// A failure detected before the connect is under way (no socket, bad
    /// address, immediate refusal) is returned as `Err` and also reported as
    /// status `(false, err)`. Connecting while already connected only
    /// returns `EISCONN`.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), Error> {
        if self.is_connected() {
            return Err(Error::from_code(libc::EISCONN, "connect"));
        }
        self.start_connect(host, port).map_err(|e| {
            log_warn!(self.inner.logger, "connect to {}:{} failed: {}", host, port, e);
            self.inner.close_socket();
            self.inner.status(false, &e);
            e
        })
    }

    fn start_connect(&self, host: &str, port: u16) -> Result<(), Error> {
        let proactor = self.inner.proactor()?;
        let sock = Socket::create_tcp()?;

        let weak = Arc::downgrade(&self.inner);
        let op = AsyncOperation::connect(
            move |result: isize, _: Buffer| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_connect(result);
                }
            },
            &sock,
            host,
            port,
        );
        self.inner.replace_socket(sock)?;
        op.initiate(&proactor)
    }

    /// Take over an already connected socket (e.g. from an accept).
    pub fn adopt_socket(&self, socket: Socket) -> Result<(), Error> {
        if !socket.is_valid() {
            return Err(Error::from_code(libc::EBADF, "adopt_socket"));
        }
        socket.set_non_blocking()?;
        self.inner.replace_socket(socket)?;
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Queue `data` for writing.
    pub fn send(&self, data: impl Into<Buffer>) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::from_code(libc::ENOTCONN, "send"));
        }
        self.inner.queue()?.push_back(data.into());
        ClientInner::pump_writes(&self.inner)
    }

    /// Ask for the next chunk of data. Delivered through the data callback,
    /// or as a status `(false, ..)` when the peer closes.
    pub fn receive(&self) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::from_code(libc::ENOTCONN, "receive"));
        }
        let inner = &self.inner;
        if inner.writing.load(Ordering::Acquire) {
            inner.pending_receive.store(true, Ordering::Release);
            // Re-check: the write may have finished before the flag landed
            if inner.writing.load(Ordering::Acquire) || !inner.pending_receive.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
        }
        ClientInner::start_receive(inner)
    }

    /// Cancel anything outstanding and close. Idempotent.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Current descriptor, `-1` when closed.
    pub fn fd(&self) -> RawFd {
        self.inner.socket.lock().map(|s| s.fd()).unwrap_or(-1)
    }
}

impl ClientInner {
    fn proactor(&self) -> Result<Arc<Proactor>, Error> {
        self.proactor
            .upgrade()
            .ok_or_else(|| Error::other("proactor is gone"))
    }

    fn lock_socket(&self) -> Result<MutexGuard<'_, Socket>, Error> {
        self.socket.lock().map_err(|_| Error::other("client socket lock poisoned"))
    }

    fn queue(&self) -> Result<MutexGuard<'_, VecDeque<Buffer>>, Error> {
        self.write_queue
            .lock()
            .map_err(|_| Error::other("client write queue poisoned"))
    }

    fn replace_socket(&self, socket: Socket) -> Result<(), Error> {
        let mut current = self.lock_socket()?;
        if current.is_valid() {
            if let Some(p) = self.proactor.upgrade() {
                p.cancel_operation(current.fd());
            }
        }
        // Old descriptor closes on drop
        *current = socket;
        Ok(())
    }

    fn close_socket(&self) {
        if let Ok(mut sock) = self.socket.lock() {
            if sock.is_valid() {
                if let Some(p) = self.proactor.upgrade() {
                    p.cancel_operation(sock.fd());
                }
                sock.close();
            }
        }
    }

    fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.close_socket();
        if let Ok(mut q) = self.write_queue.lock() {
            q.clear();
        }
        self.writing.store(false, Ordering::Release);
        self.reading.store(false, Ordering::Release);
        self.pending_receive.store(false, Ordering::Release);
        if was_connected {
            log_debug!(self.logger, "client disconnected");
        }
    }

    fn status(&self, connected: bool, error: &Error) {
        let cb = self.on_status.lock().ok().and_then(|slot| slot.clone());
        if let Some(cb) = cb {
            cb(connected, error);
        }
    }

    fn on_connect(&self, result: isize) {
        if result == 0 {
            self.connected.store(true, Ordering::Release);
            self.status(true, &Error::none());
        } else {
            let err = Error::from_result(result, "connect");
            log_warn!(self.logger, "{}", err);
            self.close_socket();
            self.status(false, &err);
        }
    }

    /// Start the next queued write unless one is already in flight.
    fn pump_writes(this: &Arc<Self>) -> Result<(), Error> {
        loop {
            if this.writing.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let next = this.queue()?.pop_front();
            let Some(buffer) = next else {
                this.writing.store(false, Ordering::Release);
                // A send may have queued between the pop and the store
                if this.queue()?.is_empty() {
                    Self::resume_deferred_receive(this);
                    return Ok(());
                }
                continue;
            };

            // The Write replaces a registered Read; re-issue it afterwards
            if this.reading.swap(false, Ordering::AcqRel) {
                this.pending_receive.store(true, Ordering::Release);
            }

            let weak = Arc::downgrade(this);
            let op = {
                let sock = this.lock_socket()?;
                AsyncOperation::write(
                    move |result: isize, _: Buffer| {
                        if let Some(inner) = weak.upgrade() {
                            ClientInner::on_write(&inner, result);
                        }
                    },
                    &sock,
                    buffer,
                )
            };
            let proactor = this.proactor()?;
            return op.initiate(&proactor).map_err(|e| {
                this.writing.store(false, Ordering::Release);
                e
            });
        }
    }

    fn on_write(this: &Arc<Self>, result: isize) {
        if result < 0 {
            let err = Error::from_result(result, "write");
            log_warn!(this.logger, "{}", err);
            this.disconnect();
            this.status(false, &err);
            return;
        }
        this.writing.store(false, Ordering::Release);
        if let Err(e) = Self::pump_writes(this) {
            log_warn!(this.logger, "queued write not started: {}", e);
        }
    }

    fn resume_deferred_receive(this: &Arc<Self>) {
        if this.pending_receive.swap(false, Ordering::AcqRel) && this.connected.load(Ordering::Acquire) {
            if let Err(e) = Self::start_receive(this) {
                log_warn!(this.logger, "deferred receive not started: {}", e);
            }
        }
    }

    fn start_receive(this: &Arc<Self>) -> Result<(), Error> {
        let weak = Arc::downgrade(this);
        let op = {
            let sock = this.lock_socket()?;
            AsyncOperation::read(
                move |result: isize, buffer: Buffer| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_read(result, buffer);
                    }
                },
                &sock,
            )
        };
        let proactor = this.proactor()?;
        this.reading.store(true, Ordering::Release);
        op.initiate(&proactor).map_err(|e| {
            this.reading.store(false, Ordering::Release);
            e
        })
    }

    fn on_read(&self, result: isize, buffer: Buffer) {
        self.reading.store(false, Ordering::Release);
        if result > 0 {
            let cb = self.on_data.lock().ok().and_then(|slot| slot.clone());
            if let Some(cb) = cb {
                cb(buffer);
            }
        } else if result == 0 {
            self.disconnect();
            self.status(false, &Error::none());
        } else {
            let err = Error::from_result(result, "read");
            log_debug!(self.logger, "{}", err);
            self.disconnect();
            self.status(false, &err);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close_socket();
    }
}

// ============================================================================
// Tests
// ============================================================================
