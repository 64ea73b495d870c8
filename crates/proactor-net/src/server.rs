//! # Server - listening socket with one Accept always outstanding
//!
//! After `start`, exactly one Accept is registered for the listener. Every
//! completion hands the new connection to the connected callback and arms
//! the next Accept. `stop()` cancels the outstanding Accept before closing
//! the listener, so no callback fires afterwards.
//!
//! The listener lock is held while re-arming and while stopping; together
//! with the `listening` flag this keeps a completion racing `stop()` from
//! registering on a closed descriptor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use proactor_core::{log_error, log_info, log_warn, Buffer, Error, Logger};
use proactor_runtime::{AsyncOperation, Proactor, Socket};

/// Receives each accepted connection (already non-blocking).
pub type ConnectedCallback = Arc<dyn Fn(Socket) + Send + Sync>;

pub struct Server {
    proactor: Arc<Proactor>,
    inner: Arc<ServerInner>,
}

struct ServerInner {
    proactor: Weak<Proactor>,
    logger: Logger,
    listener: Mutex<Socket>,
    listening: AtomicBool,
    accepted: AtomicU64,
    on_connected: Mutex<Option<ConnectedCallback>>,
}

impl Server {
    pub fn new(proactor: &Arc<Proactor>) -> Self {
        Self {
            proactor: Arc::clone(proactor),
            inner: Arc::new(ServerInner {
                proactor: Arc::downgrade(proactor),
                logger: Arc::clone(proactor.logger()),
                listener: Mutex::new(Socket::invalid()),
                listening: AtomicBool::new(false),
                accepted: AtomicU64::new(0),
                on_connected: Mutex::new(None),
            }),
        }
    }

    pub fn set_connected_callback<F>(&self, f: F)
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_connected.lock() {
            *slot = Some(Arc::new(f));
        }
    }

    /// Listen on all interfaces. Port 0 picks an ephemeral port.
    pub fn start(&self, port: u16) -> Result<(), Error> {
        self.start_on("", port)
    }

    pub fn start_on(&self, host: &str, port: u16) -> Result<(), Error> {
        if self.is_listening() {
            return Err(Error::from_code(libc::EALREADY, "server start"));
        }
        self.listen_on(host, port).map_err(|e| {
            log_warn!(self.inner.logger, "server start on port {} failed: {}", port, e);
            e
        })
    }

    fn listen_on(&self, host: &str, port: u16) -> Result<(), Error> {
        let sock = Socket::create_tcp()?;
        sock.set_reuse_address()?;
        sock.bind(host, port)?;
        sock.listen(self.proactor.config().listen_backlog)?;
        sock.set_non_blocking()?;
        let bound = sock.local_port()?;

        {
            let mut listener = self
                .inner
                .listener
                .lock()
                .map_err(|_| Error::other("server listener lock poisoned"))?;
            *listener = sock;
        }
        self.inner.listening.store(true, Ordering::Release);

        if let Err(e) = ServerInner::arm_accept(&self.inner) {
            self.stop();
            return Err(e);
        }
        log_info!(self.inner.logger, "server listening on port {}", bound);
        Ok(())
    }

    /// Cancel the outstanding Accept and close the listener. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Bound port, `None` when not listening.
    pub fn local_port(&self) -> Option<u16> {
        let listener = self.inner.listener.lock().ok()?;
        if !listener.is_valid() {
            return None;
        }
        listener.local_port().ok()
    }

    /// Connections handed to the connected callback so far.
    pub fn accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    pub fn proactor(&self) -> &Arc<Proactor> {
        &self.proactor
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl ServerInner {
    fn arm_accept(this: &Arc<Self>) -> Result<(), Error> {
        let proactor = this
            .proactor
            .upgrade()
            .ok_or_else(|| Error::other("proactor is gone"))?;
        let listener = this
            .listener
            .lock()
            .map_err(|_| Error::other("server listener lock poisoned"))?;
        if !this.listening.load(Ordering::Acquire) || !listener.is_valid() {
            return Ok(());
        }

        let weak = Arc::downgrade(this);
        let op = AsyncOperation::accept(
            move |result: isize, buffer: Buffer| {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::on_accept(&inner, result, buffer);
                }
            },
            &listener,
        );
        op.initiate(&proactor)
    }

    fn on_accept(this: &Arc<Self>, result: isize, buffer: Buffer) {
        if result == 0 {
            match buffer.as_raw_fd() {
                Some(fd) => {
                    let sock = Socket::from_raw_fd(fd);
                    if this.listening.load(Ordering::Acquire) {
                        this.accepted.fetch_add(1, Ordering::Relaxed);
                        let cb = this.on_connected.lock().ok().and_then(|slot| slot.clone());
                        if let Some(cb) = cb {
                            cb(sock);
                        }
                    }
                }
                None => log_error!(this.logger, "accept completion without a descriptor"),
            }
        } else {
            log_warn!(this.logger, "{}", Error::from_result(result, "accept"));
        }

        if let Err(e) = Self::arm_accept(this) {
            log_error!(this.logger, "re-arming accept failed: {}", e);
        }
    }

    fn stop(&self) {
        let was_listening = self.listening.swap(false, Ordering::AcqRel);
        if let Ok(mut listener) = self.listener.lock() {
            if listener.is_valid() {
                if let Some(p) = self.proactor.upgrade() {
                    p.cancel_operation(listener.fd());
                }
                listener.close();
            }
        }
        if was_listening {
            log_info!(self.logger, "server stopped");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
