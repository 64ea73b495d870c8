//! # EchoServer - one session per accepted connection
//!
//! Sessions live in a slab (`SessionTable`) addressed by [`SessionId`].
//! Completion handlers capture a `Weak` to the shared state plus their
//! `SessionId`, never a pointer back into the server, so a handler that
//! outlives its session finds an empty slot and does nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use proactor_core::{log_debug, log_info, log_warn, Buffer, Error, Logger};
use proactor_runtime::{Proactor, Socket};

use crate::client::Client;
use crate::server::Server;

/// Called with each chunk before it is echoed back.
pub type EchoObserver = Arc<dyn Fn(SessionId, &[u8]) + Send + Sync>;

/// Slot index plus the generation the slot had when the session was
/// inserted. A stale id never matches a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ============================================================================
// Session table
// ============================================================================

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab with a free list. Removing bumps the slot's generation.
pub(crate) struct SessionTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SessionTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> SessionId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SessionId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SessionId { index, generation: 0 }
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Empty the table, returning every live value.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

// ============================================================================
// EchoServer
// ============================================================================

struct EchoShared {
    proactor: Weak<Proactor>,
    logger: Logger,
    running: AtomicBool,
    sessions: Mutex<SessionTable<Client>>,
    on_echo: Mutex<Option<EchoObserver>>,
}

pub struct EchoServer {
    server: Server,
    shared: Arc<EchoShared>,
}

impl EchoServer {
    pub fn new(proactor: &Arc<Proactor>) -> Self {
        let shared = Arc::new(EchoShared {
            proactor: Arc::downgrade(proactor),
            logger: Arc::clone(proactor.logger()),
            running: AtomicBool::new(false),
            sessions: Mutex::new(SessionTable::new()),
            on_echo: Mutex::new(None),
        });

        let server = Server::new(proactor);
        let weak = Arc::downgrade(&shared);
        server.set_connected_callback(move |sock| {
            if let Some(shared) = weak.upgrade() {
                EchoShared::on_connected(&shared, sock);
            }
        });

        Self { server, shared }
    }

    pub fn set_echo_observer<F>(&self, f: F)
    where
        F: Fn(SessionId, &[u8]) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.on_echo.lock() {
            *slot = Some(Arc::new(f));
        }
    }

    pub fn start(&self, port: u16) -> Result<(), Error> {
        self.start_on("", port)
    }

    pub fn start_on(&self, host: &str, port: u16) -> Result<(), Error> {
        self.shared.running.store(true, Ordering::Release);
        self.server.start_on(host, port).map_err(|e| {
            self.shared.running.store(false, Ordering::Release);
            e
        })
    }

    /// Stop accepting and disconnect every session.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.server.stop();

        let sessions = match self.shared.lock_sessions() {
            Ok(mut table) => table.drain(),
            Err(_) => Vec::new(),
        };
        if !sessions.is_empty() {
            log_info!(self.shared.logger, "echo: closing {} session(s)", sessions.len());
        }
        for client in sessions {
            client.disconnect();
        }
    }

    pub fn session_count(&self) -> usize {
        self.shared.lock_sessions().map(|t| t.len()).unwrap_or(0)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.server.local_port()
    }

    pub fn is_listening(&self) -> bool {
        self.server.is_listening()
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EchoShared {
    fn lock_sessions(&self) -> Result<MutexGuard<'_, SessionTable<Client>>, Error> {
        self.sessions
            .lock()
            .map_err(|_| Error::other("echo session table poisoned"))
    }

    fn session(&self, id: SessionId) -> Option<Client> {
        self.lock_sessions().ok()?.get(id).cloned()
    }

    fn on_connected(this: &Arc<Self>, sock: Socket) {
        if !this.running.load(Ordering::Acquire) {
            return;
        }
        let Some(proactor) = this.proactor.upgrade() else {
            return;
        };

        let client = Client::new(&proactor);
        if let Err(e) = client.adopt_socket(sock) {
            log_warn!(this.logger, "echo: adopting connection failed: {}", e);
            return;
        }
        let id = match this.lock_sessions() {
            Ok(mut table) => table.insert(client.clone()),
            Err(e) => {
                log_warn!(this.logger, "{}", e);
                return;
            }
        };
        log_debug!(this.logger, "echo: session {} on fd {}", id, client.fd());

        let weak = Arc::downgrade(this);
        client.set_data_callback(move |buf| {
            if let Some(shared) = weak.upgrade() {
                shared.on_data(id, buf);
            }
        });
        let weak = Arc::downgrade(this);
        client.set_connection_callback(move |connected, err| {
            if connected {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                shared.on_closed(id, err);
            }
        });

        if let Err(e) = client.receive() {
            log_warn!(this.logger, "echo: session {} receive failed: {}", id, e);
            this.remove(id);
        }
    }

    fn on_data(&self, id: SessionId, buf: Buffer) {
        let Some(client) = self.session(id) else {
            return;
        };

        let observer = self.on_echo.lock().ok().and_then(|slot| slot.clone());
        if let Some(observer) = observer {
            observer(id, buf.as_slice());
        }

        if let Err(e) = client.send(buf) {
            log_warn!(self.logger, "echo: session {} send failed: {}", id, e);
            self.remove(id);
            return;
        }
        if let Err(e) = client.receive() {
            log_warn!(self.logger, "echo: session {} receive failed: {}", id, e);
            self.remove(id);
        }
    }

    fn on_closed(&self, id: SessionId, err: &Error) {
        if err.is_error() {
            log_warn!(self.logger, "echo: session {} closed: {}", id, err);
        } else {
            log_debug!(self.logger, "echo: session {} closed by peer", id);
        }
        // Out of the table first, then torn down
        let removed = match self.lock_sessions() {
            Ok(mut table) => table.remove(id),
            Err(_) => None,
        };
        drop(removed);
    }

    fn remove(&self, id: SessionId) {
        let removed = match self.lock_sessions() {
            Ok(mut table) => table.remove(id),
            Err(_) => None,
        };
        if let Some(client) = removed {
            client.disconnect();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
