//! # Proactor - fd → operation registry and completion dispatch
//!
//! The Proactor owns the [`EventQueue`] and the registry of outstanding
//! operations (at most one per descriptor). Readiness events arrive on the
//! loop thread; the matching entry is erased under the registry lock, the
//! lock is released, and the kind-specific completion logic runs. Handlers
//! are therefore free to register new operations, including on the same fd.
//!
//! ```text
//!  caller thread                 loop thread
//!  ─────────────                 ───────────
//!  op.initiate(&p)
//!    └─ register_operation ──►  registry[fd] = op, watch(filter, op.id)
//!                               wait() ─► handle_event(fd, filter, id)
//!                                 ├─ lock, erase registry[fd], unwatch, unlock
//!                                 └─ DISPATCH[kind](fd, op) ─► op.complete(..)
//! ```
//!
//! Lock order is registry, then the poller's own interest lock. Nothing
//! above this layer may hold one of its locks across a call into
//! `handle_event`.
//!
//! Construction failures are `SetupError`; everything else is an `Error`
//! value or a negative completion result. Nothing here panics on an
//! operational failure.

use std::collections::HashMap;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use proactor_core::{log_debug, log_error, log_info, log_trace, log_warn, Buffer, Error, Logger, SetupError};

use crate::config::ProactorConfig;
use crate::event_queue::{EventQueue, Filter};
use crate::operation::AsyncOperation;
use crate::socket::{Socket, Transfer};

type Registry = HashMap<RawFd, Arc<AsyncOperation>>;

/// Completion logic for one kind; runs on the loop thread without the
/// registry lock.
type KindHandler = fn(&Proactor, RawFd, Arc<AsyncOperation>);

/// Indexed by `OpKind::index()`.
const DISPATCH: [KindHandler; 4] = [
    Proactor::handle_accept,
    Proactor::handle_connect,
    Proactor::handle_read,
    Proactor::handle_write,
];

pub struct Proactor {
    event_queue: EventQueue,
    registry: Mutex<Registry>,
    config: ProactorConfig,
    logger: Logger,
    this: Weak<Proactor>,
}

impl Proactor {
    /// Build the poller and wake pipe. The loop is not started.
    pub fn new(config: ProactorConfig, logger: Logger) -> Result<Arc<Self>, SetupError> {
        let event_queue = EventQueue::new(&config, Arc::clone(&logger))?;
        Ok(Arc::new_cyclic(|this| Self {
            event_queue,
            registry: Mutex::new(HashMap::new()),
            config,
            logger,
            this: this.clone(),
        }))
    }

    /// Spawn the event loop. The loop only holds a `Weak` to the Proactor,
    /// so dropping the last `Arc` still shuts everything down.
    pub fn start(&self) -> Result<(), SetupError> {
        let this = self.this.clone();
        self.event_queue.start(move |fd, filter, user_data| {
            if let Some(proactor) = this.upgrade() {
                proactor.handle_event(fd, filter, user_data);
            }
        })?;
        log_info!(self.logger, "proactor started ({})", self.config.thread_name);
        Ok(())
    }

    /// Stop the event loop. Outstanding operations stay registered.
    pub fn stop(&self) {
        if self.event_queue.is_running() {
            self.event_queue.stop();
            log_info!(self.logger, "proactor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.event_queue.is_running()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn config(&self) -> &ProactorConfig {
        &self.config
    }

    /// Number of registry entries.
    pub fn pending_operations(&self) -> usize {
        self.lock_registry().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.lock_registry().map(|r| r.contains_key(&fd)).unwrap_or(false)
    }

    /// Make `op` the operation for `fd` and watch its filter.
    ///
    /// Replaces any previous entry for `fd`. If the replaced entry waited on
    /// the other filter, that interest is dropped too. A failed watch leaves
    /// no entry behind.
    pub fn register_operation(&self, fd: RawFd, op: Arc<AsyncOperation>) -> Result<(), Error> {
        let filter = op.kind().filter();
        let id = op.id();
        let mut registry = self.lock_registry()?;

        if let Some(prev) = registry.insert(fd, op) {
            let prev_filter = prev.kind().filter();
            if prev_filter != filter {
                if let Err(e) = self.event_queue.unregister(fd, prev_filter) {
                    log_warn!(self.logger, "fd {}: dropping replaced interest: {}", fd, e);
                }
            }
            if prev.id() != id {
                log_debug!(self.logger, "fd {}: {} replaced by new operation", fd, prev.kind().name());
            }
        }

        if let Err(e) = self.event_queue.register(fd, filter, id) {
            registry.remove(&fd);
            log_error!(self.logger, "fd {}: register failed: {}", fd, e);
            return Err(e);
        }
        Ok(())
    }

    /// Withdraw the operation for `fd`. Its handler will not run afterwards.
    /// Returns `false` when nothing was registered.
    ///
    /// Does not interrupt a handler that is already running.
    pub fn cancel_operation(&self, fd: RawFd) -> bool {
        let Ok(mut registry) = self.lock_registry() else {
            return false;
        };
        let Some(op) = registry.remove(&fd) else {
            return false;
        };
        if let Err(e) = self.event_queue.unregister(fd, op.kind().filter()) {
            log_warn!(self.logger, "fd {}: unregister on cancel: {}", fd, e);
        }
        op.cancel();
        log_trace!(self.logger, "fd {}: {} cancelled", fd, op.kind().name());
        true
    }

    /// Route one readiness event. Loop thread only.
    pub fn handle_event(&self, fd: RawFd, filter: Filter, user_data: u64) {
        let op = {
            let Ok(mut registry) = self.lock_registry() else {
                return;
            };
            match registry.get(&fd) {
                None => {
                    log_debug!(self.logger, "fd {}: event with no operation", fd);
                    return;
                }
                Some(op) if op.id() != user_data || op.kind().filter() != filter => {
                    log_trace!(self.logger, "fd {}: stale {:?} event ignored", fd, filter);
                    return;
                }
                Some(_) => {}
            }
            let Some(op) = registry.remove(&fd) else {
                return;
            };
            if let Err(e) = self.event_queue.unregister(fd, filter) {
                log_warn!(self.logger, "fd {}: unregister: {}", fd, e);
            }
            op
        };

        if op.is_cancelled() {
            return;
        }
        DISPATCH[op.kind().index()](self, fd, op);
    }

    // ── per-kind completion logic ──

    fn handle_accept(&self, fd: RawFd, op: Arc<AsyncOperation>) {
        let listener = Socket::borrow_raw(fd);
        match listener.accept() {
            Err(e) => {
                log_warn!(self.logger, "fd {}: {}", fd, e);
                op.complete(e.as_result(), Buffer::new());
            }
            // Spurious readiness, or the peer gave up before we got to it
            Ok(None) => self.rearm(fd, op),
            Ok(Some(sock)) => {
                if let Err(e) = sock.set_non_blocking() {
                    log_warn!(self.logger, "accepted fd {}: {}", sock.fd(), e);
                    op.complete(e.as_result(), Buffer::new());
                    return;
                }
                let accepted = sock.into_raw_fd();
                log_trace!(self.logger, "fd {}: accepted fd {}", fd, accepted);
                if !op.complete(0, Buffer::from_raw_fd(accepted)) {
                    drop(Socket::from_raw_fd(accepted));
                }
            }
        }
    }

    fn handle_connect(&self, fd: RawFd, op: Arc<AsyncOperation>) {
        let sock = Socket::borrow_raw(fd);
        match sock.take_error().and_then(|()| sock.write_probe()) {
            Ok(()) => {
                op.complete(0, Buffer::new());
            }
            Err(e) => {
                log_debug!(self.logger, "fd {}: connect failed: {}", fd, e);
                op.complete(e.as_result(), Buffer::new());
            }
        }
    }

    fn handle_read(&self, fd: RawFd, op: Arc<AsyncOperation>) {
        let sock = Socket::borrow_raw(fd);
        let mut buf = Buffer::with_capacity(self.config.read_buffer_size);
        match sock.read(buf.storage_mut()) {
            Err(e) => {
                log_debug!(self.logger, "fd {}: {}", fd, e);
                op.complete(e.as_result(), Buffer::new());
            }
            Ok(Transfer::Eof) => {
                op.complete(0, Buffer::new());
            }
            Ok(Transfer::WouldBlock) => self.rearm(fd, op),
            Ok(Transfer::Bytes(n)) => {
                buf.set_size(n);
                op.complete(n as isize, buf);
            }
        }
    }

    fn handle_write(&self, _fd: RawFd, op: Arc<AsyncOperation>) {
        op.resume_write(self);
    }

    fn rearm(&self, fd: RawFd, op: Arc<AsyncOperation>) {
        if let Err(e) = self.register_operation(fd, Arc::clone(&op)) {
            op.complete(e.as_result(), Buffer::new());
        }
    }

    fn lock_registry(&self) -> Result<MutexGuard<'_, Registry>, Error> {
        self.registry
            .lock()
            .map_err(|_| Error::other("operation registry poisoned"))
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpState;
    use proactor_core::NullSink;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn proactor() -> Arc<Proactor> {
        let config = ProactorConfig::new().poll_timeout(Duration::from_millis(50));
        let p = Proactor::new(config, NullSink::logger()).unwrap();
        p.start().unwrap();
        p
    }

    fn listener() -> (Socket, u16) {
        let l = Socket::create_tcp().unwrap();
        l.set_reuse_address().unwrap();
        l.bind("127.0.0.1", 0).unwrap();
        l.listen(16).unwrap();
        let port = l.local_port().unwrap();
        (l, port)
    }

    /// Non-blocking local end plus a blocking std peer.
    fn connected_pair() -> (Socket, TcpStream) {
        let (l, port) = listener();
        let peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let local = l.accept().unwrap().unwrap();
        local.set_non_blocking().unwrap();
        (local, peer)
    }

    fn channel_handler() -> (mpsc::Receiver<(isize, Vec<u8>)>, impl Fn(isize, Buffer) + Send + Sync + 'static) {
        let (tx, rx) = mpsc::channel();
        (rx, move |res: isize, buf: Buffer| {
            let _ = tx.send((res, buf.into_vec()));
        })
    }

    #[test]
    fn test_read_completion() {
        let p = proactor();
        let (local, mut peer) = connected_pair();
        let (rx, handler) = channel_handler();

        let op = AsyncOperation::read(handler, &local);
        op.initiate(&p).unwrap();
        assert!(p.is_registered(local.fd()));

        peer.write_all(b"ping").unwrap();
        let (res, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(res, 4);
        assert_eq!(data, b"ping");
        // Erased before dispatch, not re-added
        assert!(!p.is_registered(local.fd()));
    }

    #[test]
    fn test_read_eof() {
        let p = proactor();
        let (local, peer) = connected_pair();
        let (rx, handler) = channel_handler();

        AsyncOperation::read(handler, &local).initiate(&p).unwrap();
        drop(peer);
        let (res, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(res, 0);
        assert!(data.is_empty());
    }

    #[test]
    fn test_accept_delivers_descriptor() {
        let p = proactor();
        let (l, port) = listener();
        let (rx, handler) = channel_handler();

        AsyncOperation::accept(handler, &l).initiate(&p).unwrap();
        let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let (res, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(res, 0);
        let fd = Buffer::from(data).as_raw_fd().unwrap();
        let accepted = Socket::from_raw_fd(fd);
        assert!(accepted.is_valid());
        assert_eq!(accepted.socket_type().unwrap(), libc::SOCK_STREAM);
    }

    #[test]
    fn test_connect_completion() {
        let p = proactor();
        let (l, port) = listener();
        let sock = Socket::create_tcp().unwrap();
        let (rx, handler) = channel_handler();

        AsyncOperation::connect(handler, &sock, "localhost", port)
            .initiate(&p)
            .unwrap();
        let (res, _) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(res, 0);
        drop(l);
    }

    #[test]
    fn test_connect_refused() {
        let p = proactor();
        // Grab a free port, then close it
        let port = {
            let (l, port) = listener();
            drop(l);
            port
        };
        let sock = Socket::create_tcp().unwrap();
        let (rx, handler) = channel_handler();

        match AsyncOperation::connect(handler, &sock, "127.0.0.1", port).initiate(&p) {
            // Loopback may refuse synchronously
            Err(e) => assert_eq!(e.code(), libc::ECONNREFUSED),
            Ok(()) => {
                let (res, _) = rx.recv_timeout(WAIT).unwrap();
                assert_eq!(res, -(libc::ECONNREFUSED as isize));
            }
        }
        assert!(!p.is_registered(sock.fd()));
    }

    #[test]
    fn test_initiate_invalid_socket() {
        let p = proactor();
        let (rx, handler) = channel_handler();
        let op = AsyncOperation::read(handler, &Socket::invalid());

        let e = op.initiate(&p).unwrap_err();
        assert_eq!(e.code(), libc::EBADF);
        assert_eq!(op.state(), OpState::Created);
        assert_eq!(p.pending_operations(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_initiate_twice_rejected() {
        let p = proactor();
        let (local, _peer) = connected_pair();
        let (_rx, handler) = channel_handler();
        let op = AsyncOperation::read(handler, &local);
        op.initiate(&p).unwrap();
        assert_eq!(op.initiate(&p).unwrap_err().code(), libc::EALREADY);
        assert!(p.cancel_operation(local.fd()));
    }

    #[test]
    fn test_cancel_before_readiness() {
        let p = proactor();
        let (local, mut peer) = connected_pair();
        let (rx, handler) = channel_handler();

        let op = AsyncOperation::read(handler, &local);
        op.initiate(&p).unwrap();
        assert!(p.cancel_operation(local.fd()));
        assert!(!p.cancel_operation(local.fd()));
        assert_eq!(op.state(), OpState::Cancelled);

        peer.write_all(b"late").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(p.pending_operations(), 0);
    }

    #[test]
    fn test_small_write_completes_inline() {
        let p = proactor();
        let (local, mut peer) = connected_pair();
        let (rx, handler) = channel_handler();

        let op = AsyncOperation::write(handler, &local, Buffer::from("hello"));
        op.initiate(&p).unwrap();
        // Already delivered on this thread
        let (res, _) = rx.try_recv().unwrap();
        assert_eq!(res, 5);
        assert_eq!(op.state(), OpState::Completed);
        assert!(!p.is_registered(local.fd()));

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_empty_write_completes_with_zero() {
        let p = proactor();
        let (local, _peer) = connected_pair();
        let (rx, handler) = channel_handler();
        AsyncOperation::write(handler, &local, Buffer::new()).initiate(&p).unwrap();
        assert_eq!(rx.try_recv().unwrap().0, 0);
    }

    #[test]
    fn test_large_write_spans_events() {
        const SIZE: usize = 32 * 1024 * 1024;
        let p = proactor();
        let (local, mut peer) = connected_pair();
        let (rx, handler) = channel_handler();

        let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
        let op = AsyncOperation::write(handler, &local, Buffer::from(payload));
        op.initiate(&p).unwrap();
        // Socket buffers cannot hold it all, so it must wait on readiness
        assert_eq!(op.state(), OpState::Initiated);
        assert!(p.is_registered(local.fd()));

        let watcher = Arc::clone(&op);
        let reader = thread::spawn(move || {
            let mut got = 0usize;
            let mut last = 0usize;
            let mut buf = vec![0u8; 64 * 1024];
            while got < SIZE {
                let n = peer.read(&mut buf).unwrap();
                assert!(n > 0);
                for (k, b) in buf[..n].iter().enumerate() {
                    assert_eq!(*b, ((got + k) % 251) as u8);
                }
                got += n;
                let offset = watcher.bytes_written();
                assert!(offset >= last && offset <= SIZE);
                last = offset;
            }
            got
        });

        let (res, _) = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(res, SIZE as isize);
        assert_eq!(reader.join().unwrap(), SIZE);
        assert_eq!(op.bytes_written(), SIZE);
    }

    #[test]
    fn test_registry_unique_under_concurrency() {
        let config = ProactorConfig::new().poll_timeout(Duration::from_millis(50));
        let p = Proactor::new(config, NullSink::logger()).unwrap();
        let (l, _port) = listener();
        let fd = l.fd();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let op = AsyncOperation::accept(|_: isize, _: Buffer| {}, &Socket::borrow_raw(fd));
                        p.register_operation(fd, op).unwrap();
                        assert!(p.pending_operations() <= 1);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(p.pending_operations(), 1);
        assert!(p.cancel_operation(fd));
        assert_eq!(p.pending_operations(), 0);
    }

    #[test]
    fn test_replacing_filter_drops_old_interest() {
        let p = proactor();
        let (local, mut peer) = connected_pair();
        let (read_rx, read_handler) = channel_handler();

        AsyncOperation::read(read_handler, &local).initiate(&p).unwrap();
        let write_op = AsyncOperation::write(|_: isize, _: Buffer| {}, &local, Buffer::new());
        p.register_operation(local.fd(), write_op).unwrap();

        // Read interest went with the replaced entry
        peer.write_all(b"x").unwrap();
        assert!(read_rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_drop_stops_loop() {
        let p = proactor();
        assert!(p.is_running());
        p.stop();
        assert!(!p.is_running());
        p.start().unwrap();
        drop(p);
    }

    #[test]
    fn test_handler_can_reregister_same_fd() {
        let p = proactor();
        let (local, mut peer) = connected_pair();
        let local = Arc::new(local);
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        // Second read registered from inside the first completion
        let weak = Arc::downgrade(&p);
        let sock = Arc::clone(&local);
        let first = AsyncOperation::read(
            move |_: isize, buf: Buffer| {
                let _ = tx.send(buf.into_vec());
                let tx = tx.clone();
                let next = AsyncOperation::read(
                    move |_: isize, buf: Buffer| {
                        let _ = tx.send(buf.into_vec());
                    },
                    &sock,
                );
                if let Some(p) = weak.upgrade() {
                    next.initiate(&p).unwrap();
                }
            },
            &local,
        );
        first.initiate(&p).unwrap();

        peer.write_all(b"one").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"one");
        peer.write_all(b"two").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"two");
    }

    #[test]
    fn test_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<Proactor>();
        check::<AsyncOperation>();
    }
}
