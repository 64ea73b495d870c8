//! # EventQueue - edge-triggered readiness loop
//!
//! Owns the OS readiness poller and the dedicated loop thread. Callers
//! register read/write interest per descriptor with an opaque `u64` of user
//! data; the loop hands every ready `(fd, filter, user_data)` to the
//! callback given to [`EventQueue::start`].
//!
//! The backend is chosen at compile time: epoll on Linux/Android, kqueue on
//! macOS/iOS and the BSDs. Both run edge-triggered, so a consumer that stops
//! reading before `WouldBlock` must re-register to hear about the rest.
//!
//! A self-pipe wakes the loop for `stop()`. Its read end is drained inside
//! the loop and never reaches the callback.
//!
//! Every `start()` begins a new run with its own generation number. A loop
//! exits as soon as the generation moves on, so a thread detached by a
//! `stop()` from inside the callback can never keep dispatching next to the
//! run that replaced it. Events harvested by a run that was stopped
//! mid-batch are carried over and dispatched first by the next run.
//!
//! Errors: construction returns `SetupError`; registration returns `Error`
//! and never tears the loop down.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use proactor_core::{log_debug, log_error, log_warn, Error, Logger, SetupError};

use crate::config::ProactorConfig;

/// Readiness direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Read,
    Write,
}

/// One ready registration harvested by a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub fd: RawFd,
    pub filter: Filter,
    pub user_data: u64,
}

/// Platform readiness backend.
///
/// `watch` and `unwatch` may be called from any thread while `wait` runs on
/// the loop thread.
pub trait Poller: Send + Sync + Sized {
    fn new() -> Result<Self, SetupError>;

    /// Add `filter` interest for `fd`, keeping any other filter already
    /// watched. Re-watching a filter replaces its user data.
    fn watch(&self, fd: RawFd, filter: Filter, user_data: u64) -> Result<(), Error>;

    /// Drop `filter` interest. No-op when not watched.
    fn unwatch(&self, fd: RawFd, filter: Filter) -> Result<(), Error>;

    /// Wait up to `timeout` and append at most `max` ready registrations to
    /// `out`. An interrupted wait returns `Ok` with nothing appended.
    ///
    /// Error and hang-up conditions are reported for every watched filter of
    /// the descriptor.
    fn wait(&self, out: &mut Vec<Ready>, max: usize, timeout: Duration) -> Result<(), Error>;
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::EpollPoller as PlatformPoller;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))] {
        mod kqueue;
        pub use kqueue::KqueuePoller as PlatformPoller;
    } else {
        compile_error!("proactor-runtime needs epoll or kqueue");
    }
}

/// User data carried by the wake pipe registration.
const WAKE_TOKEN: u64 = u64::MAX;

/// Callback run on the loop thread for every ready registration.
pub type EventCallback = Box<dyn FnMut(RawFd, Filter, u64) + Send + 'static>;

struct Shared {
    poller: PlatformPoller,
    running: AtomicBool,
    /// Bumped by every start and stop; a loop only runs while it matches
    generation: AtomicU64,
    /// Harvested but undelivered when the previous run stopped
    carried: Mutex<Vec<Ready>>,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
    logger: Logger,
    timeout: Duration,
    max_events: usize,
}

impl Shared {
    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.wake_rx.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn carry_over(&self, events: impl Iterator<Item = Ready>) {
        let wake_fd = self.wake_rx.as_raw_fd();
        if let Ok(mut carried) = self.carried.lock() {
            carried.extend(events.filter(|ev| ev.fd != wake_fd));
        }
    }

    fn take_carried(&self, out: &mut Vec<Ready>) {
        if let Ok(mut carried) = self.carried.lock() {
            out.append(&mut carried);
        }
    }
}

pub struct EventQueue {
    shared: Arc<Shared>,
    thread_name: String,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Loops stopped from their own thread; joined once they finish
    detached: Mutex<Vec<JoinHandle<()>>>,
}

impl EventQueue {
    /// Create the poller and wake pipe. Does not start the loop.
    pub fn new(config: &ProactorConfig, logger: Logger) -> Result<Self, SetupError> {
        let poller = PlatformPoller::new()?;
        let (wake_rx, wake_tx) = nix::unistd::pipe().map_err(|e| SetupError::WakePipe(e as i32))?;
        for fd in [wake_rx.as_raw_fd(), wake_tx.as_raw_fd()] {
            set_pipe_flags(fd).map_err(SetupError::WakePipe)?;
        }
        poller
            .watch(wake_rx.as_raw_fd(), Filter::Read, WAKE_TOKEN)
            .map_err(|e| SetupError::WakePipe(e.code()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                poller,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                carried: Mutex::new(Vec::new()),
                wake_rx,
                wake_tx,
                logger,
                timeout: config.poll_timeout,
                max_events: config.max_events,
            }),
            thread_name: config.thread_name.clone(),
            thread: Mutex::new(None),
            detached: Mutex::new(Vec::new()),
        })
    }

    pub fn register_for_read(&self, fd: RawFd, user_data: u64) -> Result<(), Error> {
        self.register(fd, Filter::Read, user_data)
    }

    pub fn register_for_write(&self, fd: RawFd, user_data: u64) -> Result<(), Error> {
        self.register(fd, Filter::Write, user_data)
    }

    pub fn unregister_for_read(&self, fd: RawFd) -> Result<(), Error> {
        self.unregister(fd, Filter::Read)
    }

    pub fn unregister_for_write(&self, fd: RawFd) -> Result<(), Error> {
        self.unregister(fd, Filter::Write)
    }

    pub fn register(&self, fd: RawFd, filter: Filter, user_data: u64) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::from_code(libc::EBADF, "register"));
        }
        if fd == self.shared.wake_rx.as_raw_fd() {
            return Err(Error::from_code(libc::EINVAL, "register: wake pipe is reserved"));
        }
        self.shared.poller.watch(fd, filter, user_data)
    }

    pub fn unregister(&self, fd: RawFd, filter: Filter) -> Result<(), Error> {
        if fd < 0 || fd == self.shared.wake_rx.as_raw_fd() {
            return Ok(());
        }
        self.shared.poller.unwatch(fd, filter)
    }

    /// Spawn the loop thread. A second start while running is logged and
    /// ignored.
    ///
    /// Events carried over from a run stopped mid-batch are delivered first
    /// and may refer to registrations that changed in the meantime.
    pub fn start<F>(&self, callback: F) -> Result<(), SetupError>
    where
        F: FnMut(RawFd, Filter, u64) + Send + 'static,
    {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            log_warn!(self.shared.logger, "event queue already running");
            return Ok(());
        }

        self.reap_detached();
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = Arc::clone(&self.shared);
        let callback: EventCallback = Box::new(callback);
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || event_loop(shared, generation, callback));

        match spawned {
            Ok(handle) => {
                if let Ok(mut slot) = self.thread.lock() {
                    *slot = Some(handle);
                }
                Ok(())
            }
            Err(e) => {
                self.shared.generation.fetch_add(1, Ordering::AcqRel);
                self.shared.running.store(false, Ordering::Release);
                Err(SetupError::Thread(e.to_string()))
            }
        }
    }

    /// Stop and join the loop thread. No-op when not running.
    ///
    /// Called from the loop thread itself (e.g. a completion handler drops
    /// the last owner) the thread is detached instead of joined; it exits
    /// once the current dispatch returns, even if `start()` runs again first.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.wake_up();

        let handle = self.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                log_debug!(self.shared.logger, "event queue stopped from its own thread, detaching");
                if let Ok(mut detached) = self.detached.lock() {
                    detached.push(handle);
                }
                return;
            }
            if handle.join().is_err() {
                log_error!(self.shared.logger, "event loop thread panicked");
            }
        }
    }

    /// Interrupt the current wait. Safe from any thread.
    pub fn wake_up(&self) {
        let byte = 1u8;
        let n = unsafe {
            libc::write(self.shared.wake_tx.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1)
        };
        // A full pipe already guarantees a wake.
        if n < 0 && !matches!(Errno::last(), Errno::EAGAIN | Errno::EINTR) {
            log_warn!(self.shared.logger, "wake_up: {}", Error::from_errno("write(wake pipe)"));
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // Join detached loops that have already exited.
    fn reap_detached(&self) {
        let Ok(mut detached) = self.detached.lock() else {
            return;
        };
        let mut i = 0;
        while i < detached.len() {
            if detached[i].is_finished() {
                let _ = detached.swap_remove(i).join();
            } else {
                i += 1;
            }
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.stop();
        let handles = match self.detached.lock() {
            Ok(mut detached) => std::mem::take(&mut *detached),
            Err(_) => Vec::new(),
        };
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

fn event_loop(shared: Arc<Shared>, generation: u64, mut callback: EventCallback) {
    let wake_fd = shared.wake_rx.as_raw_fd();
    let mut ready = Vec::with_capacity(shared.max_events);
    log_debug!(shared.logger, "event loop started (run {})", generation);

    while shared.is_current(generation) {
        ready.clear();
        shared.take_carried(&mut ready);
        if ready.is_empty() {
            if let Err(e) = shared.poller.wait(&mut ready, shared.max_events, shared.timeout) {
                log_error!(shared.logger, "readiness wait failed: {}", e);
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        }

        let mut batch = ready.drain(..);
        while let Some(ev) = batch.next() {
            if ev.fd == wake_fd {
                shared.drain_wake();
                continue;
            }
            if !shared.is_current(generation) {
                shared.carry_over(std::iter::once(ev).chain(batch.by_ref()));
                break;
            }
            callback(ev.fd, ev.filter, ev.user_data);
        }
    }

    log_debug!(shared.logger, "event loop exited");
}

/// Non-blocking, close-on-exec. Returns the errno on failure.
fn set_pipe_flags(fd: RawFd) -> Result<(), i32> {
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(Errno::last_raw());
        }
        let fd_fl = libc::fcntl(fd, libc::F_GETFD);
        if fd_fl < 0 || libc::fcntl(fd, libc::F_SETFD, fd_fl | libc::FD_CLOEXEC) < 0 {
            return Err(Errno::last_raw());
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proactor_core::NullSink;
    use std::sync::mpsc;

    fn queue() -> EventQueue {
        let config = ProactorConfig::new().poll_timeout(Duration::from_millis(50));
        EventQueue::new(&config, NullSink::logger()).unwrap()
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        set_pipe_flags(r.as_raw_fd()).unwrap();
        set_pipe_flags(w.as_raw_fd()).unwrap();
        (r, w)
    }

    fn write_byte(fd: &OwnedFd) {
        let b = 7u8;
        let n = unsafe { libc::write(fd.as_raw_fd(), &b as *const u8 as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let q = queue();
        q.stop();
        q.start(|_, _, _| {}).unwrap();
        assert!(q.is_running());
        q.start(|_, _, _| {}).unwrap();
        q.stop();
        assert!(!q.is_running());
        q.stop();
    }

    #[test]
    fn test_read_readiness_delivered() {
        let q = queue();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();
        q.start(move |fd, filter, data| {
            let _ = tx.send((fd, filter, data));
        })
        .unwrap();

        q.register_for_read(r.as_raw_fd(), 42).unwrap();
        write_byte(&w);

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, (r.as_raw_fd(), Filter::Read, 42));
        q.stop();
    }

    #[test]
    fn test_write_readiness_and_unregister() {
        let q = queue();
        let (_r, w) = pipe();
        let (tx, rx) = mpsc::channel();
        q.start(move |fd, filter, data| {
            let _ = tx.send((fd, filter, data));
        })
        .unwrap();

        // An empty pipe is immediately writable
        q.register_for_write(w.as_raw_fd(), 9).unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, (w.as_raw_fd(), Filter::Write, 9));

        q.unregister_for_write(w.as_raw_fd()).unwrap();
        q.unregister_for_write(w.as_raw_fd()).unwrap();
        q.unregister_for_read(w.as_raw_fd()).unwrap();
        q.stop();
    }

    #[test]
    fn test_unregistered_fd_is_silent() {
        let q = queue();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();
        q.start(move |fd, _, _| {
            let _ = tx.send(fd);
        })
        .unwrap();

        q.register_for_read(r.as_raw_fd(), 1).unwrap();
        q.unregister_for_read(r.as_raw_fd()).unwrap();
        write_byte(&w);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        q.stop();
    }

    #[test]
    fn test_wake_pipe_not_forwarded() {
        let q = queue();
        let (tx, rx) = mpsc::channel();
        q.start(move |fd, _, _| {
            let _ = tx.send(fd);
        })
        .unwrap();
        for _ in 0..10 {
            q.wake_up();
        }
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(q.register_for_read(q.shared.wake_rx.as_raw_fd(), 3).is_err());
        q.stop();
    }

    #[test]
    fn test_stop_from_loop_thread() {
        let q = Arc::new(queue());
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();
        let q2 = Arc::clone(&q);
        q.start(move |_, _, _| {
            q2.stop();
            let _ = tx.send(());
        })
        .unwrap();

        q.register_for_read(r.as_raw_fd(), 5).unwrap();
        write_byte(&w);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!q.is_running());
    }

    #[test]
    fn test_restart_while_detached_loop_still_dispatching() {
        let q = Arc::new(queue());
        let (r, w) = pipe();
        let (stopped_tx, stopped_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let old_calls = Arc::new(AtomicU64::new(0));

        let q2 = Arc::clone(&q);
        let calls = Arc::clone(&old_calls);
        q.start(move |_, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            q2.stop();
            let _ = stopped_tx.send(());
            // Hold the old loop inside its callback across the restart
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();

        q.register_for_read(r.as_raw_fd(), 5).unwrap();
        write_byte(&w);
        stopped_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let (tx, rx) = mpsc::channel();
        q.start(move |fd, filter, data| {
            let _ = tx.send((fd, filter, data));
        })
        .unwrap();
        gate_tx.send(()).unwrap();

        // The detached loop must exit even though the queue runs again
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let finished = q.detached.lock().unwrap().iter().all(|h| h.is_finished());
            if finished {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "old loop still running");
            thread::sleep(Duration::from_millis(5));
        }

        write_byte(&w);
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, (r.as_raw_fd(), Filter::Read, 5));
        assert_eq!(old_calls.load(Ordering::SeqCst), 1);
        assert!(q.is_running());
        q.stop();
    }

    #[test]
    fn test_batch_cut_by_stop_is_carried_to_next_run() {
        let q = Arc::new(queue());
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        q.register_for_read(r1.as_raw_fd(), 1).unwrap();
        q.register_for_read(r2.as_raw_fd(), 2).unwrap();
        // Both ready before the loop exists, so the first wait harvests both
        write_byte(&w1);
        write_byte(&w2);

        let (first_tx, first_rx) = mpsc::channel();
        let q2 = Arc::clone(&q);
        q.start(move |_, _, data| {
            q2.stop();
            let _ = first_tx.send(data);
        })
        .unwrap();
        let first = first_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first_rx.recv_timeout(Duration::from_millis(100)).is_err());

        let (tx, rx) = mpsc::channel();
        q.start(move |_, _, data| {
            let _ = tx.send(data);
        })
        .unwrap();

        // No new edge: the second event can only come from the carried batch
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first + second, 3);
        q.stop();
    }

    #[test]
    fn test_register_invalid_fd() {
        let q = queue();
        assert_eq!(q.register_for_read(-1, 0).unwrap_err().code(), libc::EBADF);
        q.unregister_for_read(-1).unwrap();
    }
}
