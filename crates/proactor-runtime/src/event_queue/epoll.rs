//! epoll backend (Linux, Android)
//!
//! epoll keeps one registration per descriptor, so read and write interest
//! are merged here: the interest map records which filters are live for each
//! fd (and their user data) and every change is an ADD, MOD or DEL of the
//! combined mask. The kernel only carries the fd; user data is looked up in
//! the map when an event is harvested.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use proactor_core::{Error, SetupError};

use super::{Filter, Poller, Ready};

#[derive(Debug, Default, Clone, Copy)]
struct Interest {
    read: Option<u64>,
    write: Option<u64>,
}

impl Interest {
    fn set(&mut self, filter: Filter, user_data: Option<u64>) {
        match filter {
            Filter::Read => self.read = user_data,
            Filter::Write => self.write = user_data,
        }
    }

    fn get(&self, filter: Filter) -> Option<u64> {
        match filter {
            Filter::Read => self.read,
            Filter::Write => self.write,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn mask(&self) -> u32 {
        let mut events = libc::EPOLLET as u32;
        if self.read.is_some() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

pub struct EpollPoller {
    epfd: RawFd,
    interest: Mutex<HashMap<RawFd, Interest>>,
}

impl EpollPoller {
    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<(), i32> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(Errno::last_raw());
        }
        Ok(())
    }

    // ADD/MOD with fallback: the kernel drops a registration when the fd is
    // closed, and a recycled fd may still be live in the kernel but not in
    // the map.
    fn apply(&self, fd: RawFd, known: bool, events: u32) -> Result<(), Error> {
        let (first, second) = if known {
            (libc::EPOLL_CTL_MOD, libc::EPOLL_CTL_ADD)
        } else {
            (libc::EPOLL_CTL_ADD, libc::EPOLL_CTL_MOD)
        };
        match self.ctl(first, fd, events) {
            Ok(()) => Ok(()),
            Err(libc::ENOENT) | Err(libc::EEXIST) => self
                .ctl(second, fd, events)
                .map_err(|e| Error::from_code(e, "epoll_ctl")),
            Err(e) => Err(Error::from_code(e, "epoll_ctl")),
        }
    }
}

impl Poller for EpollPoller {
    fn new() -> Result<Self, SetupError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SetupError::Poller(Errno::last_raw()));
        }
        Ok(Self {
            epfd,
            interest: Mutex::new(HashMap::new()),
        })
    }

    fn watch(&self, fd: RawFd, filter: Filter, user_data: u64) -> Result<(), Error> {
        let mut map = self
            .interest
            .lock()
            .map_err(|_| Error::other("epoll interest map poisoned"))?;
        let known = map.get(&fd).copied();
        let mut next = known.unwrap_or_default();
        next.set(filter, Some(user_data));

        self.apply(fd, known.is_some(), next.mask())?;
        map.insert(fd, next);
        Ok(())
    }

    fn unwatch(&self, fd: RawFd, filter: Filter) -> Result<(), Error> {
        let mut map = self
            .interest
            .lock()
            .map_err(|_| Error::other("epoll interest map poisoned"))?;
        let Some(mut current) = map.get(&fd).copied() else {
            return Ok(());
        };
        if current.get(filter).is_none() {
            return Ok(());
        }
        current.set(filter, None);

        if current.is_empty() {
            map.remove(&fd);
            match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                // Already gone with a closed fd
                Ok(()) | Err(libc::ENOENT) | Err(libc::EBADF) => Ok(()),
                Err(e) => Err(Error::from_code(e, "epoll_ctl(DEL)")),
            }
        } else {
            map.insert(fd, current);
            match self.ctl(libc::EPOLL_CTL_MOD, fd, current.mask()) {
                Ok(()) | Err(libc::ENOENT) | Err(libc::EBADF) => Ok(()),
                Err(e) => Err(Error::from_code(e, "epoll_ctl(MOD)")),
            }
        }
    }

    fn wait(&self, out: &mut Vec<Ready>, max: usize, timeout: Duration) -> Result<(), Error> {
        let max = max.max(1);
        let mut events: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; max];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), max as i32, timeout_ms) };
        if n < 0 {
            return match Errno::last_raw() {
                libc::EINTR => Ok(()),
                e => Err(Error::from_code(e, "epoll_wait")),
            };
        }

        let map = self
            .interest
            .lock()
            .map_err(|_| Error::other("epoll interest map poisoned"))?;
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let flags = ev.events;
            let Some(interest) = map.get(&fd) else {
                continue;
            };
            let failed = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            let readable = failed || flags & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0;
            let writable = failed || flags & libc::EPOLLOUT as u32 != 0;

            if readable {
                if let Some(user_data) = interest.read {
                    out.push(Ready { fd, filter: Filter::Read, user_data });
                }
            }
            if writable {
                if let Some(user_data) = interest.write {
                    out.push(Ready { fd, filter: Filter::Write, user_data });
                }
            }
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_read_and_write_coexist() {
        let p = EpollPoller::new().unwrap();
        // Same fd watched for both filters
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        p.watch(fd, Filter::Read, 1).unwrap();
        p.watch(fd, Filter::Write, 2).unwrap();

        let mut out = Vec::new();
        p.wait(&mut out, 8, Duration::from_millis(100)).unwrap();
        assert_eq!(out, vec![Ready { fd, filter: Filter::Write, user_data: 2 }]);

        p.unwatch(fd, Filter::Write).unwrap();
        p.unwatch(fd, Filter::Write).unwrap();
        p.unwatch(fd, Filter::Read).unwrap();
        assert!(p.interest.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unwatch_unknown_is_noop() {
        let p = EpollPoller::new().unwrap();
        p.unwatch(12345, Filter::Read).unwrap();
    }

    #[test]
    fn test_rewatch_replaces_user_data() {
        let p = EpollPoller::new().unwrap();
        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        p.watch(fd, Filter::Read, 1).unwrap();
        p.watch(fd, Filter::Read, 7).unwrap();

        std::io::Write::write_all(&mut b, b"x").unwrap();
        let mut out = Vec::new();
        p.wait(&mut out, 8, Duration::from_millis(500)).unwrap();
        assert_eq!(out, vec![Ready { fd, filter: Filter::Read, user_data: 7 }]);
    }
}
