//! kqueue backend (macOS, iOS, FreeBSD, OpenBSD, DragonFly)
//!
//! kqueue already keys registrations by `(ident, filter)`, so read and
//! write interest are independent and the user data rides in `udata`.
//! `EV_CLEAR` gives edge-triggered delivery.

use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use proactor_core::{Error, SetupError};

use super::{Filter, Poller, Ready};

pub struct KqueuePoller {
    kq: RawFd,
}

fn kfilter(filter: Filter) -> i16 {
    match filter {
        Filter::Read => libc::EVFILT_READ,
        Filter::Write => libc::EVFILT_WRITE,
    }
}

impl KqueuePoller {
    fn change(&self, fd: RawFd, filter: Filter, flags: u16, user_data: u64) -> Result<(), i32> {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = kfilter(filter);
        ev.flags = flags;
        ev.udata = user_data as usize as *mut libc::c_void;

        let ret = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            return Err(Errno::last_raw());
        }
        Ok(())
    }
}

impl Poller for KqueuePoller {
    fn new() -> Result<Self, SetupError> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(SetupError::Poller(Errno::last_raw()));
        }
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Self { kq })
    }

    fn watch(&self, fd: RawFd, filter: Filter, user_data: u64) -> Result<(), Error> {
        self.change(fd, filter, libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR, user_data)
            .map_err(|e| Error::from_code(e, "kevent(EV_ADD)"))
    }

    fn unwatch(&self, fd: RawFd, filter: Filter) -> Result<(), Error> {
        match self.change(fd, filter, libc::EV_DELETE, 0) {
            // Never registered, or already dropped with a closed fd
            Ok(()) | Err(libc::ENOENT) | Err(libc::EBADF) => Ok(()),
            Err(e) => Err(Error::from_code(e, "kevent(EV_DELETE)")),
        }
    }

    fn wait(&self, out: &mut Vec<Ready>, max: usize, timeout: Duration) -> Result<(), Error> {
        let max = max.max(1);
        let mut events: Vec<libc::kevent> = vec![unsafe { mem::zeroed() }; max];
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        ts.tv_sec = timeout.as_secs() as _;
        ts.tv_nsec = timeout.subsec_nanos() as _;

        let n = unsafe {
            libc::kevent(self.kq, ptr::null(), 0, events.as_mut_ptr(), max as libc::c_int, &ts)
        };
        if n < 0 {
            return match Errno::last_raw() {
                libc::EINTR => Ok(()),
                e => Err(Error::from_code(e, "kevent")),
            };
        }

        for ev in &events[..n as usize] {
            let filter = match ev.filter {
                libc::EVFILT_READ => Filter::Read,
                libc::EVFILT_WRITE => Filter::Write,
                _ => continue,
            };
            // EV_ERROR and EV_EOF are delivered on the filter itself, so the
            // owning operation sees them through its normal read/write path.
            out.push(Ready {
                fd: ev.ident as RawFd,
                filter,
                user_data: ev.udata as usize as u64,
            });
        }
        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_read_and_write_independent() {
        let p = KqueuePoller::new().unwrap();
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
    }
}
