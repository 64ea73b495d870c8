//! # Socket - owned IPv4 TCP descriptor
//!
//! A `Socket` owns exactly one OS descriptor and closes it on drop. It is
//! move-only; `-1` is the invalid sentinel.
//!
//! All operational calls return `Result<_, Error>`. "Nothing to do right
//! now" is never an error: `accept` yields `Ok(None)` and `read`/`write`
//! yield [`Transfer::WouldBlock`].
//!
//! Writes never raise `SIGPIPE` (`MSG_NOSIGNAL` on Linux, `SO_NOSIGPIPE` on
//! Apple platforms).

use std::mem::{self, ManuallyDrop};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::errno::Errno;
use proactor_core::{Error, SetupError};

/// Outcome of one non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// The kernel had nothing for us; wait for readiness.
    WouldBlock,
    /// Orderly shutdown by the peer (reads only).
    Eof,
    /// This many bytes moved.
    Bytes(usize),
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        const SEND_FLAGS: libc::c_int = 0;
    }
}

const INVALID_FD: RawFd = -1;

#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// New IPv4 stream socket, close-on-exec.
    pub fn create_tcp() -> Result<Socket, SetupError> {
        let fd = unsafe { libc::socket(libc::AF_INET, stream_type(), 0) };
        if fd < 0 {
            return Err(SetupError::Socket(Errno::last_raw()));
        }
        let sock = Socket { fd };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        set_cloexec(fd).map_err(|e| SetupError::Socket(e.code()))?;
        sock.suppress_sigpipe()
            .map_err(|e| SetupError::Socket(e.code()))?;
        Ok(sock)
    }

    pub const fn invalid() -> Socket {
        Socket { fd: INVALID_FD }
    }

    /// Take ownership of `fd`. It is closed when the socket drops.
    pub fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd }
    }

    /// Non-owning view of `fd` for issuing calls on a descriptor owned
    /// elsewhere. Never closes it.
    pub(crate) fn borrow_raw(fd: RawFd) -> ManuallyDrop<Socket> {
        ManuallyDrop::new(Socket { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Close now. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = INVALID_FD;
        }
    }

    pub fn set_non_blocking(&self) -> Result<(), Error> {
        self.ensure_valid("fcntl")?;
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::from_errno("fcntl(F_GETFL)"));
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::from_errno("fcntl(F_SETFL)"));
        }
        Ok(())
    }

    pub fn set_reuse_address(&self) -> Result<(), Error> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1, "setsockopt(SO_REUSEADDR)")
    }

    pub fn set_no_delay(&self) -> Result<(), Error> {
        self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1, "setsockopt(TCP_NODELAY)")
    }

    pub fn bind(&self, host: &str, port: u16) -> Result<(), Error> {
        self.ensure_valid("bind")?;
        let addr = sockaddr_v4(parse_host(host)?, port);
        let ret = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&addr) as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Error::from_errno("bind"));
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        self.ensure_valid("listen")?;
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(Error::from_errno("listen"));
        }
        Ok(())
    }

    /// Accept one pending connection. `Ok(None)` when none is pending.
    ///
    /// The returned socket is close-on-exec but still blocking.
    pub fn accept(&self) -> Result<Option<Socket>, Error> {
        self.ensure_valid("accept")?;
        loop {
            let fd = accept_raw(self.fd);
            if fd >= 0 {
                let sock = Socket { fd };
                #[cfg(not(any(target_os = "linux", target_os = "android")))]
                set_cloexec(fd)?;
                sock.suppress_sigpipe()?;
                return Ok(Some(sock));
            }
            match Errno::last_raw() {
                libc::EINTR => continue,
                e if is_would_block(e) || e == libc::ECONNABORTED => return Ok(None),
                e => return Err(Error::from_code(e, "accept")),
            }
        }
    }

    /// Start connecting. A connection still in progress counts as success;
    /// completion is observed through write readiness.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), Error> {
        self.ensure_valid("connect")?;
        let addr = sockaddr_v4(parse_host(host)?, port);
        let ret = unsafe {
            libc::connect(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&addr) as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        match Errno::last_raw() {
            libc::EINPROGRESS | libc::EINTR | libc::EISCONN => Ok(()),
            e => Err(Error::from_code(e, "connect")),
        }
    }

    /// One read into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<Transfer, Error> {
        self.ensure_valid("read")?;
        if buf.is_empty() {
            return Ok(Transfer::Bytes(0));
        }
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                return Ok(Transfer::Bytes(n as usize));
            }
            if n == 0 {
                return Ok(Transfer::Eof);
            }
            match Errno::last_raw() {
                libc::EINTR => continue,
                e if is_would_block(e) => return Ok(Transfer::WouldBlock),
                e => return Err(Error::from_code(e, "read")),
            }
        }
    }

    /// One write from `buf`. Never yields `Eof`.
    pub fn write(&self, buf: &[u8]) -> Result<Transfer, Error> {
        self.ensure_valid("write")?;
        loop {
            let n = unsafe {
                libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS)
            };
            if n >= 0 {
                return Ok(Transfer::Bytes(n as usize));
            }
            match Errno::last_raw() {
                libc::EINTR => continue,
                e if is_would_block(e) => return Ok(Transfer::WouldBlock),
                e => return Err(Error::from_code(e, "write")),
            }
        }
    }

    /// Pending `SO_ERROR`, cleared by the read.
    pub fn take_error(&self) -> Result<(), Error> {
        match self.get_option(libc::SOL_SOCKET, libc::SO_ERROR, "getsockopt(SO_ERROR)")? {
            0 => Ok(()),
            code => Err(Error::from_code(code, "socket error")),
        }
    }

    /// Zero-byte peek. Catches a descriptor that is not a usable socket
    /// without consuming data.
    pub fn peek_probe(&self) -> Result<(), Error> {
        self.ensure_valid("recv")?;
        let mut byte = [0u8; 1];
        let n = unsafe {
            libc::recv(
                self.fd,
                byte.as_mut_ptr() as *mut libc::c_void,
                0,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let e = Errno::last_raw();
            if !is_would_block(e) && e != libc::EINTR {
                return Err(Error::from_code(e, "recv(MSG_PEEK)"));
            }
        }
        Ok(())
    }

    /// Zero-byte write. Fails on a socket that never got connected.
    pub fn write_probe(&self) -> Result<(), Error> {
        self.ensure_valid("write")?;
        let byte = [0u8; 1];
        let n = unsafe {
            libc::send(self.fd, byte.as_ptr() as *const libc::c_void, 0, SEND_FLAGS)
        };
        if n < 0 {
            let e = Errno::last_raw();
            if !is_would_block(e) && e != libc::EINTR {
                return Err(Error::from_code(e, "write probe"));
            }
        }
        Ok(())
    }

    /// Port this socket is bound to.
    pub fn local_port(&self) -> Result<u16, Error> {
        self.ensure_valid("getsockname")?;
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(Error::from_errno("getsockname"));
        }
        Ok(u16::from_be(addr.sin_port))
    }

    /// `SO_TYPE`, e.g. `libc::SOCK_STREAM`.
    pub fn socket_type(&self) -> Result<i32, Error> {
        self.get_option(libc::SOL_SOCKET, libc::SO_TYPE, "getsockopt(SO_TYPE)")
    }

    // ── helpers ──

    fn ensure_valid(&self, op: &str) -> Result<(), Error> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::from_code(libc::EBADF, op))
        }
    }

    fn set_option(&self, level: i32, name: i32, value: i32, ctx: &str) -> Result<(), Error> {
        self.ensure_valid(ctx)?;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Error::from_errno(ctx));
        }
        Ok(())
    }

    fn get_option(&self, level: i32, name: i32, ctx: &str) -> Result<i32, Error> {
        self.ensure_valid(ctx)?;
        let mut value: i32 = 0;
        let mut len = mem::size_of::<i32>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                level,
                name,
                &mut value as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(Error::from_errno(ctx));
        }
        Ok(value)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn suppress_sigpipe(&self) -> Result<(), Error> {
        self.set_option(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1, "setsockopt(SO_NOSIGPIPE)")
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn suppress_sigpipe(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for Socket {
    fn default() -> Self {
        Socket::invalid()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(mut self) -> RawFd {
        mem::replace(&mut self.fd, INVALID_FD)
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Socket { fd }
    }
}

/// IPv4 dotted quad, `"localhost"`, or empty for any address.
pub fn parse_host(host: &str) -> Result<Ipv4Addr, Error> {
    match host {
        "" => Ok(Ipv4Addr::UNSPECIFIED),
        "localhost" => Ok(Ipv4Addr::LOCALHOST),
        _ => host
            .parse()
            .map_err(|_| Error::from_code(libc::EINVAL, &format!("invalid IPv4 address '{}'", host))),
    }
}

#[inline]
fn is_would_block(e: i32) -> bool {
    e == libc::EAGAIN || e == libc::EWOULDBLOCK
}

fn sockaddr_v4(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(ip).to_be(),
    };
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    {
        addr.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    addr
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn stream_type() -> libc::c_int {
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC
        }

        fn accept_raw(fd: RawFd) -> RawFd {
            unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC) }
        }
    } else {
        fn stream_type() -> libc::c_int {
            libc::SOCK_STREAM
        }

        fn accept_raw(fd: RawFd) -> RawFd {
            unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) }
        }

        fn set_cloexec(fd: RawFd) -> Result<(), Error> {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
                return Err(Error::from_errno("fcntl(FD_CLOEXEC)"));
            }
            Ok(())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn listener() -> (Socket, u16) {
        let sock = Socket::create_tcp().unwrap();
        sock.set_reuse_address().unwrap();
        sock.bind("127.0.0.1", 0).unwrap();
        sock.listen(16).unwrap();
        let port = sock.local_port().unwrap();
        (sock, port)
    }

    fn accept_within(listener: &Socket, limit: Duration) -> Socket {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(s) = listener.accept().unwrap() {
                return s;
            }
            assert!(Instant::now() < deadline, "accept timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_invalid_socket() {
        let mut s = Socket::invalid();
        assert!(!s.is_valid());
        assert_eq!(s.fd(), -1);
        assert_eq!(s.read(&mut [0u8; 4]).unwrap_err().code(), libc::EBADF);
        s.close();
        s.close();
    }

    #[test]
    fn test_parse_host() {
        assert_eq!(parse_host("localhost").unwrap(), Ipv4Addr::LOCALHOST);
        assert_eq!(parse_host("10.1.2.3").unwrap(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(parse_host("").unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(parse_host("example.com").unwrap_err().code(), libc::EINVAL);
    }

    #[test]
    fn test_accept_nothing_pending() {
        let (l, _) = listener();
        l.set_non_blocking().unwrap();
        assert!(l.accept().unwrap().is_none());
        assert_eq!(l.socket_type().unwrap(), libc::SOCK_STREAM);
    }

    #[test]
    fn test_connect_read_write() {
        let (l, port) = listener();
        l.set_non_blocking().unwrap();

        let client = Socket::create_tcp().unwrap();
        client.set_non_blocking().unwrap();
        client.connect("localhost", port).unwrap();

        let server = accept_within(&l, Duration::from_secs(2));
        server.set_non_blocking().unwrap();

        // Connection may still be settling on the client side
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match client.write(b"ping").unwrap() {
                Transfer::Bytes(4) => break,
                _ => assert!(Instant::now() < deadline),
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        client.take_error().unwrap();
        client.write_probe().unwrap();

        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        let n = loop {
            match server.read(&mut buf).unwrap() {
                Transfer::Bytes(n) => break n,
                Transfer::WouldBlock => assert!(Instant::now() < deadline),
                Transfer::Eof => panic!("unexpected eof"),
            }
            std::thread::sleep(Duration::from_millis(2));
        };
        assert_eq!(&buf[..n], b"ping");

        // Nothing more queued
        assert_eq!(server.read(&mut buf).unwrap(), Transfer::WouldBlock);
        server.peek_probe().unwrap();

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server.read(&mut buf).unwrap() {
                Transfer::Eof => break,
                _ => assert!(Instant::now() < deadline),
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_into_raw_fd_releases_ownership() {
        let s = Socket::create_tcp().unwrap();
        let fd = s.into_raw_fd();
        assert!(fd >= 0);
        let s = Socket::from_raw_fd(fd);
        assert_eq!(s.fd(), fd);
    }
}
