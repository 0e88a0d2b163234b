//! Thin fd-level socket layer.
//!
//! Everything that touches a raw descriptor funnels through here: socket
//! creation and options via socket2, raw reads/writes via libc with errno
//! reported as `nix::errno::Errno`. Writes use `MSG_NOSIGNAL` so a dead peer
//! surfaces as `EPIPE` instead of a signal.

use std::io;
use std::io::IoSliceMut;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};

use log::*;
use nix::errno::Errno;
use socket2::{Domain, Protocol, Type};

use crate::addr::Addr;

/// An owned non-blocking TCP socket. The descriptor closes on drop.
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Non-blocking, close-on-exec stream socket for the family of `addr`.
    pub fn new_stream(addr: &Addr) -> io::Result<Socket> {
        let domain = Domain::for_address(addr.socket_addr());
        let inner = socket2::Socket::new(domain, Type::STREAM.nonblocking(), Some(Protocol::TCP))?;
        Ok(Socket { inner })
    }

    fn from_socket2(inner: socket2::Socket) -> Socket {
        Socket { inner }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &Addr) -> io::Result<()> {
        if let Err(e) = self.inner.bind(&addr.to_sock_addr()) {
            error!("bind {}: {}", addr, e);
            return Err(e);
        }
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        if let Err(e) = self.inner.listen(libc::SOMAXCONN) {
            error!("listen: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Accept one pending connection; the peer socket comes back
    /// non-blocking.
    pub fn accept(&self) -> io::Result<(Socket, Addr)> {
        let (sock, sa) = self.inner.accept()?;
        sock.set_nonblocking(true)?;
        let peer = Addr::from_sock_addr(&sa)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((Socket::from_socket2(sock), peer))
    }

    /// Start a non-blocking connect. `Ok(())` means the connect completed
    /// immediately; otherwise the raw errno comes back for classification.
    pub fn connect(&self, addr: &Addr) -> Result<(), Errno> {
        match self.inner.connect(&addr.to_sock_addr()) {
            Ok(()) => Ok(()),
            Err(e) => Err(Errno::from_raw(e.raw_os_error().unwrap_or(0))),
        }
    }

    pub fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            error!("shutdown(WR): {}", e);
        }
    }

    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_address(on) {
            error!("SO_REUSEADDR: {}", e);
        }
    }

    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_port(on) {
            if on {
                error!("SO_REUSEPORT: {}", e);
            }
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = self.inner.set_keepalive(on) {
            error!("SO_KEEPALIVE: {}", e);
        }
    }

    pub fn set_no_delay(&self, on: bool) {
        if let Err(e) = self.inner.set_nodelay(on) {
            error!("TCP_NODELAY: {}", e);
        }
    }

    pub fn local_addr(&self) -> io::Result<Addr> {
        let sa = self.inner.local_addr()?;
        Addr::from_sock_addr(&sa)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    pub fn peer_addr(&self) -> io::Result<Addr> {
        let sa = self.inner.peer_addr()?;
        Addr::from_sock_addr(&sa)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
    }

    /// Pending `SO_ERROR`, 0 when clear.
    pub fn so_error(&self) -> i32 {
        match self.inner.take_error() {
            Ok(Some(e)) => e.raw_os_error().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => e.raw_os_error().unwrap_or(0),
        }
    }

    /// True when the kernel handed us a socket connected to itself, which a
    /// transient-port connect can produce.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(l), Ok(p)) => l == p,
            _ => false,
        }
    }
}

/// `send(2)` with `MSG_NOSIGNAL`.
pub fn write_fd(fd: RawFd, data: &[u8]) -> nix::Result<usize> {
    let n = unsafe {
        libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_NOSIGNAL)
    };
    Errno::result(n).map(|n| n as usize)
}

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    Errno::result(n).map(|n| n as usize)
}

/// Scattered `readv(2)`. `IoSliceMut` is ABI-compatible with iovec.
pub fn readv_fd(fd: RawFd, iov: &mut [IoSliceMut<'_>]) -> nix::Result<usize> {
    let n = unsafe { libc::readv(fd, iov.as_mut_ptr() as *mut libc::iovec, iov.len() as i32) };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn tid() -> i32 {
    unsafe { libc::gettid() }
}
