//! Thin ownership wrapper over a TCP socket descriptor.
//!
//! Every syscall a listener or connection needs lives here; the callers above
//! never touch `nix::sys::socket` directly. Option toggles log failures rather
//! than propagate them, since a refused `SO_KEEPALIVE` is not worth tearing a
//! connection down over.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    accept4, bind, getpeername, getsockname, listen, setsockopt, shutdown, socket, sockopt,
    AddressFamily, Backlog, Shutdown, SockFlag, SockProtocol, SockType, SockaddrIn,
};
use tracing::error;

use crate::error::Result;
use crate::net::addr::InetAddress;

pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// A fresh nonblocking IPv4 stream socket, close-on-exec.
    pub fn new_nonblocking() -> Result<Socket> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::Tcp,
        )?;
        Ok(Socket { fd })
    }

    /// Adopt an already-connected descriptor, typically from accept.
    pub fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn bind_address(&self, addr: &InetAddress) -> Result<()> {
        bind(self.fd.as_raw_fd(), &addr.to_sockaddr())?;
        Ok(())
    }

    pub fn listen(&self) -> Result<()> {
        listen(&self.fd, Backlog::MAXCONN)?;
        Ok(())
    }

    /// Accept one pending connection; the new descriptor inherits neither
    /// blocking nor the exec bit. Returns the raw error so the caller can
    /// treat EAGAIN and EMFILE differently.
    pub fn accept(&self) -> nix::Result<(OwnedFd, InetAddress)> {
        let fd = accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let peer = getpeername::<SockaddrIn>(fd.as_raw_fd())?;
        Ok((fd, InetAddress::from_sockaddr(&peer)))
    }

    /// The locally bound address, which after binding port 0 carries the port
    /// the kernel actually chose.
    pub fn local_address(&self) -> Result<InetAddress> {
        Self::local_addr_of(self.fd())
    }

    pub fn local_addr_of(fd: RawFd) -> Result<InetAddress> {
        let local = getsockname::<SockaddrIn>(fd)?;
        Ok(InetAddress::from_sockaddr(&local))
    }

    /// Close the write half, letting queued inbound data still drain.
    pub fn shutdown_write(&self) {
        if let Err(e) = shutdown(self.fd(), Shutdown::Write) {
            error!(fd = self.fd(), error = %e, "shutdown(SHUT_WR) failed");
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = setsockopt(&self.fd, sockopt::TcpNoDelay, &on) {
            error!(fd = self.fd(), error = %e, "setting TCP_NODELAY failed");
        }
    }

    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = setsockopt(&self.fd, sockopt::ReuseAddr, &on) {
            error!(fd = self.fd(), error = %e, "setting SO_REUSEADDR failed");
        }
    }

    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = setsockopt(&self.fd, sockopt::ReusePort, &on) {
            error!(fd = self.fd(), error = %e, "setting SO_REUSEPORT failed");
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = setsockopt(&self.fd, sockopt::KeepAlive, &on) {
            error!(fd = self.fd(), error = %e, "setting SO_KEEPALIVE failed");
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_port_zero_resolves_real_port() {
        let socket = Socket::new_nonblocking().unwrap();
        socket.set_reuse_addr(true);
        socket.bind_address(&InetAddress::loopback(0)).unwrap();
        let bound = socket.local_address().unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(bound.ip(), std::net::Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_accept_on_idle_listener_is_eagain() {
        let socket = Socket::new_nonblocking().unwrap();
        socket.bind_address(&InetAddress::loopback(0)).unwrap();
        socket.listen().unwrap();
        assert_eq!(socket.accept().unwrap_err(), nix::errno::Errno::EAGAIN);
    }
}
