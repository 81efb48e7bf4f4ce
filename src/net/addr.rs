//! IPv4 socket addresses in the form the rest of the crate trades in.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use nix::sys::socket::SockaddrIn;

use crate::error::{Error, Result};

/// An IPv4 endpoint address. A thin wrapper so the crate converts between the
/// std and `nix` representations in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetAddress {
    addr: SocketAddrV4,
}

impl InetAddress {
    /// Bind-to-any address on `port`. Port 0 asks the kernel to pick one.
    pub fn any(port: u16) -> InetAddress {
        InetAddress {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        }
    }

    /// Loopback address on `port`.
    pub fn loopback(port: u16) -> InetAddress {
        InetAddress {
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        }
    }

    /// Parse a dotted-quad ip string with a port.
    pub fn from_ip_port(ip: &str, port: u16) -> Result<InetAddress> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::Addr(format!("{}:{}", ip, port)))?;
        Ok(InetAddress {
            addr: SocketAddrV4::new(ip, port),
        })
    }

    pub(crate) fn from_sockaddr(sa: &SockaddrIn) -> InetAddress {
        InetAddress {
            addr: SocketAddrV4::new(sa.ip(), sa.port()),
        }
    }

    pub(crate) fn to_sockaddr(&self) -> SockaddrIn {
        SockaddrIn::from(self.addr)
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The "ip:port" rendering used in connection names and logs.
    pub fn ip_port(&self) -> String {
        self.addr.to_string()
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

impl From<SocketAddrV4> for InetAddress {
    fn from(addr: SocketAddrV4) -> InetAddress {
        InetAddress { addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let addr = InetAddress::from_ip_port("127.0.0.1", 8000).unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(addr.port(), 8000);
        assert_eq!(addr.ip_port(), "127.0.0.1:8000");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(InetAddress::from_ip_port("not-an-ip", 80).is_err());
        assert!(InetAddress::from_ip_port("::1", 80).is_err());
    }

    #[test]
    fn test_sockaddr_round_trip() {
        let addr = InetAddress::from_ip_port("10.0.0.7", 4242).unwrap();
        let back = InetAddress::from_sockaddr(&addr.to_sockaddr());
        assert_eq!(addr, back);
    }
}
