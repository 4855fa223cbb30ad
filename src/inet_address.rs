//! Address representation (spec.md §6), grounded on
//! `original_source/src/net/{include,src}/InetAddress.{h,cc}`.
//!
//! The original hand-rolls a `sockaddr_in`/`sockaddr_in6` union; in Rust
//! `std::net::SocketAddr` already is that union, with safe accessors, so we
//! wrap it rather than re-deriving its layout.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddress {
    addr: SocketAddr,
}

impl InetAddress {
    /// Wildcard (`0.0.0.0`/`::`) or loopback bind address on `port`.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> InetAddress {
        let ip = match (loopback_only, ipv6) {
            (true, true) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            (false, true) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            (true, false) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (false, false) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        InetAddress { addr: SocketAddr::new(ip, port) }
    }

    /// Explicit numeric IP + port, e.g. for connect addresses.
    pub fn with_ip_port(ip: &str, port: u16, ipv6: bool) -> io::Result<InetAddress> {
        let parsed: IpAddr = ip
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid numeric IP"))?;
        match (&parsed, ipv6) {
            (IpAddr::V4(_), true) | (IpAddr::V6(_), false) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "IP family does not match requested ipv6 flag",
                ));
            }
            _ => {}
        }
        Ok(InetAddress { addr: SocketAddr::new(parsed, port) })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> InetAddress {
        InetAddress { addr }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn family(&self) -> libc::sa_family_t {
        match self.addr {
            SocketAddr::V4(_) => libc::AF_INET as libc::sa_family_t,
            SocketAddr::V6(_) => libc::AF_INET6 as libc::sa_family_t,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn to_ip(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Bracketed for IPv6, per spec.md §8 scenario 6:
    /// `InetAddress("2001:db8::1", 8888, ipv6=true).toIpPort()` => `"[2001:db8::1]:8888"`.
    pub fn to_ip_port(&self) -> String {
        match self.addr {
            SocketAddr::V4(a) => format!("{}:{}", a.ip(), a.port()),
            SocketAddr::V6(a) => format!("[{}]:{}", a.ip(), a.port()),
        }
    }

    pub fn set_scope_id(&mut self, scope_id: u32) {
        if let SocketAddr::V6(a) = &mut self.addr {
            *a = std::net::SocketAddrV6::new(*a.ip(), a.port(), a.flowinfo(), scope_id);
        }
    }

    /// Blocking reentrant hostname resolution via `getaddrinfo(3)` — the
    /// modern replacement for the `gethostbyname_r` the original used;
    /// see SPEC_FULL.md §4.12 and DESIGN.md.
    pub fn resolve(hostname: &str, port: u16) -> io::Result<InetAddress> {
        let c_host = CString::new(hostname)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "hostname contains NUL"))?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut result: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut result)
        };
        if rc != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("getaddrinfo({hostname}) failed: {}", gai_strerror(rc)),
            ));
        }

        struct Guard(*mut libc::addrinfo);
        impl Drop for Guard {
            fn drop(&mut self) {
                unsafe { libc::freeaddrinfo(self.0) };
            }
        }
        let guard = Guard(result);

        let mut node = guard.0;
        while !node.is_null() {
            let info = unsafe { &*node };
            let addr = match info.ai_family {
                f if f == libc::AF_INET => unsafe {
                    let sin = &*(info.ai_addr as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr as u32));
                    Some(SocketAddr::new(IpAddr::V4(ip), port))
                },
                f if f == libc::AF_INET6 => unsafe {
                    let sin6 = &*(info.ai_addr as *const libc::sockaddr_in6);
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    Some(SocketAddr::new(IpAddr::V6(ip), port))
                },
                _ => None,
            };
            if let Some(addr) = addr {
                return Ok(InetAddress { addr });
            }
            node = info.ai_next;
        }

        Err(io::Error::new(io::ErrorKind::Other, format!("no address found for {hostname}")))
    }
}

fn gai_strerror(code: i32) -> String {
    unsafe {
        let ptr = libc::gai_strerror(code);
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(addr: SocketAddr) -> InetAddress {
        InetAddress::from_socket_addr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_round_trip_brackets_address() {
        let addr = InetAddress::with_ip_port("2001:db8::1", 8888, true).unwrap();
        assert_eq!(addr.to_ip_port(), "[2001:db8::1]:8888");
    }

    #[test]
    fn ipv4_round_trip_has_no_brackets() {
        let addr = InetAddress::with_ip_port("127.0.0.1", 9000, false).unwrap();
        assert_eq!(addr.to_ip_port(), "127.0.0.1:9000");
        assert_eq!(addr.to_ip(), "127.0.0.1");
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn wildcard_bind_address_is_unspecified() {
        let addr = InetAddress::new(0, false, false);
        assert_eq!(addr.to_ip(), "0.0.0.0");
    }

    #[test]
    fn mismatched_family_is_rejected() {
        assert!(InetAddress::with_ip_port("127.0.0.1", 80, true).is_err());
    }
}
