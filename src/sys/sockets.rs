//! Free functions + a `Socket` RAII wrapper for the non-blocking TCP
//! operations `Acceptor`/`Connector`/`TcpConnection` build on. Grounded on
//! the teacher's `src/sys/socket.rs` (`Socket::new`/`accept`/`set_nodelay`/
//! `take_error`) and `original_source/src/net/src/Socket.cc` +
//! `SocketsOps.cc` for the call shape (`bindAddress`/`listen`/`accept`/
//! `shutdownWrite`/`setTcpNoDelay`/`setReuseAddr`/`setReusePort`/
//! `setKeepAlive`/`getSocketError`/`isSelfConnect`).

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;
use super::syscall;
use crate::inet_address::InetAddress;

pub struct Socket {
    fd: FileDesc,
}

impl Socket {
    /// A non-blocking, close-on-exec `SOCK_STREAM` socket in `addr`'s family.
    pub fn new_stream(addr: &InetAddress) -> io::Result<Socket> {
        let family = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
        let raw = match syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0
        )) {
            Ok(fd) => fd,
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
                let fd = unsafe { FileDesc::new(fd) };
                fd.set_cloexec()?;
                fd.set_nonblocking(true)?;
                return Ok(Socket { fd });
            }
            Err(e) => return Err(e),
        };
        Ok(Socket { fd: unsafe { FileDesc::new(raw) } })
    }

    /// Wraps an already-open, already-configured fd (e.g. from `accept4`).
    pub fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd: unsafe { FileDesc::new(fd) } }
    }

    pub fn bind(&self, addr: &InetAddress) -> io::Result<()> {
        let (ptr, len) = sockaddr_ptr(&addr.socket_addr());
        syscall!(bind(self.fd.raw(), ptr, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.fd.raw(), backlog))?;
        Ok(())
    }

    /// `accept4` with `SOCK_NONBLOCK | SOCK_CLOEXEC`, returning the peer
    /// socket and address. `WouldBlock` propagates for the caller to ignore.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;
        let raw = syscall!(accept4(
            self.fd.raw(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;
        let addr = storage_to_addr(&storage)?;
        Ok((Socket { fd: unsafe { FileDesc::new(raw) } }, addr))
    }

    pub fn connect(&self, addr: &InetAddress) -> io::Result<()> {
        let (ptr, len) = sockaddr_ptr(&addr.socket_addr());
        syscall!(connect(self.fd.raw(), ptr, len))?;
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;
        syscall!(getsockname(self.fd.raw(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        storage_to_addr(&storage)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;
        syscall!(getpeername(self.fd.raw(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        storage_to_addr(&storage)
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd.raw(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.fd.raw(), how))?;
        Ok(())
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd.raw(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd.raw(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
    }

    /// `SO_REUSEPORT`; a no-op `Ok(())` on platforms lacking it, matching the
    /// original's `#ifdef SO_REUSEPORT` guard.
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            setsockopt(self.fd.raw(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = on;
            Ok(())
        }
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd.raw(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as i32)
    }

    /// `SO_ERROR`: the pending async error, if any, cleared by the read.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: i32 = getsockopt(self.fd.raw(), libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn fd(&self) -> &FileDesc {
        &self.fd
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// True when a non-blocking `connect()` raced itself into a connection whose
/// local and peer endpoints are identical — `Connector::retry`'s
/// `isSelfConnect` check.
pub fn is_self_connect(local: &SocketAddr, peer: &SocketAddr) -> bool {
    local == peer
}

fn setsockopt(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<i32>() as libc::socklen_t
    ))?;
    Ok(())
}

fn getsockopt(fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = mem::size_of::<i32>() as libc::socklen_t;
    syscall!(getsockopt(fd, level, name, &mut value as *mut _ as *mut libc::c_void, &mut len))?;
    Ok(value)
}

fn sockaddr_ptr(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => (a as *const _ as *const libc::sockaddr, mem::size_of_val(a) as libc::socklen_t),
        SocketAddr::V6(a) => (a as *const _ as *const libc::sockaddr, mem::size_of_val(a) as libc::socklen_t),
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr as u32));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::new(std::net::IpAddr::V4(ip), port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::new(std::net::IpAddr::V6(ip), port))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}
