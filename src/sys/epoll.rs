//! Raw `epoll(7)` wrapper. The readiness-list `Poller` variant
//! (`src/poller/epoll.rs`) is the only caller; this module just owns the
//! epoll fd and translates to/from `libc::epoll_event`. Grounded on the
//! teacher's `src/sys/epoll.rs`, with the `Token`/`Ready`/`EpollOpt` mio-style
//! types dropped in favor of the fd-keyed interest bitmask `Channel` already
//! tracks (see SPEC_FULL.md §4.2/§4.3).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;
use super::syscall;

pub const EPOLLIN: i32 = libc::EPOLLIN;
pub const EPOLLPRI: i32 = libc::EPOLLPRI;
pub const EPOLLOUT: i32 = libc::EPOLLOUT;
pub const EPOLLRDHUP: i32 = libc::EPOLLRDHUP;
pub const EPOLLERR: i32 = libc::EPOLLERR;
pub const EPOLLHUP: i32 = libc::EPOLLHUP;

pub struct Epoll {
    fd: FileDesc,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let raw = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { fd: unsafe { FileDesc::new(raw) } })
    }

    pub fn add(&self, fd: RawFd, events: i32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: events as u32, u64: fd as u64 };
        syscall!(epoll_ctl(self.fd.raw(), libc::EPOLL_CTL_ADD, fd, &mut ev))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, events: i32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: events as u32, u64: fd as u64 };
        syscall!(epoll_ctl(self.fd.raw(), libc::EPOLL_CTL_MOD, fd, &mut ev))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.fd.raw(), libc::EPOLL_CTL_DEL, fd, &mut ev))?;
        Ok(())
    }

    /// Blocks until at least one fd is ready (or `timeout` elapses),
    /// filling `events` and returning the number of entries set.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let n = loop {
            match syscall!(epoll_wait(
                self.fd.raw(),
                events.buf.as_mut_ptr(),
                events.buf.capacity() as i32,
                timeout_ms
            )) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        unsafe { events.buf.set_len(n as usize) };
        Ok(n as usize)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub struct Events {
    buf: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events { buf: Vec::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// `(fd, revents)` for the entry at `idx`.
    pub fn get(&self, idx: usize) -> Option<(RawFd, i32)> {
        self.buf.get(idx).map(|e| (e.u64 as RawFd, e.events as i32))
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, i32)> + '_ {
        self.buf.iter().map(|e| (e.u64 as RawFd, e.events as i32))
    }
}
