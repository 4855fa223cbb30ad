//! `eventfd(2)` wrapper used as the cross-thread "doorbell" for
//! `EventLoop::wakeup` — grounded on the teacher's `src/sys/eventfd.rs` and
//! `original_source`'s `EventLoop::wakeupFd_`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;
use super::syscall;

#[derive(Debug)]
pub struct EventFd {
    fd: FileDesc,
}

impl EventFd {
    pub fn new(initval: u32) -> io::Result<EventFd> {
        let raw = syscall!(eventfd(initval, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(EventFd { fd: unsafe { FileDesc::new(raw) } })
    }

    /// Wakes up any thread blocked on this fd's readability.
    pub fn write(&self, value: u64) -> io::Result<()> {
        let bytes = value.to_ne_bytes();
        self.fd.write(&bytes)?;
        Ok(())
    }

    /// Drains the counter; returns the accumulated value since the last read.
    pub fn read(&self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        self.fd.read(&mut bytes)?;
        Ok(u64::from_ne_bytes(bytes))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_returns_accumulated_value() {
        let efd = EventFd::new(0).unwrap();
        efd.write(1).unwrap();
        efd.write(1).unwrap();
        assert_eq!(efd.read().unwrap(), 2);
    }

    #[test]
    fn read_with_nothing_pending_would_block() {
        let efd = EventFd::new(0).unwrap();
        let err = efd.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
