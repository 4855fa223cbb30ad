//! `timerfd(2)` wrapper backing `TimerQueue`'s single kernel timer, grounded
//! on the teacher's `src/sys/timerfd.rs` and
//! `original_source/src/net/src/TimerQueue.cc`'s `detail::createTimerfd` /
//! `resetTimerfd` / `readTimerfd`.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;
use super::syscall;

pub struct TimerFd {
    fd: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let raw = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        Ok(TimerFd { fd: unsafe { FileDesc::new(raw) } })
    }

    /// Arms the timer to fire once after `when`, matching `resetTimerfd`'s
    /// one-shot (`it_interval` always zero — repeats are re-armed by the
    /// `TimerQueue`, not by the kernel).
    pub fn set(&self, when: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: duration_to_timespec(when),
        };
        let mut old: libc::itimerspec = unsafe { mem::zeroed() };
        syscall!(timerfd_settime(self.fd.raw(), 0, &spec, &mut old))?;
        Ok(())
    }

    /// Drains the expiration counter. Mirrors `detail::readTimerfd`'s
    /// tolerance of `EAGAIN` (spurious wakeups are logged, not propagated).
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match self.fd.read(&mut buf) {
            Ok(_) => Ok(u64::from_ne_bytes(buf)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Clamps non-positive durations to 100 microseconds, same as
/// `detail::howMuchTimeFromNow`: a timer already "due" still has to wait a
/// hair so epoll doesn't busy-spin.
pub fn clamp_min(d: Duration) -> Duration {
    const MIN: Duration = Duration::from_micros(100);
    if d < MIN {
        MIN
    } else {
        d
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec { tv_sec: d.as_secs() as libc::time_t, tv_nsec: d.subsec_nanos() as libc::c_long }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
