//! RAII wrapper around a raw file descriptor, closing it on drop. Grounded
//! on the teacher's `src/sys/fd.rs` (`FileDesc`), extended with the
//! `set_cloexec`/vectored-io helpers the socket layer needs.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::syscall;

#[derive(Debug)]
pub struct FileDesc(RawFd);

impl FileDesc {
    /// # Safety
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn new(fd: RawFd) -> FileDesc {
        FileDesc(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        let flags = syscall!(fcntl(self.0, libc::F_GETFD))?;
        syscall!(fcntl(self.0, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = syscall!(fcntl(self.0, libc::F_GETFL))?;
        let flags = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        syscall!(fcntl(self.0, libc::F_SETFL, flags))?;
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match syscall!(read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len())) {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match syscall!(write(self.0, buf.as_ptr() as *const libc::c_void, buf.len())) {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        loop {
            match syscall!(writev(self.0, bufs.as_ptr() as *const libc::iovec, bufs.len() as i32))
            {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        loop {
            match syscall!(readv(self.0, bufs.as_ptr() as *const libc::iovec, bufs.len() as i32)) {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(fd)
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.0);
        }
    }
}
