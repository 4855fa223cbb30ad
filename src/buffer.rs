//! A growable byte buffer with cheap-prepend slack and scatter-read support.
//!
//! Layout mirrors `original_source/src/Buffer.cc`: `| prependable | readable
//! | writable |`, with `read_index`/`write_index` splitting the three
//! regions and an 8-byte minimum prependable region reserved for
//! length-prefix framing that callers may build on top of this crate.

use std::io::{self, IoSliceMut};
use std::os::unix::io::RawFd;

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack extension buffer used for the second `readv` iovec, so
/// a single read can drain more than the buffer's current writable capacity
/// without an up-front reallocation (spec.md §4.7 read path).
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region, from the read index up to the write index.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Advances the read index by `len` bytes, resetting both indices back
    /// to the cheap-prepend boundary once the buffer is fully drained.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Retrieves the whole readable region as an owned `Vec<u8>`.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_vec(n)
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    /// Appends `data` to the writable region, growing the buffer if needed.
    /// Unlike the `outputBuffer_.append` callsite flagged as buggy in
    /// spec.md §9 (the original only appends when crossing the high-water
    /// mark), this is called unconditionally by `TcpConnection::send_in_loop`
    /// whenever residual bytes remain — see DESIGN.md.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            // Compact: slide the readable bytes down to the cheap-prepend
            // boundary instead of growing the underlying allocation.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Writes into the prepend slack, for length-prefix framing built by
    /// callers of this crate (not exercised by `TcpConnection` itself).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        self.buf[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Scatter-reads from `fd` into the writable region plus a stack
    /// extension buffer, folding any overflow back in afterward. Returns the
    /// number of bytes read (0 on EOF) or the underlying `io::Error`.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let writable_slice = &mut self.buf[self.write_index..];
            let mut iovecs = [IoSliceMut::new(writable_slice), IoSliceMut::new(&mut extra_buf)];
            readv(fd, &mut iovecs)?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }

        Ok(n)
    }
}

fn readv(fd: RawFd, iovecs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    loop {
        let ret = unsafe {
            libc::readv(fd, iovecs.as_ptr() as *const libc::iovec, iovecs.len() as i32)
        };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve_roundtrip() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        assert_eq!(buf.retrieve_as_vec(5), b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::with_capacity(4);
        let data = vec![b'x'; 10_000];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 10_000);
        assert_eq!(buf.peek(), data.as_slice());
    }

    #[test]
    fn compacts_instead_of_growing_when_space_allows() {
        let mut buf = Buffer::with_capacity(1024);
        buf.append(&vec![b'a'; 900]);
        buf.retrieve(900);
        let cap_before = buf.buf.len();
        buf.append(&vec![b'b'; 900]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.peek(), vec![b'b'; 900].as_slice());
    }

    #[test]
    fn prepend_writes_into_cheap_prepend_slack() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend(b"hello ");
        assert_eq!(buf.peek(), b"hello world");
    }
}
