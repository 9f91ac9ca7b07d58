//! Byte-counting reader used for percent-complete reporting.

use std::io::{self, Read};

/// Pass-through [`Read`] that keeps a running total of bytes returned by
/// the wrapped reader.
///
/// Only the driving flow reads through it, so the counter is a plain
/// integer.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R> CountingReader<R> {
    /// Wraps `inner` with a zeroed counter.
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Total bytes returned by the wrapped reader so far.
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}
