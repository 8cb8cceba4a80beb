//! Growable carry buffer
//!
//! Holds bytes pulled from a transport beyond what the caller asked for, so a
//! line split across two transport reads is reassembled and nothing is read
//! twice.

use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: BytesMut,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Move up to `max` buffered bytes into `out`
    pub fn drain_into(&mut self, out: &mut Vec<u8>, max: usize) -> usize {
        let n = max.min(self.buf.len());
        out.extend_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Move buffered bytes into `out` up to and including the first line feed,
    /// reading at most `max`. Returns whether a line feed was copied.
    pub fn drain_line_into(&mut self, out: &mut Vec<u8>, max: usize) -> bool {
        let limit = max.min(self.buf.len());
        match self.buf[..limit].iter().position(|&b| b == b'\n') {
            Some(i) => {
                out.extend_from_slice(&self.buf[..=i]);
                self.buf.advance(i + 1);
                true
            }
            None => {
                out.extend_from_slice(&self.buf[..limit]);
                self.buf.advance(limit);
                false
            }
        }
    }

    /// Fill the buffer with one read of at most `chunk` bytes from `read`.
    /// Returns the number of bytes added.
    pub fn refill<F, E>(&mut self, chunk: usize, read: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        let start = self.buf.len();
        self.buf.resize(start + chunk, 0);
        match read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// Put bytes back in front of whatever is buffered
    pub fn unread(&mut self, bytes: &[u8]) {
        let mut front = BytesMut::with_capacity(bytes.len() + self.buf.len());
        front.extend_from_slice(bytes);
        front.extend_from_slice(&self.buf);
        self.buf = front;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_drain_keeps_remainder() {
        let mut rb = ReadBuffer::new();
        rb.refill(16, |buf| {
            buf[..9].copy_from_slice(b"ab\ncd\nef\n");
            Ok::<usize, ()>(9)
        })
        .unwrap();

        let mut out = Vec::new();
        assert!(rb.drain_line_into(&mut out, usize::MAX));
        assert_eq!(out, b"ab\n");
        assert_eq!(rb.len(), 6);

        let mut out = Vec::new();
        assert!(!rb.drain_line_into(&mut out, 1));
        assert_eq!(out, b"c");
    }

    #[test]
    fn test_failed_refill_leaves_buffer_unchanged() {
        let mut rb = ReadBuffer::new();
        rb.unread(b"xy");
        assert!(rb.refill(8, |_| Err("boom")).is_err());
        assert_eq!(rb.len(), 2);

        let mut out = Vec::new();
        assert_eq!(rb.drain_into(&mut out, 10), 2);
        assert_eq!(out, b"xy");
        assert!(rb.is_empty());
    }
}
