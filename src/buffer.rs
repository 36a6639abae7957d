/// Cursor-tracked byte store shared by the read path and the pre-buffer.
///
/// Bytes land at the back via `append` (or `ensure_capacity` + direct write
/// for socket reads) and are handed out from the front via `consume`, which
/// is O(1) and zero-copy (`BytesMut::split_to` + freeze). The consumed
/// cursor only ever advances; the storage is reset only when no carry-over
/// bytes remain for the next operation.
use bytes::{Buf, Bytes, BytesMut};

pub struct ReadBuffer {
    buf: BytesMut,
    initial_capacity: usize,
}

impl ReadBuffer {
    /// Create a buffer with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        ReadBuffer {
            buf: BytesMut::with_capacity(capacity),
            initial_capacity: capacity,
        }
    }

    /// Append bytes at the back. Grows geometrically if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes available for consumption (appended but not yet consumed).
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// View the unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Consume `n` bytes from the front and return them without copying.
    pub fn consume(&mut self, n: usize) -> Bytes {
        debug_assert!(
            n <= self.buf.len(),
            "consume({n}) exceeds buffer length {}",
            self.buf.len()
        );
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Discard `n` bytes from the front without materializing them.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Grow so that at least `min` additional bytes can be appended without
    /// reallocation. Existing content is never discarded.
    pub fn ensure_capacity(&mut self, min: usize) {
        if self.buf.capacity() - self.buf.len() < min {
            self.buf.reserve(min);
        }
    }

    /// Append up to `max` bytes produced by `fill`, which writes into the
    /// spare capacity and returns how many bytes it wrote (a socket read).
    pub fn fill_from<F>(&mut self, max: usize, fill: F) -> std::io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<usize>,
    {
        self.ensure_capacity(max);
        let len = self.buf.len();
        self.buf.resize(len + max, 0);
        match fill(&mut self.buf[len..len + max]) {
            Ok(n) => {
                self.buf.truncate(len + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(len);
                Err(e)
            }
        }
    }

    /// Reset the storage. Only legal when no bytes are pending carry-over.
    pub fn reset(&mut self) {
        debug_assert!(self.buf.is_empty(), "reset with carry-over bytes pending");
        if self.buf.is_empty() {
            self.buf = BytesMut::with_capacity(self.initial_capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume() {
        let mut rb = ReadBuffer::new(64);
        rb.append(b"hello ");
        rb.append(b"world");
        assert_eq!(rb.available(), 11);
        assert_eq!(&rb.consume(6)[..], b"hello ");
        assert_eq!(rb.data(), b"world");
        assert_eq!(&rb.consume(5)[..], b"world");
        assert!(rb.is_empty());
    }

    #[test]
    fn grow_on_overflow() {
        let mut rb = ReadBuffer::new(4);
        rb.append(b"abcdef"); // exceeds initial capacity
        assert_eq!(rb.data(), b"abcdef");
    }

    #[test]
    fn consume_is_zero_copy_carryover() {
        let mut rb = ReadBuffer::new(16);
        rb.append(b"abcdefgh");
        let head = rb.consume(3);
        assert_eq!(&head[..], b"abc");
        // Remainder carries over for the next operation.
        assert_eq!(rb.data(), b"defgh");
    }

    #[test]
    fn fill_from_partial_write() {
        let mut rb = ReadBuffer::new(8);
        rb.append(b"xy");
        let n = rb
            .fill_from(16, |spare| {
                spare[..4].copy_from_slice(b"1234");
                Ok(4)
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(rb.data(), b"xy1234");
    }

    #[test]
    fn fill_from_error_restores_length() {
        let mut rb = ReadBuffer::new(8);
        rb.append(b"keep");
        let err = rb.fill_from(16, |_spare| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });
        assert!(err.is_err());
        assert_eq!(rb.data(), b"keep");
    }

    #[test]
    fn reset_when_drained() {
        let mut rb = ReadBuffer::new(16);
        rb.append(b"data");
        rb.skip(4);
        rb.reset();
        assert!(rb.is_empty());
    }
}
