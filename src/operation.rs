//! Read/write operation descriptors and the completion policy.
//!
//! A request is the immutable description the caller hands in (kind, tag,
//! timeout, optional caller-lent buffer). An op is a request plus mutable
//! progress, sitting in a socket's FIFO queue or in the current slot.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::Error;

/// Completion condition for a queued read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Complete as soon as at least one byte is available; deliver exactly
    /// the bytes currently available.
    FirstAvailable,
    /// Complete only once exactly this many bytes have accumulated. Excess
    /// bytes from the satisfying socket read are pre-buffered, never
    /// delivered early.
    Exact(usize),
    /// Like `FirstAvailable`, but a single delivery is capped at this many
    /// bytes; the remainder is retained for the next read. A cap of 0 means
    /// no cap.
    AtMost(usize),
}

/// A queued read request.
pub struct ReadRequest {
    pub(crate) kind: ReadKind,
    pub(crate) tag: u64,
    pub(crate) timeout: Option<Duration>,
    pub(crate) buffer: Option<BytesMut>,
    pub(crate) offset: usize,
}

impl ReadRequest {
    /// Read the first available bytes.
    pub fn available(tag: u64) -> Self {
        Self::new(ReadKind::FirstAvailable, tag)
    }

    /// Read exactly `len` bytes. `len == 0` is rejected at submission.
    pub fn exact(len: usize, tag: u64) -> Self {
        Self::new(ReadKind::Exact(len), tag)
    }

    /// Read the first available bytes, delivering at most `max` per
    /// completion. `max == 0` means no cap.
    pub fn at_most(max: usize, tag: u64) -> Self {
        Self::new(ReadKind::AtMost(max), tag)
    }

    fn new(kind: ReadKind, tag: u64) -> Self {
        ReadRequest {
            kind,
            tag,
            timeout: None,
            buffer: None,
            offset: 0,
        }
    }

    /// Set a completion deadline. Without one the read waits indefinitely.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Lend a destination buffer; received bytes are written starting at
    /// `offset` and the buffer is returned in the completion. The buffer is
    /// borrowed-exclusive until the operation completes or is cancelled.
    pub fn buffer(mut self, buffer: BytesMut, offset: usize) -> Self {
        self.buffer = Some(buffer);
        self.offset = offset;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if matches!(self.kind, ReadKind::Exact(0)) {
            return Err(Error::InvalidRequest("zero-length fixed read"));
        }
        match &self.buffer {
            Some(buf) if self.offset > buf.len() => {
                Err(Error::InvalidRequest("buffer offset out of range"))
            }
            None if self.offset != 0 => {
                Err(Error::InvalidRequest("offset without a buffer"))
            }
            _ => Ok(()),
        }
    }
}

/// A queued write request. Completion requires the entire payload to be
/// transmitted; no partial-write completion is ever reported.
pub struct WriteRequest {
    pub(crate) data: Bytes,
    pub(crate) tag: u64,
    pub(crate) timeout: Option<Duration>,
}

impl WriteRequest {
    pub fn new(data: impl Into<Bytes>, tag: u64) -> Self {
        WriteRequest {
            data: data.into(),
            tag,
            timeout: None,
        }
    }

    /// Set a completion deadline. Without one the write waits indefinitely.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.data.is_empty() {
            return Err(Error::InvalidRequest("empty write"));
        }
        Ok(())
    }
}

/// Completion payload for a finished read.
pub struct Delivery {
    /// The caller-supplied tag, returned verbatim.
    pub tag: u64,
    /// The delivered bytes.
    pub data: Bytes,
    /// The caller-lent buffer, returned once the engine is done with it.
    pub buffer: Option<BytesMut>,
}

/// A read request plus its transfer progress.
pub(crate) struct ReadOp {
    pub(crate) kind: ReadKind,
    pub(crate) tag: u64,
    pub(crate) timeout: Option<Duration>,
    /// Caller-lent destination and insertion offset, or engine-owned chunks.
    caller: Option<(BytesMut, usize)>,
    chunks: Vec<Bytes>,
    pub(crate) bytes_done: usize,
}

impl ReadOp {
    pub(crate) fn new(req: ReadRequest) -> Self {
        ReadOp {
            kind: req.kind,
            tag: req.tag,
            timeout: req.timeout,
            caller: req.buffer.map(|b| (b, req.offset)),
            chunks: Vec::new(),
            bytes_done: 0,
        }
    }

    /// How many of `available` bytes this op wants right now.
    pub(crate) fn wanted(&self, available: usize) -> usize {
        match self.kind {
            ReadKind::FirstAvailable => available,
            ReadKind::AtMost(0) => available,
            ReadKind::AtMost(max) => available.min(max - self.bytes_done),
            ReadKind::Exact(len) => available.min(len - self.bytes_done),
        }
    }

    /// Whether the op has met its completion condition.
    pub(crate) fn is_complete(&self) -> bool {
        match self.kind {
            ReadKind::FirstAvailable | ReadKind::AtMost(_) => self.bytes_done > 0,
            ReadKind::Exact(len) => self.bytes_done == len,
        }
    }

    /// Account `chunk` as transferred.
    pub(crate) fn accept(&mut self, chunk: Bytes) {
        let chunk_len = chunk.len();
        match &mut self.caller {
            Some((buf, offset)) => {
                let start = *offset + self.bytes_done;
                let end = start + chunk_len;
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[start..end].copy_from_slice(&chunk);
            }
            None => self.chunks.push(chunk),
        }
        self.bytes_done += chunk_len;
    }

    /// Consume the op into its completion payload.
    pub(crate) fn into_delivery(mut self) -> Delivery {
        let (data, buffer) = match self.caller.take() {
            Some((buf, offset)) => {
                let data = Bytes::copy_from_slice(&buf[offset..offset + self.bytes_done]);
                (data, Some(buf))
            }
            None => {
                if self.chunks.len() == 1 {
                    (self.chunks.pop().expect("one chunk"), None)
                } else {
                    let total = self.chunks.iter().map(|c| c.len()).sum();
                    let mut out = BytesMut::with_capacity(total);
                    for chunk in &self.chunks {
                        out.extend_from_slice(chunk);
                    }
                    (out.freeze(), None)
                }
            }
        };
        Delivery {
            tag: self.tag,
            data,
            buffer,
        }
    }
}

/// A write request plus its transfer progress.
pub(crate) struct WriteOp {
    pub(crate) data: Bytes,
    pub(crate) tag: u64,
    pub(crate) timeout: Option<Duration>,
    pub(crate) bytes_done: usize,
}

impl WriteOp {
    pub(crate) fn new(req: WriteRequest) -> Self {
        WriteOp {
            data: req.data,
            tag: req.tag,
            timeout: req.timeout,
            bytes_done: 0,
        }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.bytes_done..]
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.bytes_done == self.data.len()
    }
}

/// Entry in a socket's per-direction FIFO queue.
pub(crate) enum QueueEntry {
    Read(ReadOp),
    Write(WriteOp),
    /// Barrier inserted by `start_tls` into both queues at once. Ops before
    /// it run in plain text; ops after it are held until the handshake
    /// clears it.
    TlsBarrier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_accumulates_across_events() {
        let mut op = ReadOp::new(ReadRequest::exact(10, 7));
        assert_eq!(op.wanted(4), 4);
        op.accept(Bytes::from_static(b"abcd"));
        assert!(!op.is_complete());
        assert_eq!(op.wanted(100), 6); // never takes more than it needs
        op.accept(Bytes::from_static(b"efghij"));
        assert!(op.is_complete());
        let d = op.into_delivery();
        assert_eq!(d.tag, 7);
        assert_eq!(&d.data[..], b"abcdefghij");
        assert!(d.buffer.is_none());
    }

    #[test]
    fn at_most_caps_single_delivery() {
        let op = ReadOp::new(ReadRequest::at_most(4, 1));
        assert_eq!(op.wanted(10), 4);
    }

    #[test]
    fn at_most_zero_is_uncapped() {
        let op = ReadOp::new(ReadRequest::at_most(0, 1));
        assert_eq!(op.wanted(10), 10);
    }

    #[test]
    fn first_available_completes_on_any_bytes() {
        let mut op = ReadOp::new(ReadRequest::available(1));
        assert!(!op.is_complete());
        op.accept(Bytes::from_static(b"x"));
        assert!(op.is_complete());
    }

    #[test]
    fn caller_buffer_written_at_offset() {
        let mut buf = BytesMut::from(&b"head"[..]);
        buf.reserve(32);
        let mut op = ReadOp::new(ReadRequest::exact(4, 9).buffer(buf, 4));
        op.accept(Bytes::from_static(b"tail"));
        assert!(op.is_complete());
        let d = op.into_delivery();
        assert_eq!(&d.data[..], b"tail");
        let buf = d.buffer.expect("buffer returned");
        assert_eq!(&buf[..], b"headtail");
    }

    #[test]
    fn validation_rejects_bad_requests() {
        assert!(ReadRequest::exact(0, 1).validate().is_err());
        let buf = BytesMut::from(&b"ab"[..]);
        assert!(ReadRequest::available(1).buffer(buf, 3).validate().is_err());
        assert!(WriteRequest::new(Bytes::new(), 1).validate().is_err());
        assert!(ReadRequest::exact(5, 1).validate().is_ok());
    }

    #[test]
    fn single_chunk_delivery_is_passthrough() {
        let mut op = ReadOp::new(ReadRequest::available(2));
        let chunk = Bytes::from_static(b"zero-copy");
        op.accept(chunk.clone());
        let d = op.into_delivery();
        assert_eq!(d.data, chunk);
    }
}
