//! The per-socket state machine.
//!
//! A `SocketCore` owns a connected stream, the two FIFO operation queues,
//! the current op per direction, and the pre-buffer. It is driven by latched
//! readiness flags: the event loop records readable/writable edges and calls
//! [`SocketCore::drive`], which makes as much progress as the socket allows
//! and emits [`Completion`] values for the loop to dispatch. The core never
//! invokes the delegate itself — that keeps every callback a borrow-safe,
//! top-level dispatch in the event loop.
//!
//! Backpressure rule: readability with no current read op is latched but not
//! acted on. The engine only reads ahead of demand in the bounded sense that
//! a single socket read may exceed what the current op needs; the excess is
//! retained in the pre-buffer and consumed before any later socket read.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::buffer::ReadBuffer;
use crate::error::Error;
use crate::metrics;
use crate::operation::{Delivery, QueueEntry, ReadOp, ReadRequest, WriteOp, WriteRequest};
use crate::tls::{self, Absorb, StartTls, TlsSession};

/// A connected byte stream, TCP or Unix-domain.
pub(crate) enum Stream {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
}

impl Stream {
    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok(),
            Stream::Unix(_) => None,
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.local_addr().ok(),
            Stream::Unix(_) => None,
        }
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

/// Lifecycle of a connected socket. The `unconnected`/`connecting` phases
/// live in the connect race; a `SocketCore` exists from `connected` onward
/// and a slot is released (terminal) once `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    Connected,
    DisconnectingAfterReads,
    DisconnectingAfterWrites,
    DisconnectingAfterBoth,
    Disconnected,
}

/// Graceful disconnect variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Tear down once all queued reads complete.
    AfterReads,
    /// Tear down once all queued writes complete.
    AfterWrites,
    /// Tear down once both queues drain.
    AfterBoth,
}

/// TLS phase of a connected socket. Irreversible once `Secure`.
enum TlsPhase {
    Plain,
    Handshaking(TlsSession),
    Secure(TlsSession),
}

/// Progress produced by a `drive` pass, dispatched by the event loop.
pub(crate) enum Completion {
    Read(Delivery),
    Write { tag: u64, written: usize },
    /// The TLS handshake completed.
    Secure,
    /// The socket reached `Disconnected`; the loop must tear it down and
    /// schedule the close notification (`None` = clean close).
    Closed(Option<Error>),
}

enum FillError {
    WouldBlock,
    Eof,
    Fatal(Error),
}

pub(crate) struct SocketCore {
    stream: Stream,
    token: Token,
    state: SocketState,
    tls: TlsPhase,
    /// Session built by `start_tls`, waiting for its barrier to reach the
    /// front of both queues.
    staged_tls: Option<TlsSession>,
    read_queue: VecDeque<QueueEntry>,
    write_queue: VecDeque<QueueEntry>,
    current_read: Option<ReadOp>,
    current_write: Option<WriteOp>,
    /// The TLS barrier occupies the current slot of a direction.
    read_gate: bool,
    write_gate: bool,
    pre_buffer: ReadBuffer,
    chunk_size: usize,
    cipher_scratch: Vec<u8>,
    plain_scratch: Vec<u8>,
    readable: bool,
    writable: bool,
    peer_eof: bool,
    /// Whether this socket came from an acceptor (TLS server role) rather
    /// than an outbound connect (TLS client role).
    accepted: bool,
    /// Host string of the outbound connect, used as the default SNI name.
    connect_host: Option<String>,
    pub(crate) user_data: u64,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,

    // Timer bookkeeping, owned jointly with the loop's deadline heap.
    pub(crate) read_timer_seq: u64,
    pub(crate) write_timer_seq: u64,
    pub(crate) read_armed_at: Instant,
    pub(crate) write_armed_at: Instant,
    read_arm_request: Option<Duration>,
    write_arm_request: Option<Duration>,
}

impl SocketCore {
    pub(crate) fn new(
        stream: Stream,
        token: Token,
        accepted: bool,
        chunk_size: usize,
        pre_buffer_capacity: usize,
        connect_host: Option<String>,
        user_data: u64,
    ) -> Self {
        let peer = stream.peer_addr();
        let local = stream.local_addr();
        SocketCore {
            stream,
            token,
            state: SocketState::Connected,
            tls: TlsPhase::Plain,
            staged_tls: None,
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            current_read: None,
            current_write: None,
            read_gate: false,
            write_gate: false,
            pre_buffer: ReadBuffer::new(pre_buffer_capacity),
            chunk_size,
            cipher_scratch: Vec::new(),
            plain_scratch: Vec::new(),
            readable: false,
            writable: false,
            peer_eof: false,
            accepted,
            connect_host,
            user_data,
            peer,
            local,
            read_timer_seq: 0,
            write_timer_seq: 0,
            read_armed_at: Instant::now(),
            write_armed_at: Instant::now(),
            read_arm_request: None,
            write_arm_request: None,
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.token;
        self.stream
            .register(registry, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = self.stream.deregister(registry);
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub(crate) fn is_secure(&self) -> bool {
        matches!(self.tls, TlsPhase::Secure(_))
    }

    pub(crate) fn is_ipv4(&self) -> bool {
        matches!(self.peer, Some(SocketAddr::V4(_)))
    }

    pub(crate) fn is_ipv6(&self) -> bool {
        matches!(self.peer, Some(SocketAddr::V6(_)))
    }

    pub(crate) fn current_read_meta(&self) -> Option<(u64, usize)> {
        self.current_read.as_ref().map(|op| (op.tag, op.bytes_done))
    }

    pub(crate) fn current_write_meta(&self) -> Option<(u64, usize)> {
        self.current_write.as_ref().map(|op| (op.tag, op.bytes_done))
    }

    pub(crate) fn take_read_arm(&mut self) -> Option<Duration> {
        self.read_arm_request.take()
    }

    pub(crate) fn take_write_arm(&mut self) -> Option<Duration> {
        self.write_arm_request.take()
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Queue a read. Argument errors are synchronous; submissions against a
    /// disconnecting socket are silently ignored (no enqueue, no callback).
    pub(crate) fn enqueue_read(&mut self, req: ReadRequest) -> Result<(), Error> {
        req.validate()?;
        if self.state != SocketState::Connected {
            return Ok(());
        }
        self.read_queue.push_back(QueueEntry::Read(ReadOp::new(req)));
        Ok(())
    }

    /// Queue a write. Same contract as [`enqueue_read`](Self::enqueue_read).
    pub(crate) fn enqueue_write(&mut self, req: WriteRequest) -> Result<(), Error> {
        req.validate()?;
        if self.state != SocketState::Connected {
            return Ok(());
        }
        self.write_queue.push_back(QueueEntry::Write(WriteOp::new(req)));
        Ok(())
    }

    /// Queue a TLS upgrade barrier across both directions. The session is
    /// built now (role by socket origin) but only starts handshaking when
    /// the barrier reaches the front of both queues.
    pub(crate) fn start_tls(
        &mut self,
        req: StartTls,
        engine_server: Option<std::sync::Arc<rustls::ServerConfig>>,
        engine_client: Option<std::sync::Arc<rustls::ClientConfig>>,
    ) -> Result<(), Error> {
        if self.state != SocketState::Connected {
            return Ok(());
        }
        if !matches!(self.tls, TlsPhase::Plain) || self.staged_tls.is_some() {
            return Err(Error::InvalidRequest("TLS already started"));
        }

        let session = if self.accepted {
            let config = req
                .server_config
                .or(engine_server)
                .ok_or(Error::InvalidRequest("no TLS server config"))?;
            TlsSession::server(config)?
        } else {
            let config = req
                .client_config
                .or(engine_client)
                .ok_or(Error::InvalidRequest("no TLS client config"))?;
            let name = req
                .server_name
                .clone()
                .or_else(|| self.connect_host.clone())
                .or_else(|| self.peer.map(|a| a.ip().to_string()))
                .ok_or(Error::InvalidRequest("no TLS server name"))?;
            let name = rustls::pki_types::ServerName::try_from(name)
                .map_err(|_| Error::InvalidRequest("invalid TLS server name"))?;
            TlsSession::client(config, name)?
        };

        self.staged_tls = Some(session);
        self.read_queue.push_back(QueueEntry::TlsBarrier);
        self.write_queue.push_back(QueueEntry::TlsBarrier);
        Ok(())
    }

    /// Enter a graceful disconnect state. Later submissions are silently
    /// ignored; teardown happens once the gated queue(s) drain.
    pub(crate) fn disconnect_after(&mut self, mode: DisconnectMode) {
        if self.state != SocketState::Connected {
            return;
        }
        self.state = match mode {
            DisconnectMode::AfterReads => SocketState::DisconnectingAfterReads,
            DisconnectMode::AfterWrites => SocketState::DisconnectingAfterWrites,
            DisconnectMode::AfterBoth => SocketState::DisconnectingAfterBoth,
        };
    }

    /// Latch readiness edges reported by the poller.
    pub(crate) fn note_event(&mut self, readable: bool, writable: bool) {
        self.readable |= readable;
        self.writable |= writable;
    }

    /// Send close_notify and best-effort flush it. Called by the loop during
    /// teardown of a secure socket.
    pub(crate) fn close_tls(&mut self) {
        if let TlsPhase::Secure(session) = &mut self.tls {
            session.send_close_notify();
            let _ = tls::flush_ciphertext(session, &mut self.stream);
        }
    }

    // ── Driving ──────────────────────────────────────────────────────

    /// Make all possible progress given the latched readiness flags.
    pub(crate) fn drive(&mut self, out: &mut Vec<Completion>) {
        if self.state == SocketState::Disconnected {
            return;
        }
        self.promote_read();
        self.promote_write();
        self.maybe_begin_handshake();
        self.pump_handshake(out);
        if !matches!(self.tls, TlsPhase::Handshaking(_)) {
            self.drive_read(out);
            self.drive_write(out);
            self.flush_secure_output(out);
        }
        self.check_drained(out);
    }

    /// Move the next queue entry into the current slot, or raise the gate.
    fn promote_read(&mut self) {
        if self.current_read.is_some() || self.read_gate {
            return;
        }
        match self.read_queue.pop_front() {
            Some(QueueEntry::Read(op)) => {
                self.read_arm_request = op.timeout;
                self.current_read = Some(op);
            }
            Some(QueueEntry::TlsBarrier) => self.read_gate = true,
            Some(QueueEntry::Write(_)) => unreachable!("write entry in read queue"),
            None => {}
        }
    }

    fn promote_write(&mut self) {
        if self.current_write.is_some() || self.write_gate {
            return;
        }
        match self.write_queue.pop_front() {
            Some(QueueEntry::Write(op)) => {
                self.write_arm_request = op.timeout;
                self.current_write = Some(op);
            }
            Some(QueueEntry::TlsBarrier) => self.write_gate = true,
            Some(QueueEntry::Read(_)) => unreachable!("read entry in write queue"),
            None => {}
        }
    }

    fn maybe_begin_handshake(&mut self) {
        if self.read_gate && self.write_gate && matches!(self.tls, TlsPhase::Plain) {
            if let Some(session) = self.staged_tls.take() {
                self.cipher_scratch = vec![0u8; self.chunk_size];
                self.plain_scratch = vec![0u8; self.chunk_size];
                self.tls = TlsPhase::Handshaking(session);
            }
        }
    }

    /// Feed and drain handshake bytes. Ordinary queue progress is paused in
    /// both directions while handshaking; pre-buffered bytes (read past the
    /// last plain-text op) are the peer's first TLS bytes and are consumed
    /// before any new socket read.
    fn pump_handshake(&mut self, out: &mut Vec<Completion>) {
        loop {
            let session = match &mut self.tls {
                TlsPhase::Handshaking(s) => s,
                _ => return,
            };

            match tls::flush_ciphertext(session, &mut self.stream) {
                Ok(true) => {}
                Ok(false) => self.writable = false,
                Err(e) => {
                    self.fatal(out, Error::Io(e));
                    return;
                }
            }

            let input: Bytes = if self.pre_buffer.available() > 0 {
                let n = self.pre_buffer.available();
                self.pre_buffer.consume(n)
            } else if self.readable {
                match self.stream.read(&mut self.cipher_scratch) {
                    Ok(0) => {
                        self.fatal(out, Error::Closed);
                        return;
                    }
                    Ok(n) => Bytes::copy_from_slice(&self.cipher_scratch[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.readable = false;
                        return;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.fatal(out, Error::Io(e));
                        return;
                    }
                }
            } else {
                return;
            };

            let absorbed = tls::absorb_ciphertext(
                session,
                &input,
                &mut self.pre_buffer,
                &mut self.plain_scratch,
            );
            match absorbed {
                Ok(Absorb::Progress) => {}
                Ok(Absorb::HandshakeComplete) => {
                    match tls::flush_ciphertext(session, &mut self.stream) {
                        Ok(true) => {}
                        Ok(false) => self.writable = false,
                        Err(e) => {
                            self.fatal(out, Error::Io(e));
                            return;
                        }
                    }
                    if let TlsPhase::Handshaking(s) =
                        std::mem::replace(&mut self.tls, TlsPhase::Plain)
                    {
                        self.tls = TlsPhase::Secure(s);
                    }
                    self.read_gate = false;
                    self.write_gate = false;
                    metrics::TLS_HANDSHAKES_COMPLETED.increment();
                    out.push(Completion::Secure);
                    self.promote_read();
                    self.promote_write();
                    return;
                }
                Ok(Absorb::PeerClosed) => {
                    self.fatal(out, Error::Closed);
                    return;
                }
                Err(e) => {
                    // Best-effort alert flush before reporting the failure.
                    let _ = tls::flush_ciphertext(session, &mut self.stream);
                    metrics::TLS_HANDSHAKES_FAILED.increment();
                    self.fatal(out, e);
                    return;
                }
            }
        }
    }

    fn drive_read(&mut self, out: &mut Vec<Completion>) {
        loop {
            if self.state == SocketState::Disconnected {
                return;
            }
            self.promote_read();
            let op = match self.current_read.as_mut() {
                Some(op) => op,
                None => return,
            };

            // Pre-buffered bytes are consumed before any new socket read.
            let want = op.wanted(self.pre_buffer.available());
            if want > 0 {
                let chunk = self.pre_buffer.consume(want);
                op.accept(chunk);
            }

            if op.is_complete() {
                let op = self.current_read.take().expect("current read");
                self.read_timer_seq = 0;
                self.read_arm_request = None;
                out.push(Completion::Read(op.into_delivery()));
                continue;
            }

            if self.peer_eof {
                self.read_eof(out);
                return;
            }
            if !self.readable {
                return;
            }

            match Self::fill_pre_buffer(
                &mut self.stream,
                &mut self.tls,
                &mut self.pre_buffer,
                &mut self.cipher_scratch,
                &mut self.plain_scratch,
                &mut self.writable,
                self.chunk_size,
            ) {
                Ok(_) => continue,
                Err(FillError::WouldBlock) => {
                    self.readable = false;
                    return;
                }
                Err(FillError::Eof) => {
                    self.peer_eof = true;
                    continue;
                }
                Err(FillError::Fatal(e)) => {
                    self.fatal(out, e);
                    return;
                }
            }
        }
    }

    /// One socket read's worth of new pre-buffer bytes: plain reads land
    /// directly, secure reads pass through the session first. Returns the
    /// number of plaintext bytes that became available.
    fn fill_pre_buffer(
        stream: &mut Stream,
        tls: &mut TlsPhase,
        pre_buffer: &mut ReadBuffer,
        cipher_scratch: &mut Vec<u8>,
        plain_scratch: &mut Vec<u8>,
        writable: &mut bool,
        chunk_size: usize,
    ) -> Result<usize, FillError> {
        match tls {
            TlsPhase::Plain | TlsPhase::Handshaking(_) => {
                let result = pre_buffer.fill_from(chunk_size, |spare| loop {
                    match stream.read(spare) {
                        Ok(n) => return Ok(n),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                });
                match result {
                    Ok(0) => Err(FillError::Eof),
                    Ok(n) => {
                        metrics::BYTES_RECEIVED.add(n as u64);
                        Ok(n)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        Err(FillError::WouldBlock)
                    }
                    Err(e) => Err(FillError::Fatal(Error::Io(e))),
                }
            }
            TlsPhase::Secure(session) => {
                let n = loop {
                    match stream.read(cipher_scratch) {
                        Ok(n) => break n,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Err(FillError::WouldBlock);
                        }
                        Err(e) => return Err(FillError::Fatal(Error::Io(e))),
                    }
                };
                if n == 0 {
                    return Err(FillError::Eof);
                }
                metrics::BYTES_RECEIVED.add(n as u64);

                let before = pre_buffer.available();
                let mut peer_closed = false;
                match tls::absorb_ciphertext(session, &cipher_scratch[..n], pre_buffer, plain_scratch)
                {
                    Ok(Absorb::Progress) | Ok(Absorb::HandshakeComplete) => {}
                    Ok(Absorb::PeerClosed) => peer_closed = true,
                    Err(e) => return Err(FillError::Fatal(e)),
                }
                // Session output (key updates, alerts) must not sit around.
                match tls::flush_ciphertext(session, stream) {
                    Ok(true) => {}
                    Ok(false) => *writable = false,
                    Err(e) => return Err(FillError::Fatal(Error::Io(e))),
                }
                if peer_closed {
                    return Err(FillError::Eof);
                }
                Ok(pre_buffer.available() - before)
            }
        }
    }

    /// The peer closed its half. Satisfy what the buffered bytes still can,
    /// then close: clean if nothing was pending, with `Error::Closed` if a
    /// pending read can no longer complete.
    fn read_eof(&mut self, out: &mut Vec<Completion>) {
        loop {
            self.promote_read();
            let op = match self.current_read.as_mut() {
                Some(op) => op,
                None => {
                    self.clean_close(out);
                    return;
                }
            };
            let want = op.wanted(self.pre_buffer.available());
            if want > 0 {
                let chunk = self.pre_buffer.consume(want);
                op.accept(chunk);
            }
            if op.is_complete() {
                let op = self.current_read.take().expect("current read");
                self.read_timer_seq = 0;
                self.read_arm_request = None;
                out.push(Completion::Read(op.into_delivery()));
                continue;
            }
            self.fatal(out, Error::Closed);
            return;
        }
    }

    fn drive_write(&mut self, out: &mut Vec<Completion>) {
        loop {
            if self.state == SocketState::Disconnected {
                return;
            }
            self.promote_write();
            let op = match self.current_write.as_mut() {
                Some(op) => op,
                None => return,
            };
            if !self.writable {
                return;
            }

            let step = Self::write_step(
                &mut self.stream,
                &mut self.tls,
                op,
                &mut self.writable,
                self.chunk_size,
            );
            match step {
                Ok(true) => {
                    let op = self.current_write.take().expect("current write");
                    self.write_timer_seq = 0;
                    self.write_arm_request = None;
                    metrics::BYTES_SENT.add(op.data.len() as u64);
                    out.push(Completion::Write {
                        tag: op.tag,
                        written: op.data.len(),
                    });
                    continue;
                }
                Ok(false) => return,
                Err(e) => {
                    self.fatal(out, e);
                    return;
                }
            }
        }
    }

    /// Push the current write forward. Returns `Ok(true)` once the op is
    /// complete (for TLS: all plaintext fed *and* ciphertext flushed).
    fn write_step(
        stream: &mut Stream,
        tls: &mut TlsPhase,
        op: &mut WriteOp,
        writable: &mut bool,
        chunk_size: usize,
    ) -> Result<bool, Error> {
        match tls {
            TlsPhase::Plain | TlsPhase::Handshaking(_) => loop {
                if op.is_complete() {
                    return Ok(true);
                }
                match stream.write(op.remaining()) {
                    Ok(0) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket accepted no bytes",
                        )));
                    }
                    Ok(n) => op.bytes_done += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        *writable = false;
                        return Ok(false);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::Io(e)),
                }
            },
            TlsPhase::Secure(session) => loop {
                match tls::flush_ciphertext(session, stream) {
                    Ok(true) => {}
                    Ok(false) => {
                        *writable = false;
                        return Ok(false);
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
                if op.is_complete() {
                    // All plaintext fed and nothing pending after the flush.
                    return Ok(!session.wants_write());
                }
                let take = op.remaining().len().min(chunk_size);
                let fed = session
                    .writer()
                    .write(&op.data[op.bytes_done..op.bytes_done + take])
                    .map_err(Error::Io)?;
                op.bytes_done += fed;
            },
        }
    }

    /// Drain session output that isn't tied to a write op (tickets, key
    /// updates) once writability returns.
    fn flush_secure_output(&mut self, out: &mut Vec<Completion>) {
        if !self.writable {
            return;
        }
        if let TlsPhase::Secure(session) = &mut self.tls {
            match tls::flush_ciphertext(session, &mut self.stream) {
                Ok(true) => {}
                Ok(false) => self.writable = false,
                Err(e) => self.fatal(out, Error::Io(e)),
            }
        }
    }

    fn check_drained(&mut self, out: &mut Vec<Completion>) {
        let read_empty =
            self.current_read.is_none() && !self.read_gate && self.read_queue.is_empty();
        let write_empty =
            self.current_write.is_none() && !self.write_gate && self.write_queue.is_empty();
        let drained = match self.state {
            SocketState::DisconnectingAfterReads => read_empty,
            SocketState::DisconnectingAfterWrites => write_empty,
            SocketState::DisconnectingAfterBoth => read_empty && write_empty,
            _ => false,
        };
        if drained {
            self.clean_close(out);
        }
    }

    fn fatal(&mut self, out: &mut Vec<Completion>, err: Error) {
        if self.state != SocketState::Disconnected {
            self.state = SocketState::Disconnected;
            out.push(Completion::Closed(Some(err)));
        }
    }

    fn clean_close(&mut self, out: &mut Vec<Completion>) {
        if self.state != SocketState::Disconnected {
            self.state = SocketState::Disconnected;
            out.push(Completion::Closed(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ReadRequest;
    use std::io::Write as _;
    use std::time::Duration;

    /// A connected (core, std peer) pair over loopback.
    fn pair() -> (SocketCore, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = Stream::Tcp(mio::net::TcpStream::from_std(accepted));
        let core = SocketCore::new(stream, Token(0), true, 4096, 4096, None, 0);
        (core, peer)
    }

    /// Write from the peer and wait for the bytes to land in the kernel
    /// buffer on the accepted side.
    fn peer_send(peer: &mut std::net::TcpStream, data: &[u8]) {
        peer.write_all(data).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
    }

    fn drain(core: &mut SocketCore) -> Vec<Completion> {
        let mut out = Vec::new();
        core.note_event(true, true);
        core.drive(&mut out);
        out
    }

    #[test]
    fn exact_read_accumulates_across_events() {
        let (mut core, mut peer) = pair();
        core.enqueue_read(ReadRequest::exact(8, 1)).unwrap();

        peer_send(&mut peer, b"abcd");
        let out = drain(&mut core);
        assert!(out.is_empty(), "must not complete with 4 of 8 bytes");

        peer_send(&mut peer, b"efgh");
        let out = drain(&mut core);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Completion::Read(d) => {
                assert_eq!(d.tag, 1);
                assert_eq!(&d.data[..], b"abcdefgh");
            }
            _ => panic!("expected read completion"),
        }
    }

    #[test]
    fn fifo_reads_from_one_burst() {
        let (mut core, mut peer) = pair();
        core.enqueue_read(ReadRequest::exact(3, 1)).unwrap();
        core.enqueue_read(ReadRequest::exact(5, 2)).unwrap();
        core.enqueue_read(ReadRequest::exact(2, 3)).unwrap();

        peer_send(&mut peer, b"aaabbbbbcc");
        let out = drain(&mut core);
        let tags: Vec<u64> = out
            .iter()
            .map(|c| match c {
                Completion::Read(d) => d.tag,
                _ => panic!("expected read"),
            })
            .collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn at_most_caps_and_retains_remainder() {
        let (mut core, mut peer) = pair();
        core.enqueue_read(ReadRequest::at_most(4, 1)).unwrap();

        peer_send(&mut peer, b"0123456789");
        let out = drain(&mut core);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Completion::Read(d) => assert_eq!(&d.data[..], b"0123"),
            _ => panic!("expected read"),
        }

        // The remainder is retained and satisfies a follow-up read without
        // touching the socket.
        core.enqueue_read(ReadRequest::available(2)).unwrap();
        let mut out = Vec::new();
        core.drive(&mut out);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Completion::Read(d) => assert_eq!(&d.data[..], b"456789"),
            _ => panic!("expected read"),
        }
    }

    #[test]
    fn readability_without_demand_is_latched() {
        let (mut core, mut peer) = pair();
        peer_send(&mut peer, b"unrequested");
        let out = drain(&mut core);
        assert!(out.is_empty());
        // No read op was queued, so nothing was pulled off the socket.
        assert_eq!(core.pre_buffer.available(), 0);
    }

    #[test]
    fn write_completes_fully() {
        let (mut core, mut peer) = pair();
        core.enqueue_write(WriteRequest::new(&b"hello wire"[..], 9))
            .unwrap();
        let out = drain(&mut core);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Completion::Write { tag, written } => {
                assert_eq!(*tag, 9);
                assert_eq!(*written, 10);
            }
            _ => panic!("expected write completion"),
        }

        peer.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 10];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello wire");
    }

    #[test]
    fn disconnect_after_writes_drains_then_closes() {
        let (mut core, _peer) = pair();
        core.enqueue_write(WriteRequest::new(&b"a"[..], 1)).unwrap();
        core.enqueue_write(WriteRequest::new(&b"b"[..], 2)).unwrap();
        core.enqueue_read(ReadRequest::exact(4, 3)).unwrap();
        core.disconnect_after(DisconnectMode::AfterWrites);

        // Submissions after the call are silently ignored.
        core.enqueue_write(WriteRequest::new(&b"late"[..], 4)).unwrap();
        core.enqueue_read(ReadRequest::available(5)).unwrap();

        let out = drain(&mut core);
        let mut saw = Vec::new();
        for c in &out {
            match c {
                Completion::Write { tag, .. } => saw.push(*tag),
                Completion::Closed(err) => {
                    assert!(err.is_none(), "drain close must be clean");
                    saw.push(u64::MAX);
                }
                Completion::Read(_) => panic!("pending read must not complete"),
                Completion::Secure => panic!("unexpected"),
            }
        }
        assert_eq!(saw, vec![1, 2, u64::MAX]);
    }

    #[test]
    fn eof_fails_pending_exact_read() {
        let (mut core, peer) = pair();
        core.enqueue_read(ReadRequest::exact(100, 1)).unwrap();
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));
        let out = drain(&mut core);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Completion::Closed(Some(Error::Closed)) => {}
            _ => panic!("expected close with peer-closed error"),
        }
    }

    #[test]
    fn eof_satisfies_first_available_before_closing() {
        let (mut core, mut peer) = pair();
        core.enqueue_read(ReadRequest::available(1)).unwrap();
        peer_send(&mut peer, b"tail");
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));
        let out = drain(&mut core);
        match &out[0] {
            Completion::Read(d) => assert_eq!(&d.data[..], b"tail"),
            _ => panic!("expected the buffered bytes first"),
        }
    }

    #[test]
    fn timer_arm_requested_on_activation_only() {
        let (mut core, _peer) = pair();
        core.enqueue_read(ReadRequest::exact(4, 1).timeout(Duration::from_secs(1)))
            .unwrap();
        assert!(core.take_read_arm().is_none(), "not armed before activation");
        let mut out = Vec::new();
        core.drive(&mut out);
        assert_eq!(core.take_read_arm(), Some(Duration::from_secs(1)));
        assert!(core.take_read_arm().is_none(), "request is one-shot");
    }
}
