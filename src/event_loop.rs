//! The engine event loop.
//!
//! One thread owns the poller, the socket slot table, the deadline heap, and
//! the delegate. Every state transition, queue mutation, and buffer mutation
//! for a socket happens on this thread — that serialization is what makes
//! the at-most-one-current-op-per-direction invariant hold without locks.
//! Independent engines share nothing and run concurrently.
//!
//! Delegate callbacks are dispatched only from top-level loop code, never
//! from inside a socket borrow: sockets emit [`Completion`] batches, the
//! loop releases the borrow, then dispatches with a fresh [`EngineCtx`].
//! Close and connect-failure notices are deferred to the end of the cycle so
//! they land after any previously delivered completions, exactly once.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Poll, Token, Waker};

use crate::acceptor::{self, Accepted, BoundListener, ListenRequest, ListenerHandle};
use crate::config::Config;
use crate::connector::{
    resolve_host, ConnectRace, ConnectRequest, PendingOp, RaceLane, RaceOutcome,
    UnixConnectRequest,
};
use crate::delegate::{ListenerToken, SocketDelegate, SocketToken};
use crate::error::Error;
use crate::metrics;
use crate::operation::{ReadRequest, WriteRequest};
use crate::socket::{Completion, DisconnectMode, SocketCore, Stream};
use crate::timer::{TimerTarget, Timers};
use crate::tls::StartTls;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_BASE: usize = 1 << 31;

fn sock_token(index: u32) -> Token {
    Token(index as usize * 4)
}

fn race_token(index: u32, lane: RaceLane) -> Token {
    let sub = match lane {
        RaceLane::V4 => 1,
        RaceLane::V6 => 2,
    };
    Token(index as usize * 4 + sub)
}

fn listener_token(id: u32) -> Token {
    Token(LISTENER_BASE + id as usize)
}

enum Decoded {
    Waker,
    Listener(u32),
    Socket(u32),
    Race(u32, RaceLane),
}

fn decode(token: Token) -> Decoded {
    if token == WAKER_TOKEN {
        return Decoded::Waker;
    }
    if token.0 >= LISTENER_BASE {
        return Decoded::Listener((token.0 - LISTENER_BASE) as u32);
    }
    let index = (token.0 / 4) as u32;
    match token.0 % 4 {
        0 => Decoded::Socket(index),
        1 => Decoded::Race(index, RaceLane::V4),
        _ => Decoded::Race(index, RaceLane::V6),
    }
}

/// Commands submitted to the loop from an [`EngineHandle`](crate::EngineHandle)
/// or a resolver thread.
pub(crate) enum Command {
    Connect(ConnectRequest),
    ConnectUnix(UnixConnectRequest),
    Resolved {
        index: u32,
        generation: u32,
        result: Result<Vec<SocketAddr>, String>,
    },
    Listen {
        id: u32,
        listeners: Vec<BoundListener>,
    },
    CloseListener(ListenerToken),
    Read {
        token: SocketToken,
        req: ReadRequest,
    },
    Write {
        token: SocketToken,
        req: WriteRequest,
    },
    StartTls {
        token: SocketToken,
        req: StartTls,
    },
    Disconnect(SocketToken),
    DisconnectAfter {
        token: SocketToken,
        mode: DisconnectMode,
    },
    SetUserData {
        token: SocketToken,
        value: u64,
    },
    Shutdown,
}

/// State shared between the handle and the loop thread.
pub(crate) struct Shared {
    pub(crate) next_listener_id: AtomicU32,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Shared {
            next_listener_id: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        }
    }
}

enum SlotState {
    Empty,
    /// Outbound connect in progress (`connecting` in lifecycle terms).
    Racing(Box<ConnectRace>),
    /// Established socket.
    Open(Box<SocketCore>),
}

struct Slot {
    state: SlotState,
    generation: u32,
    active: bool,
}

/// Socket slots with a free list for O(1) allocation and a generation
/// counter so stale tokens never touch a recycled slot.
struct SocketTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SocketTable {
    fn new(max_connections: u32) -> Self {
        let mut slots = Vec::with_capacity(max_connections as usize);
        for _ in 0..max_connections {
            slots.push(Slot {
                state: SlotState::Empty,
                generation: 0,
                active: false,
            });
        }
        // Free list in reverse so pop hands out the lowest index first.
        let free: Vec<u32> = (0..max_connections).rev().collect();
        SocketTable { slots, free }
    }

    fn allocate(&mut self) -> Option<u32> {
        let index = self.free.pop()?;
        self.slots[index as usize].active = true;
        Some(index)
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if !slot.active {
            return;
        }
        slot.active = false;
        slot.state = SlotState::Empty;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    fn generation(&self, index: u32) -> u32 {
        self.slots[index as usize].generation
    }

    fn check(&self, token: SocketToken) -> bool {
        match self.slots.get(token.index as usize) {
            Some(slot) => slot.active && slot.generation == token.generation,
            None => false,
        }
    }

    fn set_state(&mut self, index: u32, state: SlotState) {
        self.slots[index as usize].state = state;
    }

    fn take_state(&mut self, index: u32) -> SlotState {
        std::mem::replace(&mut self.slots[index as usize].state, SlotState::Empty)
    }

    fn open_mut(&mut self, index: u32) -> Option<&mut SocketCore> {
        match &mut self.slots.get_mut(index as usize)?.state {
            SlotState::Open(core) => Some(core),
            _ => None,
        }
    }

    fn racing_mut(&mut self, index: u32) -> Option<&mut ConnectRace> {
        match &mut self.slots.get_mut(index as usize)?.state {
            SlotState::Racing(race) => Some(race),
            _ => None,
        }
    }

    fn len(&self) -> u32 {
        self.slots.len() as u32
    }
}

/// Deferred end-of-cycle notifications.
enum Notice {
    Close(SocketToken, Option<Error>),
    ConnectFailed(SocketToken, Error),
}

/// Everything the loop owns except the delegate. Delegate callbacks borrow
/// this through [`EngineCtx`] while the delegate itself stays disjoint.
pub(crate) struct Inner {
    pub(crate) config: Config,
    poll: Poll,
    pub(crate) waker: Arc<Waker>,
    sockets: SocketTable,
    listeners: HashMap<u32, Vec<BoundListener>>,
    timers: Timers,
    pub(crate) cmd_tx: Sender<Command>,
    cmd_rx: Receiver<Command>,
    pub(crate) shared: Arc<Shared>,
    dirty: VecDeque<u32>,
    deferred: VecDeque<Notice>,
    shutdown: bool,
}

impl Inner {
    fn token_of(&self, index: u32) -> SocketToken {
        SocketToken::new(index, self.sockets.generation(index))
    }

    fn mark_dirty(&mut self, index: u32) {
        if !self.dirty.contains(&index) {
            self.dirty.push_back(index);
        }
    }

    // ── Submission paths (shared by ctx and commands) ────────────────

    fn submit_read(&mut self, token: SocketToken, req: ReadRequest) -> Result<(), Error> {
        req.validate()?;
        if !self.sockets.check(token) {
            return Ok(());
        }
        let mut dirty = false;
        match &mut self.sockets.slots[token.index as usize].state {
            SlotState::Open(core) => {
                core.enqueue_read(req)?;
                dirty = true;
            }
            SlotState::Racing(race) => race.pending.push(PendingOp::Read(req)),
            SlotState::Empty => {}
        }
        if dirty {
            self.mark_dirty(token.index);
        }
        Ok(())
    }

    fn submit_write(&mut self, token: SocketToken, req: WriteRequest) -> Result<(), Error> {
        req.validate()?;
        if !self.sockets.check(token) {
            return Ok(());
        }
        let mut dirty = false;
        match &mut self.sockets.slots[token.index as usize].state {
            SlotState::Open(core) => {
                core.enqueue_write(req)?;
                dirty = true;
            }
            SlotState::Racing(race) => race.pending.push(PendingOp::Write(req)),
            SlotState::Empty => {}
        }
        if dirty {
            self.mark_dirty(token.index);
        }
        Ok(())
    }

    fn submit_start_tls(&mut self, token: SocketToken, req: StartTls) -> Result<(), Error> {
        if !self.sockets.check(token) {
            return Ok(());
        }
        let server = self.config.tls.as_ref().map(|t| t.server_config.clone());
        let client = self
            .config
            .tls_client
            .as_ref()
            .map(|t| t.client_config.clone());
        let mut dirty = false;
        match &mut self.sockets.slots[token.index as usize].state {
            SlotState::Open(core) => {
                core.start_tls(req, server, client)?;
                dirty = true;
            }
            SlotState::Racing(race) => race.pending.push(PendingOp::StartTls(req)),
            SlotState::Empty => {}
        }
        if dirty {
            self.mark_dirty(token.index);
        }
        Ok(())
    }

    fn submit_disconnect_after(&mut self, token: SocketToken, mode: DisconnectMode) {
        if !self.sockets.check(token) {
            return;
        }
        let mut dirty = false;
        match &mut self.sockets.slots[token.index as usize].state {
            SlotState::Open(core) => {
                core.disconnect_after(mode);
                dirty = true;
            }
            SlotState::Racing(race) => race.pending.push(PendingOp::DisconnectAfter(mode)),
            SlotState::Empty => {}
        }
        if dirty {
            self.mark_dirty(token.index);
        }
    }

    /// Immediate disconnect: synchronous teardown, queued and current ops
    /// dropped without completion callbacks, one close notice deferred.
    fn submit_disconnect(&mut self, token: SocketToken) {
        if !self.sockets.check(token) {
            return;
        }
        let index = token.index;
        let is_open = matches!(
            self.sockets.slots[index as usize].state,
            SlotState::Open(_)
        );
        if is_open {
            self.teardown(index, None);
            return;
        }
        if self.sockets.racing_mut(index).is_some() {
            let notice_token = self.token_of(index);
            if let Some(race) = self.sockets.racing_mut(index) {
                race.abort(self.poll.registry());
            }
            self.sockets.take_state(index);
            self.sockets.release(index);
            self.deferred.push_back(Notice::Close(notice_token, None));
        }
    }

    fn set_user_data(&mut self, token: SocketToken, value: u64) {
        if !self.sockets.check(token) {
            return;
        }
        match &mut self.sockets.slots[token.index as usize].state {
            SlotState::Open(core) => core.user_data = value,
            SlotState::Racing(race) => race.user_data = value,
            SlotState::Empty => {}
        }
    }

    // ── Connect ──────────────────────────────────────────────────────

    /// Allocate a slot, install the race, and hand resolution to a helper
    /// thread. Failures after this point arrive through `on_connect(Err)`.
    fn connect(&mut self, req: ConnectRequest) -> Result<SocketToken, Error> {
        req.validate()?;
        let index = self
            .sockets
            .allocate()
            .ok_or(Error::ConnectionLimitReached)?;
        let mut race = match ConnectRace::tcp(
            &req,
            self.config.ipv4_enabled,
            self.config.ipv6_enabled,
            self.config.prefer_ipv4,
        ) {
            Ok(race) => race,
            Err(e) => {
                self.sockets.release(index);
                return Err(e);
            }
        };
        if let Some(timeout) = race.timeout {
            race.deadline_seq = self
                .timers
                .arm(Instant::now() + timeout, TimerTarget::Connect(index));
        }
        self.sockets.set_state(index, SlotState::Racing(Box::new(race)));

        let generation = self.sockets.generation(index);
        let token = SocketToken::new(index, generation);
        let tx = self.cmd_tx.clone();
        let waker = self.waker.clone();
        let host = req.host;
        let port = req.port;
        let spawned = std::thread::Builder::new()
            .name("wireline-resolve".to_string())
            .spawn(move || {
                let result = resolve_host(&host, port);
                let _ = tx.send(Command::Resolved {
                    index,
                    generation,
                    result,
                });
                let _ = waker.wake();
            });
        if let Err(e) = spawned {
            self.sockets.take_state(index);
            self.sockets.release(index);
            return Err(Error::Io(e));
        }
        Ok(token)
    }

    fn connect_unix(&mut self, req: UnixConnectRequest) -> Result<SocketToken, Error> {
        req.validate()?;
        let index = self
            .sockets
            .allocate()
            .ok_or(Error::ConnectionLimitReached)?;
        let mut race = ConnectRace::unix(&req);
        if let Some(timeout) = race.timeout {
            race.deadline_seq = self
                .timers
                .arm(Instant::now() + timeout, TimerTarget::Connect(index));
        }
        let started = race.start_unix(self.poll.registry(), race_token(index, RaceLane::V4));
        self.sockets.set_state(index, SlotState::Racing(Box::new(race)));
        let token = self.token_of(index);
        if let Err(e) = started {
            self.fail_connect(index, e);
        }
        Ok(token)
    }

    /// Connect-failure path: the instance never reached `connected`, so the
    /// notice is `on_connect(Err)` and no close follows.
    fn fail_connect(&mut self, index: u32, err: Error) {
        let token = self.token_of(index);
        if let Some(race) = self.sockets.racing_mut(index) {
            race.abort(self.poll.registry());
        } else {
            return;
        }
        self.sockets.take_state(index);
        self.sockets.release(index);
        metrics::CONNECT_FAILURES.increment();
        self.deferred.push_back(Notice::ConnectFailed(token, err));
    }

    // ── Listen ───────────────────────────────────────────────────────

    fn listen(&mut self, req: ListenRequest) -> Result<ListenerHandle, Error> {
        let listeners = acceptor::bind_listeners(&self.config, &req)?;
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let addrs = listeners.iter().filter_map(|l| l.addr).collect();
        self.install_listeners(id, listeners)?;
        Ok(ListenerHandle {
            token: ListenerToken(id),
            addrs,
        })
    }

    fn install_listeners(
        &mut self,
        id: u32,
        mut listeners: Vec<BoundListener>,
    ) -> Result<(), Error> {
        for listener in &mut listeners {
            listener
                .register(self.poll.registry(), listener_token(id))
                .map_err(Error::Io)?;
        }
        self.listeners.insert(id, listeners);
        Ok(())
    }

    fn close_listener(&mut self, token: ListenerToken) {
        if let Some(mut listeners) = self.listeners.remove(&token.0) {
            for listener in &mut listeners {
                listener.deregister(self.poll.registry());
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Tear down an established socket and defer its single close notice.
    fn teardown(&mut self, index: u32, error: Option<Error>) {
        let token = self.token_of(index);
        let mut core = match self.sockets.take_state(index) {
            SlotState::Open(core) => core,
            other => {
                self.sockets.set_state(index, other);
                return;
            }
        };
        core.close_tls();
        core.deregister(self.poll.registry());
        self.sockets.release(index);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        self.deferred.push_back(Notice::Close(token, error));
    }

    // ── Queries ──────────────────────────────────────────────────────

    fn with_open<T>(&self, token: SocketToken, f: impl FnOnce(&SocketCore) -> T) -> Option<T> {
        if !self.sockets.check(token) {
            return None;
        }
        match &self.sockets.slots[token.index as usize].state {
            SlotState::Open(core) => Some(f(core)),
            _ => None,
        }
    }
}

/// Context handed to delegate callbacks for issuing operations and queries.
///
/// This is a short-lived borrow into the loop's state; everything submitted
/// through it is processed before the loop goes back to sleep.
pub struct EngineCtx<'a> {
    pub(crate) inner: &'a mut Inner,
}

impl EngineCtx<'_> {
    /// Queue a read. Argument errors are synchronous and enqueue nothing;
    /// submissions against a stale or disconnecting socket are silently
    /// ignored.
    pub fn read(&mut self, token: SocketToken, req: ReadRequest) -> Result<(), Error> {
        self.inner.submit_read(token, req)
    }

    /// Queue a write. Same contract as [`read`](Self::read).
    pub fn write(&mut self, token: SocketToken, req: WriteRequest) -> Result<(), Error> {
        self.inner.submit_write(token, req)
    }

    /// Queue a TLS upgrade as a barrier across both directions.
    pub fn start_tls(&mut self, token: SocketToken, req: StartTls) -> Result<(), Error> {
        self.inner.submit_start_tls(token, req)
    }

    /// Start an outbound connect. The token is live immediately: reads,
    /// writes, and `start_tls` may be queued against it while the connect is
    /// still in flight.
    pub fn connect(&mut self, req: ConnectRequest) -> Result<SocketToken, Error> {
        self.inner.connect(req)
    }

    /// Start an outbound Unix-domain connect.
    pub fn connect_unix(&mut self, req: UnixConnectRequest) -> Result<SocketToken, Error> {
        self.inner.connect_unix(req)
    }

    /// Bind and start accepting. Accepted sockets are reported through
    /// `on_accept` as independent instances.
    pub fn listen(&mut self, req: ListenRequest) -> Result<ListenerHandle, Error> {
        self.inner.listen(req)
    }

    /// Stop accepting on a listener. Sockets it already produced live on.
    pub fn close_listener(&mut self, token: ListenerToken) {
        self.inner.close_listener(token);
    }

    /// Immediate disconnect: drops all queued and current operations with
    /// no completion callbacks and schedules exactly one close notice.
    pub fn disconnect(&mut self, token: SocketToken) {
        self.inner.submit_disconnect(token);
    }

    /// Disconnect once all queued reads complete.
    pub fn disconnect_after_reading(&mut self, token: SocketToken) {
        self.inner
            .submit_disconnect_after(token, DisconnectMode::AfterReads);
    }

    /// Disconnect once all queued writes complete.
    pub fn disconnect_after_writing(&mut self, token: SocketToken) {
        self.inner
            .submit_disconnect_after(token, DisconnectMode::AfterWrites);
    }

    /// Disconnect once both queues drain.
    pub fn disconnect_after_reading_and_writing(&mut self, token: SocketToken) {
        self.inner
            .submit_disconnect_after(token, DisconnectMode::AfterBoth);
    }

    /// Associate an opaque value with the socket. Never interpreted.
    pub fn set_user_data(&mut self, token: SocketToken, value: u64) {
        self.inner.set_user_data(token, value);
    }

    pub fn user_data(&self, token: SocketToken) -> Option<u64> {
        self.inner.with_open(token, |core| core.user_data)
    }

    pub fn peer_addr(&self, token: SocketToken) -> Option<SocketAddr> {
        self.inner.with_open(token, |core| core.peer_addr()).flatten()
    }

    pub fn local_addr(&self, token: SocketToken) -> Option<SocketAddr> {
        self.inner.with_open(token, |core| core.local_addr()).flatten()
    }

    /// Whether the socket has been upgraded to TLS.
    pub fn is_secure(&self, token: SocketToken) -> bool {
        self.inner
            .with_open(token, |core| core.is_secure())
            .unwrap_or(false)
    }

    pub fn is_ipv4(&self, token: SocketToken) -> bool {
        self.inner
            .with_open(token, |core| core.is_ipv4())
            .unwrap_or(false)
    }

    pub fn is_ipv6(&self, token: SocketToken) -> bool {
        self.inner
            .with_open(token, |core| core.is_ipv6())
            .unwrap_or(false)
    }

    /// Stop the engine after the current cycle.
    pub fn request_shutdown(&mut self) {
        self.inner.shutdown = true;
    }
}

pub(crate) struct EventLoop<D> {
    inner: Inner,
    delegate: D,
}

impl<D: SocketDelegate> EventLoop<D> {
    pub(crate) fn new(
        config: Config,
        delegate: D,
        poll: Poll,
        waker: Arc<Waker>,
        cmd_tx: Sender<Command>,
        cmd_rx: Receiver<Command>,
        shared: Arc<Shared>,
    ) -> Self {
        let sockets = SocketTable::new(config.max_connections);
        EventLoop {
            inner: Inner {
                config,
                poll,
                waker,
                sockets,
                listeners: HashMap::new(),
                timers: Timers::new(),
                cmd_tx,
                cmd_rx,
                shared,
                dirty: VecDeque::new(),
                deferred: VecDeque::new(),
                shutdown: false,
            },
            delegate,
        }
    }

    pub(crate) fn run(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(self.inner.config.event_capacity);
        loop {
            if self.inner.shutdown || self.inner.shared.shutdown.load(Ordering::Acquire) {
                self.teardown_all();
                return Ok(());
            }

            let timeout = self.inner.timers.poll_timeout(Instant::now());
            match self.inner.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }

            for event in events.iter() {
                match decode(event.token()) {
                    Decoded::Waker => {}
                    Decoded::Listener(id) => self.accept_ready(id),
                    Decoded::Socket(index) => {
                        if let Some(core) = self.inner.sockets.open_mut(index) {
                            core.note_event(
                                event.is_readable() || event.is_read_closed(),
                                event.is_writable() || event.is_write_closed(),
                            );
                            self.inner.mark_dirty(index);
                        }
                    }
                    Decoded::Race(index, lane) => self.race_ready(index, lane),
                }
            }

            self.drain_commands();
            self.fire_timers();
            self.flush_dirty();
            self.drain_deferred();

            {
                let EventLoop { inner, delegate } = self;
                delegate.on_tick(&mut EngineCtx { inner });
            }
            self.flush_dirty();
            self.drain_deferred();
        }
    }

    // ── Accept path ──────────────────────────────────────────────────

    fn accept_ready(&mut self, id: u32) {
        loop {
            let accepted = {
                let inner = &mut self.inner;
                let nodelay = inner.config.tcp_nodelay;
                let listeners = match inner.listeners.get_mut(&id) {
                    Some(listeners) => listeners,
                    None => return,
                };
                let mut found = None;
                for listener in listeners.iter_mut() {
                    match listener.accept(nodelay) {
                        Ok(Some(accepted)) => {
                            found = Some(accepted);
                            break;
                        }
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
                found
            };
            let Some(accepted) = accepted else { return };
            self.install_accepted(id, accepted);
        }
    }

    fn install_accepted(&mut self, id: u32, accepted: Accepted) {
        let (stream, peer) = match accepted {
            Accepted::Tcp(stream, peer) => (Stream::Tcp(stream), Some(peer)),
            Accepted::Unix(stream) => (Stream::Unix(stream), None),
        };
        let index = match self.inner.sockets.allocate() {
            Some(index) => index,
            // At the connection limit the backlog entry is dropped.
            None => return,
        };
        let mut core = Box::new(SocketCore::new(
            stream,
            sock_token(index),
            true,
            self.inner.config.read_chunk_size,
            self.inner.config.pre_buffer_capacity,
            None,
            0,
        ));
        if core.register(self.inner.poll.registry()).is_err() {
            self.inner.sockets.release(index);
            return;
        }
        self.inner.sockets.set_state(index, SlotState::Open(core));
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();

        let token = self.inner.token_of(index);
        {
            let EventLoop { inner, delegate } = self;
            delegate.on_accept(&mut EngineCtx { inner }, ListenerToken(id), token, peer);
        }
        self.inner.mark_dirty(index);
    }

    // ── Connect race path ────────────────────────────────────────────

    fn race_ready(&mut self, index: u32, lane: RaceLane) {
        let outcome = {
            let Inner { sockets, poll, .. } = &mut self.inner;
            let race = match sockets.racing_mut(index) {
                Some(race) => race,
                None => return,
            };
            race.handle_ready(
                lane,
                poll.registry(),
                race_token(index, RaceLane::V4),
                race_token(index, RaceLane::V6),
            )
        };
        match outcome {
            RaceOutcome::Pending => {}
            RaceOutcome::Winner(stream) => self.install_winner(index, stream),
            RaceOutcome::Failed(msg) => self.inner.fail_connect(index, Error::Connect(msg)),
        }
    }

    fn install_winner(&mut self, index: u32, stream: Stream) {
        let race = match self.inner.sockets.take_state(index) {
            SlotState::Racing(race) => race,
            other => {
                self.inner.sockets.set_state(index, other);
                return;
            }
        };
        if let Stream::Tcp(tcp) = &stream {
            let _ = tcp.set_nodelay(self.inner.config.tcp_nodelay);
        }

        let mut core = Box::new(SocketCore::new(
            stream,
            sock_token(index),
            false,
            self.inner.config.read_chunk_size,
            self.inner.config.pre_buffer_capacity,
            race.connect_host(),
            race.user_data,
        ));
        if let Err(e) = core.register(self.inner.poll.registry()) {
            let token = self.inner.token_of(index);
            self.inner.sockets.release(index);
            metrics::CONNECT_FAILURES.increment();
            self.inner
                .deferred
                .push_back(Notice::ConnectFailed(token, Error::Io(e)));
            return;
        }

        // Replay operations queued while connecting, in submission order.
        let server = self
            .inner
            .config
            .tls
            .as_ref()
            .map(|t| t.server_config.clone());
        let client = self
            .inner
            .config
            .tls_client
            .as_ref()
            .map(|t| t.client_config.clone());
        for op in race.pending {
            match op {
                PendingOp::Read(req) => {
                    let _ = core.enqueue_read(req);
                }
                PendingOp::Write(req) => {
                    let _ = core.enqueue_write(req);
                }
                PendingOp::StartTls(req) => {
                    let _ = core.start_tls(req, server.clone(), client.clone());
                }
                PendingOp::DisconnectAfter(mode) => core.disconnect_after(mode),
            }
        }

        self.inner.sockets.set_state(index, SlotState::Open(core));
        metrics::CONNECTIONS_CONNECTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();

        // The connect notice lands before any completion on this socket.
        let token = self.inner.token_of(index);
        {
            let EventLoop { inner, delegate } = self;
            delegate.on_connect(&mut EngineCtx { inner }, token, Ok(()));
        }
        self.inner.mark_dirty(index);
    }

    // ── Commands ─────────────────────────────────────────────────────

    fn drain_commands(&mut self) {
        while let Ok(command) = self.inner.cmd_rx.try_recv() {
            match command {
                Command::Connect(req) => {
                    let _ = self.inner.connect(req);
                }
                Command::ConnectUnix(req) => {
                    let _ = self.inner.connect_unix(req);
                }
                Command::Resolved {
                    index,
                    generation,
                    result,
                } => self.handle_resolved(index, generation, result),
                Command::Listen { id, listeners } => {
                    let _ = self.inner.install_listeners(id, listeners);
                }
                Command::CloseListener(token) => self.inner.close_listener(token),
                Command::Read { token, req } => {
                    let _ = self.inner.submit_read(token, req);
                }
                Command::Write { token, req } => {
                    let _ = self.inner.submit_write(token, req);
                }
                Command::StartTls { token, req } => {
                    let _ = self.inner.submit_start_tls(token, req);
                }
                Command::Disconnect(token) => self.inner.submit_disconnect(token),
                Command::DisconnectAfter { token, mode } => {
                    self.inner.submit_disconnect_after(token, mode)
                }
                Command::SetUserData { token, value } => self.inner.set_user_data(token, value),
                Command::Shutdown => self.inner.shutdown = true,
            }
        }
    }

    fn handle_resolved(
        &mut self,
        index: u32,
        generation: u32,
        result: Result<Vec<SocketAddr>, String>,
    ) {
        {
            let inner = &self.inner;
            if inner.sockets.generation(index) != generation {
                return; // race was aborted or timed out meanwhile
            }
        }
        let install = {
            let Inner { sockets, poll, .. } = &mut self.inner;
            let race = match sockets.racing_mut(index) {
                Some(race) if race.resolving => race,
                _ => return,
            };
            match result {
                Err(msg) => Err(Error::Connect(msg)),
                Ok(addrs) => race.install_candidates(
                    addrs,
                    poll.registry(),
                    race_token(index, RaceLane::V4),
                    race_token(index, RaceLane::V6),
                ),
            }
        };
        if let Err(e) = install {
            self.inner.fail_connect(index, e);
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some((seq, target)) = self.inner.timers.pop_expired(now) {
            match target {
                TimerTarget::Read(index) => self.op_timer_fired(index, seq, now, true),
                TimerTarget::Write(index) => self.op_timer_fired(index, seq, now, false),
                TimerTarget::Connect(index) => {
                    let live = self
                        .inner
                        .sockets
                        .racing_mut(index)
                        .map(|race| race.deadline_seq == seq)
                        .unwrap_or(false);
                    if live {
                        self.inner.fail_connect(index, Error::Timeout);
                    }
                }
            }
        }
    }

    /// An op deadline fired: ask the delegate for an extension before
    /// declaring the timeout connection-fatal.
    fn op_timer_fired(&mut self, index: u32, seq: u64, now: Instant, read: bool) {
        let meta = match self.inner.sockets.open_mut(index) {
            Some(core) => {
                let armed_seq = if read {
                    core.read_timer_seq
                } else {
                    core.write_timer_seq
                };
                if armed_seq != seq {
                    return;
                }
                let meta = if read {
                    core.current_read_meta()
                } else {
                    core.current_write_meta()
                };
                let armed_at = if read {
                    core.read_armed_at
                } else {
                    core.write_armed_at
                };
                meta.map(|(tag, done)| (tag, done, armed_at))
            }
            None => return,
        };
        let Some((tag, bytes_done, armed_at)) = meta else {
            return;
        };

        let token = self.inner.token_of(index);
        let elapsed = now.saturating_duration_since(armed_at);
        let extension = {
            let EventLoop { inner, delegate } = self;
            let mut ctx = EngineCtx { inner };
            if read {
                delegate.on_read_timeout(&mut ctx, token, tag, elapsed, bytes_done)
            } else {
                delegate.on_write_timeout(&mut ctx, token, tag, elapsed, bytes_done)
            }
        };

        match extension {
            Some(extra) => {
                // Extend by the granted interval only; progress is kept.
                let Inner {
                    sockets, timers, ..
                } = &mut self.inner;
                if let Some(core) = sockets.open_mut(index) {
                    let target = if read {
                        TimerTarget::Read(index)
                    } else {
                        TimerTarget::Write(index)
                    };
                    let seq = timers.arm(now + extra, target);
                    if read {
                        core.read_timer_seq = seq;
                    } else {
                        core.write_timer_seq = seq;
                    }
                }
            }
            None => {
                metrics::OPERATION_TIMEOUTS.increment();
                self.inner.teardown(index, Some(Error::Timeout));
            }
        }
    }

    // ── Socket driving ───────────────────────────────────────────────

    fn flush_dirty(&mut self) {
        while let Some(index) = self.inner.dirty.pop_front() {
            self.drive_socket(index);
        }
    }

    fn drive_socket(&mut self, index: u32) {
        loop {
            let completions = {
                let Inner {
                    sockets, timers, ..
                } = &mut self.inner;
                let core = match sockets.open_mut(index) {
                    Some(core) => core,
                    None => return,
                };
                let mut out = Vec::new();
                core.drive(&mut out);

                // Arm deadlines for ops that were activated and are still
                // in flight.
                let now = Instant::now();
                if let Some(timeout) = core.take_read_arm() {
                    core.read_timer_seq = timers.arm(now + timeout, TimerTarget::Read(index));
                    core.read_armed_at = now;
                }
                if let Some(timeout) = core.take_write_arm() {
                    core.write_timer_seq = timers.arm(now + timeout, TimerTarget::Write(index));
                    core.write_armed_at = now;
                }
                out
            };
            if completions.is_empty() {
                return;
            }
            for completion in completions {
                let token = self.inner.token_of(index);
                match completion {
                    Completion::Read(delivery) => {
                        let EventLoop { inner, delegate } = self;
                        delegate.on_read_complete(&mut EngineCtx { inner }, token, delivery);
                    }
                    Completion::Write { tag, written } => {
                        let EventLoop { inner, delegate } = self;
                        delegate.on_write_complete(&mut EngineCtx { inner }, token, tag, written);
                    }
                    Completion::Secure => {
                        let EventLoop { inner, delegate } = self;
                        delegate.on_secure(&mut EngineCtx { inner }, token);
                    }
                    Completion::Closed(error) => {
                        self.inner.teardown(index, error);
                        return;
                    }
                }
            }
        }
    }

    // ── Deferred notices ─────────────────────────────────────────────

    fn drain_deferred(&mut self) {
        loop {
            let Some(notice) = self.inner.deferred.pop_front() else {
                if self.inner.dirty.is_empty() {
                    return;
                }
                self.flush_dirty();
                continue;
            };
            match notice {
                Notice::Close(token, error) => {
                    let EventLoop { inner, delegate } = self;
                    delegate.on_close(&mut EngineCtx { inner }, token, error);
                }
                Notice::ConnectFailed(token, error) => {
                    let EventLoop { inner, delegate } = self;
                    delegate.on_connect(&mut EngineCtx { inner }, token, Err(error));
                }
            }
            self.flush_dirty();
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    fn teardown_all(&mut self) {
        let Inner {
            sockets,
            poll,
            listeners,
            ..
        } = &mut self.inner;
        for index in 0..sockets.len() {
            match sockets.take_state(index) {
                SlotState::Open(mut core) => {
                    core.close_tls();
                    core.deregister(poll.registry());
                }
                SlotState::Racing(mut race) => race.abort(poll.registry()),
                SlotState::Empty => {}
            }
            sockets.release(index);
        }
        for (_, mut bound) in listeners.drain() {
            for listener in &mut bound {
                listener.deregister(poll.registry());
            }
        }
    }
}
