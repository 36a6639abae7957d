use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;
use crate::event_loop::EngineCtx;
use crate::operation::Delivery;

/// Opaque socket handle given to the delegate.
/// Encodes the slot index and generation for stale detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SocketToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        SocketToken { index, generation }
    }

    /// Returns the slot index. Useful for indexing into per-socket arrays.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Opaque handle for a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub(crate) u32);

impl ListenerToken {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Trait for engine delegates.
///
/// All callbacks run on the engine's loop thread; per-direction completions
/// arrive strictly in enqueue order, and `on_close` fires at most once per
/// socket, after any completions already delivered. Every method has a
/// default no-op body so implementations only spell out what they react to.
#[allow(unused_variables)]
pub trait SocketDelegate {
    /// An outbound connect finished. On success the socket is `connected`
    /// and any operations queued while connecting begin processing; on
    /// failure the token is dead and no `on_close` follows.
    fn on_connect(&mut self, ctx: &mut EngineCtx<'_>, token: SocketToken, result: Result<(), Error>) {}

    /// A listener produced a new, independent connected socket.
    fn on_accept(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        listener: ListenerToken,
        token: SocketToken,
        peer: Option<SocketAddr>,
    ) {
    }

    /// A queued read met its completion condition.
    fn on_read_complete(&mut self, ctx: &mut EngineCtx<'_>, token: SocketToken, delivery: Delivery) {}

    /// A queued write was fully transmitted.
    fn on_write_complete(&mut self, ctx: &mut EngineCtx<'_>, token: SocketToken, tag: u64, written: usize) {}

    /// The current read op hit its deadline. Return an additional interval
    /// to extend it, or `None` to let the engine fail the connection with a
    /// timeout error.
    fn on_read_timeout(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        token: SocketToken,
        tag: u64,
        elapsed: Duration,
        bytes_done: usize,
    ) -> Option<Duration> {
        None
    }

    /// The current write op hit its deadline. Same contract as
    /// [`on_read_timeout`](Self::on_read_timeout).
    fn on_write_timeout(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        token: SocketToken,
        tag: u64,
        elapsed: Duration,
        bytes_done: usize,
    ) -> Option<Duration> {
        None
    }

    /// The TLS handshake completed; the socket is now `secure`.
    fn on_secure(&mut self, ctx: &mut EngineCtx<'_>, token: SocketToken) {}

    /// The socket disconnected. `None` means a clean close (peer EOF with no
    /// unsatisfiable pending read, or a drained `disconnect_after_*`).
    fn on_close(&mut self, ctx: &mut EngineCtx<'_>, token: SocketToken, error: Option<Error>) {}

    /// Called once per loop iteration after events, commands, and timers.
    fn on_tick(&mut self, ctx: &mut EngineCtx<'_>) {}
}
