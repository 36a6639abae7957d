//! Launching an engine and talking to it from other threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use mio::{Poll, Waker};

use crate::acceptor::{self, ListenRequest, ListenerHandle};
use crate::config::Config;
use crate::connector::{ConnectRequest, UnixConnectRequest};
use crate::delegate::{ListenerToken, SocketDelegate, SocketToken};
use crate::error::Error;
use crate::event_loop::{Command, EventLoop, Shared, WAKER_TOKEN};
use crate::operation::{ReadRequest, WriteRequest};
use crate::tls::StartTls;

/// Result type for [`WirelineBuilder::launch`].
type LaunchResult = Result<(EngineHandle, thread::JoinHandle<Result<(), Error>>), Error>;

/// Builder for launching a wireline engine.
///
/// Create a builder with [`WirelineBuilder::new(config)`](Self::new), then
/// call [`launch(delegate)`](Self::launch) to start the loop thread. The
/// returned [`EngineHandle`] issues commands from any thread; the delegate
/// receives every notification on the loop thread.
pub struct WirelineBuilder {
    config: Config,
}

impl WirelineBuilder {
    /// Create a new builder with the given config.
    pub fn new(config: Config) -> Self {
        WirelineBuilder { config }
    }

    /// Validate the config, spawn the loop thread, and hand back the
    /// command handle plus the thread's join handle.
    pub fn launch<D: SocketDelegate + Send + 'static>(self, delegate: D) -> LaunchResult {
        self.config.validate()?;

        let poll = Poll::new().map_err(Error::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::new());

        let handle = EngineHandle {
            cmd_tx: cmd_tx.clone(),
            waker: waker.clone(),
            shared: shared.clone(),
            config: self.config.clone(),
        };

        let config = self.config;
        let join = thread::Builder::new()
            .name("wireline-loop".to_string())
            .spawn(move || {
                let mut event_loop =
                    EventLoop::new(config, delegate, poll, waker, cmd_tx, cmd_rx, shared);
                event_loop.run()
            })
            .map_err(Error::Io)?;

        Ok((handle, join))
    }
}

/// Cross-thread surface of a running engine.
///
/// Commands are validated synchronously where the arguments allow it
/// (`InvalidRequest` never reaches the loop); everything else is answered
/// through the delegate. Cloneable; all clones talk to the same loop.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    shared: Arc<Shared>,
    config: Config,
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<(), Error> {
        self.cmd_tx.send(command).map_err(|_| Error::Shutdown)?;
        self.waker.wake().map_err(Error::Io)?;
        Ok(())
    }

    /// Start an outbound connect. The resulting socket arrives through
    /// `on_connect`; correlate concurrent connects with
    /// [`ConnectRequest::user_data`].
    pub fn connect(&self, req: ConnectRequest) -> Result<(), Error> {
        req.validate()?;
        self.send(Command::Connect(req))
    }

    /// Start an outbound Unix-domain connect.
    pub fn connect_unix(&self, req: UnixConnectRequest) -> Result<(), Error> {
        req.validate()?;
        self.send(Command::ConnectUnix(req))
    }

    /// Bind listeners for the request and start accepting. Binding happens
    /// on the calling thread so bind errors are synchronous; the returned
    /// handle carries the chosen addresses.
    pub fn listen(&self, req: ListenRequest) -> Result<ListenerHandle, Error> {
        let listeners = acceptor::bind_listeners(&self.config, &req)?;
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let addrs = listeners.iter().filter_map(|l| l.addr).collect();
        self.send(Command::Listen { id, listeners })?;
        Ok(ListenerHandle {
            token: ListenerToken(id),
            addrs,
        })
    }

    /// Stop accepting on a listener.
    pub fn close_listener(&self, token: ListenerToken) -> Result<(), Error> {
        self.send(Command::CloseListener(token))
    }

    /// Queue a read. See [`EngineCtx::read`](crate::EngineCtx::read).
    pub fn read(&self, token: SocketToken, req: ReadRequest) -> Result<(), Error> {
        req.validate()?;
        self.send(Command::Read { token, req })
    }

    /// Queue a write. See [`EngineCtx::write`](crate::EngineCtx::write).
    pub fn write(&self, token: SocketToken, req: WriteRequest) -> Result<(), Error> {
        req.validate()?;
        self.send(Command::Write { token, req })
    }

    /// Queue a TLS upgrade barrier.
    pub fn start_tls(&self, token: SocketToken, req: StartTls) -> Result<(), Error> {
        self.send(Command::StartTls { token, req })
    }

    /// Immediate disconnect: pending operations are dropped without
    /// completion callbacks and one close notice follows.
    pub fn disconnect(&self, token: SocketToken) -> Result<(), Error> {
        self.send(Command::Disconnect(token))
    }

    pub fn disconnect_after_reading(&self, token: SocketToken) -> Result<(), Error> {
        self.send(Command::DisconnectAfter {
            token,
            mode: crate::socket::DisconnectMode::AfterReads,
        })
    }

    pub fn disconnect_after_writing(&self, token: SocketToken) -> Result<(), Error> {
        self.send(Command::DisconnectAfter {
            token,
            mode: crate::socket::DisconnectMode::AfterWrites,
        })
    }

    pub fn disconnect_after_reading_and_writing(&self, token: SocketToken) -> Result<(), Error> {
        self.send(Command::DisconnectAfter {
            token,
            mode: crate::socket::DisconnectMode::AfterBoth,
        })
    }

    /// Associate an opaque value with a socket.
    pub fn set_user_data(&self, token: SocketToken, value: u64) -> Result<(), Error> {
        self.send(Command::SetUserData { token, value })
    }

    /// Signal the loop to shut down gracefully. All sockets are closed
    /// without individual notifications and the loop thread exits.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
    }
}
