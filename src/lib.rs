//! wireline — readiness-driven async socket engine.
//!
//! wireline establishes TCP and Unix-domain connections (active connect
//! with dual-stack IPv4/IPv6 racing, passive listen/accept) and performs
//! queued, tag-identified reads and writes against them with configurable
//! completion conditions, per-operation extendable timeouts, and an
//! in-place TLS upgrade modeled as a queue barrier. One loop thread owns
//! all socket state and drives it from readiness events; your protocol
//! code lives in a [`SocketDelegate`] and reacts to completions.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wireline::{
//!     Config, EngineCtx, ListenRequest, ReadRequest, SocketDelegate, SocketToken,
//!     WirelineBuilder, WriteRequest,
//! };
//!
//! struct Echo;
//!
//! impl SocketDelegate for Echo {
//!     fn on_accept(
//!         &mut self,
//!         ctx: &mut EngineCtx<'_>,
//!         _listener: wireline::ListenerToken,
//!         token: SocketToken,
//!         _peer: Option<std::net::SocketAddr>,
//!     ) {
//!         ctx.read(token, ReadRequest::available(0)).unwrap();
//!     }
//!
//!     fn on_read_complete(
//!         &mut self,
//!         ctx: &mut EngineCtx<'_>,
//!         token: SocketToken,
//!         delivery: wireline::Delivery,
//!     ) {
//!         ctx.write(token, WriteRequest::new(delivery.data, 0)).unwrap();
//!         ctx.read(token, ReadRequest::available(0)).unwrap();
//!     }
//! }
//!
//! fn main() -> Result<(), wireline::Error> {
//!     let (handle, join) = WirelineBuilder::new(Config::default()).launch(Echo)?;
//!     let listener = handle.listen(ListenRequest::port(7878))?;
//!     println!("listening on {:?}", listener.addrs);
//!     join.join().unwrap()
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod connector;
pub(crate) mod delegate;
pub(crate) mod engine;
pub(crate) mod event_loop;
pub(crate) mod operation;
pub(crate) mod socket;
pub(crate) mod timer;
pub(crate) mod tls;

// ── Public modules ──────────────────────────────────────────────────────
pub mod error;
pub mod metrics;

// ── Re-exports: configuration ───────────────────────────────────────────

/// Engine configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Engine-wide TLS client configuration.
pub use config::TlsClientConfig;
/// Engine-wide TLS server configuration.
pub use config::TlsConfig;

// ── Re-exports: engine surface ──────────────────────────────────────────

/// Cross-thread command surface of a running engine.
pub use engine::EngineHandle;
/// Builder for launching an engine.
pub use engine::WirelineBuilder;
/// Context passed to delegate callbacks for issuing operations.
pub use event_loop::EngineCtx;

// ── Re-exports: delegate types ──────────────────────────────────────────

/// Opaque handle for a listening socket.
pub use delegate::ListenerToken;
/// Trait implemented by the embedding protocol code.
pub use delegate::SocketDelegate;
/// Opaque handle for a connected (or connecting) socket.
pub use delegate::SocketToken;

// ── Re-exports: requests and completions ────────────────────────────────

/// Outbound TCP connect request.
pub use connector::ConnectRequest;
/// Outbound Unix-domain connect request.
pub use connector::UnixConnectRequest;
/// Listen request (TCP port + interface, or Unix-domain path).
pub use acceptor::ListenRequest;
/// Result of a successful listen: token plus bound addresses.
pub use acceptor::ListenerHandle;
/// Completion payload of a finished read.
pub use operation::Delivery;
/// Completion condition of a queued read.
pub use operation::ReadKind;
/// A queued read request.
pub use operation::ReadRequest;
/// A queued write request.
pub use operation::WriteRequest;
/// Parameters for an in-place TLS upgrade.
pub use tls::StartTls;

// ── Re-exports: errors ──────────────────────────────────────────────────

/// Engine errors.
pub use error::Error;
