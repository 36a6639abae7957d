use std::io;

use thiserror::Error;

/// Errors reported by the wireline engine.
///
/// `InvalidRequest` is returned synchronously from the call site and never
/// changes socket state. Every other variant is connection-fatal and is
/// delivered through exactly one `on_close` notification per socket.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request arguments: empty host, bad interface specifier,
    /// zero-length fixed read, out-of-range buffer offset. Rejected at the
    /// call site with no queue side effect.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// Connection establishment failed: resolution failure, refused,
    /// unreachable, or every race attempt failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// An in-flight operation (or the connect race) exceeded its deadline
    /// and no extension was granted.
    #[error("operation timed out")]
    Timeout,
    /// Socket I/O failed mid-operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// TLS handshake or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// The peer closed the connection before a fixed-length read could be
    /// satisfied.
    #[error("connection closed by peer")]
    Closed,
    /// No free socket slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// The engine has shut down and no longer accepts commands.
    #[error("engine shut down")]
    Shutdown,
}

impl Error {
    /// Whether this error escalates to connection teardown.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidRequest(_))
    }
}
