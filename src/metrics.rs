//! Engine runtime metrics.
//!
//! Counters for connection lifecycle, transferred bytes, timeouts, and TLS
//! handshakes. Exposed through metriken's global registry for whatever
//! exposition the embedding application wires up.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "wireline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/connected",
    description = "Total outbound connections established"
)]
pub static CONNECTIONS_CONNECTED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/connect_failures",
    description = "Outbound connects that failed or timed out"
)]
pub static CONNECT_FAILURES: Counter = Counter::new();

#[metric(
    name = "wireline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "wireline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "wireline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Operations ───────────────────────────────────────────────────

#[metric(
    name = "wireline/operations/timeouts",
    description = "Operations that hit their deadline without extension"
)]
pub static OPERATION_TIMEOUTS: Counter = Counter::new();

// ── TLS ──────────────────────────────────────────────────────────

#[metric(
    name = "wireline/tls/handshakes_completed",
    description = "TLS handshakes completed"
)]
pub static TLS_HANDSHAKES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "wireline/tls/handshakes_failed",
    description = "TLS handshakes failed"
)]
pub static TLS_HANDSHAKES_FAILED: Counter = Counter::new();
