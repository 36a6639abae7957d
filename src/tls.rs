//! TLS sessions and the handshake/record pump.
//!
//! The engine treats rustls as a synchronous-feeling provider over the raw
//! byte channel: ciphertext read off the socket is absorbed here, plaintext
//! comes out into the pre-buffer, and pending ciphertext output is flushed
//! back to the socket on writability. The socket state machine decides when
//! to pump; nothing here touches a descriptor directly.

use std::io::{self, Read as _};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};

use crate::buffer::ReadBuffer;
use crate::error::Error;

/// Parameters for an in-place TLS upgrade.
///
/// The upgrade is queued as a barrier across both directions: operations
/// enqueued before it complete in plain text, operations enqueued after it
/// are held until the handshake clears. The side (client vs. server) follows
/// the socket's origin: accepted sockets handshake as servers, outbound
/// sockets as clients.
#[derive(Default, Clone)]
pub struct StartTls {
    pub(crate) server_name: Option<String>,
    pub(crate) client_config: Option<Arc<rustls::ClientConfig>>,
    pub(crate) server_config: Option<Arc<rustls::ServerConfig>>,
}

impl StartTls {
    pub fn new() -> Self {
        Self::default()
    }

    /// SNI name for a client-side handshake. Defaults to the host the
    /// socket was connected to.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Per-call client config, overriding the engine-wide one.
    pub fn client_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.client_config = Some(config);
        self
    }

    /// Per-call server config, overriding the engine-wide one.
    pub fn server_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.server_config = Some(config);
        self
    }
}

/// TLS session kind — server (accepted socket) or client (outbound socket).
pub(crate) enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    pub(crate) fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, Error> {
        Ok(TlsSession::Client(ClientConnection::new(
            config,
            server_name,
        )?))
    }

    pub(crate) fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        Ok(TlsSession::Server(ServerConnection::new(config)?))
    }

    pub(crate) fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.read_tls(rd),
            TlsSession::Client(c) => c.read_tls(rd),
        }
    }

    pub(crate) fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.write_tls(wr),
            TlsSession::Client(c) => c.write_tls(wr),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(c) => c.process_new_packets(),
            TlsSession::Client(c) => c.process_new_packets(),
        }
    }

    pub(crate) fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(c) => c.reader(),
            TlsSession::Client(c) => c.reader(),
        }
    }

    pub(crate) fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(c) => c.writer(),
            TlsSession::Client(c) => c.writer(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.wants_write(),
            TlsSession::Client(c) => c.wants_write(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.is_handshaking(),
            TlsSession::Client(c) => c.is_handshaking(),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(c) => c.send_close_notify(),
            TlsSession::Client(c) => c.send_close_notify(),
        }
    }
}

/// Result of absorbing a slice of ciphertext into a session.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Absorb {
    /// Ciphertext processed; handshake may still be in progress.
    Progress,
    /// The handshake just completed with this input.
    HandshakeComplete,
    /// The peer sent close_notify.
    PeerClosed,
}

/// Feed ciphertext into the session and drain any resulting plaintext into
/// `plain_out`. `scratch` is a reusable decrypt buffer.
pub(crate) fn absorb_ciphertext(
    session: &mut TlsSession,
    ciphertext: &[u8],
    plain_out: &mut ReadBuffer,
    scratch: &mut [u8],
) -> Result<Absorb, Error> {
    let was_handshaking = session.is_handshaking();
    let mut cursor = io::Cursor::new(ciphertext);
    let mut peer_closed = false;

    loop {
        if (cursor.position() as usize) < ciphertext.len() {
            // A full deframe buffer can make read_tls take less than
            // everything offered; process and come back for the rest.
            if session.read_tls(&mut cursor)? == 0 {
                break;
            }
        }

        let state = session.process_new_packets()?;

        if state.plaintext_bytes_to_read() > 0 {
            loop {
                match session.reader().read(scratch) {
                    Ok(0) => break,
                    Ok(n) => plain_out.append(&scratch[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }

        if state.peer_has_closed() {
            peer_closed = true;
        }

        if (cursor.position() as usize) >= ciphertext.len() {
            break;
        }
    }

    if peer_closed {
        return Ok(Absorb::PeerClosed);
    }
    if was_handshaking && !session.is_handshaking() {
        return Ok(Absorb::HandshakeComplete);
    }
    Ok(Absorb::Progress)
}

/// Flush pending ciphertext to `wr`. Returns `true` when nothing is left
/// pending, `false` when the sink would block.
pub(crate) fn flush_ciphertext(
    session: &mut TlsSession,
    wr: &mut dyn io::Write,
) -> io::Result<bool> {
    while session.wants_write() {
        match session.write_tls(wr) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "TLS sink accepted no bytes",
                ));
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn test_pair() -> (TlsSession, TlsSession) {
        let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate cert");
        let cert_der = signed.cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
            signed.key_pair.serialize_der().into(),
        );

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .expect("server config");

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).expect("add root");
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let client = TlsSession::client(
            Arc::new(client_config),
            ServerName::try_from("localhost".to_string()).unwrap(),
        )
        .unwrap();
        let server = TlsSession::server(Arc::new(server_config)).unwrap();
        (client, server)
    }

    /// Shuttle pending ciphertext from `from` into `to`.
    fn shuttle(
        from: &mut TlsSession,
        to: &mut TlsSession,
        plain_out: &mut ReadBuffer,
        scratch: &mut [u8],
    ) -> Absorb {
        let mut wire = Vec::new();
        flush_ciphertext(from, &mut wire).unwrap();
        absorb_ciphertext(to, &wire, plain_out, scratch).unwrap()
    }

    #[test]
    fn handshake_and_data_pump_in_memory() {
        let (mut client, mut server) = test_pair();
        let mut client_plain = ReadBuffer::new(4096);
        let mut server_plain = ReadBuffer::new(4096);
        let mut scratch = vec![0u8; 4096];

        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..10 {
            if shuttle(&mut client, &mut server, &mut server_plain, &mut scratch)
                == Absorb::HandshakeComplete
            {
                server_done = true;
            }
            if shuttle(&mut server, &mut client, &mut client_plain, &mut scratch)
                == Absorb::HandshakeComplete
            {
                client_done = true;
            }
            if client_done && server_done {
                break;
            }
        }
        assert!(client_done && server_done, "handshake did not converge");

        // Application data in both directions.
        client.writer().write_all(b"ping").unwrap();
        shuttle(&mut client, &mut server, &mut server_plain, &mut scratch);
        assert_eq!(server_plain.data(), b"ping");

        server.writer().write_all(b"pong").unwrap();
        shuttle(&mut server, &mut client, &mut client_plain, &mut scratch);
        assert_eq!(client_plain.data(), b"pong");
    }

    #[test]
    fn close_notify_is_reported() {
        let (mut client, mut server) = test_pair();
        let mut sink = ReadBuffer::new(4096);
        let mut scratch = vec![0u8; 4096];

        for _ in 0..10 {
            let a = shuttle(&mut client, &mut server, &mut sink, &mut scratch);
            let b = shuttle(&mut server, &mut client, &mut sink, &mut scratch);
            if a == Absorb::HandshakeComplete || b == Absorb::HandshakeComplete {
                break;
            }
        }

        client.send_close_notify();
        let outcome = shuttle(&mut client, &mut server, &mut sink, &mut scratch);
        assert_eq!(outcome, Absorb::PeerClosed);
    }
}
