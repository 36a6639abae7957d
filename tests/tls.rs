//! Integration tests: in-place TLS upgrade over real loopback sockets.
//!
//! The peer side runs blocking rustls over std sockets, so everything the
//! engine sends after `on_secure` is observably ciphertext on the wire —
//! a plain-text peer could not complete these exchanges.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConnection, RootCertStore, ServerConnection};
use wireline::{
    Config, ConnectRequest, Delivery, EngineCtx, Error, ListenRequest, ListenerToken,
    ReadRequest, SocketDelegate, SocketToken, StartTls, TlsClientConfig, TlsConfig,
    WirelineBuilder, WriteRequest,
};

#[derive(Debug, PartialEq, Eq)]
enum Ev {
    Read { tag: u64, data: Vec<u8> },
    Wrote { tag: u64, written: usize },
    Secure,
    Close { error: Option<&'static str> },
}

fn error_label(error: &Error) -> &'static str {
    match error {
        Error::Tls(_) => "tls",
        Error::Timeout => "timeout",
        Error::Closed => "closed",
        _ => "other",
    }
}

fn recv(rx: &Receiver<Ev>) -> Ev {
    rx.recv_timeout(Duration::from_secs(5)).expect("event timed out")
}

fn assert_silent(rx: &Receiver<Ev>) {
    match rx.recv_timeout(Duration::from_millis(300)) {
        Err(_) => {}
        Ok(ev) => panic!("expected silence, got {ev:?}"),
    }
}

struct TestPki {
    server_config: Arc<rustls::ServerConfig>,
    client_config: Arc<rustls::ClientConfig>,
}

fn test_pki() -> TestPki {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate cert");
    let cert: CertificateDer<'static> = signed.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(signed.key_pair.serialize_der().into());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .expect("server config");

    let mut roots = RootCertStore::empty();
    roots.add(cert).expect("add root");
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TestPki {
        server_config: Arc::new(server_config),
        client_config: Arc::new(client_config),
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.max_connections = 64;
    config
}

// ── Server-side upgrade with a queue barrier ────────────────────────

struct TlsServer {
    tx: Sender<Ev>,
}

impl SocketDelegate for TlsServer {
    fn on_accept(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        _listener: ListenerToken,
        token: SocketToken,
        _peer: Option<SocketAddr>,
    ) {
        // Enqueued before the barrier: completes in plain text.
        ctx.read(token, ReadRequest::exact(5, 1)).unwrap();
        ctx.start_tls(token, StartTls::new()).unwrap();
        // Enqueued after the barrier: held until the handshake clears.
        ctx.read(token, ReadRequest::exact(6, 2)).unwrap();
    }

    fn on_read_complete(&mut self, ctx: &mut EngineCtx<'_>, token: SocketToken, d: Delivery) {
        let tag = d.tag;
        let _ = self.tx.send(Ev::Read {
            tag,
            data: d.data.to_vec(),
        });
        if tag == 2 {
            ctx.write(token, WriteRequest::new(&b"ack"[..], 3)).unwrap();
        }
    }

    fn on_write_complete(
        &mut self,
        _ctx: &mut EngineCtx<'_>,
        _token: SocketToken,
        tag: u64,
        written: usize,
    ) {
        let _ = self.tx.send(Ev::Wrote { tag, written });
    }

    fn on_secure(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken) {
        let _ = self.tx.send(Ev::Secure);
    }

    fn on_close(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken, error: Option<Error>) {
        let _ = self.tx.send(Ev::Close {
            error: error.as_ref().map(error_label),
        });
    }
}

#[test]
fn upgrade_barrier_plain_before_secure_after() {
    let pki = test_pki();
    let mut config = test_config();
    config.tls = Some(TlsConfig {
        server_config: pki.server_config.clone(),
    });

    let (tx, rx) = unbounded();
    let (handle, _join) = WirelineBuilder::new(config)
        .launch(TlsServer { tx })
        .expect("launch failed");
    let listener = handle
        .listen(ListenRequest::port(0).interface("127.0.0.1"))
        .unwrap();

    let mut tcp = TcpStream::connect(listener.addrs[0]).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Plain-text bytes for the pre-barrier read, then handshake + secure
    // bytes back to back: the engine must split them at the barrier.
    tcp.write_all(b"plain").unwrap();

    let mut conn = ClientConnection::new(
        pki.client_config.clone(),
        ServerName::try_from("localhost".to_string()).unwrap(),
    )
    .unwrap();
    let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
    tls.write_all(b"secret").unwrap();
    tls.flush().unwrap();

    assert_eq!(recv(&rx), Ev::Read { tag: 1, data: b"plain".to_vec() });
    assert_eq!(recv(&rx), Ev::Secure);
    assert_eq!(recv(&rx), Ev::Read { tag: 2, data: b"secret".to_vec() });
    assert_eq!(recv(&rx), Ev::Wrote { tag: 3, written: 3 });

    // The ack is only readable through the TLS session.
    let mut ack = [0u8; 3];
    tls.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"ack");

    handle.shutdown();
}

// ── Client-side upgrade ─────────────────────────────────────────────

struct TlsClient {
    tx: Sender<Ev>,
}

impl SocketDelegate for TlsClient {
    fn on_connect(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        token: SocketToken,
        result: Result<(), Error>,
    ) {
        assert!(result.is_ok(), "connect failed");
        ctx.write(token, WriteRequest::new(&b"pre"[..], 1)).unwrap();
        ctx.start_tls(token, StartTls::new().server_name("localhost"))
            .unwrap();
        ctx.write(token, WriteRequest::new(&b"ping"[..], 2)).unwrap();
        ctx.read(token, ReadRequest::exact(4, 3)).unwrap();
    }

    fn on_read_complete(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken, d: Delivery) {
        let _ = self.tx.send(Ev::Read {
            tag: d.tag,
            data: d.data.to_vec(),
        });
    }

    fn on_write_complete(
        &mut self,
        _ctx: &mut EngineCtx<'_>,
        _token: SocketToken,
        tag: u64,
        written: usize,
    ) {
        let _ = self.tx.send(Ev::Wrote { tag, written });
    }

    fn on_secure(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken) {
        let _ = self.tx.send(Ev::Secure);
    }

    fn on_close(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken, error: Option<Error>) {
        let _ = self.tx.send(Ev::Close {
            error: error.as_ref().map(error_label),
        });
    }
}

#[test]
fn client_upgrade_after_plain_preamble() {
    let pki = test_pki();
    let server_config = pki.server_config.clone();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut pre = [0u8; 3];
        peer.read_exact(&mut pre).unwrap();
        assert_eq!(&pre, b"pre");

        let mut conn = ServerConnection::new(server_config).unwrap();
        let mut tls = rustls::Stream::new(&mut conn, &mut peer);
        let mut ping = [0u8; 4];
        tls.read_exact(&mut ping).unwrap();
        assert_eq!(&ping, b"ping");
        tls.write_all(b"pong").unwrap();
        tls.flush().unwrap();
        // Hold the socket open until the client has read the answer.
        std::thread::sleep(Duration::from_secs(2));
    });

    let mut config = test_config();
    config.tls_client = Some(TlsClientConfig {
        client_config: pki.client_config.clone(),
    });

    let (tx, rx) = unbounded();
    let (handle, _join) = WirelineBuilder::new(config)
        .launch(TlsClient { tx })
        .expect("launch failed");

    handle
        .connect(ConnectRequest::new("127.0.0.1", port).timeout(Duration::from_secs(5)))
        .unwrap();

    assert_eq!(recv(&rx), Ev::Wrote { tag: 1, written: 3 });
    assert_eq!(recv(&rx), Ev::Secure);
    assert_eq!(recv(&rx), Ev::Wrote { tag: 2, written: 4 });
    assert_eq!(recv(&rx), Ev::Read { tag: 3, data: b"pong".to_vec() });

    handle.shutdown();
}

// ── Handshake failure is connection-fatal ───────────────────────────

struct UntrustingClient {
    tx: Sender<Ev>,
}

impl SocketDelegate for UntrustingClient {
    fn on_connect(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        token: SocketToken,
        result: Result<(), Error>,
    ) {
        assert!(result.is_ok(), "connect failed");
        ctx.start_tls(token, StartTls::new().server_name("localhost"))
            .unwrap();
        ctx.read(token, ReadRequest::available(1)).unwrap();
    }

    fn on_secure(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken) {
        let _ = self.tx.send(Ev::Secure);
    }

    fn on_read_complete(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken, d: Delivery) {
        let _ = self.tx.send(Ev::Read {
            tag: d.tag,
            data: d.data.to_vec(),
        });
    }

    fn on_close(&mut self, _ctx: &mut EngineCtx<'_>, _token: SocketToken, error: Option<Error>) {
        let _ = self.tx.send(Ev::Close {
            error: error.as_ref().map(error_label),
        });
    }
}

#[test]
fn handshake_failure_tears_down_with_security_error() {
    let pki = test_pki();
    let server_config = pki.server_config.clone();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut conn = ServerConnection::new(server_config).unwrap();
        let mut tls = rustls::Stream::new(&mut conn, &mut peer);
        // The client rejects our certificate; this read fails with its alert.
        let mut buf = [0u8; 1];
        let _ = tls.read_exact(&mut buf);
    });

    // Empty root store: nothing is trusted, so verification must fail.
    let untrusting = rustls::ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

    let mut config = test_config();
    config.tls_client = Some(TlsClientConfig {
        client_config: Arc::new(untrusting),
    });

    let (tx, rx) = unbounded();
    let (handle, _join) = WirelineBuilder::new(config)
        .launch(UntrustingClient { tx })
        .expect("launch failed");

    handle
        .connect(ConnectRequest::new("127.0.0.1", port).timeout(Duration::from_secs(5)))
        .unwrap();

    assert_eq!(recv(&rx), Ev::Close { error: Some("tls") });
    // Connection-fatal, reported exactly once, never secure.
    assert_silent(&rx);

    handle.shutdown();
}
