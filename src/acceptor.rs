//! Listening sockets.
//!
//! A listen request produces one descriptor per enabled address family (or
//! one Unix-domain descriptor). The listening socket owns no operation
//! queues; each accepted connection becomes a new, independent socket
//! already in the connected state.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::connector::{parse_interface, InterfaceSpec};
use crate::delegate::ListenerToken;
use crate::error::Error;

/// A listen request: TCP port (0 = let the OS choose) with an optional
/// interface restriction, or a Unix-domain socket path.
pub struct ListenRequest {
    pub(crate) port: u16,
    pub(crate) interface: Option<String>,
    pub(crate) unix_path: Option<PathBuf>,
}

impl ListenRequest {
    /// Listen on the given TCP port across all enabled families and
    /// interfaces.
    pub fn port(port: u16) -> Self {
        ListenRequest {
            port,
            interface: None,
            unix_path: None,
        }
    }

    /// Listen on a Unix-domain socket path.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ListenRequest {
            port: 0,
            interface: None,
            unix_path: Some(path.into()),
        }
    }

    /// Restrict to an interface, by name (`"en1"`, `"lo0"`), literal
    /// address, or `"localhost"`/`"loopback"`.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

/// The outcome of a successful listen: the token accepted sockets will be
/// attributed to, and the bound addresses (one per family; empty for
/// Unix-domain listeners).
pub struct ListenerHandle {
    pub token: ListenerToken,
    pub addrs: Vec<SocketAddr>,
}

pub(crate) enum ListenerSocket {
    Tcp(mio::net::TcpListener),
    Unix(mio::net::UnixListener),
}

pub(crate) struct BoundListener {
    pub(crate) socket: ListenerSocket,
    pub(crate) addr: Option<SocketAddr>,
}

impl BoundListener {
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match &mut self.socket {
            ListenerSocket::Tcp(l) => l.register(registry, token, Interest::READABLE),
            ListenerSocket::Unix(l) => l.register(registry, token, Interest::READABLE),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        match &mut self.socket {
            ListenerSocket::Tcp(l) => {
                let _ = l.deregister(registry);
            }
            ListenerSocket::Unix(l) => {
                let _ = l.deregister(registry);
            }
        }
    }

    /// Accept one pending connection, or `None` once the backlog is empty.
    pub(crate) fn accept(&mut self, tcp_nodelay: bool) -> io::Result<Option<Accepted>> {
        loop {
            match &mut self.socket {
                ListenerSocket::Tcp(l) => match l.accept() {
                    Ok((stream, peer)) => {
                        if tcp_nodelay {
                            let _ = stream.set_nodelay(true);
                        }
                        return Ok(Some(Accepted::Tcp(stream, peer)));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
                ListenerSocket::Unix(l) => match l.accept() {
                    Ok((stream, _)) => return Ok(Some(Accepted::Unix(stream))),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

pub(crate) enum Accepted {
    Tcp(mio::net::TcpStream, SocketAddr),
    Unix(mio::net::UnixStream),
}

/// Bind one listener per enabled family. When the OS picks the port
/// (`port == 0`), the port learned from the first family is reused for the
/// second so the listener is reachable at one number on both.
pub(crate) fn bind_listeners(
    config: &Config,
    req: &ListenRequest,
) -> Result<Vec<BoundListener>, Error> {
    if let Some(path) = &req.unix_path {
        let listener =
            mio::net::UnixListener::bind(path).map_err(Error::Io)?;
        return Ok(vec![BoundListener {
            socket: ListenerSocket::Unix(listener),
            addr: None,
        }]);
    }

    let spec = match &req.interface {
        Some(desc) => parse_interface(desc)?,
        None => InterfaceSpec::any(),
    };

    let mut out = Vec::new();
    let mut last_err: Option<io::Error> = None;
    let mut port = req.port;

    if config.ipv4_enabled && spec.allows(false) {
        let ip = spec.v4.unwrap_or(Ipv4Addr::UNSPECIFIED);
        match bind_tcp(SocketAddr::new(ip.into(), port), config.backlog) {
            Ok(listener) => {
                if port == 0 {
                    if let Ok(addr) = listener.local_addr() {
                        port = addr.port();
                    }
                }
                let addr = listener.local_addr().ok();
                out.push(BoundListener {
                    socket: ListenerSocket::Tcp(listener),
                    addr,
                });
            }
            Err(e) => last_err = Some(e),
        }
    }
    if config.ipv6_enabled && spec.allows(true) {
        let ip = spec.v6.unwrap_or(Ipv6Addr::UNSPECIFIED);
        match bind_tcp(SocketAddr::new(ip.into(), port), config.backlog) {
            Ok(listener) => {
                let addr = listener.local_addr().ok();
                out.push(BoundListener {
                    socket: ListenerSocket::Tcp(listener),
                    addr,
                });
            }
            Err(e) => last_err = Some(e),
        }
    }

    if out.is_empty() {
        return Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::InvalidRequest("interface allows no enabled family"),
        });
    }
    Ok(out)
}

/// SO_REUSEADDR, IPV6_V6ONLY for the v6 descriptor (each family gets its
/// own socket), non-blocking.
fn bind_tcp(addr: SocketAddr, backlog: i32) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn dual_stack_shares_one_port() {
        let config = Config::default();
        let listeners = bind_listeners(&config, &ListenRequest::port(0)).unwrap();
        assert!(!listeners.is_empty());
        // Hosts without IPv6 yield just the v4 descriptor.
        if listeners.len() == 2 {
            let ports: Vec<u16> = listeners
                .iter()
                .map(|l| l.addr.expect("tcp listener has addr").port())
                .collect();
            assert_eq!(ports[0], ports[1], "families must share the chosen port");
        }
    }

    #[test]
    fn interface_restricts_family() {
        let config = Config::default();
        let listeners =
            bind_listeners(&config, &ListenRequest::port(0).interface("127.0.0.1")).unwrap();
        assert_eq!(listeners.len(), 1);
        assert!(listeners[0].addr.unwrap().is_ipv4());
    }

    #[test]
    fn disabled_family_is_skipped() {
        let mut config = Config::default();
        config.ipv6_enabled = false;
        let listeners = bind_listeners(&config, &ListenRequest::port(0)).unwrap();
        assert_eq!(listeners.len(), 1);
        assert!(listeners[0].addr.unwrap().is_ipv4());
    }

    #[test]
    fn accepted_socket_is_independent() {
        let config = Config::default();
        let mut listeners =
            bind_listeners(&config, &ListenRequest::port(0).interface("127.0.0.1")).unwrap();
        let addr = listeners[0].addr.unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let accepted = listeners[0].accept(true).unwrap();
        assert!(matches!(accepted, Some(Accepted::Tcp(_, _))));
        // Backlog drained.
        assert!(listeners[0].accept(true).unwrap().is_none());
    }
}
