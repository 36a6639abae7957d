//! Outbound connection establishment.
//!
//! A connect goes through three phases: synchronous validation at the call
//! site, black-box host resolution on a short-lived helper thread, then a
//! non-blocking race with at most one in-flight attempt per enabled address
//! family under one shared deadline. The first attempt to become writable
//! with no pending socket error wins; the loser's descriptor is aborted.
//! Operations submitted while connecting are held in order and replayed into
//! the socket once it is installed.

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Error;
use crate::operation::{ReadRequest, WriteRequest};
use crate::socket::{DisconnectMode, Stream};
use crate::tls::StartTls;

/// An outbound TCP connect request.
pub struct ConnectRequest {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) interface: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) user_data: u64,
}

impl ConnectRequest {
    /// Connect to `host:port`. The host may be a domain name, a literal
    /// address, or `"localhost"`/`"loopback"`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectRequest {
            host: host.into(),
            port,
            interface: None,
            timeout: None,
            user_data: 0,
        }
    }

    /// Bind the local endpoint to an interface, given by name (`"en1"`),
    /// literal address, or `"localhost"`. A trailing `:port` after the last
    /// colon fixes the *local* port (`"en1:8082"`, `":8082"`) — an advanced
    /// option, not to be confused with the remote port.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Shared deadline for the whole connect (resolution + race).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Opaque value associated with the socket, never interpreted.
    pub fn user_data(mut self, value: u64) -> Self {
        self.user_data = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidRequest("empty host"));
        }
        if let Some(spec) = &self.interface {
            parse_interface(spec)?;
        }
        Ok(())
    }
}

/// An outbound Unix-domain connect request.
pub struct UnixConnectRequest {
    pub(crate) path: PathBuf,
    pub(crate) timeout: Option<Duration>,
    pub(crate) user_data: u64,
}

impl UnixConnectRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        UnixConnectRequest {
            path: path.into(),
            timeout: None,
            user_data: 0,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn user_data(mut self, value: u64) -> Self {
        self.user_data = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidRequest("empty socket path"));
        }
        Ok(())
    }
}

/// Parsed interface specifier: which local address to bind per family, plus
/// an optional fixed local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterfaceSpec {
    pub(crate) v4: Option<Ipv4Addr>,
    pub(crate) v6: Option<Ipv6Addr>,
    /// No address restriction (bare `":port"` or no interface at all).
    pub(crate) any: bool,
    pub(crate) port: u16,
}

impl InterfaceSpec {
    pub(crate) fn any() -> Self {
        InterfaceSpec {
            v4: None,
            v6: None,
            any: true,
            port: 0,
        }
    }

    /// Local bind address for an attempt of the given family, if this spec
    /// allows that family.
    pub(crate) fn bind_addr(&self, ipv6: bool) -> Option<SocketAddr> {
        if self.any {
            if self.port == 0 {
                return None; // nothing to pin down
            }
            let ip: IpAddr = if ipv6 {
                Ipv6Addr::UNSPECIFIED.into()
            } else {
                Ipv4Addr::UNSPECIFIED.into()
            };
            return Some(SocketAddr::new(ip, self.port));
        }
        if ipv6 {
            self.v6.map(|ip| SocketAddr::new(ip.into(), self.port))
        } else {
            self.v4.map(|ip| SocketAddr::new(ip.into(), self.port))
        }
    }

    pub(crate) fn allows(&self, ipv6: bool) -> bool {
        self.any || if ipv6 { self.v6.is_some() } else { self.v4.is_some() }
    }
}

/// Parse an interface specifier. The portion after the *last* colon is the
/// local port, except when the whole string is an IPv6 literal.
pub(crate) fn parse_interface(desc: &str) -> Result<InterfaceSpec, Error> {
    let desc = desc.trim();
    if desc.is_empty() {
        return Err(Error::InvalidRequest("empty interface specifier"));
    }
    if let Ok(v6) = desc.parse::<Ipv6Addr>() {
        return Ok(InterfaceSpec {
            v4: None,
            v6: Some(v6),
            any: false,
            port: 0,
        });
    }

    let (name, port) = match desc.rfind(':') {
        Some(i) => {
            let port: u16 = desc[i + 1..]
                .parse()
                .map_err(|_| Error::InvalidRequest("malformed interface port"))?;
            (&desc[..i], port)
        }
        None => (desc, 0),
    };

    if name.is_empty() {
        let mut spec = InterfaceSpec::any();
        spec.port = port;
        return Ok(spec);
    }
    if name.eq_ignore_ascii_case("localhost") || name.eq_ignore_ascii_case("loopback") {
        return Ok(InterfaceSpec {
            v4: Some(Ipv4Addr::LOCALHOST),
            v6: Some(Ipv6Addr::LOCALHOST),
            any: false,
            port,
        });
    }
    if let Ok(v4) = name.parse::<Ipv4Addr>() {
        return Ok(InterfaceSpec {
            v4: Some(v4),
            v6: None,
            any: false,
            port,
        });
    }
    if let Ok(v6) = name.parse::<Ipv6Addr>() {
        return Ok(InterfaceSpec {
            v4: None,
            v6: Some(v6),
            any: false,
            port,
        });
    }

    let (v4, v6) = lookup_interface(name)?;
    Ok(InterfaceSpec {
        v4,
        v6,
        any: false,
        port,
    })
}

/// Resolve an interface name to its first IPv4/IPv6 addresses via
/// getifaddrs(3).
pub(crate) fn lookup_interface(
    name: &str,
) -> Result<(Option<Ipv4Addr>, Option<Ipv6Addr>), Error> {
    let mut v4 = None;
    let mut v6 = None;

    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let mut cursor = ifap;
        while !cursor.is_null() {
            let ifa = &*cursor;
            cursor = ifa.ifa_next;
            if ifa.ifa_name.is_null() || ifa.ifa_addr.is_null() {
                continue;
            }
            if CStr::from_ptr(ifa.ifa_name).to_bytes() != name.as_bytes() {
                continue;
            }
            match (*ifa.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let sa = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    if v4.is_none() {
                        v4 = Some(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)));
                    }
                }
                libc::AF_INET6 => {
                    let sa = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    if v6.is_none() {
                        v6 = Some(Ipv6Addr::from(sa.sin6_addr.s6_addr));
                    }
                }
                _ => {}
            }
        }
        libc::freeifaddrs(ifap);
    }

    if v4.is_none() && v6.is_none() {
        return Err(Error::InvalidRequest("unknown interface"));
    }
    Ok((v4, v6))
}

/// Black-box host → address-list lookup. Runs on a helper thread; the
/// result comes back to the loop as a command.
pub(crate) fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
    if host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("loopback") {
        return Ok(vec![
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port),
        ]);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .collect();
    if addrs.is_empty() {
        return Err(format!("no addresses for {host}"));
    }
    Ok(addrs)
}

/// Operation submitted while the socket was still connecting, replayed in
/// order once it is installed.
pub(crate) enum PendingOp {
    Read(ReadRequest),
    Write(WriteRequest),
    StartTls(StartTls),
    DisconnectAfter(DisconnectMode),
}

/// One attempt lane of the race (a single address family).
struct Lane {
    enabled: bool,
    candidates: Vec<SocketAddr>,
    cursor: usize,
    attempt: Option<mio::net::TcpStream>,
}

impl Lane {
    fn new(enabled: bool) -> Self {
        Lane {
            enabled,
            candidates: Vec::new(),
            cursor: 0,
            attempt: None,
        }
    }

    /// A lane is dead once it has no attempt in flight and no candidates
    /// left to try.
    fn dead(&self) -> bool {
        self.attempt.is_none() && self.cursor >= self.candidates.len()
    }
}

/// Which race registration an event landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RaceLane {
    V4,
    V6,
}

/// What a writability event on an attempt descriptor means.
pub(crate) enum RaceOutcome {
    /// Still connecting (or a failed candidate was replaced by the next).
    Pending,
    /// This race produced a connected stream; both registrations are gone.
    Winner(Stream),
    /// Every lane is exhausted.
    Failed(String),
}

pub(crate) struct ConnectRace {
    pub(crate) host: String,
    local: Option<InterfaceSpec>,
    v4: Lane,
    v6: Lane,
    unix_path: Option<PathBuf>,
    unix_attempt: Option<mio::net::UnixStream>,
    prefer_ipv4: bool,
    /// Still waiting for the resolver thread.
    pub(crate) resolving: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline_seq: u64,
    pub(crate) user_data: u64,
    pub(crate) pending: Vec<PendingOp>,
    last_error: Option<String>,
}

impl ConnectRace {
    pub(crate) fn tcp(
        req: &ConnectRequest,
        ipv4_enabled: bool,
        ipv6_enabled: bool,
        prefer_ipv4: bool,
    ) -> Result<Self, Error> {
        let local = match &req.interface {
            Some(spec) => Some(parse_interface(spec)?),
            None => None,
        };
        Ok(ConnectRace {
            host: req.host.clone(),
            local,
            v4: Lane::new(ipv4_enabled),
            v6: Lane::new(ipv6_enabled),
            unix_path: None,
            unix_attempt: None,
            prefer_ipv4,
            resolving: true,
            timeout: req.timeout,
            deadline_seq: 0,
            user_data: req.user_data,
            pending: Vec::new(),
            last_error: None,
        })
    }

    pub(crate) fn unix(req: &UnixConnectRequest) -> Self {
        ConnectRace {
            host: String::new(),
            local: None,
            v4: Lane::new(false),
            v6: Lane::new(false),
            unix_path: Some(req.path.clone()),
            unix_attempt: None,
            prefer_ipv4: true,
            resolving: false,
            timeout: req.timeout,
            deadline_seq: 0,
            user_data: req.user_data,
            pending: Vec::new(),
            last_error: None,
        }
    }

    pub(crate) fn connect_host(&self) -> Option<String> {
        if self.host.is_empty() {
            None
        } else {
            Some(self.host.clone())
        }
    }

    /// Kick off the Unix-domain attempt.
    pub(crate) fn start_unix(&mut self, registry: &Registry, token: Token) -> Result<(), Error> {
        let path = self.unix_path.clone().expect("unix race");
        let mut stream =
            mio::net::UnixStream::connect(&path).map_err(|e| Error::Connect(e.to_string()))?;
        stream
            .register(registry, token, Interest::WRITABLE)
            .map_err(Error::Io)?;
        self.unix_attempt = Some(stream);
        Ok(())
    }

    /// Install resolved candidates and start one attempt per enabled family
    /// that has any. Errors if no usable candidate remains.
    pub(crate) fn install_candidates(
        &mut self,
        addrs: Vec<SocketAddr>,
        registry: &Registry,
        v4_token: Token,
        v6_token: Token,
    ) -> Result<(), Error> {
        self.resolving = false;
        for addr in addrs {
            match addr {
                SocketAddr::V4(_) if self.v4.enabled && self.lane_allowed(false) => {
                    self.v4.candidates.push(addr)
                }
                SocketAddr::V6(_) if self.v6.enabled && self.lane_allowed(true) => {
                    self.v6.candidates.push(addr)
                }
                _ => {}
            }
        }
        if self.v4.candidates.is_empty() && self.v6.candidates.is_empty() {
            return Err(Error::Connect(format!(
                "no usable addresses for {}",
                self.host
            )));
        }
        self.advance(RaceLane::V4, registry, v4_token);
        self.advance(RaceLane::V6, registry, v6_token);
        if self.v4.dead() && self.v6.dead() {
            return Err(Error::Connect(self.failure_message()));
        }
        Ok(())
    }

    fn lane_allowed(&self, ipv6: bool) -> bool {
        match &self.local {
            Some(spec) => spec.allows(ipv6),
            None => true,
        }
    }

    /// Start the next candidate on a lane, skipping candidates that fail
    /// immediately.
    fn advance(&mut self, lane: RaceLane, registry: &Registry, token: Token) {
        let local = self.local.clone();
        let l = match lane {
            RaceLane::V4 => &mut self.v4,
            RaceLane::V6 => &mut self.v6,
        };
        if l.attempt.is_some() {
            return;
        }
        while l.cursor < l.candidates.len() {
            let addr = l.candidates[l.cursor];
            l.cursor += 1;
            let bind = local
                .as_ref()
                .and_then(|spec| spec.bind_addr(addr.is_ipv6()));
            match tcp_attempt(addr, bind) {
                Ok(mut stream) => {
                    if stream.register(registry, token, Interest::WRITABLE).is_ok() {
                        l.attempt = Some(stream);
                        return;
                    }
                }
                Err(e) => {
                    self.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Handle a writability event on an attempt descriptor.
    pub(crate) fn handle_ready(
        &mut self,
        lane: RaceLane,
        registry: &Registry,
        v4_token: Token,
        v6_token: Token,
    ) -> RaceOutcome {
        if self.unix_path.is_some() {
            return self.handle_unix_ready(registry);
        }

        let attempt_state = {
            let l = match lane {
                RaceLane::V4 => &self.v4,
                RaceLane::V6 => &self.v6,
            };
            match &l.attempt {
                Some(stream) => attempt_status(stream),
                None => return RaceOutcome::Pending,
            }
        };

        match attempt_state {
            AttemptStatus::Connecting => RaceOutcome::Pending,
            AttemptStatus::Failed(e) => {
                self.last_error = Some(e);
                let token = match lane {
                    RaceLane::V4 => v4_token,
                    RaceLane::V6 => v6_token,
                };
                self.drop_attempt(lane, registry);
                self.advance(lane, registry, token);
                if self.v4.dead() && self.v6.dead() {
                    RaceOutcome::Failed(self.failure_message())
                } else {
                    RaceOutcome::Pending
                }
            }
            AttemptStatus::Connected => {
                // Tie-break: if the other family also finished in this poll
                // batch and is the preferred one, it wins instead.
                let mut winner = lane;
                let other = match lane {
                    RaceLane::V4 => RaceLane::V6,
                    RaceLane::V6 => RaceLane::V4,
                };
                if self.other_ready(other) && self.preferred(other, lane) {
                    winner = other;
                }
                let loser = match winner {
                    RaceLane::V4 => RaceLane::V6,
                    RaceLane::V6 => RaceLane::V4,
                };
                self.drop_attempt(loser, registry);
                let mut stream = match winner {
                    RaceLane::V4 => self.v4.attempt.take().expect("winner attempt"),
                    RaceLane::V6 => self.v6.attempt.take().expect("winner attempt"),
                };
                let _ = stream.deregister(registry);
                RaceOutcome::Winner(Stream::Tcp(stream))
            }
        }
    }

    fn handle_unix_ready(&mut self, registry: &Registry) -> RaceOutcome {
        let status = match &self.unix_attempt {
            Some(stream) => match stream.take_error() {
                Ok(Some(e)) => AttemptStatus::Failed(e.to_string()),
                Err(e) => AttemptStatus::Failed(e.to_string()),
                Ok(None) => AttemptStatus::Connected,
            },
            None => return RaceOutcome::Pending,
        };
        match status {
            AttemptStatus::Failed(e) => RaceOutcome::Failed(e),
            _ => {
                let mut stream = self.unix_attempt.take().expect("unix attempt");
                let _ = stream.deregister(registry);
                RaceOutcome::Winner(Stream::Unix(stream))
            }
        }
    }

    fn other_ready(&self, lane: RaceLane) -> bool {
        let l = match lane {
            RaceLane::V4 => &self.v4,
            RaceLane::V6 => &self.v6,
        };
        matches!(
            l.attempt.as_ref().map(attempt_status),
            Some(AttemptStatus::Connected)
        )
    }

    fn preferred(&self, a: RaceLane, over: RaceLane) -> bool {
        match (a, over) {
            (RaceLane::V4, RaceLane::V6) => self.prefer_ipv4,
            (RaceLane::V6, RaceLane::V4) => !self.prefer_ipv4,
            _ => false,
        }
    }

    fn drop_attempt(&mut self, lane: RaceLane, registry: &Registry) {
        let l = match lane {
            RaceLane::V4 => &mut self.v4,
            RaceLane::V6 => &mut self.v6,
        };
        if let Some(mut stream) = l.attempt.take() {
            let _ = stream.deregister(registry);
        }
    }

    /// Abort everything in flight (explicit disconnect, deadline, shutdown).
    pub(crate) fn abort(&mut self, registry: &Registry) {
        self.drop_attempt(RaceLane::V4, registry);
        self.drop_attempt(RaceLane::V6, registry);
        if let Some(mut stream) = self.unix_attempt.take() {
            let _ = stream.deregister(registry);
        }
    }

    fn failure_message(&self) -> String {
        match &self.last_error {
            Some(e) => format!("{}: {}", self.host, e),
            None => format!("{}: all attempts failed", self.host),
        }
    }
}

enum AttemptStatus {
    Connecting,
    Connected,
    Failed(String),
}

/// Classify an in-flight non-blocking connect from its socket state.
fn attempt_status(stream: &mio::net::TcpStream) -> AttemptStatus {
    match stream.take_error() {
        Ok(Some(e)) => return AttemptStatus::Failed(e.to_string()),
        Err(e) => return AttemptStatus::Failed(e.to_string()),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => AttemptStatus::Connected,
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => AttemptStatus::Connecting,
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => AttemptStatus::Connecting,
        Err(e) => AttemptStatus::Failed(e.to_string()),
    }
}

/// Create a non-blocking connect attempt, optionally bound to a local
/// address and port first.
fn tcp_attempt(addr: SocketAddr, bind: Option<SocketAddr>) -> io::Result<mio::net::TcpStream> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(local) = bind {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(mio::net::TcpStream::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_name_port() {
        // ":8082" pins only the local port.
        let spec = parse_interface(":8082").unwrap();
        assert!(spec.any);
        assert_eq!(spec.port, 8082);
    }

    #[test]
    fn parse_literal_v4_with_port() {
        let spec = parse_interface("192.168.4.35:2424").unwrap();
        assert_eq!(spec.v4, Some("192.168.4.35".parse().unwrap()));
        assert_eq!(spec.v6, None);
        assert_eq!(spec.port, 2424);
    }

    #[test]
    fn parse_localhost_covers_both_families() {
        let spec = parse_interface("localhost").unwrap();
        assert_eq!(spec.v4, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(spec.v6, Some(Ipv6Addr::LOCALHOST));
        assert_eq!(spec.port, 0);
    }

    #[test]
    fn parse_bare_v6_literal_is_not_split() {
        let spec = parse_interface("::1").unwrap();
        assert_eq!(spec.v6, Some(Ipv6Addr::LOCALHOST));
        assert_eq!(spec.port, 0);
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(parse_interface("en1:notaport").is_err());
        assert!(parse_interface("").is_err());
    }

    #[test]
    fn resolve_localhost_yields_both_families() {
        let addrs = resolve_host("localhost", 80).unwrap();
        assert!(addrs.iter().any(|a| a.is_ipv4()));
        assert!(addrs.iter().any(|a| a.is_ipv6()));
        assert!(addrs.iter().all(|a| a.port() == 80));
    }

    #[test]
    fn resolve_literal_skips_lookup() {
        let addrs = resolve_host("192.0.2.7", 1234).unwrap();
        assert_eq!(addrs, vec!["192.0.2.7:1234".parse().unwrap()]);
    }

    #[test]
    fn connect_request_validation() {
        assert!(ConnectRequest::new("", 80).validate().is_err());
        assert!(ConnectRequest::new("example.com", 80)
            .interface("bogus:port")
            .validate()
            .is_err());
        assert!(ConnectRequest::new("example.com", 80).validate().is_ok());
    }

    #[test]
    fn lane_bind_addr_per_family() {
        let spec = parse_interface("localhost:9000").unwrap();
        assert_eq!(
            spec.bind_addr(false),
            Some("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(spec.bind_addr(true), Some("[::1]:9000".parse().unwrap()));
        let any = InterfaceSpec::any();
        assert_eq!(any.bind_addr(false), None);
    }
}
