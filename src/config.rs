use std::sync::Arc;

/// Engine-wide TLS configuration for inbound upgrades. Pass a pre-built
/// rustls ServerConfig; the user loads certs/keys and configures ALPN etc.
#[derive(Clone)]
pub struct TlsConfig {
    pub server_config: Arc<rustls::ServerConfig>,
}

/// Engine-wide TLS configuration for outbound upgrades. The user configures
/// root certs, ALPN, etc.
#[derive(Clone)]
pub struct TlsClientConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

/// Configuration for a wireline engine.
#[derive(Clone)]
pub struct Config {
    /// Whether outbound connects and listeners may use IPv4.
    pub ipv4_enabled: bool,
    /// Whether outbound connects and listeners may use IPv6.
    pub ipv6_enabled: bool,
    /// Tie-break when both families succeed at effectively the same time.
    pub prefer_ipv4: bool,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Maximum number of concurrent socket slots (established + racing).
    pub max_connections: u32,
    /// Upper bound on a single socket read into the pre-buffer.
    pub read_chunk_size: usize,
    /// Initial capacity for per-socket pre-buffers.
    pub pre_buffer_capacity: usize,
    /// Enable TCP_NODELAY on accepted and outbound connections.
    pub tcp_nodelay: bool,
    /// Capacity of the poll event batch.
    pub event_capacity: usize,
    /// Optional TLS server configuration, used by `start_tls` on accepted
    /// sockets when the call doesn't carry its own.
    pub tls: Option<TlsConfig>,
    /// Optional TLS client configuration, used by `start_tls` on outbound
    /// sockets when the call doesn't carry its own.
    pub tls_client: Option<TlsClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipv4_enabled: true,
            ipv6_enabled: true,
            prefer_ipv4: true,
            backlog: 1024,
            max_connections: 16000,
            read_chunk_size: 16384,
            pre_buffer_capacity: 4096,
            tcp_nodelay: true,
            event_capacity: 1024,
            tls: None,
            tls_client: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if !self.ipv4_enabled && !self.ipv6_enabled {
            return Err(crate::error::Error::InvalidRequest(
                "at least one address family must be enabled",
            ));
        }
        if self.max_connections == 0 || self.max_connections >= (1 << 24) {
            return Err(crate::error::Error::InvalidRequest(
                "max_connections must be > 0 and < 2^24",
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(crate::error::Error::InvalidRequest(
                "read_chunk_size must be > 0",
            ));
        }
        if self.pre_buffer_capacity == 0 {
            return Err(crate::error::Error::InvalidRequest(
                "pre_buffer_capacity must be > 0",
            ));
        }
        if self.event_capacity == 0 {
            return Err(crate::error::Error::InvalidRequest(
                "event_capacity must be > 0",
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use wireline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .max_connections(8000)
///     .tcp_nodelay(true)
///     .read_chunk_size(4096)
///     .prefer_ipv4(false)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Address family settings ──────────────────────────────────────

    /// Enable or disable IPv4 for connects and listeners.
    pub fn ipv4(mut self, enable: bool) -> Self {
        self.config.ipv4_enabled = enable;
        self
    }

    /// Enable or disable IPv6 for connects and listeners.
    pub fn ipv6(mut self, enable: bool) -> Self {
        self.config.ipv6_enabled = enable;
        self
    }

    /// Prefer IPv4 over IPv6 when a connect race ties.
    pub fn prefer_ipv4(mut self, prefer: bool) -> Self {
        self.config.prefer_ipv4 = prefer;
        self
    }

    // ── Connection settings ──────────────────────────────────────────

    /// Set the maximum number of concurrent socket slots.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on all connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    // ── Buffer settings ──────────────────────────────────────────────

    /// Set the upper bound on a single socket read.
    pub fn read_chunk_size(mut self, n: usize) -> Self {
        self.config.read_chunk_size = n;
        self
    }

    /// Set the initial capacity for per-socket pre-buffers.
    pub fn pre_buffer_capacity(mut self, n: usize) -> Self {
        self.config.pre_buffer_capacity = n;
        self
    }

    /// Set the capacity of the poll event batch.
    pub fn event_capacity(mut self, n: usize) -> Self {
        self.config.event_capacity = n;
        self
    }

    // ── TLS settings ─────────────────────────────────────────────────

    /// Set the engine-wide TLS server configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.config.tls = Some(config);
        self
    }

    /// Set the engine-wide TLS client configuration.
    pub fn tls_client(mut self, config: TlsClientConfig) -> Self {
        self.config.tls_client = Some(config);
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_no_families() {
        let result = ConfigBuilder::new().ipv4(false).ipv6(false).build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_chunk() {
        let result = ConfigBuilder::new().read_chunk_size(0).build();
        assert!(result.is_err());
    }
}
