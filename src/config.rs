// ABOUTME: Connection and pool tunables, collected behind a fluent builder
// ABOUTME: Mirrors the documented defaults for host, port, buffering, and pool sizing

use std::time::Duration;

/// Default host a `Config` connects to when none is given.
pub const DEFAULT_HOST: &str = "localhost";
/// Default TCP port.
pub const DEFAULT_PORT: u16 = 7036;
/// Default size of a single blocking/non-blocking socket read.
pub const DEFAULT_RECV_CHUNK_SIZE: usize = 65536;
/// `max_connections = 0` means unbounded; represented internally as this.
pub const UNBOUNDED_CONNECTIONS: u32 = i32::MAX as u32;
/// Default bound on how long `check_pid` waits to acquire `fork_mutex`.
pub const DEFAULT_FORK_MUTEX_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform TCP keepalive tuning, applied via `socket2` when
/// `socket_keepalive` is enabled. `retries` has no effect on platforms
/// (Windows) that don't expose a keepalive probe count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveOptions {
    /// How long the connection must sit idle before the first probe.
    pub idle: Duration,
    /// Interval between probes once idle keepalives have started.
    pub interval: Duration,
    /// Number of unanswered probes before the connection is considered dead.
    pub retries: u32,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

/// Every tunable a `Connection` or `ConnectionPool` needs.
///
/// Construct one with [`Config::builder`], or use the `quick`/`with_password`
/// shortcuts below for the common cases.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub socket_keepalive: bool,
    /// Platform keepalive tuning applied when `socket_keepalive` is set.
    /// `None` falls back to [`KeepaliveOptions::default`].
    pub socket_keepalive_options: Option<KeepaliveOptions>,
    pub recv_chunk_size: usize,
    /// `0` means unbounded (treated as [`UNBOUNDED_CONNECTIONS`]).
    pub max_connections: u32,
    pub fork_mutex_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
            socket_keepalive: false,
            socket_keepalive_options: None,
            recv_chunk_size: DEFAULT_RECV_CHUNK_SIZE,
            max_connections: 0,
            fork_mutex_timeout: DEFAULT_FORK_MUTEX_TIMEOUT,
        }
    }
}

impl Config {
    /// `max_connections`, with the documented `0 -> unbounded` substitution
    /// already applied.
    pub fn effective_max_connections(&self) -> u32 {
        if self.max_connections == 0 {
            UNBOUNDED_CONNECTIONS
        } else {
            self.max_connections
        }
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

/// Fluent builder over [`Config`]: a `Default` start point plus chained
/// `with_*` setters, each consuming and returning `self`.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: Config,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn with_socket_keepalive(mut self, enabled: bool) -> Self {
        self.config.socket_keepalive = enabled;
        self
    }

    pub fn with_socket_keepalive_options(mut self, options: KeepaliveOptions) -> Self {
        self.config.socket_keepalive_options = Some(options);
        self
    }

    pub fn with_recv_chunk_size(mut self, size: usize) -> Self {
        self.config.recv_chunk_size = size;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn with_fork_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.config.fork_mutex_timeout = timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }

    /// One-line construction for the common case: no password, default pool
    /// sizing.
    pub fn quick(host: impl Into<String>, port: u16) -> Config {
        Self::new().with_host(host).with_port(port).build()
    }

    /// As [`ClientBuilder::quick`], with a password for the `auth` handshake.
    pub fn with_password_config(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Config {
        Self::new()
            .with_host(host)
            .with_port(port)
            .with_password(password)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 7036);
        assert_eq!(config.recv_chunk_size, 65536);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.fork_mutex_timeout, Duration::from_secs(5));
        assert_eq!(config.effective_max_connections(), i32::MAX as u32);
        assert!(!config.socket_keepalive);
        assert!(config.socket_keepalive_options.is_none());
    }

    #[test]
    fn keepalive_options_can_be_set_independently_of_the_enable_flag() {
        let options = KeepaliveOptions {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            retries: 4,
        };
        let config = ClientBuilder::new()
            .with_socket_keepalive(true)
            .with_socket_keepalive_options(options)
            .build();
        assert!(config.socket_keepalive);
        assert_eq!(config.socket_keepalive_options, Some(options));
    }

    #[test]
    fn builder_chains_overrides() {
        let config = ClientBuilder::new()
            .with_host("db.internal")
            .with_port(1234)
            .with_password("secret")
            .with_max_connections(8)
            .build();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 1234);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.effective_max_connections(), 8);
    }

    #[test]
    fn quick_sets_host_and_port_only() {
        let config = ClientBuilder::quick("localhost", 7036);
        assert_eq!(config.host, "localhost");
        assert!(config.password.is_none());
    }
}
