//! Server configuration: limits, timeouts and tuning knobs
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Header flooding and HPACK decompression bombs
//! - Slowloris-style connection starvation
//!
//! Every option can be set in code or overridden from the environment via
//! [`ServerConfig::from_env`]. Invalid values fail fast at startup, before
//! the accept loop binds.
//!
//! # Examples
//!
//! ```
//! use trident_web::config::{ServerConfig, Http2Limits};
//! use std::time::Duration;
//!
//! let config = ServerConfig {
//!     port: 8443,
//!     max_connections: 50_000,
//!     idle_timeout: Duration::from_secs(30),
//!     h2: Http2Limits {
//!         max_concurrent_streams: 512,
//!         ..Http2Limits::default()
//!     },
//!     ..ServerConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::errors::ConfigError;
use std::{env, net::IpAddr, path::PathBuf, time::Duration};

/// Top-level configuration container consumed by the server core.
///
/// Environment variables and CLI flags are acceptable sources; the core only
/// ever sees this container.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening address (default: `0.0.0.0`).
    pub address: IpAddr,
    /// Listening port (default: `8080`).
    pub port: u16,
    /// Static content directory. `None` disables static file serving.
    pub webroot: Option<PathBuf>,
    /// TLS termination. `None` means plaintext only.
    pub tls: Option<TlsLimits>,

    /// Maximum number of simultaneously live connections (default: `50_000`).
    ///
    /// Connections accepted beyond this ceiling are closed immediately with
    /// no response. Rate limiting is the primary admission defense; this is
    /// the crude backstop.
    pub max_connections: usize,
    /// Per-connection idle timeout (default: `60 s`).
    ///
    /// Every blocking read on a connection is bounded by this duration;
    /// expiry closes the connection.
    pub idle_timeout: Duration,
    /// Bound on a single socket write (default: `10 s`).
    pub write_timeout: Duration,
    /// Graceful-shutdown drain period (default: `10 s`).
    pub drain_timeout: Duration,

    /// Bytes at or above which static files take the zero-copy path
    /// (default: `5 MiB`).
    pub zero_copy_threshold: u64,

    /// Buffer pool sizing.
    pub buffer_pool: BufferPoolLimits,
    /// Token-bucket rate limiting.
    pub rate_limit: RateLimitLimits,
    /// HTTP/1.1 parsing bounds.
    pub http1: Http1Limits,
    /// HTTP/2 settings advertised to peers and enforced locally.
    pub h2: Http2Limits,
    /// WebSocket bounds.
    pub ws: WsLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            webroot: None,
            tls: None,

            max_connections: 50_000,
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),

            zero_copy_threshold: 5 * 1024 * 1024,

            buffer_pool: BufferPoolLimits::default(),
            rate_limit: RateLimitLimits::default(),
            http1: Http1Limits::default(),
            h2: Http2Limits::default(),
            ws: WsLimits::default(),
        }
    }
}

macro_rules! env_override {
    ($target:expr, $name:literal, $conv:expr) => {
        if let Ok(raw) = env::var($name) {
            let value = raw
                .parse()
                .map_err(|_| ConfigError::InvalidEnv($name, raw.clone()))?;
            $target = $conv(value);
        }
    };
}

impl ServerConfig {
    /// Builds a configuration from defaults plus `TRIDENT_*` environment
    /// overrides.
    ///
    /// Recognized variables: `TRIDENT_ADDRESS`, `TRIDENT_PORT`,
    /// `TRIDENT_WEBROOT`, `TRIDENT_MAX_CONNECTIONS`,
    /// `TRIDENT_IDLE_TIMEOUT_MS`, `TRIDENT_ZERO_COPY_THRESHOLD`,
    /// `TRIDENT_RATE_CAPACITY`, `TRIDENT_RATE_WINDOW_SECONDS`,
    /// `TRIDENT_RATE_MAX_KEYS`, `TRIDENT_TLS_CERT` + `TRIDENT_TLS_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        env_override!(config.address, "TRIDENT_ADDRESS", |v: IpAddr| v);
        env_override!(config.port, "TRIDENT_PORT", |v: u16| v);
        env_override!(config.webroot, "TRIDENT_WEBROOT", |v: PathBuf| Some(v));
        env_override!(config.max_connections, "TRIDENT_MAX_CONNECTIONS", |v| v);
        env_override!(config.idle_timeout, "TRIDENT_IDLE_TIMEOUT_MS", |v: u64| {
            Duration::from_millis(v)
        });
        env_override!(
            config.zero_copy_threshold,
            "TRIDENT_ZERO_COPY_THRESHOLD",
            |v: u64| v
        );
        env_override!(
            config.rate_limit.capacity,
            "TRIDENT_RATE_CAPACITY",
            |v: f64| v
        );
        env_override!(
            config.rate_limit.window_seconds,
            "TRIDENT_RATE_WINDOW_SECONDS",
            |v: u64| v
        );
        env_override!(config.rate_limit.max_keys, "TRIDENT_RATE_MAX_KEYS", |v| v);

        if let (Ok(cert), Ok(key)) = (env::var("TRIDENT_TLS_CERT"), env::var("TRIDENT_TLS_KEY")) {
            config.tls = Some(TlsLimits {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
                _priv: (),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints. Called by the server builder; a
    /// failure here aborts startup before any socket is bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        if self.buffer_pool.size == 0 {
            return Err(ConfigError::Invalid("buffer_pool.size must be non-zero"));
        }
        if self.rate_limit.capacity < 1.0 || self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit capacity and window must be positive",
            ));
        }
        if self.rate_limit.max_keys == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_keys must be non-zero"));
        }
        if !(16_384..=16_777_215).contains(&self.h2.max_frame_size) {
            return Err(ConfigError::Invalid(
                "h2.max_frame_size must be within [2^14, 2^24 - 1]",
            ));
        }
        if self.h2.initial_window_size > 0x7FFF_FFFF {
            return Err(ConfigError::Invalid(
                "h2.initial_window_size must be below 2^31",
            ));
        }
        if self.ws.max_message_size == 0 {
            return Err(ConfigError::Invalid("ws.max_message_size must be non-zero"));
        }
        Ok(())
    }
}

/// TLS key material locations. Loading and parsing happen at startup; the
/// accept loop only sees the resulting rustls configuration.
#[derive(Debug, Clone)]
pub struct TlsLimits {
    /// PEM certificate chain path.
    pub cert_path: PathBuf,
    /// PEM private key path.
    pub key_path: PathBuf,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl TlsLimits {
    /// Convenience constructor for the common two-path case.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            _priv: (),
        }
    }
}

/// Buffer pool sizing (component C1 of the hot path).
#[derive(Debug, Clone)]
pub struct BufferPoolLimits {
    /// Capacity of each pooled buffer in bytes (default: `8 KiB`).
    pub size: usize,
    /// Maximum number of buffers retained for reuse (default: `1000`).
    ///
    /// This bounds the pool, not outstanding buffers: `acquire` never
    /// blocks, it allocates when the free list is empty.
    pub capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for BufferPoolLimits {
    fn default() -> Self {
        Self {
            size: 8 * 1024,
            capacity: 1000,
            _priv: (),
        }
    }
}

/// Token-bucket request admission.
#[derive(Debug, Clone)]
pub struct RateLimitLimits {
    /// Bucket capacity: burst size and the per-window request budget
    /// (default: `100`).
    pub capacity: f64,
    /// Refill window in seconds; the refill rate is
    /// `capacity / window_seconds` tokens per second (default: `60`).
    pub window_seconds: u64,
    /// Maximum number of tracked keys; least-recently-used keys are evicted
    /// beyond this bound (default: `10_000`).
    pub max_keys: usize,
    /// Peers that bypass the limiter entirely (default: empty).
    pub whitelist: Vec<IpAddr>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RateLimitLimits {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            window_seconds: 60,
            max_keys: 10_000,
            whitelist: Vec::new(),
            _priv: (),
        }
    }
}

/// HTTP/1.1 parsing bounds.
#[derive(Debug, Clone)]
pub struct Http1Limits {
    /// Maximum bytes of request line plus headers (default: `16 KiB`).
    /// Overflow is answered with `431 Request Header Fields Too Large`.
    pub max_header_bytes: usize,
    /// Maximum number of headers per request (default: `100`).
    pub max_headers: usize,
    /// Maximum request body size in bytes (default: `1 MiB`).
    pub max_body_bytes: usize,
    /// Requests served on one keep-alive connection before it is retired
    /// (default: `10_000`).
    pub max_requests_per_connection: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for Http1Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_headers: 100,
            max_body_bytes: 1024 * 1024,
            max_requests_per_connection: 10_000,
            _priv: (),
        }
    }
}

/// HTTP/2 settings advertised in the server's SETTINGS frame and enforced on
/// inbound traffic.
#[derive(Debug, Clone)]
pub struct Http2Limits {
    /// `SETTINGS_MAX_CONCURRENT_STREAMS` advertised to the peer
    /// (default: `256`).
    pub max_concurrent_streams: u32,
    /// `SETTINGS_INITIAL_WINDOW_SIZE`; also the starting window for every
    /// new stream (default: `65_535`).
    pub initial_window_size: u32,
    /// `SETTINGS_MAX_FRAME_SIZE` (default: `16_384`, max `2^24 - 1`).
    pub max_frame_size: u32,
    /// Decoded header list bound; the HPACK-bomb defense
    /// (default: `8 KiB`).
    pub max_header_list_size: u32,
    /// HPACK dynamic table size advertised via
    /// `SETTINGS_HEADER_TABLE_SIZE` (default: `4096`).
    pub header_table_size: u32,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for Http2Limits {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 256,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: 8 * 1024,
            header_table_size: 4096,
            _priv: (),
        }
    }
}

/// WebSocket bounds and timers.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Maximum assembled message size; larger messages close the connection
    /// with code `1009` (default: `64 MiB`).
    pub max_message_size: usize,
    /// How long to wait for the peer's CLOSE reply before force-closing
    /// (default: `30 s`).
    pub close_timeout: Duration,
    /// Server-initiated PING interval; `None` disables keepalive pings
    /// (default: `None`).
    pub ping_interval: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_message_size: 64 << 20,
            close_timeout: Duration::from_secs(30),
            ping_interval: None,
            _priv: (),
        }
    }
}
