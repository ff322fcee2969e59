//! Relay server configuration
//!
//! ```text
//! rendezvous-server [--listen <addr:port>] [--max-line <bytes>]
//!                   [--max-pending <bytes>] [--metrics <path>] [--log <path>]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rendezvous::config::DEFAULT_SERVER_PORT;

// ============================================================================
// Constants
// ============================================================================

/// Longest line accepted from a client before it is disconnected
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Send buffer per client; oldest frames are dropped beyond this
pub const DEFAULT_MAX_PENDING_BYTES: usize = 16 * DEFAULT_MAX_LINE_LEN;

/// How often the metrics summary is logged
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Server Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_line_len: usize,
    /// Per-client send buffer limit for a destination that is not reading
    pub max_pending_bytes: usize,
    pub stats_interval: Duration,
    /// Prometheus text file rewritten every stats interval and on shutdown
    pub metrics_path: Option<PathBuf>,
    /// Send logs here instead of stderr
    pub log_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            stats_interval: DEFAULT_STATS_INTERVAL,
            metrics_path: None,
            log_path: None,
        }
    }
}

impl ServerConfig {
    /// Parse from process arguments; absent flags keep their defaults
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(listen) = parse_arg(args, "--listen") {
            config.listen_addr = listen
                .parse()
                .map_err(|_| ConfigError::InvalidValue("--listen", listen))?;
        }

        if let Some(max_line) = parse_arg(args, "--max-line") {
            config.max_line_len = match max_line.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidValue("--max-line", max_line)),
            };
        }

        if let Some(max_pending) = parse_arg(args, "--max-pending") {
            config.max_pending_bytes = match max_pending.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidValue("--max-pending", max_pending)),
            };
        }

        config.metrics_path = parse_arg(args, "--metrics").map(PathBuf::from);
        config.log_path = parse_arg(args, "--log").map(PathBuf::from);

        Ok(config)
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Flag value did not parse
    InvalidValue(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(flag, value) => {
                write!(f, "invalid value '{}' for {}", value, flag)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
