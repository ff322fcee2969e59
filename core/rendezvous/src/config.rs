//! Session configuration and the client command-line surface

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::{IdentityError, PeerIdentity};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::session::SessionError;

// ============================================================================
// Constants
// ============================================================================

/// Port assumed when the server address has none
pub const DEFAULT_SERVER_PORT: u16 = 10000;

/// Server used when none is given on the command line
pub const DEFAULT_SERVER_ADDRESS: &str = "localhost:10000";

/// I/O thread tick when nothing wakes it earlier
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a non-blocking connect may stay in progress
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes read from the socket per `read` call
pub const DEFAULT_READ_CHUNK: usize = 4096;

// ============================================================================
// Session Config
// ============================================================================

/// Tuning for a [`crate::SignalingSession`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on the I/O thread sleep between iterations
    pub poll_interval: Duration,
    /// Give up on a connect that has not completed after this long
    pub connect_timeout: Duration,
    /// Outgoing queue bound
    pub queue_capacity: usize,
    /// Socket read size
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

/// Resolve `host[:port]` (or `[v6]:port`), defaulting the port to 10000
pub fn parse_server_address(address: &str) -> Result<SocketAddr, SessionError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(SessionError::AddressResolutionFailed(
            "empty server address".to_string(),
        ));
    }

    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = split_host_port(address)?;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SessionError::AddressResolutionFailed(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| {
            SessionError::AddressResolutionFailed(format!("{}: no addresses", address))
        })
}

fn split_host_port(address: &str) -> Result<(&str, u16), SessionError> {
    let bad_port = |p: &str| {
        SessionError::AddressResolutionFailed(format!("invalid port '{}' in {}", p, address))
    };

    // [v6] or [v6]:port
    if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| {
            SessionError::AddressResolutionFailed(format!("unterminated '[' in {}", address))
        })?;
        let host = &rest[..end];
        return match rest[end + 1..].strip_prefix(':') {
            Some(p) => Ok((host, p.parse().map_err(|_| bad_port(p))?)),
            None => Ok((host, DEFAULT_SERVER_PORT)),
        };
    }

    match address.rsplit_once(':') {
        // Bare IPv6 literal without brackets
        Some((host, _)) if host.contains(':') => Ok((address, DEFAULT_SERVER_PORT)),
        Some((host, p)) => Ok((host, p.parse().map_err(|_| bad_port(p))?)),
        None => Ok((address, DEFAULT_SERVER_PORT)),
    }
}

// ============================================================================
// Client Options
// ============================================================================

/// Options an application hosting the signaling client takes from its
/// command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// `--server <host:port>`
    pub server_address: String,
    /// `--identity-local <id>`
    pub local_identity: Option<PeerIdentity>,
    /// `--identity-remote <id>`
    pub remote_identity: Option<PeerIdentity>,
    /// `--log <path>`
    pub log_path: Option<PathBuf>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            local_identity: None,
            remote_identity: None,
            log_path: None,
        }
    }
}

impl ClientOptions {
    /// Parse from process arguments (`args[0]` is ignored)
    pub fn from_args(args: &[String]) -> Result<Self, OptionsError> {
        let mut opts = ClientOptions::default();
        let mut iter = args.iter().skip(1);

        while let Some(flag) = iter.next() {
            let mut value = || {
                iter.next()
                    .cloned()
                    .ok_or_else(|| OptionsError::MissingValue(flag.clone()))
            };
            match flag.as_str() {
                "--server" => opts.server_address = value()?,
                "--identity-local" => opts.local_identity = Some(parse_identity(flag, value()?)?),
                "--identity-remote" => {
                    opts.remote_identity = Some(parse_identity(flag, value()?)?)
                }
                "--log" => opts.log_path = Some(PathBuf::from(value()?)),
                other => return Err(OptionsError::UnknownFlag(other.to_string())),
            }
        }

        Ok(opts)
    }
}

fn parse_identity(flag: &str, value: String) -> Result<PeerIdentity, OptionsError> {
    PeerIdentity::new(value).map_err(|e| OptionsError::InvalidIdentity(flag.to_string(), e))
}

/// Command-line parsing failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// Flag given without its value
    MissingValue(String),
    /// Flag not recognised
    UnknownFlag(String),
    /// Identity flag with an unusable value
    InvalidIdentity(String, IdentityError),
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsError::MissingValue(flag) => write!(f, "{} requires a value", flag),
            OptionsError::UnknownFlag(flag) => write!(f, "unknown option {}", flag),
            OptionsError::InvalidIdentity(flag, e) => write!(f, "{}: {}", flag, e),
        }
    }
}

impl std::error::Error for OptionsError {}
