//! Runtime configuration from environment variables.
//!
//! Every knob has a compiled-in default and a `WARREN_*` override, the
//! same shape the rest of the stack uses for deployment configuration.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP listen address for TLS sessions.
pub const DEFAULT_TCP_ADDR: &str = "0.0.0.0:4433";

/// Default UDP listen address for address-discovery datagrams.
pub const DEFAULT_UDP_ADDR: &str = "0.0.0.0:4434";

/// Maximum number of concurrent daemon sessions.
pub const MAX_SESSIONS: usize = 10_000;

/// Runtime configuration for the tracker daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// TLS-TCP listen address.
    pub tcp_addr: SocketAddr,
    /// UDP listen address for punch datagrams.
    pub udp_addr: SocketAddr,
    /// Server certificate chain, PEM.
    pub cert_path: PathBuf,
    /// Server private key, PEM.
    pub key_path: PathBuf,
    /// Send a synthetic keepalive if nothing was transmitted for this long.
    pub ping_interval: Duration,
    /// Force-close a session if nothing was received for this long.
    pub pong_interval: Duration,
    /// Time a punch pair may stay incomplete before the sweeper drops it.
    pub pair_ttl: Duration,
    /// Maximum concurrent sessions; accepts past this are closed immediately.
    pub max_sessions: usize,
    /// Sender address used for account-bootstrap mail.
    pub mail_from: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

impl Config {
    /// Builds a configuration from the environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            tcp_addr: parse_addr("WARREN_TCP_ADDR", DEFAULT_TCP_ADDR)?,
            udp_addr: parse_addr("WARREN_UDP_ADDR", DEFAULT_UDP_ADDR)?,
            cert_path: env::var("WARREN_CERT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/etc/warren/cert.pem")),
            key_path: env::var("WARREN_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/etc/warren/key.pem")),
            ping_interval: parse_secs("WARREN_PING_SECS", 30)?,
            pong_interval: parse_secs("WARREN_PONG_SECS", 90)?,
            pair_ttl: parse_secs("WARREN_PAIR_TTL_SECS", 10)?,
            max_sessions: parse_usize("WARREN_MAX_SESSIONS", MAX_SESSIONS)?,
            mail_from: env::var("WARREN_MAIL_FROM")
                .unwrap_or_else(|_| "tracker@warren.invalid".to_string()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_addr: fallback_addr(DEFAULT_TCP_ADDR),
            udp_addr: fallback_addr(DEFAULT_UDP_ADDR),
            cert_path: PathBuf::from("/etc/warren/cert.pem"),
            key_path: PathBuf::from("/etc/warren/key.pem"),
            ping_interval: Duration::from_secs(30),
            pong_interval: Duration::from_secs(90),
            pair_ttl: Duration::from_secs(10),
            max_sessions: MAX_SESSIONS,
            mail_from: "tracker@warren.invalid".to_string(),
        }
    }
}

fn fallback_addr(default: &'static str) -> SocketAddr {
    default
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 4433)))
}

fn parse_addr(var: &'static str, default: &'static str) -> Result<SocketAddr, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(fallback_addr(default)),
    }
}

fn parse_secs(var: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn parse_usize(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
