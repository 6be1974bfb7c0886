//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// HS256 secret for credential token verification
    pub jwt_secret: String,
    /// Tokens issued before this Unix timestamp are rejected
    /// (allows invalidating everything issued before a forced rotation)
    pub token_not_before: u64,

    /// Simulation tick interval, reported to every peer in the `state` push
    pub tick_interval: Duration,

    /// How long a memberless session survives before the GC removes it
    pub session_idle_timeout: Duration,
    /// GC probe period; the idle threshold is ceil(timeout / probe)
    pub session_probe_interval: Duration,

    /// Allowed client origins for CORS (comma separated, `*` for any)
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PaaS providers hand out PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            jwt_secret: env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?,

            token_not_before: parse_or("TOKEN_NOT_BEFORE", 0)?,

            tick_interval: Duration::from_millis(parse_or("TICK_INTERVAL_MS", 50)?),

            session_idle_timeout: Duration::from_secs(parse_or(
                "SESSION_IDLE_TIMEOUT_SECS",
                180,
            )?),
            session_probe_interval: Duration::from_secs(parse_or(
                "SESSION_PROBE_INTERVAL_SECS",
                60,
            )?),

            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
        })
    }

    /// Consecutive idle GC probes a memberless session survives
    pub fn session_idle_probes(&self) -> u32 {
        let probe = self.session_probe_interval.as_secs().max(1);
        let timeout = self.session_idle_timeout.as_secs();
        (timeout.div_ceil(probe)).max(1) as u32
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
