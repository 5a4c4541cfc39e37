//! Client configuration.
//!
//! Loading from a file is left to the application; every field has a
//! default, so a partial document deserializes.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default chat server (TLS).
pub const DEFAULT_SERVER: &str = "irc.chat.twitch.tv:6697";
/// Anonymous login accepted by the service for read-only use.
pub const ANONYMOUS_USERNAME: &str = "justinfan12345";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Login name; also the nick the server echoes on our own JOIN/PART.
    pub username: String,
    /// OAuth token. `oauth:` is prepended when missing.
    pub password: Option<String>,
    /// Server address (host:port).
    pub server_addr: String,
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed test servers).
    pub tls_insecure: bool,
    /// Channel ceiling per physical connection.
    pub max_channel_count_per_connection: usize,
    /// Request `twitch.tv/membership` (JOIN/PART of other users).
    pub request_membership_capability: bool,
    /// Install the rate limiter and state trackers on construction.
    pub install_default_mixins: bool,
    pub connection_rate_limits: ConnectionRateLimits,
    /// How long join/part/say/... wait for the server's answer.
    pub request_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
}

/// Limits on how many connections may be in their connect sequence at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionRateLimits {
    pub parallel_connections: usize,
    /// Time a connect slot stays taken after the connection became ready.
    pub release_time_ms: u64,
}

impl Default for ConnectionRateLimits {
    fn default() -> Self {
        Self {
            parallel_connections: 1,
            release_time_ms: 2000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: ANONYMOUS_USERNAME.to_string(),
            password: None,
            server_addr: DEFAULT_SERVER.to_string(),
            tls: true,
            tls_insecure: false,
            max_channel_count_per_connection: 90,
            request_membership_capability: false,
            install_default_mixins: true,
            connection_rate_limits: ConnectionRateLimits::default(),
            request_timeout_ms: 2000,
            ping_interval_secs: 60,
            ping_timeout_secs: 120,
        }
    }
}

impl ClientConfig {
    /// Defaults with a random anonymous `justinfanNNNNN` login.
    pub fn anonymous() -> Self {
        let n: u32 = rand::thread_rng().gen_range(10_000..100_000);
        Self {
            username: format!("justinfan{n}"),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::InvalidConfig("username must not be empty".into()));
        }
        if self.max_channel_count_per_connection == 0 {
            return Err(Error::InvalidConfig(
                "max_channel_count_per_connection must be at least 1".into(),
            ));
        }
        if self.connection_rate_limits.parallel_connections == 0 {
            return Err(Error::InvalidConfig(
                "connection_rate_limits.parallel_connections must be at least 1".into(),
            ));
        }
        if self.request_timeout_ms == 0 || self.ping_interval_secs == 0 || self.ping_timeout_secs == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Lowercased login, compared against the nick in own JOIN/PART echoes.
    pub fn nick(&self) -> String {
        self.username.to_lowercase()
    }

    /// `PASS` argument, if a password is configured.
    pub fn pass_token(&self) -> Option<String> {
        self.password.as_ref().map(|p| {
            if p.starts_with("oauth:") {
                p.clone()
            } else {
                format!("oauth:{p}")
            }
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}
