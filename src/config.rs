use std::time::Duration;

use url::Url;

use crate::consts::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PORT, DEFAULT_RECONNECT_TIMEOUT,
    DEFAULT_RESPONSE_TIMEOUT,
};
use crate::error::RelinkClientError;

/// Environment variable consulted by the logger for its level.
pub const LOG_LEVEL: &str = "LOG_LEVEL";

/// Client configuration. Fixed at construction; `Client::select` and
/// `Client::auth` update the stored db/password so reconnects redo setup with
/// the new values.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Password sent via `auth` during connection setup, if any.
    pub password: Option<String>,
    /// Database selected via `select` during setup. 0 skips the command.
    pub db: u32,
    /// Backoff delay between a failed connect attempt and the next retry.
    pub reconnect_timeout: Duration,
    /// Failed attempts tolerated before entering the failed state.
    pub max_reconnect_attempts: u32,
    /// Quiet period after which a keepalive ping is sent. `None` disables the
    /// inactivity monitor.
    pub activity_timeout: Option<Duration>,
    /// Window after a keepalive in which traffic must arrive, or the
    /// connection is closed.
    pub response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: 0,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            activity_timeout: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Config {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Parses a `redis://[:password@]host[:port][/db]` URI.
    pub fn from_uri(uri: &str) -> Result<Config, RelinkClientError> {
        let url =
            Url::parse(uri).map_err(|e| RelinkClientError::Config(format!("{}: {}", uri, e)))?;

        if url.scheme() != "redis" {
            return Err(RelinkClientError::Config(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| RelinkClientError::Config("missing host".to_string()))?
            .to_string();

        let password = url
            .password()
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        // An empty path selects database 0.
        let path = url.path().trim_start_matches('/');
        let db = if path.is_empty() {
            0
        } else {
            path.parse::<u32>()
                .map_err(|_| RelinkClientError::Config(format!("invalid db index: {}", path)))?
        };

        Ok(Config {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            password,
            db,
            ..Config::default()
        })
    }
}
