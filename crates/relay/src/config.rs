// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool`.

use std::{net::SocketAddr, time::Duration};

const DEV_JWT_SECRET: &str = "parley_local_development_jwt_secret_must_be_32_chars";
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for bearer credentials.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` selects the in-memory gateway.
    pub database_url: Option<String>,
    /// Shared secret for the internal broadcast intake. `None` disables it.
    pub internal_token: Option<String>,
    /// Comma-separated CORS / WebSocket origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `parley_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Interval between server-initiated WebSocket pings.
    pub heartbeat_interval: Duration,
    /// Extra time a peer gets to answer a ping before it is dropped.
    pub heartbeat_timeout: Duration,
    /// How long shutdown waits for open connections to drain.
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLEY_RELAY_HOST` | `0.0.0.0` |
    /// | `PARLEY_RELAY_PORT` | `3000` |
    /// | `PARLEY_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `PARLEY_RELAY_DATABASE_URL` | *(none, in-memory gateway)* |
    /// | `PARLEY_RELAY_INTERNAL_TOKEN` | *(none, intake disabled)* |
    /// | `PARLEY_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `PARLEY_RELAY_LOG_FILTER` | `info` |
    /// | `PARLEY_RELAY_LOG_FORMAT` | `pretty` |
    /// | `PARLEY_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `PARLEY_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `PARLEY_RELAY_SHUTDOWN_GRACE_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PARLEY_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PARLEY_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(3000);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PARLEY_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("PARLEY_RELAY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let internal_token =
            env("PARLEY_RELAY_INTERNAL_TOKEN").ok().filter(|v| !v.trim().is_empty());
        let cors_origins = env("PARLEY_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("PARLEY_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("PARLEY_RELAY_LOG_FORMAT").ok().as_deref() {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let heartbeat_interval_ms = env("PARLEY_RELAY_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        let heartbeat_timeout_ms = env("PARLEY_RELAY_HEARTBEAT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS)
            .min(heartbeat_interval_ms.saturating_sub(1));

        let shutdown_grace_secs = env("PARLEY_RELAY_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            internal_token,
            cors_origins,
            log_filter,
            log_format,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
