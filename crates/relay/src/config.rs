// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Individual modules (DB pool, CORS, etc.) may still read
// their own env vars — this module covers the core server settings.

use std::net::SocketAddr;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string for the collaborator stores. When unset
    /// the relay runs with in-memory stores (development only).
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `atelier_relay=debug`).
    pub log_filter: String,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ATELIER_RELAY_HOST` | `0.0.0.0` |
    /// | `ATELIER_RELAY_PORT` | `8080` |
    /// | `ATELIER_RELAY_DATABASE_URL` | *(none — in-memory stores)* |
    /// | `ATELIER_RELAY_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `ATELIER_RELAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("ATELIER_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("ATELIER_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("ATELIER_RELAY_DATABASE_URL").ok();
        let cors_origins = env("ATELIER_RELAY_CORS_ORIGINS").ok();

        let log_filter =
            env("ATELIER_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, database_url, cors_origins, log_filter }
    }
}
