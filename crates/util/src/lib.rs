pub mod config;

use std::net::SocketAddr;

pub use config::{
    AppConfig, ConfigError, DatabaseConfig, Environment, Secret, TwitchConfig, WorkerConfig,
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const PRODUCTION_BIND_ADDR: &str = "0.0.0.0:8080";

/// Loads environment variables from `.env` when available.
///
/// Missing files are ignored so the function is safe in production builds
/// where dotenv files are not deployed.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Parses an explicit bind address, or picks the default for `environment`.
///
/// Production listens on every interface behind the reverse proxy; development
/// and test stay on loopback and are reached through a tunnel.
pub fn resolve_bind_address(
    value: Option<String>,
    environment: Environment,
) -> Result<SocketAddr, std::net::AddrParseError> {
    match value {
        Some(value) => value.parse(),
        None if environment.is_production() => PRODUCTION_BIND_ADDR.parse(),
        None => DEFAULT_BIND_ADDR.parse(),
    }
}
