use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::resolve_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://eventsub.db";
const DEFAULT_PUBLIC_URL: &str = "https://eventsub.sogebot.xyz";
const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2/";
const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv/helix/";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// String value that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Connection settings for the relational store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_attempts: u32,
    pub retry_backoff: Duration,
}

/// Credentials and endpoints for the identity provider and the EventSub API.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: Secret,
    pub webhook_secret: Secret,
    pub oauth_base_url: Url,
    pub helix_base_url: Url,
    pub callback_url: Url,
}

/// Cadence and limits of the background workers and the long-poll endpoint.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub event_retention: Duration,
    pub retention_sweep_interval: Duration,
    pub poll_refresh_interval: Duration,
    pub long_poll_timeout: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_max_concurrency: usize,
    pub reconcile_slot_hold: Duration,
    pub reconcile_full_scan_every: u32,
    pub dev_user_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            event_retention: Duration::from_secs(86_400),
            retention_sweep_interval: Duration::from_secs(3_600),
            poll_refresh_interval: Duration::from_secs(2),
            long_poll_timeout: Duration::from_secs(105),
            reconcile_interval: Duration::from_secs(60),
            reconcile_max_concurrency: 10,
            reconcile_slot_hold: Duration::from_millis(500),
            reconcile_full_scan_every: 60,
            dev_user_id: None,
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub twitch: TwitchConfig,
    pub workers: WorkerConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let env_value = vars
            .get("APP_ENV")
            .unwrap_or_else(|| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = resolve_bind_address(vars.get("APP_BIND_ADDR"), environment)
            .map_err(ConfigError::BindAddress)?;

        let database = DatabaseConfig {
            url: vars
                .get("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            connect_attempts: vars.number("DB_CONNECT_ATTEMPTS", 5u32)?.max(1),
            retry_backoff: Duration::from_millis(vars.number("DB_RETRY_BACKOFF_MS", 2_000u64)?),
        };

        let webhook_secret = vars.required("TWITCH_EVENTSUB_SECRET")?;
        if !(10..=100).contains(&webhook_secret.len()) {
            return Err(ConfigError::InvalidSecret {
                var: "TWITCH_EVENTSUB_SECRET",
                reason: "must be between 10 and 100 bytes",
            });
        }

        // Development runs behind a tunnel whose address changes every start.
        let public_url = match vars.get("EVENTSUB_PUBLIC_URL") {
            Some(value) => value,
            None if environment.is_development() => {
                return Err(ConfigError::MissingVar("EVENTSUB_PUBLIC_URL"))
            }
            None => DEFAULT_PUBLIC_URL.to_string(),
        };
        let public_url = vars.url_value("EVENTSUB_PUBLIC_URL", &public_url)?;
        let callback_url = public_url
            .join("callback")
            .map_err(|source| ConfigError::InvalidUrl {
                var: "EVENTSUB_PUBLIC_URL",
                source,
            })?;

        let twitch = TwitchConfig {
            client_id: vars.required("TWITCH_EVENTSUB_CLIENTID")?,
            client_secret: Secret::new(vars.required("TWITCH_EVENTSUB_CLIENTSECRET")?),
            webhook_secret: Secret::new(webhook_secret),
            oauth_base_url: vars.url("TWITCH_OAUTH_BASE_URL", DEFAULT_OAUTH_BASE_URL)?,
            helix_base_url: vars.url("TWITCH_HELIX_BASE_URL", DEFAULT_HELIX_BASE_URL)?,
            callback_url,
        };

        let defaults = WorkerConfig::default();
        let workers = WorkerConfig {
            event_retention: vars.seconds("EVENT_RETENTION_SECS", defaults.event_retention)?,
            retention_sweep_interval: vars.tick(
                "RETENTION_SWEEP_INTERVAL_SECS",
                defaults.retention_sweep_interval,
            )?,
            poll_refresh_interval: vars
                .tick("POLL_REFRESH_INTERVAL_SECS", defaults.poll_refresh_interval)?,
            long_poll_timeout: vars.seconds("LONG_POLL_TIMEOUT_SECS", defaults.long_poll_timeout)?,
            reconcile_interval: vars
                .seconds("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            reconcile_max_concurrency: vars
                .number("RECONCILE_MAX_CONCURRENCY", defaults.reconcile_max_concurrency)?
                .max(1),
            reconcile_slot_hold: Duration::from_millis(vars.number(
                "RECONCILE_SLOT_HOLD_MS",
                defaults.reconcile_slot_hold.as_millis() as u64,
            )?),
            reconcile_full_scan_every: vars
                .number("RECONCILE_FULL_SCAN_EVERY", defaults.reconcile_full_scan_every)?
                .max(1),
            dev_user_id: vars
                .get("DEV_USER_ID")
                .filter(|_| environment.is_development()),
        };

        Ok(Self {
            bind_addr,
            environment,
            database,
            twitch,
            workers,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingVar(key))
    }

    fn number<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
    {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber { var: key, value }),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.number(key, default.as_secs()).map(Duration::from_secs)
    }

    /// Like [`Vars::seconds`], but a worker tick period must be non-zero.
    fn tick(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let period = self.seconds(key, default)?;
        if period.is_zero() {
            return Err(ConfigError::InvalidNumber {
                var: key,
                value: "0".to_string(),
            });
        }
        Ok(period)
    }

    fn url(&self, key: &'static str, default: &str) -> Result<Url, ConfigError> {
        let value = self.get(key).unwrap_or_else(|| default.to_string());
        self.url_value(key, &value)
    }

    /// Parses a base URL, forcing a trailing slash so `Url::join` appends.
    fn url_value(&self, key: &'static str, value: &str) -> Result<Url, ConfigError> {
        let normalized = if value.ends_with('/') {
            value.to_string()
        } else {
            format!("{value}/")
        };
        Url::parse(&normalized).map_err(|source| ConfigError::InvalidUrl { var: key, source })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidNumber {
        var: &'static str,
        value: String,
    },
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    InvalidSecret {
        var: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(var) => write!(f, "{var} must be set"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a non-negative integer (got {value})")
            }
            Self::InvalidUrl { var, source } => write!(f, "invalid {var} value: {source}"),
            Self::InvalidSecret { var, reason } => write!(f, "{var} {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindAddress(err) => Some(err),
            Self::InvalidUrl { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BIND_ADDR;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("TWITCH_EVENTSUB_CLIENTID", "client"),
            ("TWITCH_EVENTSUB_CLIENTSECRET", "client-secret"),
            ("TWITCH_EVENTSUB_SECRET", "0123456789abcdef"),
            ("EVENTSUB_PUBLIC_URL", "https://tunnel.example.com"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| vars.get(key).map(|value| value.to_string()))
    }

    #[test]
    fn loads_defaults_in_development() {
        let config = load(&base_vars()).expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.workers.long_poll_timeout, Duration::from_secs(105));
        assert_eq!(config.workers.reconcile_max_concurrency, 10);
        assert_eq!(
            config.twitch.callback_url.as_str(),
            "https://tunnel.example.com/callback"
        );
    }

    #[test]
    fn rejects_invalid_environment() {
        let mut vars = base_vars();
        vars.insert("APP_ENV", "invalid");

        let err = load(&vars).expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));
    }

    #[test]
    fn parses_production_environment() {
        let mut vars = base_vars();
        vars.remove("EVENTSUB_PUBLIC_URL");
        vars.insert("APP_ENV", "production");
        vars.insert("DEV_USER_ID", "96965261");

        let config = load(&vars).expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(
            config.twitch.callback_url.as_str(),
            "https://eventsub.sogebot.xyz/callback"
        );
        assert!(config.workers.dev_user_id.is_none());
    }

    #[test]
    fn development_requires_tunnel_url() {
        let mut vars = base_vars();
        vars.remove("EVENTSUB_PUBLIC_URL");

        let err = load(&vars).expect_err("missing tunnel url should error");
        assert!(matches!(err, ConfigError::MissingVar("EVENTSUB_PUBLIC_URL")));
    }

    #[test]
    fn rejects_short_webhook_secret() {
        let mut vars = base_vars();
        vars.insert("TWITCH_EVENTSUB_SECRET", "short");

        let err = load(&vars).expect_err("short secret should error");
        assert!(matches!(
            err,
            ConfigError::InvalidSecret {
                var: "TWITCH_EVENTSUB_SECRET",
                ..
            }
        ));
    }

    #[test]
    fn reads_worker_overrides() {
        let mut vars = base_vars();
        vars.insert("EVENT_RETENTION_SECS", "3600");
        vars.insert("RECONCILE_MAX_CONCURRENCY", "0");
        vars.insert("DEV_USER_ID", "96965261");

        let config = load(&vars).expect("config should load");
        assert_eq!(config.workers.event_retention, Duration::from_secs(3600));
        assert_eq!(config.workers.reconcile_max_concurrency, 1);
        assert_eq!(config.workers.dev_user_id.as_deref(), Some("96965261"));
    }

    #[test]
    fn rejects_non_numeric_interval() {
        let mut vars = base_vars();
        vars.insert("LONG_POLL_TIMEOUT_SECS", "soon");

        let err = load(&vars).expect_err("bad number should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                var: "LONG_POLL_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_tick_intervals() {
        for var in ["POLL_REFRESH_INTERVAL_SECS", "RETENTION_SWEEP_INTERVAL_SECS"] {
            let mut vars = base_vars();
            vars.insert(var, "0");

            let err = load(&vars).expect_err("zero interval should error");
            assert!(
                matches!(err, ConfigError::InvalidNumber { var: rejected, .. } if rejected == var),
                "{var}"
            );
        }

        let mut vars = base_vars();
        vars.insert("POLL_REFRESH_INTERVAL_SECS", "1");
        let config = load(&vars).expect("one second is accepted");
        assert_eq!(config.workers.poll_refresh_interval, Duration::from_secs(1));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let config = load(&base_vars()).expect("config should load");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("0123456789abcdef"));
        assert!(!rendered.contains("client-secret"));
    }
}
