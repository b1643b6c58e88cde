use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::RateLimitConfig;
use crate::tariff::{Tariff, TariffUpdate};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub default_tariff: DefaultTariffConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Per-key overrides installed at startup
    #[serde(default)]
    pub tariffs: BTreeMap<String, TariffUpdate>,
}

/// Connection settings for the shared counter store
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "default_backend_enabled")]
    pub enabled: bool,
    /// Full connection URL. Takes precedence over host/port/db/password.
    #[serde(default)]
    pub url: Option<SecretString>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Upper bound for one backend call before it fails over
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_backend_enabled() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_probe_interval_ms() -> u64 {
    5000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: default_backend_enabled(),
            url: None,
            host: default_host(),
            port: default_port(),
            db: 0,
            password: None,
            timeout_ms: default_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl BackendConfig {
    /// The Redis URL to connect to. Contains the password if one is set.
    pub fn connection_url(&self) -> SecretString {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let auth = match &self.password {
            Some(password) => format!(":{}@", password.expose_secret()),
            None => String::new(),
        };
        SecretString::from(format!(
            "redis://{auth}{}:{}/{}",
            self.host, self.port, self.db
        ))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// The tariff of keys without an override. Its rate limits come from
/// `rate_limit`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultTariffConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_tariff_name")]
    pub name: String,
    #[serde(default = "default_tariff_description")]
    pub description: String,
}

fn default_max_tokens() -> u64 {
    50_000
}

fn default_tariff_name() -> String {
    "Default".to_string()
}

fn default_tariff_description() -> String {
    "Default tariff".to_string()
}

impl Default for DefaultTariffConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            name: default_tariff_name(),
            description: default_tariff_description(),
        }
    }
}

fn parse_env<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, Error> {
    match get(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::new(ErrorDetails::Config {
                message: format!("Environment variable `{name}` has invalid value `{raw}`"),
            })
        }),
    }
}

fn parse_env_bool(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>, Error> {
    let Some(raw) = get(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::new(ErrorDetails::Config {
            message: format!("Environment variable `{name}` has invalid boolean value `{raw}`"),
        })),
    }
}

impl BillingConfig {
    /// Read a TOML config file. Missing sections take their defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config: BillingConfig = toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by the variables `get` returns.
    pub fn from_env_with(get: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = BillingConfig::default();
        let backend = &mut config.backend;

        if let Some(url) = get("REDIS_URL").filter(|url| !url.trim().is_empty()) {
            backend.url = Some(SecretString::from(url));
        }
        if let Some(host) = get("REDIS_HOST").filter(|host| !host.trim().is_empty()) {
            backend.host = host;
        }
        if let Some(port) = parse_env(&get, "REDIS_PORT")? {
            backend.port = port;
        }
        if let Some(db) = parse_env(&get, "REDIS_DB")? {
            backend.db = db;
        }
        if let Some(password) = get("REDIS_PASSWORD").filter(|p| !p.is_empty()) {
            backend.password = Some(SecretString::from(password));
        }
        if let Some(enabled) = parse_env_bool(&get, "BILLING_BACKEND_ENABLED")? {
            backend.enabled = enabled;
        }
        if let Some(timeout_ms) = parse_env(&get, "BILLING_BACKEND_TIMEOUT_MS")? {
            backend.timeout_ms = timeout_ms;
        }
        if let Some(probe_interval_ms) = parse_env(&get, "BILLING_PROBE_INTERVAL_MS")? {
            backend.probe_interval_ms = probe_interval_ms;
        }

        if let Some(max_tokens) = parse_env(&get, "DEFAULT_MAX_TOKENS")? {
            config.default_tariff.max_tokens = max_tokens;
        }
        if let Some(requests) = parse_env(&get, "RATE_LIMIT_REQUESTS")? {
            config.rate_limit.requests_per_window = requests;
        }
        if let Some(window) = parse_env(&get, "RATE_LIMIT_WINDOW")? {
            config.rate_limit.window_seconds = window;
        }
        if let Some(enabled) = parse_env_bool(&get, "RATE_LIMIT_ENABLED")? {
            config.rate_limit.enabled = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.backend.timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "backend.timeout_ms must be positive".to_string(),
            }));
        }
        if self.backend.probe_interval_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "backend.probe_interval_ms must be positive".to_string(),
            }));
        }
        self.rate_limit.validate()?;
        self.default_tariff().validate()
    }

    pub fn default_tariff(&self) -> Tariff {
        Tariff {
            name: self.default_tariff.name.clone(),
            max_tokens: self.default_tariff.max_tokens,
            max_requests_per_window: self.rate_limit.requests_per_window,
            window_seconds: self.rate_limit.window_seconds,
            description: self.default_tariff.description.clone(),
        }
    }
}
