use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// Configuration for per-key request throttling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Requests admitted per window for keys on the default tariff
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    /// Window length in seconds for keys on the default tariff
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_window() -> u32 {
    30
}

fn default_window_seconds() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            requests_per_window: default_requests_per_window(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.requests_per_window == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "rate_limit.requests_per_window must be positive".to_string(),
            }));
        }
        if self.window_seconds == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "rate_limit.window_seconds must be positive".to_string(),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_config_defaults() {
        let config: RateLimitConfig = toml::from_str("").unwrap();
        assert_eq!(config, RateLimitConfig::default());
        assert!(config.enabled);
        assert_eq!(config.requests_per_window, 30);
        assert_eq!(config.window_seconds, 60);
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let config: RateLimitConfig = toml::from_str("window_seconds = 0").unwrap();
        assert!(config.validate().is_err());
        assert!(RateLimitConfig::default().validate().is_ok());
    }
}
