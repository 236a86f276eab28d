//! Configuration validation for the DON gateway.
//!
//! Validation runs once when a handler is built and collects every problem
//! instead of stopping at the first one.

use std::collections::HashSet;

use super::error::{ConfigResult, ConfigurationError};
use super::{AllowlistConfig, DonConfig, GatewayConfig, HandlerConfig, RateLimiterConfig};
use crate::api::Address;

/// Configuration validator.
///
/// | Section             | Rule                                               |
/// |---------------------|----------------------------------------------------|
/// | DON                 | at least one member, unique non-empty addresses    |
/// | DON                 | `f < members.len()`                                |
/// | `allowlistConfig`   | hex contract address, positive frequency/timeout   |
/// | `rateLimiterConfig` | RPS and burst values strictly positive             |
/// | handler             | `requestTimeoutMillis` positive                    |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the whole process configuration, including the embedded
    /// handler config.
    pub fn validate(config: &GatewayConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_don(&config.don) {
            errors.push(e);
        }
        if let Err(e) = HandlerConfig::parse(&config.don.handler_config) {
            errors.push(e);
        }
        if config.logging.level.trim().is_empty() {
            errors.push(ConfigurationError::invalid(
                "logging.level is empty",
                "Set logging.level to a tracing filter such as 'info' or 'don_gateway=debug'",
            ));
        }

        ConfigurationError::collect(errors)
    }

    /// Validate DON membership and fault tolerance.
    pub fn validate_don(don: &DonConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if don.members.is_empty() {
            errors.push(ConfigurationError::missing_required(
                "don.members",
                "routing requests to a DON",
                "don.members in the config file or DON_GATEWAY__DON__MEMBERS",
            ));
        } else if don.f >= don.members.len() {
            errors.push(ConfigurationError::invalid(
                format!(
                    "don.f is {} but the DON has only {} members",
                    don.f,
                    don.members.len()
                ),
                "F counts tolerated faulty nodes and must be smaller than the member count",
            ));
        }

        let mut seen = HashSet::new();
        for member in &don.members {
            let address = member.address.trim().to_ascii_lowercase();
            if address.is_empty() {
                errors.push(ConfigurationError::invalid(
                    format!("DON member '{}' has an empty address", member.name),
                    "Give every member the address its connection is registered under",
                ));
            } else if !seen.insert(address) {
                errors.push(ConfigurationError::invalid(
                    format!("DON member address '{}' is listed twice", member.address),
                    "Each node may appear once; duplicates would count twice toward quorum",
                ));
            }
        }

        ConfigurationError::collect(errors)
    }

    /// Validate a parsed handler config.
    pub fn validate_handler(config: &HandlerConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Some(allowlist) = &config.allowlist_config {
            if let Err(e) = Self::validate_allowlist(allowlist) {
                errors.push(e);
            }
        }
        if let Some(limiter) = &config.rate_limiter_config {
            if let Err(e) = Self::validate_rate_limiter(limiter) {
                errors.push(e);
            }
        }
        if config.request_timeout_millis == 0 {
            errors.push(ConfigurationError::invalid(
                "requestTimeoutMillis must be positive",
                "Set requestTimeoutMillis to how long a caller may wait for quorum",
            ));
        }

        ConfigurationError::collect(errors)
    }

    /// Validate allow-list refresh settings.
    pub fn validate_allowlist(config: &AllowlistConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = config.contract_address.parse::<Address>() {
            errors.push(ConfigurationError::invalid(
                format!("allowlistConfig.contractAddress: {e}"),
                "Use the 0x-prefixed 20-byte address of the allow-list contract",
            ));
        }
        if config.update_frequency_sec == 0 {
            errors.push(ConfigurationError::invalid(
                "allowlistConfig.updateFrequencySec must be positive",
                "Set how many seconds to wait between allow-list refreshes",
            ));
        }
        if config.update_timeout_sec == 0 {
            errors.push(ConfigurationError::invalid(
                "allowlistConfig.updateTimeoutSec must be positive",
                "Set how many seconds a single allow-list fetch may take",
            ));
        }

        ConfigurationError::collect(errors)
    }

    /// Validate rate limiter settings.
    pub fn validate_rate_limiter(config: &RateLimiterConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        for (name, rps) in [
            ("globalRPS", config.global_rps),
            ("perUserRPS", config.per_user_rps),
        ] {
            if !(rps.is_finite() && rps > 0.0) {
                errors.push(ConfigurationError::invalid(
                    format!("rateLimiterConfig.{name} must be positive, got {rps}"),
                    format!("Set rateLimiterConfig.{name} to a value greater than zero"),
                ));
            }
        }
        for (name, burst) in [
            ("globalBurst", config.global_burst),
            ("perUserBurst", config.per_user_burst),
        ] {
            if burst == 0 {
                errors.push(ConfigurationError::invalid(
                    format!("rateLimiterConfig.{name} must be positive"),
                    format!("Set rateLimiterConfig.{name} to at least 1"),
                ));
            }
        }

        ConfigurationError::collect(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use serde_json::json;

    fn don_with(members: usize, f: usize) -> DonConfig {
        DonConfig {
            members: (0..members)
                .map(|i| NodeConfig {
                    name: format!("n{i}"),
                    address: format!("0x{i:02}"),
                })
                .collect(),
            f,
            ..DonConfig::default()
        }
    }

    #[test]
    fn test_f_must_be_below_member_count() {
        assert!(ConfigValidator::validate_don(&don_with(4, 1)).is_ok());
        assert!(ConfigValidator::validate_don(&don_with(1, 0)).is_ok());
        let err = ConfigValidator::validate_don(&don_with(3, 3)).unwrap_err();
        assert!(err.to_string().contains("don.f is 3"));
    }

    #[test]
    fn test_empty_don_rejected() {
        let err = ConfigValidator::validate_don(&don_with(0, 0)).unwrap_err();
        assert!(err.to_string().contains("don.members"));
    }

    #[test]
    fn test_duplicate_member_addresses_rejected() {
        let mut don = don_with(3, 1);
        don.members[2].address = don.members[0].address.to_uppercase();
        let err = ConfigValidator::validate_don(&don).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_bad_allowlist_settings_all_reported() {
        let err = HandlerConfig::parse(&json!({
            "allowlistConfig": {
                "chainID": 1,
                "contractAddress": "not-an-address",
                "blockConfirmations": 1,
                "updateFrequencySec": 0,
                "updateTimeoutSec": 0
            }
        }))
        .unwrap_err();
        assert_eq!(err.count(), 3);
    }

    #[test]
    fn test_rate_limiter_values_must_be_positive() {
        let err = HandlerConfig::parse(&json!({
            "rateLimiterConfig": {
                "globalRPS": 0.0,
                "globalBurst": 1,
                "perUserRPS": 1.0,
                "perUserBurst": 0
            }
        }))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("globalRPS"));
        assert!(msg.contains("perUserBurst"));
        assert_eq!(err.count(), 2);
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let err = HandlerConfig::parse(&json!({"requestTimeoutMillis": 0})).unwrap_err();
        assert!(err.to_string().contains("requestTimeoutMillis"));
    }

    #[test]
    fn test_gateway_config_collects_across_sections() {
        let mut config = GatewayConfig::default();
        config.don.f = 10;
        config.don.handler_config = json!({"requestTimeoutMillis": 0});
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.count(), 2);
    }
}
