//! Configuration management for the DON gateway.
//!
//! Two layers of configuration exist:
//!
//! - [`GatewayConfig`]: process-level settings (logging, the served DON),
//!   loaded from an optional config file and `DON_GATEWAY__*` environment
//!   variables.
//! - [`HandlerConfig`]: the handler-specific JSON blob carried inside
//!   [`DonConfig::handler_config`], parsed and validated when the handler
//!   is constructed so malformed settings fail before any request is served.
//!
//! # Example
//!
//! ```rust,ignore
//! use don_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::load(Some("config/local.yaml"))?;
//! println!("serving DON {} with F={}", config.don.don_id, config.don.f);
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

pub use crate::rate_limit::RateLimiterConfig;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::Quorum;

/// Request timeout applied when `requestTimeoutMillis` is omitted.
pub const DEFAULT_REQUEST_TIMEOUT_MILLIS: u64 = 30_000;

/// Top-level process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// The DON this gateway routes to.
    #[serde(default)]
    pub don: DonConfig,
}

impl GatewayConfig {
    /// Load and validate configuration.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. Built-in defaults
    /// 2. `config/don-gateway.{yaml,toml,json}` if present
    /// 3. The file at `path`, if given (must exist)
    /// 4. `DON_GATEWAY__SECTION__KEY` environment variables
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(config::File::with_name("config/don-gateway").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("DON_GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// One DON member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub address: String,
}

/// Membership and fault tolerance of the DON served by a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonConfig {
    #[serde(default)]
    pub don_id: String,
    #[serde(default = "default_handler_name")]
    pub handler_name: String,
    /// Handler-specific settings, parsed by [`HandlerConfig::parse`].
    #[serde(default)]
    pub handler_config: serde_json::Value,
    #[serde(default)]
    pub members: Vec<NodeConfig>,
    /// Maximum number of faulty members tolerated.
    #[serde(default, alias = "F")]
    pub f: usize,
}

impl DonConfig {
    /// Quorum parameters derived from membership.
    pub fn quorum(&self) -> Quorum {
        Quorum::new(self.members.len(), self.f)
    }

    /// Whether `address` belongs to a configured member.
    pub fn is_member(&self, address: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.address.eq_ignore_ascii_case(address))
    }
}

impl Default for DonConfig {
    /// A four-member local DON tolerating one faulty node.
    fn default() -> Self {
        let members = (1..=4u8)
            .map(|i| NodeConfig {
                name: format!("node{i}"),
                address: format!("0x{:040x}", i),
            })
            .collect();
        Self {
            don_id: "local_don".to_string(),
            handler_name: default_handler_name(),
            handler_config: serde_json::Value::Null,
            members,
            f: 1,
        }
    }
}

/// Settings of the secrets request handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default, rename = "allowlistConfig", alias = "allowlistconfig")]
    pub allowlist_config: Option<AllowlistConfig>,
    #[serde(default, rename = "rateLimiterConfig", alias = "ratelimiterconfig")]
    pub rate_limiter_config: Option<RateLimiterConfig>,
    /// Per-sender cap on in-flight requests; 0 disables the cap.
    #[serde(
        default,
        rename = "maxPendingRequestPerUser",
        alias = "maxpendingrequestperuser"
    )]
    pub max_pending_requests_per_user: usize,
    /// Gateway-wide cap on in-flight requests; 0 disables the cap.
    #[serde(
        default,
        rename = "maxPendingRequestsGlobal",
        alias = "maxpendingrequestsglobal"
    )]
    pub max_pending_requests_global: usize,
    #[serde(
        default = "default_request_timeout_millis",
        rename = "requestTimeoutMillis",
        alias = "requesttimeoutmillis"
    )]
    pub request_timeout_millis: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            allowlist_config: None,
            rate_limiter_config: None,
            max_pending_requests_per_user: 0,
            max_pending_requests_global: 0,
            request_timeout_millis: DEFAULT_REQUEST_TIMEOUT_MILLIS,
        }
    }
}

impl HandlerConfig {
    /// Parse and validate a raw handler config. `null` yields the defaults.
    pub fn parse(raw: &serde_json::Value) -> ConfigResult<Self> {
        let config: Self = if raw.is_null() {
            Self::default()
        } else {
            serde_json::from_value(raw.clone()).map_err(|e| {
                ConfigurationError::invalid(
                    format!("handler config is malformed: {e}"),
                    "Check field names and types against the handler config reference",
                )
            })?
        };
        ConfigValidator::validate_handler(&config)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }
}

/// Where and how often the sender allow-list is refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(rename = "chainID", alias = "chainid")]
    pub chain_id: u64,
    #[serde(rename = "contractAddress", alias = "contractaddress")]
    pub contract_address: String,
    #[serde(default, rename = "blockConfirmations", alias = "blockconfirmations")]
    pub block_confirmations: u64,
    #[serde(rename = "updateFrequencySec", alias = "updatefrequencysec")]
    pub update_frequency_sec: u64,
    #[serde(rename = "updateTimeoutSec", alias = "updatetimeoutsec")]
    pub update_timeout_sec: u64,
}

impl AllowlistConfig {
    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.update_frequency_sec)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_sec)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handler_name() -> String {
    "functions".to_string()
}

fn default_request_timeout_millis() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MILLIS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_handler_config_uses_defaults() {
        let cfg = HandlerConfig::parse(&json!({})).unwrap();
        assert!(cfg.allowlist_config.is_none());
        assert!(cfg.rate_limiter_config.is_none());
        assert_eq!(cfg.request_timeout_millis, DEFAULT_REQUEST_TIMEOUT_MILLIS);

        let cfg = HandlerConfig::parse(&serde_json::Value::Null).unwrap();
        assert_eq!(cfg.max_pending_requests_global, 0);
    }

    #[test]
    fn test_full_handler_config_parses() {
        let raw = json!({
            "allowlistConfig": {
                "chainID": 1337,
                "contractAddress": "0x00000000000000000000000000000000000000aa",
                "blockConfirmations": 2,
                "updateFrequencySec": 30,
                "updateTimeoutSec": 5
            },
            "rateLimiterConfig": {
                "globalRPS": 100.0,
                "globalBurst": 100,
                "perUserRPS": 0.5,
                "perUserBurst": 2
            },
            "maxPendingRequestPerUser": 4,
            "maxPendingRequestsGlobal": 1000,
            "requestTimeoutMillis": 1500
        });
        let cfg = HandlerConfig::parse(&raw).unwrap();
        let allowlist = cfg.allowlist_config.as_ref().unwrap();
        assert_eq!(allowlist.chain_id, 1337);
        assert_eq!(allowlist.update_frequency(), Duration::from_secs(30));
        let limiter = cfg.rate_limiter_config.as_ref().unwrap();
        assert!((limiter.per_user_rps - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.max_pending_requests_per_user, 4);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_malformed_handler_config_fails_fast() {
        let err = HandlerConfig::parse(&json!({"requestTimeoutMillis": "soon"})).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_default_don_is_valid() {
        let don = DonConfig::default();
        assert_eq!(don.members.len(), 4);
        assert_eq!(don.quorum().threshold(), 2);
        assert!(don.is_member("0x0000000000000000000000000000000000000001"));
        assert!(!don.is_member("0x0000000000000000000000000000000000000009"));
        ConfigValidator::validate_don(&don).unwrap();
    }

    #[test]
    fn test_don_config_accepts_uppercase_f() {
        let don: DonConfig = serde_json::from_value(json!({
            "don_id": "fun",
            "members": [{"name": "a", "address": "0x01"}, {"name": "b", "address": "0x02"}],
            "F": 1
        }))
        .unwrap();
        assert_eq!(don.f, 1);
        assert_eq!(don.handler_name, "functions");
    }
}
