//! Configuration errors that tell the operator what to change.
//!
//! Handler and DON configuration is checked once, when the handler is built,
//! and every problem found is reported together so a broken config file can
//! be fixed in one pass.

use std::fmt;

/// Configuration errors with the offending setting and a fix hint.
#[derive(Debug, Clone)]
pub enum ConfigurationError {
    /// A setting has an unusable value.
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// A setting needed by an enabled feature is absent.
    MissingRequired {
        /// The missing setting name.
        setting: String,
        /// What feature requires this setting.
        context: String,
        /// Where the value is expected to come from.
        source_hint: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { message, fix_hint } => {
                write!(
                    f,
                    "Invalid configuration: {message}\n\nHow to fix: {fix_hint}"
                )
            }
            Self::MissingRequired {
                setting,
                context,
                source_hint,
            } => {
                write!(
                    f,
                    "Missing required configuration: {setting}\n\n\
                    Required for: {context}\n\
                    Set via: {source_hint}"
                )
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    /// Create a missing required configuration error.
    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        source_hint: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            source_hint: source_hint.into(),
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise. Nested `Multiple`s are
    /// flattened.
    pub fn collect(errors: Vec<ConfigurationError>) -> ConfigResult<()> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(Self::Multiple(flat)),
        }
    }

    /// Get the number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_error_display() {
        let err = ConfigurationError::invalid(
            "rateLimiterConfig.globalRPS must be positive, got 0",
            "Set rateLimiterConfig.globalRPS to a value greater than zero",
        );
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("globalRPS"));
        assert!(msg.contains("How to fix"));
    }

    #[test]
    fn test_missing_required_error_display() {
        let err = ConfigurationError::missing_required(
            "allow-list source",
            "allowlistConfig is set",
            "FunctionsHandler::from_config",
        );
        let msg = err.to_string();
        assert!(msg.contains("Missing required"));
        assert!(msg.contains("allow-list source"));
        assert!(msg.contains("from_config"));
    }

    #[test]
    fn test_collect_flattens() {
        assert!(ConfigurationError::collect(Vec::new()).is_ok());

        let single = ConfigurationError::collect(vec![ConfigurationError::invalid("a", "b")])
            .unwrap_err();
        assert_eq!(single.count(), 1);

        let nested = ConfigurationError::collect(vec![
            ConfigurationError::invalid("1", "fix"),
            ConfigurationError::Multiple(vec![
                ConfigurationError::invalid("2", "fix"),
                ConfigurationError::invalid("3", "fix"),
            ]),
        ])
        .unwrap_err();
        assert_eq!(nested.count(), 3);
        let msg = nested.to_string();
        assert!(msg.contains("Multiple configuration errors"));
        assert!(msg.contains("3."));
    }
}
