//! Tracing setup and structured logging helpers.

use std::time::Instant;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
    }
    Ok(())
}

/// Times a recurring background operation.
///
/// Unlike startup phases, these run on every tick, so success is logged at
/// debug and failure at warn.
///
/// ```rust,ignore
/// let timer = OpTimer::new("allowlist", "refresh");
/// let result = allowlist.update_from_source(timeout).await;
/// timer.finish_with_result(result.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Log the outcome with the elapsed time.
    pub fn finish_with_result<T: std::fmt::Debug, E: std::fmt::Display>(
        self,
        result: Result<&T, &E>,
    ) {
        let duration_ms = self.start.elapsed().as_millis();
        match result {
            Ok(value) => tracing::debug!(
                component = self.component,
                operation = self.operation,
                duration_ms,
                result = ?value,
                "Operation completed"
            ),
            Err(e) => tracing::warn!(
                component = self.component,
                operation = self.operation,
                duration_ms,
                error = %e,
                "Operation failed"
            ),
        }
    }
}

/// Log a numbered startup step.
///
/// ```rust,ignore
/// log_init_step!(2, 4, "DON", "4 members, F=1");
/// ```
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {} - {}",
            $step,
            $total,
            $name,
            $detail
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_timer_fields() {
        let timer = OpTimer::new("allowlist", "refresh");
        assert_eq!(timer.component, "allowlist");
        assert_eq!(timer.operation, "refresh");
    }

    #[test]
    fn test_op_timer_finish_with_both_outcomes() {
        let ok: Result<usize, String> = Ok(3);
        OpTimer::new("allowlist", "refresh").finish_with_result(ok.as_ref());
        let err: Result<usize, String> = Err("rpc unavailable".to_string());
        OpTimer::new("allowlist", "refresh").finish_with_result(err.as_ref());
    }
}
