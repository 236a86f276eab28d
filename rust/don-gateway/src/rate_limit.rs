//! Token-bucket admission control using governor.
//!
//! One global bucket shared by every caller plus a lazily created bucket per
//! caller. A request is admitted only when both have a token.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigResult, ConfigValidator, ConfigurationError};

/// Rate limiter settings from the handler config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(rename = "globalRPS", alias = "globalrps")]
    pub global_rps: f64,
    #[serde(rename = "globalBurst", alias = "globalburst")]
    pub global_burst: u32,
    #[serde(rename = "perUserRPS", alias = "peruserrps")]
    pub per_user_rps: f64,
    #[serde(rename = "perUserBurst", alias = "peruserburst")]
    pub per_user_burst: u32,
}

/// Global plus per-caller rate limiter.
///
/// Per-caller buckets are never evicted, so memory grows with the number of
/// distinct callers ever seen. Callers reach this limiter only after passing
/// the allow-list and signature checks, which bounds the key space in
/// practice.
#[derive(Debug)]
pub struct RateLimiter {
    global: DefaultDirectRateLimiter,
    per_user: Mutex<HashMap<String, Arc<DefaultDirectRateLimiter>>>,
    per_user_quota: Quota,
}

impl RateLimiter {
    /// Build a limiter, rejecting non-positive rates and bursts.
    pub fn new(config: &RateLimiterConfig) -> ConfigResult<Self> {
        ConfigValidator::validate_rate_limiter(config)?;

        let global_quota = quota("globalRPS", config.global_rps, config.global_burst)?;
        let per_user_quota = quota("perUserRPS", config.per_user_rps, config.per_user_burst)?;

        Ok(Self {
            global: DefaultDirectRateLimiter::direct(global_quota),
            per_user: Mutex::new(HashMap::new()),
            per_user_quota,
        })
    }

    /// Take one token from the global bucket, then one from the caller's.
    ///
    /// An exhausted global bucket rejects without creating or touching any
    /// per-caller bucket. A global token taken before a per-caller rejection
    /// is not returned.
    pub fn allow(&self, user: &str) -> bool {
        if self.global.check().is_err() {
            return false;
        }
        self.limiter_for(user).check().is_ok()
    }

    /// Number of callers with a bucket.
    pub fn tracked_callers(&self) -> usize {
        self.per_user.lock().len()
    }

    fn limiter_for(&self, user: &str) -> Arc<DefaultDirectRateLimiter> {
        let mut limiters = self.per_user.lock();
        if let Some(limiter) = limiters.get(user) {
            return Arc::clone(limiter);
        }
        let limiter = Arc::new(DefaultDirectRateLimiter::direct(self.per_user_quota));
        limiters.insert(user.to_string(), Arc::clone(&limiter));
        limiter
    }
}

fn quota(name: &str, rps: f64, burst: u32) -> ConfigResult<Quota> {
    let invalid = || {
        ConfigurationError::invalid(
            format!("rateLimiterConfig.{name} of {rps} cannot be represented"),
            format!("Set rateLimiterConfig.{name} to a positive, finite rate"),
        )
    };
    let period = Duration::try_from_secs_f64(1.0 / rps).ok().ok_or_else(invalid)?;
    let burst = NonZeroU32::new(burst).ok_or_else(invalid)?;
    Ok(Quota::with_period(period).ok_or_else(invalid)?.allow_burst(burst))
}
