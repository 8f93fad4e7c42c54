//! Per-host request quotas shared by every worker.

use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as KeyedLimiter};

use crate::error::EnrichError;

/// Slowest accepted quota: one request per hour.
const MAX_PERIOD: Duration = Duration::from_secs(3600);

type HostLimiter = KeyedLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Builds the quota for `per_second` requests with room for `burst`
/// back-to-back calls.
pub fn quota(per_second: f64, burst: u32) -> Result<Quota, EnrichError> {
    let invalid = |reason: &str| {
        EnrichError::ConfigParse(format!(
            "rate_limit ({per_second}/s, burst {burst}): {reason}"
        ))
    };
    if !(per_second.is_finite() && per_second > 0.0) {
        return Err(invalid("per_second must be positive"));
    }
    let period = Duration::try_from_secs_f64(1.0 / per_second)
        .map_err(|_| invalid("per_second is out of range"))?;
    if period > MAX_PERIOD {
        return Err(invalid("per_second must allow at least one request per hour"));
    }
    let burst = NonZeroU32::new(burst).ok_or_else(|| invalid("burst must be at least 1"))?;
    Quota::with_period(period)
        .map(|quota| quota.allow_burst(burst))
        .ok_or_else(|| invalid("per_second is too large"))
}

pub struct RateLimiter {
    limiter: HostLimiter,
    clock: DefaultClock,
}

impl RateLimiter {
    pub fn new(per_second: f64, burst: u32) -> Result<Self, EnrichError> {
        Ok(Self {
            limiter: KeyedLimiter::keyed(quota(per_second, burst)?),
            clock: DefaultClock::default(),
        })
    }

    /// Blocks until the host of `url` has capacity.
    pub fn acquire(&self, url: &str) {
        let host = host_of(url);
        while let Err(not_until) = self.limiter.check_key(&host) {
            thread::sleep(not_until.wait_time_from(self.clock.now()));
        }
    }

    /// Takes capacity without blocking; returns false when the host is saturated.
    pub fn try_acquire(&self, url: &str) -> bool {
        self.limiter.check_key(&host_of(url)).is_ok()
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_default()
}
