use std::time::{Duration, Instant};

use super::{AdapterError, DeviceResult};

/// Consecutive failures after which a cached reading flips to stale even if
/// the TTL has not yet expired.
const STALE_AFTER_FAILURES: u32 = 3;

/// Last-good cache for a single adapter reading.
///
/// A fresh value resets the failure counter. Readings stay usable within the
/// TTL; after that, or after three consecutive failures, `get` reports
/// `Stale` so dependents fall back to their conservative branch.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    value: Option<(T, Instant)>,
    ttl: Duration,
    failures: u32,
}

impl<T: Clone> Cached<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            value: None,
            ttl,
            failures: 0,
        }
    }

    pub fn update(&mut self, value: T, now: Instant) {
        self.value = Some((value, now));
        self.failures = 0;
    }

    /// Record a failed refresh attempt; returns the consecutive count.
    pub fn failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.value
            .as_ref()
            .map(|(_, at)| now.saturating_duration_since(*at))
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        if self.failures >= STALE_AFTER_FAILURES {
            return true;
        }
        match self.age(now) {
            Some(age) => age > self.ttl,
            None => true,
        }
    }

    /// The cached value if still fresh, `Stale` otherwise.
    pub fn get(&self, now: Instant) -> DeviceResult<T> {
        match &self.value {
            Some((value, at)) => {
                let age = now.saturating_duration_since(*at);
                if age <= self.ttl && self.failures < STALE_AFTER_FAILURES {
                    Ok(value.clone())
                } else {
                    Err(AdapterError::Stale {
                        age_secs: age.as_secs(),
                    })
                }
            }
            None => Err(AdapterError::Stale { age_secs: u64::MAX }),
        }
    }

    /// The last known value regardless of freshness.
    pub fn last(&self) -> Option<T> {
        self.value.as_ref().map(|(value, _)| value.clone())
    }
}
