// In-memory daily rate limiter for the battle endpoint.
//
// Counters are keyed by access key (if the caller presented one) or by IP,
// and reset at the next UTC midnight after first use in a window. This is
// best-effort abuse mitigation, not billing-grade accounting: counters are
// process-local and not persisted.

use chrono::{DateTime, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::entitlements::Tier;
use crate::metrics;

/// Time source, injectable so tests control the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of an admission check. `remaining` already accounts for the
/// battle being admitted by this check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub tier: Tier,
}

#[derive(Debug, Clone)]
struct CounterEntry {
    count: u32,
    resets_at: DateTime<Utc>,
}

/// Thread-safe in-memory rate limiter with tiered daily quotas.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, CounterEntry>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Check and count one battle for `key` under `tier`'s daily limit.
    ///
    /// Check-and-increment is a single step under the map lock; there is no
    /// separate commit, so an admitted battle consumes quota even if it is
    /// later aborted.
    pub fn check_admission(&self, key: &str, tier: Tier) -> Admission {
        let limit = tier.limits().battles_per_day;
        let now = self.clock.now();
        let mut map = self.inner.lock().unwrap();

        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                resets_at: next_utc_midnight(now),
            });
        if now >= entry.resets_at {
            // Window passed, start a fresh one.
            *entry = CounterEntry {
                count: 0,
                resets_at: next_utc_midnight(now),
            };
        }

        if entry.count >= limit {
            metrics::ADMISSIONS_DENIED_TOTAL
                .with_label_values(&[tier.as_str()])
                .inc();
            return Admission {
                allowed: false,
                remaining: 0,
                limit,
                tier,
            };
        }

        entry.count += 1;
        Admission {
            allowed: true,
            remaining: limit - entry.count,
            limit,
            tier,
        }
    }

    /// Drop counters whose window has passed. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.inner.lock().unwrap();
        let before = map.len();
        map.retain(|_, entry| now < entry.resets_at);
        before - map.len()
    }

    /// Current count for a key (for diagnostics/testing).
    pub fn current_count(&self, key: &str) -> u32 {
        let now = self.clock.now();
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(entry) if now < entry.resets_at => entry.count,
            _ => 0,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// The UTC midnight immediately after `now`.
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = now.date_naive() + chrono::Days::new(1);
    next_day.and_time(NaiveTime::MIN).and_utc()
}

/// Spawn the periodic counter GC. Best-effort: admission checks never wait
/// on this.
pub fn spawn_cleanup_task(limiter: RateLimiter) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            let removed = limiter.cleanup();
            if removed > 0 {
                tracing::debug!("Rate limiter GC removed {removed} expired counters");
            }
        }
    });
}
