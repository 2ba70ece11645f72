// Entitlement tiers and the access-key validation cache.
//
// An entitlement grants a tier to an email and is looked up by its opaque
// access key. Lookups go through a short-lived in-memory cache; negative
// results are cached too, so repeated probing with invalid keys stays cheap.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::{Database, Entitlement};
use crate::rate_limit::{Clock, SystemClock};

/// Entitlement tier. `None` is the anonymous/free tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    None,
    Sponsor,
    Pro,
    Builder,
}

/// Per-tier quota table, consulted by both the rate limiter and prompt
/// validation so the two stay in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub battles_per_day: u32,
    pub max_prompt_length: usize,
}

impl Tier {
    pub fn limits(self) -> TierLimits {
        match self {
            Tier::Builder => TierLimits {
                battles_per_day: 300,
                max_prompt_length: 5000,
            },
            Tier::Pro => TierLimits {
                battles_per_day: 50,
                max_prompt_length: 3000,
            },
            Tier::Sponsor => TierLimits {
                battles_per_day: 10,
                max_prompt_length: 2000,
            },
            Tier::None => TierLimits {
                battles_per_day: 3,
                max_prompt_length: 2000,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::None => "none",
            Tier::Sponsor => "sponsor",
            Tier::Pro => "pro",
            Tier::Builder => "builder",
        }
    }

    /// Parse a stored tier name. Unknown names fall back to the free tier.
    pub fn from_name(name: &str) -> Tier {
        match name {
            "sponsor" => Tier::Sponsor,
            "pro" => Tier::Pro,
            "builder" => Tier::Builder,
            _ => Tier::None,
        }
    }
}

/// Generate a fresh opaque access key.
pub fn generate_access_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("arena_{}", hex::encode(bytes))
}

// ── Validation cache ─────────────────────────────────────────────────

const CACHE_TTL_SECONDS: i64 = 5 * 60;

struct CachedLookup {
    entitlement: Option<Entitlement>,
    expires: DateTime<Utc>,
}

/// TTL-bounded cache in front of the entitlement table.
#[derive(Clone)]
pub struct EntitlementCache {
    entries: Arc<Mutex<HashMap<String, CachedLookup>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl EntitlementCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(CACHE_TTL_SECONDS),
            clock,
        }
    }

    /// Resolve an access key to its active entitlement, consulting the cache
    /// first. Both hits and misses are cached for the TTL window.
    pub async fn validate(&self, db: &Database, access_key: &str) -> Option<Entitlement> {
        let now = self.clock.now();
        {
            let entries = self.entries.lock().unwrap();
            if let Some(cached) = entries.get(access_key) {
                if cached.expires > now {
                    return cached.entitlement.clone();
                }
            }
        }

        let entitlement = match db.get_entitlement_by_access_key(access_key).await {
            Ok(e) => e,
            Err(e) => {
                tracing::error!("Entitlement lookup failed: {e}");
                None
            }
        };

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            access_key.to_string(),
            CachedLookup {
                entitlement: entitlement.clone(),
                expires: now + self.ttl,
            },
        );
        entitlement
    }

    /// Invalidate one key, or the whole cache. Called after an entitlement
    /// is created or updated so the new tier takes effect promptly.
    pub fn clear(&self, access_key: Option<&str>) {
        let mut entries = self.entries.lock().unwrap();
        match access_key {
            Some(key) => {
                entries.remove(key);
            }
            None => entries.clear(),
        }
    }
}

impl Default for EntitlementCache {
    fn default() -> Self {
        Self::new()
    }
}
