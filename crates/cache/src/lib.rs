//! Expiry-based memoization for expensive engine and repository queries.
//!
//! [`TtlCache`] is the one component in this workspace designed for
//! concurrent use: every operation serializes on a single mutex around the
//! underlying map. Entries carry an absolute expiry computed at write time;
//! a read past expiry deletes the entry and reports absence. Reclamation is
//! lazy — on read or via [`TtlCache::sweep_expired`] — never proactive.
//!
//! Keys combine a logical operation name with a parameter set whose order
//! never matters:
//!
//! ```
//! use qsense_cache::TtlCache;
//!
//! let cache: TtlCache<String> = TtlCache::new();
//! cache.set("field_info", &[("app", "a1"), ("field", "Country")], "text".into());
//! // Same entry regardless of parameter order.
//! assert!(cache.get("field_info", &[("field", "Country"), ("app", "a1")]).is_some());
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Entry lifetime when none is given per write: one hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

type Key = [u8; 32];

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Thread-safe map from (name, parameters) to a value with a lifetime.
pub struct TtlCache<V> {
    default_ttl: Duration,
    entries: Mutex<HashMap<Key, Entry<V>>>,
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlCache<V> {
    /// Cache with the one-hour default entry lifetime.
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL)
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Value stored under (name, params), unless absent or expired. An
    /// expired entry is deleted on the spot.
    pub fn get(&self, name: &str, params: &[(&str, &str)]) -> Option<V> {
        let key = derive_key(name, params);
        let now = Instant::now();

        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store a value with the default lifetime.
    pub fn set(&self, name: &str, params: &[(&str, &str)], value: V) {
        self.set_with_ttl(name, params, value, self.default_ttl);
    }

    /// Store a value with an explicit lifetime.
    pub fn set_with_ttl(&self, name: &str, params: &[(&str, &str)], value: V, ttl: Duration) {
        let key = derive_key(name, params);
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Drop one entry. Returns whether it was present (expired or not).
    pub fn invalidate(&self, name: &str, params: &[(&str, &str)]) -> bool {
        let key = derive_key(name, params);
        self.entries.lock().remove(&key).is_some()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Remove every entry whose expiry has passed; returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Entry count, expired entries included until they are reclaimed.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock();
        let total = entries.len();
        let expired = entries
            .values()
            .filter(|entry| entry.expires_at <= now)
            .count();
        CacheStats {
            total,
            active: total - expired,
            expired,
            default_ttl: self.default_ttl,
        }
    }
}

/// Snapshot of one cache's population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub default_ttl: Duration,
}

/// Composite key: blake3 over the name and the parameter pairs sorted by
/// key name. Pure, so callers pay for hashing outside the lock.
fn derive_key(name: &str, params: &[(&str, &str)]) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&[0]);

    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.as_bytes());
        hasher.update(&[0]);
    }
    *hasher.finalize().as_bytes()
}

// =============================================================================
// Per-category registry
// =============================================================================

/// The caches a running client owns, one per data category. Constructed once
/// at startup and passed by reference to whatever needs memoization — there
/// are no process-wide instances.
pub struct CacheRegistry {
    pub app_metadata: TtlCache<serde_json::Value>,
    pub field_info: TtlCache<serde_json::Value>,
    pub field_stats: TtlCache<serde_json::Value>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL)
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            app_metadata: TtlCache::with_default_ttl(default_ttl),
            field_info: TtlCache::with_default_ttl(default_ttl),
            field_stats: TtlCache::with_default_ttl(default_ttl),
        }
    }

    /// Stats for every category, in declaration order.
    pub fn stats(&self) -> [(&'static str, CacheStats); 3] {
        [
            ("app_metadata", self.app_metadata.stats()),
            ("field_info", self.field_info.stats()),
            ("field_stats", self.field_stats.stats()),
        ]
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}
