//! Query cache shared by all bridge connections.
//!
//! Entries carry a per-entry TTL and the identity scope they were computed
//! under. Expiry is lazy: an expired entry is removed on the read that finds
//! it. The cache is an idempotent read-mirror, never the source of truth, so
//! readers tolerate a brief visibility window under concurrency.

mod key;

pub use key::{generate_key, is_cacheable};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use zbridge_core::{AuthContext, BridgeError};

pub const TTL_MIN_SECS: u64 = 1;
pub const TTL_MAX_SECS: u64 = 3600;
pub const TTL_DEFAULT_SECS: u64 = 60;

/// Identity boundary a cached entry is valid under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    User,
    App,
    Global,
}

#[derive(Clone, Debug)]
struct Entry {
    value: serde_json::Value,
    inserted_at: Instant,
    ttl: Duration,
    scope: CacheScope,
    user_id: Option<String>,
    app_name: Option<String>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Counter snapshot. Hits/misses/evictions are monotonic since process
/// start; `size` is the current entry count.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub evictions: u64,
}

/// Process-wide query cache. Safe for concurrent access from every
/// connection task.
pub struct CacheManager {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl_secs: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn validate_ttl(secs: u64) -> Result<(), BridgeError> {
    if !(TTL_MIN_SECS..=TTL_MAX_SECS).contains(&secs) {
        return Err(BridgeError::Validation(format!(
            "TTL must be between {TTL_MIN_SECS} and {TTL_MAX_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

impl CacheManager {
    pub fn new(default_ttl_secs: u64) -> Result<Self, BridgeError> {
        validate_ttl(default_ttl_secs)?;
        Ok(Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl_secs: AtomicU64::new(default_ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn with_default_ttl() -> Self {
        // TTL_DEFAULT_SECS is in range.
        Self::new(TTL_DEFAULT_SECS).unwrap_or_else(|_| unreachable!())
    }

    /// Look up a key. Expired entries count as misses and are evicted.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {} // expired, fall through to remove
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let mut entries = self.entries.write();
        // Re-check under the write lock; another reader may have evicted it.
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(now) {
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Evicted expired cache entry");
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entries[key].value.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite. The identity determines the entry's scope tag;
    /// an out-of-range TTL override is rejected, never clamped.
    pub fn put(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        ttl_override_secs: Option<u64>,
        identity: Option<&AuthContext>,
    ) -> Result<(), BridgeError> {
        let ttl_secs = match ttl_override_secs {
            Some(secs) => {
                validate_ttl(secs)?;
                secs
            }
            None => self.default_ttl_secs.load(Ordering::Relaxed),
        };

        let (scope, user_id, app_name) = match identity {
            Some(ctx) if !ctx.is_anonymous() => (
                CacheScope::User,
                Some(ctx.user_id.clone()),
                Some(ctx.app_name.clone()),
            ),
            _ => (CacheScope::Global, None, None),
        };

        self.entries.write().insert(
            key.into(),
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl: Duration::from_secs(ttl_secs),
                scope,
                user_id,
                app_name,
            },
        );
        Ok(())
    }

    pub fn set_default_ttl(&self, secs: u64) -> Result<(), BridgeError> {
        validate_ttl(secs)?;
        self.default_ttl_secs.store(secs, Ordering::Relaxed);
        Ok(())
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs.load(Ordering::Relaxed)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Drop entries computed under the given user's identity.
    pub fn clear_for_user(&self, user_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.user_id.as_deref() != Some(user_id));
        before - entries.len()
    }

    /// Drop entries computed under the given application.
    pub fn clear_for_app(&self, app_name: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.app_name.as_deref() != Some(app_name));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.read().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Scope tag of a stored entry, for audit logging.
    pub fn scope_of(&self, key: &str) -> Option<CacheScope> {
        self.entries.read().get(key).map(|e| e.scope)
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, by: Duration) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.inserted_at -= by;
        }
    }
}
