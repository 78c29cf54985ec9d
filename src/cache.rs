//! Namespaced, byte-bounded LRU cache store.
//!
//! One [`CacheStore`] owns every namespace. Capacity is global: an insert
//! into any namespace may evict the least recently used entry of any other.
//! Values are serialized, passed through the at-rest transform, and accounted
//! at their stored size plus a fixed per-entry overhead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto::{AesCbcTransform, ValueTransform};
use crate::error::{TejasError, TejasResult};
use crate::lru::{CacheEntry, LruList};

/// Fixed per-entry overhead: expiry + timestamp + list structure.
const ENTRY_OVERHEAD_BYTES: u64 = 24;

/// Safety cap on the eviction loop.
const MAX_EVICTIONS_PER_INSERT: usize = 1000;

type DeleteHook = Box<dyn Fn(&str, &str) + Send + Sync>;

struct CacheInner {
    namespaces: HashMap<String, LruList>,
    global_bytes: u64,
}

/// Process-wide cache engine. All public operations take the store lock for
/// their full duration, eviction included.
pub struct CacheStore {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
    transform: Box<dyn ValueTransform>,
    on_delete: Option<DeleteHook>,
    log_enabled: bool,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub namespaces: usize,
    pub entries: usize,
    pub global_bytes: u64,
    pub max_bytes: u64,
}

impl CacheStore {
    /// Creates a store bounded by `max_size`, an absolute size string
    /// (`"512KB"`, `"100MB"`, `"1.5GB"`) or a percentage of physical memory
    /// (`"25%"`). Values are AES-encrypted with process-random material.
    pub fn new(max_size: &str) -> TejasResult<Self> {
        Ok(Self {
            inner: Mutex::new(CacheInner {
                namespaces: HashMap::new(),
                global_bytes: 0,
            }),
            max_bytes: parse_size(max_size)?,
            transform: Box::new(AesCbcTransform::generate()),
            on_delete: None,
            log_enabled: false,
        })
    }

    /// Replaces the at-rest transform. Intended for tests.
    pub fn with_transform(mut self, transform: Box<dyn ValueTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Hook invoked with `(namespace, key)` whenever an entry leaves the
    /// store implicitly, by eviction or expiry.
    pub fn with_on_delete(mut self, hook: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(hook));
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.log_enabled = enabled;
        self
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Stores a value under `namespace`/`key`. `ttl_ms` of `None` never
    /// expires. Evicts across namespaces until the entry fits; an entry
    /// larger than the whole store is rejected.
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl_ms: Option<u64>,
    ) -> TejasResult<()> {
        self.set_at(namespace, key, value, ttl_ms, now_ms())
    }

    pub(crate) fn set_at(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> TejasResult<()> {
        let plain = serde_json::to_vec(value).map_err(|e| TejasError::Storage(e.to_string()))?;
        let stored = self.transform.encode(&plain)?;
        let size = key.len() as u64 + stored.len() as u64 + ENTRY_OVERHEAD_BYTES;

        if size > self.max_bytes {
            warn!(namespace, key, size, max = self.max_bytes, "cache entry exceeds capacity");
            return Err(TejasError::Storage(format!(
                "entry of {} bytes exceeds cache capacity of {} bytes",
                size, self.max_bytes
            )));
        }

        let mut inner = self.inner.lock().expect("cache lock poisoned");

        // Replacing a key frees its old bytes before capacity is judged.
        if let Some(old) = inner
            .namespaces
            .get_mut(namespace)
            .and_then(|lru| lru.remove(key))
        {
            Self::debit(&mut inner, old.size_bytes);
        }

        self.enforce_global(&mut inner, size);
        if inner.global_bytes + size > self.max_bytes {
            return Err(TejasError::Storage(
                "cache capacity could not be reclaimed".to_string(),
            ));
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value: stored,
            expires_at_ms: ttl_ms.map(|ttl| now_ms.saturating_add(ttl)),
            created_at_ms: now_ms,
            touched_at_ms: now_ms,
            size_bytes: size,
        };

        let lru = inner
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(LruList::new);
        lru.insert(entry);
        inner.global_bytes += size;

        if self.log_enabled {
            debug!(namespace, key, size, global = inner.global_bytes, "cache set");
        }
        Ok(())
    }

    /// Fetches and promotes a value. Expired entries are deleted on read.
    pub fn get(&self, namespace: &str, key: &str) -> TejasResult<Option<Value>> {
        self.get_at(namespace, key, now_ms())
    }

    pub(crate) fn get_at(&self, namespace: &str, key: &str, now_ms: u64) -> TejasResult<Option<Value>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let expired = match inner.namespaces.get(namespace).and_then(|l| l.peek(key)) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(now_ms),
        };

        if expired {
            if let Some(entry) = inner
                .namespaces
                .get_mut(namespace)
                .and_then(|l| l.remove(key))
            {
                Self::debit(&mut inner, entry.size_bytes);
                drop(inner);
                self.notify_delete(namespace, key);
            }
            return Ok(None);
        }

        let stored = inner
            .namespaces
            .get_mut(namespace)
            .and_then(|l| l.touch(key, now_ms))
            .map(|entry| entry.value.clone());
        drop(inner);

        match stored {
            None => Ok(None),
            Some(bytes) => {
                let plain = self.transform.decode(&bytes)?;
                let value =
                    serde_json::from_slice(&plain).map_err(|e| TejasError::Storage(e.to_string()))?;
                Ok(Some(value))
            }
        }
    }

    /// Removes one entry. Returns whether it existed.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner
            .namespaces
            .get_mut(namespace)
            .and_then(|l| l.remove(key))
        {
            Some(entry) => {
                Self::debit(&mut inner, entry.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Clears one namespace, or the whole store when `namespace` is `None`.
    pub fn clear(&self, namespace: Option<&str>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match namespace {
            Some(ns) => {
                if let Some(lru) = inner.namespaces.get_mut(ns) {
                    let freed = lru.clear();
                    Self::debit(&mut inner, freed);
                }
            }
            None => {
                inner.namespaces.clear();
                inner.global_bytes = 0;
            }
        }
    }

    pub fn has(&self, namespace: &str, key: &str) -> bool {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .namespaces
            .get(namespace)
            .and_then(|l| l.peek(key))
            .map(|entry| !entry.is_expired(now_ms()))
            .unwrap_or(false)
    }

    pub fn len(&self, namespace: &str) -> usize {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.namespaces.get(namespace).map(|l| l.len()).unwrap_or(0)
    }

    /// Keys of one namespace, most recently used first.
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .namespaces
            .get(namespace)
            .map(|l| l.keys())
            .unwrap_or_default()
    }

    /// One page of keys; `page` is 1-based. The snapshot is taken under the
    /// store lock so a page is internally consistent.
    pub fn paginated_keys(&self, namespace: &str, page: usize, page_size: usize) -> Vec<String> {
        if page_size == 0 {
            return Vec::new();
        }
        let keys = self.keys(namespace);
        let start = page.saturating_sub(1).saturating_mul(page_size);
        keys.into_iter().skip(start).take(page_size).collect()
    }

    /// Decoded values of one namespace, most recently used first. Does not
    /// touch recency.
    pub fn values(&self, namespace: &str) -> TejasResult<Vec<Value>> {
        let stored: Vec<Vec<u8>> = {
            let inner = self.inner.lock().expect("cache lock poisoned");
            let now = now_ms();
            inner
                .namespaces
                .get(namespace)
                .map(|l| {
                    l.entries()
                        .into_iter()
                        .filter(|e| !e.is_expired(now))
                        .map(|e| e.value.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut out = Vec::with_capacity(stored.len());
        for bytes in stored {
            let plain = self.transform.decode(&bytes)?;
            out.push(
                serde_json::from_slice(&plain).map_err(|e| TejasError::Storage(e.to_string()))?,
            );
        }
        Ok(out)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            namespaces: inner.namespaces.len(),
            entries: inner.namespaces.values().map(|l| l.len()).sum(),
            global_bytes: inner.global_bytes,
            max_bytes: self.max_bytes,
        }
    }

    /// Evicts least recently used entries across every namespace until
    /// `required` extra bytes fit. Namespace order is sorted for determinism;
    /// the globally stalest tail goes first.
    fn enforce_global(&self, inner: &mut CacheInner, required: u64) {
        let mut iterations = 0;
        while inner.global_bytes.saturating_add(required) > self.max_bytes {
            if iterations >= MAX_EVICTIONS_PER_INSERT {
                warn!(global = inner.global_bytes, "eviction iteration cap reached");
                break;
            }
            iterations += 1;

            let before = inner.global_bytes;
            let victim_ns = {
                let mut names: Vec<&String> = inner
                    .namespaces
                    .iter()
                    .filter(|(_, l)| !l.is_empty())
                    .map(|(name, _)| name)
                    .collect();
                names.sort();
                names
                    .into_iter()
                    .min_by_key(|name| {
                        inner.namespaces[*name]
                            .tail_entry()
                            .map(|e| e.touched_at_ms)
                            .unwrap_or(u64::MAX)
                    })
                    .cloned()
            };

            let Some(ns) = victim_ns else { break };
            let Some(entry) = inner.namespaces.get_mut(&ns).and_then(|l| l.pop_tail()) else {
                break;
            };
            Self::debit(inner, entry.size_bytes);
            if self.log_enabled {
                debug!(namespace = %ns, key = %entry.key, "cache evict");
            }
            self.notify_delete(&ns, &entry.key);

            if inner.global_bytes >= before {
                warn!("eviction made no progress, breaking");
                break;
            }
        }
    }

    fn debit(inner: &mut CacheInner, bytes: u64) {
        if bytes > inner.global_bytes {
            warn!(
                freed = bytes,
                global = inner.global_bytes,
                "cache accounting underflow, clamping to zero"
            );
            inner.global_bytes = 0;
        } else {
            inner.global_bytes -= bytes;
        }
    }

    fn notify_delete(&self, namespace: &str, key: &str) {
        if let Some(hook) = &self.on_delete {
            hook(namespace, key);
        }
    }
}

/// Parses a cache capacity: `"512KB"` / `"100MB"` / `"1.5GB"`
/// (case-insensitive, 1024-based) or `"25%"` of host physical memory,
/// strictly in (0, 100].
pub fn parse_size(input: &str) -> TejasResult<u64> {
    let s = input.trim();

    if let Some(pct) = s.strip_suffix('%') {
        let p: f64 = pct
            .trim()
            .parse()
            .map_err(|_| TejasError::Config(format!("invalid percentage: {}", input)))?;
        if !(p > 0.0 && p <= 100.0) {
            return Err(TejasError::Config(format!(
                "percentage must be in (0, 100]: {}",
                input
            )));
        }
        let total = total_physical_memory();
        return Ok((total as f64 * p / 100.0) as u64);
    }

    let upper = s.to_ascii_uppercase();
    for (suffix, multiplier) in [
        ("GB", 1024u64 * 1024 * 1024),
        ("MB", 1024 * 1024),
        ("KB", 1024),
    ] {
        if let Some(number) = upper.strip_suffix(suffix) {
            let n: f64 = number
                .trim()
                .parse()
                .map_err(|_| TejasError::Config(format!("invalid size: {}", input)))?;
            if n <= 0.0 {
                return Err(TejasError::Config(format!("size must be positive: {}", input)));
            }
            return Ok((n * multiplier as f64) as u64);
        }
    }

    Err(TejasError::Config(format!(
        "unrecognized size string: {}",
        input
    )))
}

fn total_physical_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
