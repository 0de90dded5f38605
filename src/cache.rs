//! Read-through query cache.
//!
//! A [`CacheQuery`] owns one SQL template with `{0}`, `{1}`... placeholders.
//! Results are cached per parameter list with optional absolute and sliding
//! expiration and a bounded entry count. Caches are shared by name through an
//! explicit [`CacheRegistry`].
//!
//! # Example
//!
//! ```ignore
//! let registry = CacheRegistry::new();
//! let users = registry.get_or_create(
//!     "users",
//!     &adapter,
//!     "SELECT * FROM users WHERE id = {0}",
//!     CacheOptions::default().with_sliding_expiration(Duration::from_secs(60)),
//! );
//! let table = users.get(false, &[&42]).await;
//! ```

use crate::db::MySqlAdapter;
use crate::db::types::convert_scalar;
use crate::models::{ScalarResult, Table};
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt::{Display, Write as _};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// One template parameter. Must be `Sync` so lookup futures are `Send`.
pub type CacheParam<'a> = &'a (dyn Display + Sync);

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}").expect("valid regex"));

/// Size and lifetime limits of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Maximum number of entries (0 disables caching)
    pub capacity: usize,
    /// Lifetime measured from insertion
    pub absolute_expiration: Option<Duration>,
    /// Lifetime measured from the last read
    pub sliding_expiration: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            absolute_expiration: None,
            sliding_expiration: None,
        }
    }
}

impl CacheOptions {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_absolute_expiration(mut self, ttl: Duration) -> Self {
        self.absolute_expiration = Some(ttl);
        self
    }

    pub fn with_sliding_expiration(mut self, ttl: Duration) -> Self {
        self.sliding_expiration = Some(ttl);
        self
    }
}

// =============================================================================
// Expiring store
// =============================================================================

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    accessed_at: Instant,
}

/// Bounded map with absolute/sliding expiration. Eviction prefers expired
/// entries, then the least recently read.
#[derive(Debug)]
struct ExpiringCache<V> {
    options: CacheOptions,
    entries: HashMap<String, Entry<V>>,
}

impl<V: Clone> ExpiringCache<V> {
    fn new(options: CacheOptions) -> Self {
        Self {
            options,
            entries: HashMap::new(),
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        let absolute = self
            .options
            .absolute_expiration
            .is_some_and(|ttl| now.duration_since(entry.inserted_at) >= ttl);
        let sliding = self
            .options
            .sliding_expiration
            .is_some_and(|ttl| now.duration_since(entry.accessed_at) >= ttl);
        absolute || sliding
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = self.entries.get(key).map(|e| self.is_expired(e, now))?;
        if expired {
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.accessed_at = now;
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: String, value: V, now: Instant) {
        if self.options.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.options.capacity {
            self.purge_expired(now);
            if self.entries.len() >= self.options.capacity {
                self.evict_least_recent();
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                accessed_at: now,
            },
        );
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
        }
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.accessed_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// CacheQuery
// =============================================================================

#[derive(Debug, Clone)]
enum Cached {
    Table(Option<Table>),
    Scalar(Option<ScalarResult<JsonValue>>),
}

const TABLE_KEY: &str = "t:";
const SCALAR_KEY: &str = "s:";

/// Cached SQL template.
pub struct CacheQuery {
    adapter: MySqlAdapter,
    template: String,
    store: Mutex<ExpiringCache<Cached>>,
}

impl CacheQuery {
    pub fn new(adapter: MySqlAdapter, template: impl Into<String>, options: CacheOptions) -> Self {
        Self {
            adapter,
            template: template.into(),
            store: Mutex::new(ExpiringCache::new(options)),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn store(&self) -> MutexGuard<'_, ExpiringCache<Cached>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Table for `params`, from the cache or via `select`.
    ///
    /// With `cache_null` a failed call (`None`) is cached too.
    pub async fn get(&self, cache_null: bool, params: &[CacheParam<'_>]) -> Option<Table> {
        let key = cache_key(TABLE_KEY, params);
        let hit = self.store().get(&key, Instant::now());
        if let Some(Cached::Table(table)) = hit {
            debug!(template = %self.template, key = %key, "Cache hit");
            return table;
        }

        let sql = render_template(&self.template, params);
        let table = self.adapter.select(&sql).await;
        if cache_null || table.is_some() {
            self.store()
                .insert(key, Cached::Table(table.clone()), Instant::now());
        }
        table
    }

    /// Scalar for `params`, from the cache or via `select_scalar`.
    pub async fn get_scalar<T>(&self, cache_null: bool, params: &[CacheParam<'_>]) -> Option<ScalarResult<T>>
    where
        T: DeserializeOwned,
    {
        let key = cache_key(SCALAR_KEY, params);
        let hit = self.store().get(&key, Instant::now());
        let cached = match hit {
            Some(Cached::Scalar(scalar)) => {
                debug!(template = %self.template, key = %key, "Cache hit");
                Some(scalar)
            }
            _ => None,
        };

        let scalar = match cached {
            Some(scalar) => scalar,
            None => {
                let sql = render_template(&self.template, params);
                let scalar = self.adapter.select_scalar::<JsonValue>(&sql).await;
                if cache_null || scalar.is_some() {
                    self.store()
                        .insert(key, Cached::Scalar(scalar.clone()), Instant::now());
                }
                scalar
            }
        };

        let value = match scalar?.into_value() {
            Some(value) => value,
            None => return Some(ScalarResult::db_null()),
        };
        match convert_scalar::<T>(&value) {
            Ok(converted) => Some(ScalarResult::new(converted)),
            Err(e) => {
                warn!(template = %self.template, error = %e, "Cached scalar has the wrong type");
                None
            }
        }
    }

    /// Drop the cached table and scalar for `params`.
    pub fn invalidate(&self, params: &[CacheParam<'_>]) -> bool {
        let mut store = self.store();
        let table = store.remove(&cache_key(TABLE_KEY, params));
        let scalar = store.remove(&cache_key(SCALAR_KEY, params));
        table || scalar
    }

    pub fn clear(&self) {
        self.store().clear();
    }

    /// Entries currently held, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Each parameter's text followed by `_`.
fn cache_key(kind: &str, params: &[CacheParam<'_>]) -> String {
    let mut key = String::from(kind);
    for param in params {
        let _ = write!(key, "{}_", param);
    }
    key
}

/// Substitute `{n}` with the n-th parameter; unknown indexes stay as written.
pub fn render_template(template: &str, params: &[CacheParam<'_>]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| params.get(i))
                .map(|p| p.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

// =============================================================================
// Registry
// =============================================================================

/// Named caches shared between callers.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Arc<CacheQuery>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache registered as `name`, created on first use. Later calls
    /// return the existing cache and ignore the other arguments.
    pub fn get_or_create(
        &self,
        name: &str,
        adapter: &MySqlAdapter,
        template: &str,
        options: CacheOptions,
    ) -> Arc<CacheQuery> {
        if let Some(cache) = self.get(name) {
            return cache;
        }
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CacheQuery::new(adapter.clone(), template, options))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CacheQuery>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CacheQuery>> {
        self.caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key(TABLE_KEY, &[&1, &"a"]), "t:1_a_");
        assert_eq!(cache_key(SCALAR_KEY, &[]), "s:");
    }

    #[test]
    fn test_render_template() {
        assert_eq!(
            render_template("SELECT * FROM t WHERE a = {0} AND b = '{1}'", &[&5, &"x"]),
            "SELECT * FROM t WHERE a = 5 AND b = 'x'"
        );
        assert_eq!(render_template("{0} {3}", &[&"only"]), "only {3}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_expiration() {
        let mut cache = ExpiringCache::new(
            CacheOptions::default().with_absolute_expiration(Duration::from_secs(10)),
        );
        cache.insert("k".to_string(), 1, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k", Instant::now()), Some(1));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k", Instant::now()), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expiration_renews_on_read() {
        let mut cache = ExpiringCache::new(
            CacheOptions::default().with_sliding_expiration(Duration::from_secs(10)),
        );
        cache.insert("k".to_string(), 1, Instant::now());
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(8)).await;
            assert_eq!(cache.get("k", Instant::now()), Some(1));
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k", Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_expired_then_lru() {
        let mut cache = ExpiringCache::new(
            CacheOptions::default()
                .with_capacity(2)
                .with_sliding_expiration(Duration::from_secs(10)),
        );
        cache.insert("a".to_string(), 1, Instant::now());
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("b".to_string(), 2, Instant::now());
        tokio::time::advance(Duration::from_secs(1)).await;
        // "a" is now the least recently read
        assert_eq!(cache.get("b", Instant::now()), Some(2));
        cache.insert("c".to_string(), 3, Instant::now());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a", Instant::now()), None);
        assert_eq!(cache.get("c", Instant::now()), Some(3));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut cache = ExpiringCache::new(CacheOptions::default().with_capacity(0));
        let now = Instant::now();
        cache.insert("k".to_string(), 1, now);
        assert_eq!(cache.get("k", now), None);
    }
}
