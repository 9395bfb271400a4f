//! Process-lifetime result caching.
//!
//! [`ResultCache`] is the store behind the cache-enabled variant of
//! [`BatchController`](crate::BatchController). [`CachedRequest`] wraps a
//! plain single-key request function with the same caching, plus
//! deduplication of concurrent calls for the same key.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// A cached value and the moment it was recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<Value> {
    pub value: Value,
    pub fetched_at: Instant,
}

/// A key-value cache with no TTL and no eviction. Entries live until they
/// are explicitly invalidated or the whole cache is cleared.
pub struct ResultCache<Key, Value> {
    entries: Mutex<HashMap<Key, CacheEntry<Value>>>,
}

impl<Key, Value> Default for ResultCache<Key, Value> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<Key, Value> Debug for ResultCache<Key, Value> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl<Key: Eq + Hash, Value: Clone> ResultCache<Key, Value> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Value>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Like `get`, but also reports when the value was fetched.
    pub fn entry<Q>(&self, key: &Q) -> Option<CacheEntry<Value>>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: Key, value: Value) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Forget a single key. Returns true if there was something to forget.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

type SharedFetch<Value, Error> = Shared<BoxFuture<'static, Result<Value, Error>>>;

/// A named, cached single-key request. Concurrent calls for the same key
/// share one in-flight request; successful results are cached until
/// invalidated, failures are not cached at all.
///
/// ```
/// use chatloader::CachedRequest;
/// use futures::executor::block_on;
///
/// let token_valid = CachedRequest::new("tokenValid", |token: String| async move {
///     Ok::<_, ()>(token.starts_with("ey"))
/// });
///
/// assert_eq!(block_on(token_valid.call("eyJhbGci".to_owned())), Ok(true));
/// assert_eq!(token_valid.cache().len(), 1);
/// ```
pub struct CachedRequest<Key, Value, Error, Fetch> {
    name: &'static str,
    fetch: Fetch,
    cache: ResultCache<Key, Value>,
    inflight: Mutex<HashMap<Key, SharedFetch<Value, Error>>>,
}

impl<Key, Value, Error, Fetch> Debug for CachedRequest<Key, Value, Error, Fetch> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedRequest")
            .field("name", &self.name)
            .field("fetch", &"<closure>")
            .field("cache", &self.cache)
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

impl<Key, Value, Error, Fetch, Fut> CachedRequest<Key, Value, Error, Fetch>
where
    Key: Eq + Hash + Clone,
    Value: Clone + Send + Sync + 'static,
    Error: Clone + Send + Sync + 'static,
    Fetch: Fn(Key) -> Fut,
    Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
    pub fn new(name: &'static str, fetch: Fetch) -> Self {
        Self {
            name,
            fetch,
            cache: ResultCache::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cache(&self) -> &ResultCache<Key, Value> {
        &self.cache
    }

    pub async fn call(&self, key: Key) -> Result<Value, Error> {
        if let Some(value) = self.cache.get(&key) {
            tracing::trace!(request = self.name, "cache hit");
            return Ok(value);
        }

        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    tracing::trace!(request = self.name, "starting request");
                    let fetch = (self.fetch)(key.clone()).boxed().shared();
                    inflight.insert(key.clone(), fetch.clone());
                    fetch
                }
            }
        };

        let result = shared.clone().await;

        // Cache first, so that nobody sneaks in between the in-flight entry
        // going away and the value showing up.
        if let Ok(value) = &result {
            self.cache.insert(key.clone(), value.clone());
        }

        let mut inflight = self.inflight.lock();
        if inflight
            .get(&key)
            .map_or(false, |current| current.ptr_eq(&shared))
        {
            inflight.remove(&key);
        }

        result
    }
}
