use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::value::{Error, Value};

/// Erased cache key for freeze and pin stores.
///
/// Any `Eq + Hash + Send + Sync + 'static` value works as a key; the hash is
/// precomputed over the key type and contents so map lookups stay cheap.
pub struct CacheKey {
    hash: u64,
    key: Arc<dyn ErasedKey>,
}

impl Clone for CacheKey {
    fn clone(&self) -> CacheKey {
        CacheKey {
            hash: self.hash,
            key: self.key.clone(),
        }
    }
}

trait ErasedKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_key(&self, other: &dyn ErasedKey) -> bool;
}

impl<K: Eq + Hash + Send + Sync + 'static> ErasedKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_key(&self, other: &dyn ErasedKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .map_or(false, |other| self == other)
    }
}

impl CacheKey {
    /// Erases a key.
    pub fn new<K: Eq + Hash + Send + Sync + 'static>(key: K) -> CacheKey {
        let mut hasher = FxHasher::default();
        TypeId::of::<K>().hash(&mut hasher);
        key.hash(&mut hasher);
        CacheKey {
            hash: hasher.finish(),
            key: Arc::new(key),
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &CacheKey) -> bool {
        self.hash == other.hash && self.key.eq_key(&*other.key)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "CacheKey({:016x})", self.hash)
    }
}

type Entries = Mutex<FxHashMap<CacheKey, Arc<dyn Any + Send + Sync>>>;

fn lookup_entry<T: Send + Sync + 'static>(
    entries: &Entries,
    key: &CacheKey,
) -> Option<Value<T>> {
    entries
        .lock()
        .get(key)
        .and_then(|stored| stored.downcast_ref::<Value<T>>())
        .cloned()
}

/// Scope-local single-evaluation cache.
///
/// `freeze` evaluates the supplier at most once per store tree for a given
/// key and replays the captured [`Value`] — errors and blocking included —
/// on every later call. Lookup walks the parent chain, so child scopes can
/// share a parent's freezes without copying them.
#[derive(Clone)]
pub struct FreezeStore {
    inner: Arc<FreezeInner>,
}

struct FreezeInner {
    entries: Entries,
    parent: Option<FreezeStore>,
}

impl FreezeStore {
    /// Creates an empty store.
    pub fn new() -> FreezeStore {
        FreezeStore::construct(None)
    }

    /// Creates an empty store that falls back to `parent` on lookup.
    pub fn with_parent(parent: FreezeStore) -> FreezeStore {
        FreezeStore::construct(Some(parent))
    }

    fn construct(parent: Option<FreezeStore>) -> FreezeStore {
        FreezeStore {
            inner: Arc::new(FreezeInner {
                entries: Mutex::new(FxHashMap::default()),
                parent,
            }),
        }
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Value<T>> {
        lookup_entry(&self.inner.entries, key)
            .or_else(|| self.inner.parent.as_ref().and_then(|parent| parent.lookup(key)))
    }

    /// Returns the cached value for `key`, evaluating and capturing the
    /// supplier on a miss. Nested freezes are allowed.
    pub fn freeze<T, F>(&self, key: CacheKey, supplier: F) -> Value<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, Error>,
    {
        if let Some(cached) = self.lookup(&key) {
            return cached;
        }
        let value = Value::capture(supplier);
        let mut entries = self.inner.entries.lock();
        // A nested evaluation may have stored this key in the meantime;
        // the first capture wins so replay stays deterministic.
        if let Some(stored) = entries.get(&key).and_then(|s| s.downcast_ref::<Value<T>>()) {
            return stored.clone();
        }
        entries.insert(key, Arc::new(value.clone()));
        value
    }

    /// Number of entries in this store, parents excluded.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether this store holds no entries of its own.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FreezeStore {
    fn default() -> FreezeStore {
        FreezeStore::new()
    }
}

impl fmt::Debug for FreezeStore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "FreezeStore({} entries)", self.len())
    }
}

/// Cross-iteration idempotence cache.
///
/// A pin is like a freeze that survives successive re-evaluations of a
/// blocking computation, with two extra rules: a blocking value is never
/// stored (the computation it came from has not finished), and the store
/// carries a validity bit that the owning scope clears when it blocks.
/// Validity is AND-ed over the parent chain; an empty store is never
/// invalidated.
#[derive(Clone)]
pub struct PinStore {
    inner: Arc<PinInner>,
}

struct PinInner {
    entries: Entries,
    valid: AtomicBool,
    parent: Option<PinStore>,
}

impl PinStore {
    /// Creates an empty, valid store.
    pub fn new() -> PinStore {
        PinStore::construct(None)
    }

    /// Creates an empty store that falls back to `parent` on lookup.
    pub fn with_parent(parent: PinStore) -> PinStore {
        PinStore::construct(Some(parent))
    }

    fn construct(parent: Option<PinStore>) -> PinStore {
        PinStore {
            inner: Arc::new(PinInner {
                entries: Mutex::new(FxHashMap::default()),
                valid: AtomicBool::new(true),
                parent,
            }),
        }
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Value<T>> {
        lookup_entry(&self.inner.entries, key)
            .or_else(|| self.inner.parent.as_ref().and_then(|parent| parent.lookup(key)))
    }

    /// Returns the cached value for `key`, evaluating and capturing the
    /// supplier on a miss. The captured value is stored only when it is
    /// non-blocking; a blocking value is returned but not cached, so a
    /// later call with the same key evaluates again.
    pub fn pin<T, F>(&self, key: CacheKey, supplier: F) -> Value<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, Error>,
    {
        if let Some(cached) = self.lookup(&key) {
            return cached;
        }
        let value = Value::capture(supplier);
        if !value.blocking() {
            let mut entries = self.inner.entries.lock();
            if let Some(stored) = entries.get(&key).and_then(|s| s.downcast_ref::<Value<T>>()) {
                return stored.clone();
            }
            entries.insert(key, Arc::new(value.clone()));
        }
        value
    }

    /// Stores a value explicitly. Used when rebuilding a scope's pins
    /// between evaluations.
    ///
    /// # Panics
    ///
    /// Panics when the value is blocking.
    pub fn set<T: Send + Sync + 'static>(&self, key: CacheKey, value: Value<T>) {
        if value.blocking() {
            panic!("cannot pin a blocking value");
        }
        self.inner.entries.lock().insert(key, Arc::new(value));
    }

    /// Removes the entry for `key` from this store. Returns whether an
    /// entry was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.entries.lock().remove(key).is_some()
    }

    /// Keys held by this store, parents excluded.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    /// Whether this store and every ancestor are still valid.
    pub fn valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
            && self.inner.parent.as_ref().map_or(true, |parent| parent.valid())
    }

    /// Clears the validity bit, unless the store holds no entries.
    pub(crate) fn invalidate(&self) {
        if !self.inner.entries.lock().is_empty() {
            self.inner.valid.store(false, Ordering::SeqCst);
        }
    }

    /// Copies this store's own entries into `target`. Validity is never
    /// copied.
    pub(crate) fn merge_into(&self, target: &PinStore) {
        if Arc::ptr_eq(&self.inner, &target.inner) {
            return;
        }
        let entries = self.inner.entries.lock().clone();
        let mut target_entries = target.inner.entries.lock();
        for (key, value) in entries {
            target_entries.entry(key).or_insert(value);
        }
    }

    /// Number of entries in this store, parents excluded.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether this store holds no entries of its own.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PinStore {
    fn default() -> PinStore {
        PinStore::new()
    }
}

impl fmt::Debug for PinStore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "PinStore({} entries, valid: {})",
            self.len(),
            self.valid()
        )
    }
}
