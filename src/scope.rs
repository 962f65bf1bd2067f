//! Thread-local dependency tracking for the currently running computation.
//!
//! A [`Scope`] is entered for the duration of one computation; every
//! variable read while it is current appends a `(variable, version)` pair
//! to its dependency map. When the computation finishes, those pairs arm a
//! [`Trigger`](crate::Trigger) that re-schedules the computation when any
//! of them advances.
//!
//! The free functions in this module operate on the current scope and fall
//! back to sensible no-ops when there is none, so plain code and tests run
//! without any ambient scope.

use std::cell::RefCell;
use std::fmt;
use std::hash::{BuildHasherDefault, Hash};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::map::Entry;
use indexmap::IndexMap;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::store::{CacheKey, FreezeStore, PinStore};
use crate::value::{Error, Value};
use crate::variable::{Dependency, DependencyVersion, Variable};
use crate::version::Version;

pub(crate) type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

thread_local! {
    static CURRENT: RefCell<Option<Scope>> = RefCell::new(None);
}

/// Per-computation dependency tracker.
///
/// Scopes collect the variables a computation reads, the blocking flag, and
/// the freeze/pin caches the computation uses. A scope is meant to be
/// entered on one thread at a time; entering an already-active scope
/// panics.
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Clone for Scope {
    fn clone(&self) -> Scope {
        Scope {
            inner: self.inner.clone(),
        }
    }
}

struct ScopeInner {
    active: AtomicBool,
    state: Mutex<ScopeState>,
}

struct ScopeState {
    dependencies: FxIndexMap<usize, DependencyVersion>,
    blocked: bool,
    freezes: Option<FreezeStore>,
    pins: Option<PinStore>,
}

impl Scope {
    /// Creates an empty scope.
    pub fn new() -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                active: AtomicBool::new(false),
                state: Mutex::new(ScopeState {
                    dependencies: FxIndexMap::default(),
                    blocked: false,
                    freezes: None,
                    pins: None,
                }),
            }),
        }
    }

    /// The scope the current thread is tracking into, if any.
    pub fn current() -> Option<Scope> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Makes this scope the thread's current scope until the returned guard
    /// is dropped; the previous current scope is restored on exit.
    ///
    /// # Panics
    ///
    /// Panics when the scope is already entered somewhere.
    pub fn enter(&self) -> ScopeGuard {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            panic!("scope is already entered");
        }
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        ScopeGuard {
            scope: self.clone(),
            previous,
            _not_send: PhantomData,
        }
    }

    /// Suspends dependency tracking until the returned guard is dropped.
    /// Reads still happen, they are just not recorded anywhere.
    pub fn ignore() -> IgnoreGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().take());
        IgnoreGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Enters a child scope that shares the parent's freezes and pins. When
    /// the guard is dropped, the child's dependencies and pin entries are
    /// copied to the parent — but neither the blocking flag nor pin
    /// invalidation, which is what gives the caller a fresh blocking flag
    /// to inspect.
    pub fn nonblocking() -> NonblockingGuard {
        let parent = Scope::current();
        let child = Scope::new();
        if let Some(parent) = &parent {
            let freezes = parent.freezes();
            let pins = PinStore::with_parent(parent.pins());
            let mut state = child.inner.state.lock();
            // A blocked parent blocks the child up front, so pins captured
            // in the child obey the same refusal rules they would in the
            // parent.
            state.blocked = parent.blocked();
            state.freezes = Some(freezes);
            state.pins = Some(pins);
        }
        let entered = child.enter();
        NonblockingGuard {
            child,
            parent,
            entered: Some(entered),
        }
    }

    /// Records a read of `variable` at its current version.
    pub fn watch<T: Send + Sync + 'static>(&self, variable: &Variable<T>) {
        self.watch_dependency(variable.as_dependency(), variable.version());
    }

    /// Records a read of `variable` at an explicit version. When the
    /// variable is already tracked, the earlier of the two versions wins,
    /// which is what lets partial scopes be merged compositionally.
    pub fn watch_at<T: Send + Sync + 'static>(&self, variable: &Variable<T>, version: Version) {
        self.watch_dependency(variable.as_dependency(), version);
    }

    pub(crate) fn watch_dependency(&self, source: Arc<dyn Dependency>, version: Version) {
        let entry = DependencyVersion::new(source, version);
        let key = entry.key();
        let mut state = self.inner.state.lock();
        match state.dependencies.entry(key) {
            Entry::Occupied(mut occupied) => {
                if version < occupied.get().version() {
                    occupied.insert(entry);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }

    /// Snapshot of the tracked `(dependency, version)` pairs, used to arm a
    /// trigger.
    ///
    /// One special case: when the scope has not blocked but its pin store
    /// is non-empty and invalid, the pinned values that flowed into this
    /// evaluation are stale. The snapshot is then a single synthetic
    /// outdated dependency, which makes the armed trigger fire immediately
    /// and forces one re-evaluation that re-collects pins from scratch.
    pub fn versions(&self) -> Vec<DependencyVersion> {
        let state = self.inner.state.lock();
        if !state.blocked {
            if let Some(pins) = &state.pins {
                if !pins.is_empty() && !pins.valid() {
                    debug!("scope carries invalid pins; reporting synthetic outdated dependency");
                    return vec![outdated()];
                }
            }
        }
        state.dependencies.values().cloned().collect()
    }

    pub(crate) fn raw_versions(&self) -> Vec<DependencyVersion> {
        let state = self.inner.state.lock();
        state.dependencies.values().cloned().collect()
    }

    /// Marks the computation incomplete and invalidates a non-empty pin
    /// store.
    pub fn block(&self) {
        let mut state = self.inner.state.lock();
        if !state.blocked {
            state.blocked = true;
            if let Some(pins) = &state.pins {
                pins.invalidate();
            }
        }
    }

    /// Whether this scope has been marked blocked.
    pub fn blocked(&self) -> bool {
        self.inner.state.lock().blocked
    }

    /// The scope's freeze store, created on first use.
    pub fn freezes(&self) -> FreezeStore {
        self.inner
            .state
            .lock()
            .freezes
            .get_or_insert_with(FreezeStore::new)
            .clone()
    }

    /// Replaces the freeze store, typically to share one across scopes.
    pub fn set_freezes(&self, freezes: FreezeStore) {
        self.inner.state.lock().freezes = Some(freezes);
    }

    /// The scope's pin store, created on first use.
    pub fn pins(&self) -> PinStore {
        self.inner
            .state
            .lock()
            .pins
            .get_or_insert_with(PinStore::new)
            .clone()
    }

    /// Replaces the pin store, typically to carry pins from a previous
    /// blocking evaluation into this one.
    pub fn set_pins(&self, pins: PinStore) {
        self.inner.state.lock().pins = Some(pins);
    }

    /// Single-evaluation cache keyed by `key`. See [`FreezeStore::freeze`].
    pub fn freeze<K, T, F>(&self, key: K, supplier: F) -> Value<T>
    where
        K: Eq + Hash + Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, Error>,
    {
        self.freezes().freeze(CacheKey::new(key), supplier)
    }

    /// Cross-iteration cache keyed by `key`. See [`PinStore::pin`].
    pub fn pin<K, T, F>(&self, key: K, supplier: F) -> Value<T>
    where
        K: Eq + Hash + Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, Error>,
    {
        self.pins().pin(CacheKey::new(key), supplier)
    }
}

impl Default for Scope {
    fn default() -> Scope {
        Scope::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        fmt.debug_struct("Scope")
            .field("dependencies", &state.dependencies.len())
            .field("blocked", &state.blocked)
            .finish()
    }
}

fn outdated() -> DependencyVersion {
    let sentinel: Variable<()> = Variable::new(());
    DependencyVersion::new(sentinel.as_dependency(), Version::pre_start())
}

/// Guard returned by [`Scope::enter`]; restores the previous current scope
/// on drop.
pub struct ScopeGuard {
    scope: Scope,
    previous: Option<Scope>,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = self.previous.take();
        });
        self.scope.inner.active.store(false, Ordering::SeqCst);
    }
}

/// Guard returned by [`Scope::ignore`]; restores tracking on drop.
pub struct IgnoreGuard {
    previous: Option<Scope>,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = self.previous.take();
        });
    }
}

/// Guard returned by [`Scope::nonblocking`].
pub struct NonblockingGuard {
    child: Scope,
    parent: Option<Scope>,
    entered: Option<ScopeGuard>,
}

impl NonblockingGuard {
    /// The child scope computations are currently tracking into.
    pub fn scope(&self) -> &Scope {
        &self.child
    }
}

impl Drop for NonblockingGuard {
    fn drop(&mut self) {
        self.entered.take();
        if let Some(parent) = &self.parent {
            for entry in self.child.raw_versions() {
                parent.watch_dependency(entry.source().clone(), entry.version());
            }
            let child_state = self.child.inner.state.lock();
            if let Some(pins) = &child_state.pins {
                pins.merge_into(&parent.pins());
            }
        }
    }
}

/// Whether the current scope, if any, is blocked.
pub fn blocked() -> bool {
    Scope::current().map_or(false, |scope| scope.blocked())
}

/// Marks the current scope blocked. A no-op without a scope.
pub fn block() {
    if let Some(scope) = Scope::current() {
        scope.block();
    }
}

/// Freezes against the current scope. Without a scope the supplier is
/// evaluated directly, uncached.
pub fn freeze<K, T, F>(key: K, supplier: F) -> Value<T>
where
    K: Eq + Hash + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T, Error>,
{
    match Scope::current() {
        Some(scope) => scope.freeze(key, supplier),
        None => Value::capture(supplier),
    }
}

/// Pins against the current scope. Without a scope the supplier is
/// evaluated directly, uncached.
pub fn pin<K, T, F>(key: K, supplier: F) -> Value<T>
where
    K: Eq + Hash + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T, Error>,
{
    match Scope::current() {
        Some(scope) => scope.pin(key, supplier),
        None => Value::capture(supplier),
    }
}
