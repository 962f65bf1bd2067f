use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::scope::Scope;
use crate::trigger::{Trigger, TriggerCore};
use crate::value::{equal_guarded, CapturedError, Value};
use crate::version::{AtomicVersion, Version};

/// Anything a reactive computation can depend on: a versioned source that
/// triggers can subscribe to.
///
/// Every [`Variable`] is a dependency; scopes and triggers only ever see
/// this trait, which is what lets a single trigger watch variables of
/// different payload types.
pub trait Dependency: Send + Sync {
    /// Current version of this source.
    fn version(&self) -> Version;

    /// Registers a trigger to be fired when the version advances. The
    /// registration is weak: a dropped trigger is pruned lazily.
    fn subscribe(&self, trigger: &Trigger);

    /// Removes a previously registered trigger.
    fn unsubscribe(&self, trigger: &Trigger);
}

/// A dependency at the version it was first observed.
#[derive(Clone)]
pub struct DependencyVersion {
    source: Arc<dyn Dependency>,
    version: Version,
}

impl DependencyVersion {
    pub(crate) fn new(source: Arc<dyn Dependency>, version: Version) -> DependencyVersion {
        DependencyVersion { source, version }
    }

    /// The watched source.
    pub fn source(&self) -> &Arc<dyn Dependency> {
        &self.source
    }

    /// The version recorded when the source was first read.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether the source has advanced past the recorded version.
    pub fn outdated(&self) -> bool {
        self.source.version() != self.version
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.source) as *const () as usize
    }
}

impl fmt::Debug for DependencyVersion {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "DependencyVersion({:#x} @ {:?})", self.key(), self.version)
    }
}

/// Subscriber registration keyed by the trigger's precomputed random hash,
/// so set membership checks never touch the trigger itself.
#[derive(Copy, Clone, PartialEq, Eq)]
struct SubscriberKey {
    hash: u64,
    addr: usize,
}

impl Hash for SubscriberKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Default)]
pub(crate) struct SubscriberSet {
    entries: FxHashMap<SubscriberKey, Weak<TriggerCore>>,
}

impl SubscriberSet {
    fn key(trigger: &Trigger) -> SubscriberKey {
        SubscriberKey {
            hash: trigger.hash(),
            addr: trigger.addr(),
        }
    }

    fn insert(&mut self, trigger: &Trigger) {
        self.entries.insert(Self::key(trigger), trigger.downgrade());
    }

    fn remove(&mut self, trigger: &Trigger) {
        self.entries.remove(&Self::key(trigger));
    }

    /// Copies the live subscribers out and prunes the dead ones.
    fn snapshot(&mut self) -> SmallVec<[Arc<TriggerCore>; 8]> {
        let mut live = SmallVec::new();
        self.entries.retain(|_, weak| match weak.upgrade() {
            Some(core) => {
                live.push(core);
                true
            }
            None => false,
        });
        live
    }
}

/// A mutable reactive cell.
///
/// A variable holds a [`Value`] and a monotonically increasing [`Version`].
/// Reading the variable inside an entered [`Scope`] records a dependency;
/// writing it advances the version and fires every subscribed trigger.
/// Variables are cheap-to-clone handles onto shared state and all
/// operations are thread-safe.
///
/// By default writes that compare equal to the stored value are dropped
/// without a version bump, which is what stops change storms from
/// propagating through chains of derived computations.
pub struct Variable<T: Send + Sync + 'static> {
    inner: Arc<VarInner<T>>,
}

impl<T: Send + Sync + 'static> Clone for Variable<T> {
    fn clone(&self) -> Variable<T> {
        Variable {
            inner: self.inner.clone(),
        }
    }
}

struct VarInner<T: Send + Sync + 'static> {
    state: Mutex<VarState<T>>,
    version: AtomicVersion,
    equality: AtomicBool,
    compare: Option<fn(&Value<T>, &Value<T>) -> bool>,
}

struct VarState<T> {
    value: Value<T>,
    subscribers: SubscriberSet,
    keepalive: Vec<Box<dyn Any + Send + Sync>>,
}

impl<T: Send + Sync + PartialEq + 'static> Variable<T> {
    /// Creates a variable holding a completed result.
    pub fn new(initial: T) -> Variable<T> {
        Variable::from_value(Value::of(initial))
    }

    /// Creates a variable holding the given value.
    pub fn from_value(initial: Value<T>) -> Variable<T> {
        Variable::construct(initial, Some(equal_guarded::<T>))
    }
}

impl<T: Send + Sync + 'static> Variable<T> {
    /// Creates a variable for a payload type that cannot be compared.
    /// Every write is accepted and bumps the version.
    pub fn without_equality(initial: Value<T>) -> Variable<T> {
        Variable::construct(initial, None)
    }

    fn construct(
        initial: Value<T>,
        compare: Option<fn(&Value<T>, &Value<T>) -> bool>,
    ) -> Variable<T> {
        Variable {
            inner: Arc::new(VarInner {
                state: Mutex::new(VarState {
                    value: initial,
                    subscribers: SubscriberSet::default(),
                    keepalive: Vec::new(),
                }),
                version: AtomicVersion::start(),
                equality: AtomicBool::new(compare.is_some()),
                compare,
            }),
        }
    }

    /// Toggles equality-based write suppression. Has no effect on variables
    /// created with [`Variable::without_equality`].
    pub fn equality(self, enabled: bool) -> Variable<T> {
        self.inner.equality.store(enabled, Ordering::SeqCst);
        self
    }

    /// Reads the current value and records `(self, version)` on the
    /// thread's current scope, if any.
    pub fn read(&self) -> Value<T> {
        let (value, version) = {
            let state = self.inner.state.lock();
            (state.value.clone(), self.inner.version.load())
        };
        if let Some(scope) = Scope::current() {
            scope.watch_dependency(self.as_dependency(), version);
        }
        value
    }

    /// Reads and unpacks the current value. See [`Value::get`].
    pub fn get(&self) -> Result<T, CapturedError>
    where
        T: Clone,
    {
        self.read().get()
    }

    /// Replaces the stored value.
    ///
    /// An equal write (when equality is on) returns without a version bump.
    /// Otherwise the value and version advance atomically, and the
    /// subscribers snapshotted under the lock are fired after it is
    /// released.
    pub fn write(&self, value: Value<T>) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if self.inner.equality.load(Ordering::SeqCst) {
                if let Some(equal) = self.inner.compare {
                    if equal(&state.value, &value) {
                        return;
                    }
                }
            }
            state.value = value;
            let previous = self.inner.version.fetch_then_increment();
            debug!("variable {:#x} advanced to {:?}", self.addr(), previous.next());
            state.subscribers.snapshot()
        };
        for subscriber in snapshot {
            subscriber.fire();
        }
    }

    /// Wraps the result and writes it. See [`Variable::write`].
    pub fn set(&self, result: T) {
        self.write(Value::of(result));
    }

    /// Current version.
    pub fn version(&self) -> Version {
        self.inner.version.load()
    }

    /// Ties `owner` to this variable's lifetime. Used by owners that must
    /// stay reachable for as long as anything can still read the variable.
    pub fn keepalive(&self, owner: impl Any + Send + Sync) {
        self.inner.state.lock().keepalive.push(Box::new(owner));
    }

    pub(crate) fn as_dependency(&self) -> Arc<dyn Dependency> {
        self.inner.clone()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl<T: Send + Sync + 'static> Dependency for VarInner<T> {
    fn version(&self) -> Version {
        self.version.load()
    }

    fn subscribe(&self, trigger: &Trigger) {
        self.state.lock().subscribers.insert(trigger);
    }

    fn unsubscribe(&self, trigger: &Trigger) {
        self.state.lock().subscribers.remove(trigger);
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Variable<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        fmt.debug_struct("Variable")
            .field("value", &state.value)
            .field("version", &self.inner.version.load())
            .finish()
    }
}
