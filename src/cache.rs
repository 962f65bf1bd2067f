use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::executor::{common_executor, Executor};
use crate::scope::Scope;
use crate::store::PinStore;
use crate::trigger::Trigger;
use crate::value::{Error, Value};
use crate::variable::Variable;

/// Where an [`AsyncCache`] is in its re-evaluation lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Never queried; nothing computed or scheduled.
    Initial,
    /// A compute task is scheduled or running.
    Running,
    /// A compute task is in flight and a dependency already changed under
    /// it; another run is needed as soon as it completes.
    RunningBacklogged,
    /// A fresh value is published and no reader has picked it up yet.
    AwaitingQueries,
    /// A fresh value is published, but it is already out of date.
    AwaitingQueriesBacklogged,
    /// Up to date (or parked on a blocking computation) with readers
    /// served; waiting for an invalidation.
    Idle,
}

/// Post-lock queue: actions buffered inside a critical section and executed
/// once the lock is released. Scheduling and version bumps must never run
/// under the cache lock, or executor re-entry would deadlock.
#[derive(Default)]
struct SideEffects {
    actions: SmallVec<[Box<dyn FnOnce() + Send>; 2]>,
}

impl SideEffects {
    fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    fn run(self) {
        for action in self.actions {
            action();
        }
    }
}

/// Asynchronous reactive memo.
///
/// Readers and the background computation are decoupled: `get` returns the
/// latest published value immediately and records a dependency on the
/// cache's version variable, which is bumped whenever a new value is
/// published. Recomputation is demand-driven — an invalidation while no
/// reader has come back parks the cache instead of burning the executor on
/// values nobody wants.
pub struct AsyncCache<T: Send + Sync + 'static> {
    core: Arc<CacheCore<T>>,
}

impl<T: Send + Sync + 'static> Clone for AsyncCache<T> {
    fn clone(&self) -> AsyncCache<T> {
        AsyncCache {
            core: self.core.clone(),
        }
    }
}

type Supplier<T> = Box<dyn FnMut() -> Result<T, Error> + Send>;

struct CacheCore<T: Send + Sync + 'static> {
    supplier: Mutex<Supplier<T>>,
    inner: Mutex<CacheInner<T>>,
    /// Bumped on publish; the only dependency readers record.
    version: Variable<u64>,
}

struct CacheInner<T> {
    status: CacheStatus,
    value: Value<T>,
    serial: u64,
    draft: bool,
    stopped: bool,
    executor: Arc<dyn Executor>,
    trigger: Option<Trigger>,
    pins: Option<PinStore>,
}

impl<T: Send + Sync + 'static> AsyncCache<T> {
    /// Creates a cache over the supplier. Nothing runs until `start` or the
    /// first `get`.
    pub fn new(supplier: impl FnMut() -> Result<T, Error> + Send + 'static) -> AsyncCache<T> {
        AsyncCache {
            core: Arc::new(CacheCore {
                supplier: Mutex::new(Box::new(supplier)),
                inner: Mutex::new(CacheInner {
                    status: CacheStatus::Initial,
                    value: Value::blocked(),
                    serial: 0,
                    draft: true,
                    stopped: false,
                    executor: common_executor(),
                    trigger: None,
                    pins: None,
                }),
                version: Variable::new(0),
            }),
        }
    }

    /// Overrides the value served before the first computation completes.
    ///
    /// # Panics
    ///
    /// Panics when the cache has already left its initial state.
    pub fn initial(self, value: Value<T>) -> AsyncCache<T> {
        {
            let mut inner = self.core.inner.lock();
            if inner.status != CacheStatus::Initial {
                panic!("cannot reconfigure a started async cache");
            }
            inner.value = value;
        }
        self
    }

    /// Controls whether blocking intermediate values are published to
    /// readers (the default) or held back until a computation completes.
    ///
    /// # Panics
    ///
    /// Panics when the cache has already left its initial state.
    pub fn draft(self, draft: bool) -> AsyncCache<T> {
        {
            let mut inner = self.core.inner.lock();
            if inner.status != CacheStatus::Initial {
                panic!("cannot reconfigure a started async cache");
            }
            inner.draft = draft;
        }
        self
    }

    /// Selects the executor compute tasks run on.
    ///
    /// # Panics
    ///
    /// Panics when the cache has already left its initial state.
    pub fn executor(self, executor: Arc<dyn Executor>) -> AsyncCache<T> {
        {
            let mut inner = self.core.inner.lock();
            if inner.status != CacheStatus::Initial {
                panic!("cannot reconfigure a started async cache");
            }
            inner.executor = executor;
        }
        self
    }

    /// Schedules the first computation without waiting for a reader.
    pub fn start(&self) {
        let mut effects = SideEffects::default();
        {
            let mut inner = self.core.inner.lock();
            if !inner.stopped && inner.status == CacheStatus::Initial {
                inner.status = CacheStatus::Running;
                effects.push(self.schedule(&inner));
            }
        }
        effects.run();
    }

    /// The latest published value. Records a dependency on the cache's
    /// version, so the reader is re-run when a new value is published.
    pub fn get(&self) -> Value<T> {
        self.core.version.read();
        let mut effects = SideEffects::default();
        let value = {
            let mut inner = self.core.inner.lock();
            if !inner.stopped {
                match inner.status {
                    CacheStatus::Initial => {
                        inner.status = CacheStatus::Running;
                        effects.push(self.schedule(&inner));
                    }
                    CacheStatus::AwaitingQueries => {
                        inner.status = CacheStatus::Idle;
                    }
                    CacheStatus::AwaitingQueriesBacklogged => {
                        inner.status = CacheStatus::Running;
                        effects.push(self.schedule(&inner));
                    }
                    _ => {}
                }
            }
            inner.value.clone()
        };
        effects.run();
        value
    }

    /// Where the cache currently is in its lifecycle.
    pub fn status(&self) -> CacheStatus {
        self.core.inner.lock().status
    }

    /// Stops the cache: a computation already in flight completes, but its
    /// results are discarded and nothing further is scheduled. Idempotent.
    pub fn stop(&self) {
        let trigger = {
            let mut inner = self.core.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.pins = None;
            inner.trigger.take()
        };
        if let Some(trigger) = trigger {
            trigger.close();
        }
    }

    fn schedule(&self, inner: &CacheInner<T>) -> impl FnOnce() + Send + 'static {
        let core = self.core.clone();
        let executor = inner.executor.clone();
        move || {
            executor.execute(Box::new(move || CacheCore::compute(&core)));
        }
    }
}

impl<T: Send + Sync + 'static> CacheCore<T> {
    fn compute(core: &Arc<CacheCore<T>>) {
        {
            let inner = core.inner.lock();
            if inner.stopped {
                return;
            }
        }

        let scope = Scope::new();
        if let Some(pins) = core.inner.lock().pins.take() {
            scope.set_pins(pins);
        }
        let value = {
            let _entered = scope.enter();
            let mut supplier = core.supplier.lock();
            Value::capture(|| (*supplier)())
        };
        let blocked = value.blocking();
        let versions = scope.versions();

        let trigger = Trigger::new().callback({
            let weak = Arc::downgrade(core);
            move || {
                if let Some(core) = weak.upgrade() {
                    CacheCore::invalidate(&core);
                }
            }
        });
        {
            let mut inner = core.inner.lock();
            if inner.stopped {
                drop(inner);
                trigger.close();
                return;
            }
            inner.trigger = Some(trigger.clone());
        }
        // Arming outside the cache lock: an immediate fire lands in
        // invalidate(), which sees the cache still Running and records the
        // backlog.
        trigger.arm(versions);

        let mut effects = SideEffects::default();
        {
            let mut inner = core.inner.lock();
            if inner.stopped {
                return;
            }
            let publish = !blocked || inner.draft;
            if publish {
                inner.value = value;
                inner.serial += 1;
                let serial = inner.serial;
                let version = core.version.clone();
                effects.push(move || version.set(serial));
            }
            match inner.status {
                CacheStatus::Running => {
                    inner.status = if blocked {
                        inner.pins = Some(scope.pins());
                        CacheStatus::Idle
                    } else {
                        CacheStatus::AwaitingQueries
                    };
                }
                CacheStatus::RunningBacklogged => {
                    inner.status = if blocked {
                        inner.pins = Some(scope.pins());
                        let core = core.clone();
                        let executor = inner.executor.clone();
                        effects.push(move || {
                            executor.execute(Box::new(move || CacheCore::compute(&core)))
                        });
                        CacheStatus::Running
                    } else {
                        CacheStatus::AwaitingQueriesBacklogged
                    };
                }
                status => panic!("async cache completed in unexpected state {:?}", status),
            }
            debug!("async cache completed; now {:?}", inner.status);
        }
        effects.run();
    }

    fn invalidate(core: &Arc<CacheCore<T>>) {
        let mut effects = SideEffects::default();
        let spent = {
            let mut inner = core.inner.lock();
            if inner.stopped {
                return;
            }
            match inner.status {
                CacheStatus::Running => inner.status = CacheStatus::RunningBacklogged,
                CacheStatus::AwaitingQueries => {
                    inner.status = CacheStatus::AwaitingQueriesBacklogged
                }
                CacheStatus::Idle => {
                    inner.status = CacheStatus::Running;
                    let core = core.clone();
                    let executor = inner.executor.clone();
                    effects
                        .push(move || executor.execute(Box::new(move || CacheCore::compute(&core))));
                }
                _ => {}
            }
            debug!("async cache invalidated; now {:?}", inner.status);
            inner.trigger.take()
        };
        if let Some(spent) = spent {
            spent.close();
        }
        effects.run();
    }
}

impl<T: Send + Sync + 'static> Drop for CacheCore<T> {
    fn drop(&mut self) {
        if let Some(trigger) = self.inner.get_mut().trigger.take() {
            trigger.close();
        }
    }
}
