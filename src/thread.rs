use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, error};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::executor::{common_executor, Executor};
use crate::scope::Scope;
use crate::store::PinStore;
use crate::trigger::Trigger;
use crate::value::{BlockedError, CapturedError, Error};

type Runnable = Box<dyn FnMut() -> Result<(), Error> + Send>;

thread_local! {
    static CURRENT_THREAD: RefCell<Vec<ReactiveThread>> = RefCell::new(Vec::new());
}

fn live() -> &'static Mutex<FxHashMap<usize, Arc<ThreadCore>>> {
    static LIVE: OnceLock<Mutex<FxHashMap<usize, Arc<ThreadCore>>>> = OnceLock::new();
    LIVE.get_or_init(Default::default)
}

/// Long-running reactive loop.
///
/// The runnable is re-entered each time a dependency of its last iteration
/// advances. It is not an OS thread: iterations are short tasks submitted
/// to an executor, and at most one iteration is in flight at a time.
///
/// A *daemon* thread is weakly rooted: when the last handle to it is
/// dropped, the loop dies with it. A non-daemon thread is registered in a
/// process-wide live set from `start` until `stop`, so it keeps running
/// with no handles held.
///
/// Blocking errors reported by the runnable are swallowed — the iteration
/// will be retried when its dependencies change. Any other error, panics
/// included, is logged and stops the thread.
pub struct ReactiveThread {
    core: Arc<ThreadCore>,
}

impl Clone for ReactiveThread {
    fn clone(&self) -> ReactiveThread {
        ReactiveThread {
            core: self.core.clone(),
        }
    }
}

struct ThreadCore {
    runnable: Mutex<Runnable>,
    inner: Mutex<ThreadInner>,
}

struct ThreadInner {
    executor: Arc<dyn Executor>,
    daemon: bool,
    started: bool,
    stopped: bool,
    trigger: Option<Trigger>,
    pins: Option<PinStore>,
}

impl ReactiveThread {
    /// Creates a stopped-but-startable thread over the runnable.
    pub fn new(runnable: impl FnMut() -> Result<(), Error> + Send + 'static) -> ReactiveThread {
        ReactiveThread {
            core: Arc::new(ThreadCore {
                runnable: Mutex::new(Box::new(runnable)),
                inner: Mutex::new(ThreadInner {
                    executor: common_executor(),
                    daemon: false,
                    started: false,
                    stopped: false,
                    trigger: None,
                    pins: None,
                }),
            }),
        }
    }

    /// Marks the thread as daemon (weakly rooted).
    ///
    /// # Panics
    ///
    /// Panics when the thread is already started.
    pub fn daemon(self, daemon: bool) -> ReactiveThread {
        {
            let mut inner = self.core.inner.lock();
            if inner.started {
                panic!("cannot reconfigure a started reactive thread");
            }
            inner.daemon = daemon;
        }
        self
    }

    /// Selects the executor iterations run on.
    ///
    /// # Panics
    ///
    /// Panics when the thread is already started.
    pub fn executor(self, executor: Arc<dyn Executor>) -> ReactiveThread {
        {
            let mut inner = self.core.inner.lock();
            if inner.started {
                panic!("cannot reconfigure a started reactive thread");
            }
            inner.executor = executor;
        }
        self
    }

    /// Schedules the first iteration. Idempotent; a no-op after `stop`.
    pub fn start(&self) {
        let executor = {
            let mut inner = self.core.inner.lock();
            if inner.started || inner.stopped {
                return;
            }
            inner.started = true;
            if !inner.daemon {
                live()
                    .lock()
                    .insert(Arc::as_ptr(&self.core) as usize, self.core.clone());
            }
            inner.executor.clone()
        };
        debug!("reactive thread started");
        let weak = Arc::downgrade(&self.core);
        executor.execute(Box::new(move || ThreadCore::iterate(&weak)));
    }

    /// Stops the loop. Idempotent. An iteration already in flight runs to
    /// completion, but it will not reschedule. Stopping before `start`
    /// prevents any iteration from ever running.
    pub fn stop(&self) {
        ThreadCore::halt(&self.core);
    }

    /// The reactive thread whose iteration is running on the calling OS
    /// thread, if any. Lets a runnable stop itself.
    pub fn current() -> Option<ReactiveThread> {
        CURRENT_THREAD.with(|stack| stack.borrow().last().cloned())
    }
}

impl ThreadCore {
    fn halt(core: &Arc<ThreadCore>) {
        let trigger = {
            let mut inner = core.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.pins = None;
            inner.trigger.take()
        };
        live().lock().remove(&(Arc::as_ptr(core) as usize));
        if let Some(trigger) = trigger {
            trigger.close();
        }
        debug!("reactive thread stopped");
    }

    fn iterate(weak: &Weak<ThreadCore>) {
        let core = match weak.upgrade() {
            Some(core) => core,
            None => return,
        };
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

        CURRENT_THREAD.with(|stack| {
            stack.borrow_mut().push(ReactiveThread { core: core.clone() })
        });
        let outcome = {
            let _entered = scope.enter();
            let mut runnable = core.runnable.lock();
            panic::catch_unwind(AssertUnwindSafe(|| (*runnable)()))
        };
        CURRENT_THREAD.with(|stack| {
            stack.borrow_mut().pop();
        });

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if error.is::<BlockedError>() {
                    // Blocking failures are ordinary incomplete iterations.
                    scope.block();
                } else {
                    error!("reactive thread failed: {}", error);
                    ThreadCore::halt(&core);
                    return;
                }
            }
            Err(payload) => {
                let error = CapturedError::from_panic(payload);
                if error.is_blocked() {
                    scope.block();
                } else {
                    error!("reactive thread panicked: {}", error);
                    ThreadCore::halt(&core);
                    return;
                }
            }
        }

        let versions = scope.versions();
        let blocked = scope.blocked();
        let trigger = Trigger::new().callback({
            let weak = weak.clone();
            move || ThreadCore::reschedule(&weak)
        });
        {
            let mut inner = core.inner.lock();
            if inner.stopped {
                drop(inner);
                trigger.close();
                return;
            }
            if blocked {
                inner.pins = Some(scope.pins());
            }
            inner.trigger = Some(trigger.clone());
        }
        trigger.arm(versions);
    }

    fn reschedule(weak: &Weak<ThreadCore>) {
        let core = match weak.upgrade() {
            Some(core) => core,
            None => return,
        };
        let (executor, spent) = {
            let mut inner = core.inner.lock();
            if inner.stopped {
                return;
            }
            (inner.executor.clone(), inner.trigger.take())
        };
        if let Some(spent) = spent {
            spent.close();
        }
        let weak = weak.clone();
        executor.execute(Box::new(move || ThreadCore::iterate(&weak)));
    }
}

impl Drop for ThreadCore {
    fn drop(&mut self) {
        // Without a garbage collector the armed trigger must be
        // unsubscribed explicitly when the owner goes away.
        if let Some(trigger) = self.inner.get_mut().trigger.take() {
            trigger.close();
        }
    }
}
