use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::executor::{common_executor, Executor};
use crate::machine::StateMachine;
use crate::scope::Scope;
use crate::thread::ReactiveThread;
use crate::value::{equal_guarded, BlockedError, CapturedError, Error, Value};
use crate::variable::Variable;

/// Single-value asynchronous memo.
///
/// A worker keeps re-running its supplier in the background — through an
/// inner [`StateMachine`] on a daemon [`ReactiveThread`] — and forwards the
/// results to an output variable that [`get`](Worker::get) reads. Three
/// policies sit between the supplier and the readers:
///
/// * **change suppression**: an output equal to the last one is not
///   republished, so downstream computations are not re-run for nothing;
/// * **no regression**: once a non-blocking value has shipped, a blocking
///   one never replaces it;
/// * **pause on unused**: the worker heartbeats its readers through a
///   `ping`/`ack` counter pair and stops recomputing when nobody has read
///   the output since the last probe; the next `get` resumes it.
///
/// Probe invalidations are exponentially spaced — equal-output iterations
/// 1, 2, 4, 8, … — which bounds the CPU spent on a value no one is
/// watching.
pub struct Worker<T: Send + Sync + 'static> {
    core: Arc<WorkerCore<T>>,
}

impl<T: Send + Sync + 'static> Clone for Worker<T> {
    fn clone(&self) -> Worker<T> {
        Worker {
            core: self.core.clone(),
        }
    }
}

struct WorkerCore<T: Send + Sync + 'static> {
    machine: StateMachine<T>,
    output: Variable<Value<T>>,
    /// Generation heartbeat written by the worker; equality-on, so equal
    /// generations never wake subscribers.
    ping: Variable<u64>,
    /// Heartbeat echo written by readers on `get`; a paused worker parks
    /// on this variable.
    ack: Variable<u64>,
    state: Mutex<WorkerState<T>>,
    equality: AtomicBool,
    compare: Option<fn(&Value<T>, &Value<T>) -> bool>,
}

struct WorkerState<T> {
    last: Value<T>,
    generation: u64,
    age: u64,
    paused: bool,
    started: bool,
    executor: Arc<dyn Executor>,
    thread: Option<ReactiveThread>,
}

fn sentinel<T>() -> Value<T> {
    Value::new(None, Some(CapturedError::new(BlockedError)), true)
}

impl<T: Send + Sync + PartialEq + 'static> Worker<T> {
    /// Creates a worker with equality-based change suppression.
    pub fn new(supplier: impl FnMut() -> Result<T, Error> + Send + 'static) -> Worker<T> {
        Worker::construct(supplier, Some(equal_guarded::<T>))
    }
}

impl<T: Send + Sync + 'static> Worker<T> {
    /// Creates a worker for a payload type that cannot be compared; change
    /// suppression falls back to the reference-identity cheap path.
    pub fn new_without_equality(
        supplier: impl FnMut() -> Result<T, Error> + Send + 'static,
    ) -> Worker<T> {
        Worker::construct(supplier, None)
    }

    fn construct(
        supplier: impl FnMut() -> Result<T, Error> + Send + 'static,
        compare: Option<fn(&Value<T>, &Value<T>) -> bool>,
    ) -> Worker<T> {
        Worker {
            core: Arc::new(WorkerCore {
                machine: StateMachine::new(supplier),
                output: Variable::without_equality(Value::of(sentinel())),
                ping: Variable::new(0),
                ack: Variable::new(0),
                state: Mutex::new(WorkerState {
                    last: sentinel(),
                    generation: 0,
                    age: 0,
                    paused: false,
                    started: false,
                    executor: common_executor(),
                    thread: None,
                }),
                equality: AtomicBool::new(true),
                compare,
            }),
        }
    }

    /// Overrides the output served before the first supplier run. Defaults
    /// to a blocking error sentinel.
    ///
    /// # Panics
    ///
    /// Panics when the worker is already started.
    pub fn initial(self, value: Value<T>) -> Worker<T> {
        {
            let mut state = self.core.state.lock();
            if state.started {
                panic!("cannot reconfigure a started worker");
            }
            state.last = value.clone();
        }
        self.core.output.set(value);
        self
    }

    /// Toggles equality-based change suppression. When off, only
    /// reference-identical outputs are suppressed.
    ///
    /// # Panics
    ///
    /// Panics when the worker is already started.
    pub fn equality(self, enabled: bool) -> Worker<T> {
        if self.core.state.lock().started {
            panic!("cannot reconfigure a started worker");
        }
        self.core.equality.store(enabled, Ordering::SeqCst);
        self
    }

    /// Selects the executor the worker's loop runs on.
    ///
    /// # Panics
    ///
    /// Panics when the worker is already started.
    pub fn executor(self, executor: Arc<dyn Executor>) -> Worker<T> {
        {
            let mut state = self.core.state.lock();
            if state.started {
                panic!("cannot reconfigure a started worker");
            }
            state.executor = executor;
        }
        self
    }

    /// The worker's latest output. Records dependencies on the output and
    /// on the probe heartbeat, echoes the heartbeat back (which resumes a
    /// paused worker), and starts the loop on first use.
    pub fn get(&self) -> Value<T> {
        self.ensure_started();
        let value = self
            .core
            .output
            .read()
            .result()
            .cloned()
            .unwrap_or_else(Value::blocked);
        let generation = self.core.ping.read().result().copied().unwrap_or(0);
        self.core.ack.set(generation);
        value
    }

    fn ensure_started(&self) {
        let thread = {
            let mut state = self.core.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            let weak = Arc::downgrade(&self.core);
            let thread = ReactiveThread::new(move || {
                if let Some(core) = weak.upgrade() {
                    WorkerCore::run(&core);
                }
                Ok(())
            })
            .daemon(true)
            .executor(state.executor.clone());
            state.thread = Some(thread.clone());
            thread
        };
        thread.start();
    }
}

impl<T: Send + Sync + 'static> WorkerCore<T> {
    /// One iteration of the worker loop. Runs inside the reactive thread's
    /// scope; whatever is read with tracking here is what wakes the loop
    /// next.
    fn run(core: &Arc<WorkerCore<T>>) {
        if core.machine.valid() {
            return;
        }

        let acked = {
            let _ignored = Scope::ignore();
            core.ack.read().result().copied().unwrap_or(0)
        };
        let republish = {
            let mut state = core.state.lock();
            if acked != state.generation && !state.last.blocking() {
                // Nobody re-read since the last probe; park until the next
                // reader heartbeats through `ack`.
                state.paused = true;
                Some(state.last.to_blocking())
            } else {
                None
            }
        };
        if let Some(value) = republish {
            core.ack.read();
            core.output.set(value);
            debug!("worker paused");
            return;
        }

        // Outside any lock: the supplier may be slow.
        core.machine.advance();
        let fresh = {
            let _ignored = Scope::ignore();
            core.machine.output()
        };

        let (publish, generation) = {
            let mut state = core.state.lock();
            if fresh.blocking() && !state.last.blocking() {
                debug!("worker discarding blocking value after a non-blocking output");
                return;
            }
            let changed = match (core.equality.load(Ordering::SeqCst), core.compare) {
                (true, Some(equal)) => !equal(&fresh, &state.last),
                _ => !fresh.same(&state.last),
            };
            let publish = changed || state.paused;
            if publish {
                state.last = fresh.clone();
                state.paused = false;
            }
            state.age = if changed { 0 } else { state.age + 1 };
            let generation = 64 - u64::from(state.age.leading_zeros());
            state.generation = generation;
            (publish, generation)
        };
        if publish {
            core.output.set(fresh);
        }
        core.ping.set(generation);
    }
}

impl<T: Send + Sync + 'static> Drop for WorkerCore<T> {
    fn drop(&mut self) {
        if let Some(thread) = self.state.get_mut().thread.take() {
            thread.stop();
        }
    }
}
