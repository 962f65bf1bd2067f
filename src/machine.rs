use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::scope::Scope;
use crate::store::PinStore;
use crate::trigger::Trigger;
use crate::value::{Error, Value};
use crate::variable::Variable;

type Supplier<T> = Box<dyn FnMut() -> Result<T, Error> + Send>;

/// Drives one supplier through successive re-evaluations.
///
/// The machine is either *valid* — a trigger is armed on the dependencies
/// of the last evaluation and `output` holds its captured [`Value`] — or
/// *invalid*, meaning a dependency has advanced and the next [`advance`]
/// will re-run the supplier. Both `output` and `valid` are reactive:
/// reading them from inside a scope records a dependency.
///
/// Pins captured by a blocking evaluation are carried into the next one,
/// so the supplier converges instead of redoing side computations from
/// scratch on every re-run.
///
/// [`advance`]: StateMachine::advance
pub struct StateMachine<T: Send + Sync + 'static> {
    core: Arc<MachineCore<T>>,
}

impl<T: Send + Sync + 'static> Clone for StateMachine<T> {
    fn clone(&self) -> StateMachine<T> {
        StateMachine {
            core: self.core.clone(),
        }
    }
}

struct MachineCore<T: Send + Sync + 'static> {
    supplier: Mutex<Supplier<T>>,
    /// Serializes evaluations; concurrent callers short-circuit instead of
    /// queueing up behind a slow supplier.
    advance_lock: Mutex<()>,
    inner: Mutex<MachineInner>,
    output: Variable<Value<T>>,
    valid: Variable<bool>,
}

struct MachineInner {
    trigger: Option<Trigger>,
    pins: Option<PinStore>,
}

impl<T: Send + Sync + 'static> StateMachine<T> {
    /// Creates a machine over a value-returning supplier. The output is
    /// the blocked placeholder until the first evaluation.
    pub fn new(supplier: impl FnMut() -> Result<T, Error> + Send + 'static) -> StateMachine<T> {
        StateMachine::with_initial(Value::blocked(), supplier)
    }

    /// Creates a machine with an explicit initial output.
    pub fn with_initial(
        initial: Value<T>,
        supplier: impl FnMut() -> Result<T, Error> + Send + 'static,
    ) -> StateMachine<T> {
        StateMachine {
            core: Arc::new(MachineCore {
                supplier: Mutex::new(Box::new(supplier)),
                advance_lock: Mutex::new(()),
                inner: Mutex::new(MachineInner {
                    trigger: None,
                    pins: None,
                }),
                output: Variable::without_equality(Value::of(initial)),
                valid: Variable::new(false),
            }),
        }
    }

    /// The output captured by the last evaluation. Reactive.
    pub fn output(&self) -> Value<T> {
        self.core
            .output
            .read()
            .result()
            .cloned()
            .unwrap_or_else(Value::blocked)
    }

    /// Whether the last output is still up to date. Reactive.
    pub fn valid(&self) -> bool {
        self.core.valid.read().result().copied().unwrap_or(false)
    }

    /// Runs the supplier once if the machine is invalid; otherwise returns
    /// immediately. Only one evaluation is ever in flight per machine.
    pub fn advance(&self) {
        let _serialize = match self.core.advance_lock.try_lock() {
            Some(guard) => guard,
            // Another thread is mid-advance; its publish is imminent.
            None => return,
        };
        if self.core.inner.lock().trigger.is_some() {
            return;
        }

        let scope = Scope::new();
        if let Some(pins) = self.core.inner.lock().pins.clone() {
            scope.set_pins(pins);
        }

        let value = {
            let _entered = scope.enter();
            let mut supplier = self.core.supplier.lock();
            Value::capture(|| (*supplier)())
        };
        let blocking = value.blocking();
        debug!("state machine advanced; blocking: {}", blocking);

        // Validity flips on before the output is visible, which stops
        // racing readers from piling further advance calls onto a value
        // they have not seen yet.
        self.core.valid.set(true);
        self.core.output.set(value);

        {
            let mut inner = self.core.inner.lock();
            inner.pins = if blocking { Some(scope.pins()) } else { None };
        }

        let trigger = Trigger::new().callback({
            let core = Arc::downgrade(&self.core);
            move || invalidate(&core)
        });
        self.core.inner.lock().trigger = Some(trigger.clone());
        // May fire immediately when a dependency moved during evaluation;
        // the callback then simply marks the machine invalid again.
        trigger.arm(scope.versions());
    }
}

impl StateMachine<()> {
    /// Creates a machine over a runnable: a supplier with nothing to
    /// return.
    pub fn from_runnable(
        mut runnable: impl FnMut() -> Result<(), Error> + Send + 'static,
    ) -> StateMachine<()> {
        StateMachine::with_initial(Value::blocked(), move || runnable())
    }
}

fn invalidate<T: Send + Sync + 'static>(core: &Weak<MachineCore<T>>) {
    if let Some(core) = core.upgrade() {
        core.valid.set(false);
        let trigger = core.inner.lock().trigger.take();
        if let Some(trigger) = trigger {
            trigger.close();
        }
    }
}

impl<T: Send + Sync + 'static> Drop for MachineCore<T> {
    fn drop(&mut self) {
        if let Some(trigger) = self.inner.get_mut().trigger.take() {
            trigger.close();
        }
    }
}
