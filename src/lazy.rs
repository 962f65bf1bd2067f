use crate::machine::StateMachine;
use crate::value::{Error, Value};

/// Thin synchronous face over the state machine: a memoized computation
/// evaluated on demand, on the caller's thread.
///
/// `get` re-runs the supplier only when a dependency has advanced since the
/// last call, and records this lazy's own dependencies on the caller's
/// scope so invalidation propagates through.
pub struct Lazy<T: Send + Sync + 'static> {
    machine: StateMachine<T>,
}

impl<T: Send + Sync + 'static> Clone for Lazy<T> {
    fn clone(&self) -> Lazy<T> {
        Lazy {
            machine: self.machine.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Lazy<T> {
    /// Creates a lazy over the supplier.
    pub fn new(supplier: impl FnMut() -> Result<T, Error> + Send + 'static) -> Lazy<T> {
        Lazy {
            machine: StateMachine::new(supplier),
        }
    }

    /// The current output, evaluating the supplier if it is out of date.
    pub fn get(&self) -> Value<T> {
        if !self.machine.valid() {
            self.machine.advance();
        }
        self.machine.output()
    }
}
