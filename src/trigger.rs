use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::variable::{Dependency, DependencyVersion};

/// One-shot notifier armed on a snapshot of dependency versions.
///
/// Lifecycle: new → armed → (fired) → closed. Arming subscribes the trigger
/// to every dependency in the snapshot; a later write that advances any of
/// them past its recorded version fires the callback exactly once. Writes
/// that happened before arming are detected during arming and fire
/// immediately.
///
/// `fire` and `close` are idempotent, and the callback always runs outside
/// the trigger's lock.
pub struct Trigger {
    core: Arc<TriggerCore>,
}

impl Clone for Trigger {
    fn clone(&self) -> Trigger {
        Trigger {
            core: self.core.clone(),
        }
    }
}

pub(crate) struct TriggerCore {
    /// Random precomputed hash; accelerates subscriber-set lookups in
    /// variables without ever dereferencing the weak registration.
    hash: u64,
    state: Mutex<TriggerState>,
}

struct TriggerState {
    armed: bool,
    fired: bool,
    closed: bool,
    callback: Option<Box<dyn FnOnce() + Send>>,
    subscriptions: SmallVec<[Arc<dyn Dependency>; 4]>,
}

fn random_hash() -> u64 {
    static RNG: Mutex<Option<oorandom::Rand64>> = Mutex::new(None);
    let mut rng = RNG.lock();
    rng.get_or_insert_with(|| oorandom::Rand64::new(0x5851_f42d_4c95_7f2d_1405_7b7e_f767_814f))
        .rand_u64()
}

impl Trigger {
    /// Creates an unarmed trigger with no callback.
    pub fn new() -> Trigger {
        Trigger {
            core: Arc::new(TriggerCore {
                hash: random_hash(),
                state: Mutex::new(TriggerState {
                    armed: false,
                    fired: false,
                    closed: false,
                    callback: None,
                    subscriptions: SmallVec::new(),
                }),
            }),
        }
    }

    /// Installs the callback invoked on fire.
    ///
    /// # Panics
    ///
    /// Panics when the trigger is already armed.
    pub fn callback(self, callback: impl FnOnce() + Send + 'static) -> Trigger {
        {
            let mut state = self.core.state.lock();
            if state.armed {
                panic!("cannot install a callback on an armed trigger");
            }
            state.callback = Some(Box::new(callback));
        }
        self
    }

    /// Arms the trigger on a snapshot of dependency versions.
    ///
    /// Subscription happens outside the trigger's lock. After every
    /// subscription the dependency's current version is compared against
    /// the recorded one; on mismatch the trigger fires immediately and the
    /// remaining arming work is skipped as redundant. A concurrent
    /// [`Trigger::close`] rolls back every subscription made so far.
    ///
    /// # Panics
    ///
    /// Panics when the trigger is already armed or closed.
    pub fn arm(&self, versions: impl IntoIterator<Item = DependencyVersion>) {
        {
            let mut state = self.core.state.lock();
            if state.closed {
                panic!("cannot arm a closed trigger");
            }
            if state.armed {
                panic!("trigger can only be armed once");
            }
            state.armed = true;
        }
        for entry in versions {
            entry.source().subscribe(self);
            {
                let mut state = self.core.state.lock();
                if state.closed {
                    // close() raced us; it already unsubscribed everything
                    // it could see, so only this subscription is ours to
                    // undo.
                    drop(state);
                    entry.source().unsubscribe(self);
                    return;
                }
                state.subscriptions.push(entry.source().clone());
            }
            if entry.outdated() {
                debug!(
                    "trigger {:016x}: dependency advanced past {:?} during arming",
                    self.core.hash,
                    entry.version()
                );
                self.fire();
                break;
            }
        }
    }

    /// Fires the trigger: runs the callback at most once, unless closed.
    pub fn fire(&self) {
        self.core.fire();
    }

    /// Closes the trigger and unsubscribes it from every dependency.
    pub fn close(&self) {
        let subscriptions = {
            let mut state = self.core.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.callback = None;
            std::mem::take(&mut state.subscriptions)
        };
        for source in subscriptions {
            source.unsubscribe(self);
        }
    }

    /// Whether `arm` has run.
    pub fn armed(&self) -> bool {
        self.core.state.lock().armed
    }

    /// Whether the trigger has fired.
    pub fn fired(&self) -> bool {
        self.core.state.lock().fired
    }

    /// Whether the trigger has been closed.
    pub fn closed(&self) -> bool {
        self.core.state.lock().closed
    }

    pub(crate) fn hash(&self) -> u64 {
        self.core.hash
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.core) as *const () as usize
    }

    pub(crate) fn downgrade(&self) -> Weak<TriggerCore> {
        Arc::downgrade(&self.core)
    }
}

impl Default for Trigger {
    fn default() -> Trigger {
        Trigger::new()
    }
}

impl TriggerCore {
    pub(crate) fn fire(&self) {
        let callback = {
            let mut state = self.state.lock();
            if state.fired || state.closed {
                return;
            }
            state.fired = true;
            state.callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        fmt.debug_struct("Trigger")
            .field("armed", &state.armed)
            .field("fired", &state.fired)
            .field("closed", &state.closed)
            .finish()
    }
}
