#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! The ripple crate is a runtime for push-pull reactive programming.
//! Application code expresses computations as ordinary closures that read
//! values from reactive [`Variable`]s; the runtime records which variables
//! were read, caches results, and re-evaluates dependents when the
//! variables change.
//!
//! The core is a dependency-tracking engine built from three primitives: a
//! [`Variable`] (versioned reactive cell), a [`Scope`] (per-computation
//! tracker), and a [`Trigger`] (one-shot invalidation notifier). Slow data
//! sources are handled with *reactive blocking* — a marker that an output
//! is incomplete — and *pins*, idempotence caches that survive successive
//! re-evaluations of a blocking computation.
//!
//! On top of the core sit a [`StateMachine`] that drives one supplier
//! through re-evaluations, a synchronous [`Lazy`] memo, an asynchronous
//! [`Worker`] with change suppression and pause-on-unused, a multi-state
//! [`AsyncCache`], a long-running [`ReactiveThread`], and an
//! [`EventExecutor`] that keeps cascading tasks latency-bounded by grouping
//! them into events.
//!
//! ```
//! use ripple::{Scope, Trigger, Variable};
//!
//! let variable = Variable::new("a");
//! let scope = Scope::new();
//! {
//!     let _entered = scope.enter();
//!     variable.read();
//! }
//! let trigger = Trigger::new();
//! trigger.arm(scope.versions());
//! assert!(!trigger.fired());
//! variable.set("b");
//! assert!(trigger.fired());
//! ```

mod cache;
mod executor;
mod lazy;
mod machine;
pub mod scope;
mod store;
mod thread;
mod trigger;
mod value;
mod variable;
mod version;
mod worker;

pub use crate::cache::{AsyncCache, CacheStatus};
pub use crate::executor::{common, EventExecutor, Executor};
pub use crate::lazy::Lazy;
pub use crate::machine::StateMachine;
pub use crate::scope::Scope;
pub use crate::store::{CacheKey, FreezeStore, PinStore};
pub use crate::thread::ReactiveThread;
pub use crate::trigger::Trigger;
pub use crate::value::{BlockedError, CapturedError, Error, Value};
pub use crate::variable::{Dependency, DependencyVersion, Variable};
pub use crate::version::Version;
pub use crate::worker::Worker;
