use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::scope;

/// Error type accepted from user suppliers.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Canonical carrier for the blocking signal.
///
/// Blocking is normally represented, not thrown: a supplier that cannot
/// finish marks its scope blocked (see [`scope::block`]) and returns a draft
/// result. When it has nothing to return at all, `BlockedError` is the
/// conventional error to propagate instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedError;

impl BlockedError {
    /// Marks the current scope blocked and returns the canonical carrier as
    /// an `Err`, so suppliers can write `return BlockedError::bail();`.
    pub fn bail<T>() -> Result<T, Error> {
        scope::block();
        Err(BlockedError.into())
    }
}

impl fmt::Display for BlockedError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "reactive computation is blocked")
    }
}

impl std::error::Error for BlockedError {}

/// Failure captured from a reactive computation.
///
/// Captured errors are cheap to clone and are replayed on every
/// [`Value::get`]. Two captured errors compare equal when their descriptions
/// match; the backtrace taken at capture time is carried for `Debug` output
/// only, since its text is not stable across runs.
#[derive(Clone)]
pub struct CapturedError {
    inner: Arc<ErrorInner>,
}

struct ErrorInner {
    description: String,
    blocked: bool,
    backtrace: Backtrace,
    source: Option<Error>,
}

impl CapturedError {
    /// Captures an error for storage inside a [`Value`].
    pub fn new(error: impl Into<Error>) -> CapturedError {
        CapturedError::from_error(error.into())
    }

    pub(crate) fn from_error(error: Error) -> CapturedError {
        // An error that already went through capture is reused as-is, so
        // repeated propagation does not pile up wrappers.
        match error.downcast::<CapturedError>() {
            Ok(replayed) => *replayed,
            Err(error) => {
                let blocked = error.is::<BlockedError>();
                CapturedError {
                    inner: Arc::new(ErrorInner {
                        description: error.to_string(),
                        blocked,
                        backtrace: Backtrace::capture(),
                        source: Some(error),
                    }),
                }
            }
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> CapturedError {
        if let Some(replayed) = payload.downcast_ref::<CapturedError>() {
            return replayed.clone();
        }
        let description = if let Some(message) = payload.downcast_ref::<&'static str>() {
            format!("panicked: {}", message)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            format!("panicked: {}", message)
        } else {
            "panicked: <non-string payload>".to_string()
        };
        CapturedError {
            inner: Arc::new(ErrorInner {
                description,
                blocked: false,
                backtrace: Backtrace::capture(),
                source: None,
            }),
        }
    }

    /// Whether this error is the canonical blocking carrier.
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked
    }

    /// Human-readable description, also the basis of equality.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Identity comparison: both handles refer to the same captured failure.
    pub fn same(&self, other: &CapturedError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for CapturedError {
    fn eq(&self, other: &CapturedError) -> bool {
        self.inner.blocked == other.inner.blocked
            && self.inner.description == other.inner.description
    }
}

impl Eq for CapturedError {}

impl fmt::Display for CapturedError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.inner.description)
    }
}

impl fmt::Debug for CapturedError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "CapturedError({})", self.inner.description)?;
        if fmt.alternate() {
            write!(fmt, "\n{}", self.inner.backtrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for CapturedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|error| &**error as &(dyn std::error::Error + 'static))
    }
}

/// Immutable output of a reactive computation: a result or a captured error,
/// plus a flag marking incomplete (blocking) output.
///
/// At most one of result and error is present; carrying both is rejected at
/// construction. The result lives behind an `Arc`, so cloning a `Value` is
/// cheap regardless of the payload.
pub struct Value<T> {
    result: Option<Arc<T>>,
    error: Option<CapturedError>,
    blocking: bool,
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Value<T> {
        Value {
            result: self.result.clone(),
            error: self.error.clone(),
            blocking: self.blocking,
        }
    }
}

impl<T> Value<T> {
    /// Assembles a value from parts.
    ///
    /// # Panics
    ///
    /// Panics when both a result and an error are supplied.
    pub fn new(result: Option<T>, error: Option<CapturedError>, blocking: bool) -> Value<T> {
        if result.is_some() && error.is_some() {
            panic!("reactive value cannot carry both a result and an error");
        }
        Value {
            result: result.map(Arc::new),
            error,
            blocking,
        }
    }

    /// Completed computation with a result.
    pub fn of(result: T) -> Value<T> {
        Value::new(Some(result), None, false)
    }

    /// Failed computation.
    pub fn from_error(error: impl Into<Error>) -> Value<T> {
        Value::new(None, Some(CapturedError::new(error)), false)
    }

    /// Incomplete computation with nothing to show yet.
    pub fn blocked() -> Value<T> {
        Value::new(None, None, true)
    }

    /// Incomplete computation carrying a draft result.
    pub fn blocked_draft(result: T) -> Value<T> {
        Value::new(Some(result), None, true)
    }

    /// Runs the supplier and packs its outcome, panics included, into a
    /// `Value`. The blocking flag is taken from the current scope once the
    /// supplier returns, so anything the supplier blocked on is reflected in
    /// the captured value.
    pub fn capture<F>(f: F) -> Value<T>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let (result, error) = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(result)) => (Some(Arc::new(result)), None),
            Ok(Err(error)) => {
                let error = CapturedError::from_error(error);
                if error.is_blocked() {
                    // Keep the scope consistent with the conventional
                    // carrier even when the thrower forgot to block.
                    scope::block();
                }
                (None, Some(error))
            }
            Err(payload) => (None, Some(CapturedError::from_panic(payload))),
        };
        Value {
            result,
            error,
            blocking: scope::blocked(),
        }
    }

    /// The result, if any.
    pub fn result(&self) -> Option<&T> {
        self.result.as_deref()
    }

    /// The captured error, if any.
    pub fn error(&self) -> Option<&CapturedError> {
        self.error.as_ref()
    }

    /// Whether the producer could not finish without further inputs.
    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /// Copy of this value with the blocking flag raised.
    pub fn to_blocking(&self) -> Value<T> {
        Value {
            result: self.result.clone(),
            error: self.error.clone(),
            blocking: true,
        }
    }

    /// Unpacks the value: propagates the blocking flag into the current
    /// scope, then replays the captured error or clones out the result. An
    /// empty value yields the canonical blocked error.
    pub fn get(&self) -> Result<T, CapturedError>
    where
        T: Clone,
    {
        if self.blocking {
            scope::block();
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        match &self.result {
            Some(result) => Ok(T::clone(result)),
            None => Err(CapturedError::new(BlockedError)),
        }
    }

    /// Identity comparison: every component is reference-identical. This is
    /// the cheap path next to full equality and never runs user code.
    pub fn same(&self, other: &Value<T>) -> bool {
        if self.blocking != other.blocking {
            return false;
        }
        let results = match (&self.result, &other.result) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        let errors = match (&self.error, &other.error) {
            (Some(a), Some(b)) => a.same(b),
            (None, None) => true,
            _ => false,
        };
        results && errors
    }
}

impl<T: PartialEq> PartialEq for Value<T> {
    fn eq(&self, other: &Value<T>) -> bool {
        self.blocking == other.blocking
            && self.result == other.result
            && self.error == other.error
    }
}

impl<T: Eq> Eq for Value<T> {}

impl<T: fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Value")
            .field("result", &self.result)
            .field("error", &self.error)
            .field("blocking", &self.blocking)
            .finish()
    }
}

impl<T: fmt::Display> fmt::Display for Value<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.result, &self.error) {
            (Some(result), _) => write!(fmt, "{}", result)?,
            (_, Some(error)) => write!(fmt, "{}", error)?,
            (None, None) => write!(fmt, "<empty>")?,
        }
        if self.blocking {
            write!(fmt, " [blocking]")?;
        }
        Ok(())
    }
}

/// Equality check shielded from panicking user implementations: a panicking
/// comparison counts as a change.
pub(crate) fn equal_guarded<T: PartialEq>(a: &Value<T>, b: &Value<T>) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| a == b)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_result_and_error_together() {
        let outcome = panic::catch_unwind(|| {
            Value::new(Some(1), Some(CapturedError::new(BlockedError)), false)
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn get_returns_result() {
        assert_eq!(Value::of(7).get().unwrap(), 7);
    }

    #[test]
    fn get_replays_error() {
        let value: Value<i32> = Value::from_error(BlockedError);
        let error = value.get().unwrap_err();
        assert!(error.is_blocked());
    }

    #[test]
    fn empty_value_yields_blocked_error() {
        let value: Value<i32> = Value::blocked();
        assert!(value.get().unwrap_err().is_blocked());
    }

    #[test]
    fn capture_packs_panics() {
        let value: Value<i32> = Value::capture(|| panic!("boom"));
        assert_eq!(value.error().unwrap().description(), "panicked: boom");
        assert!(!value.blocking());
    }

    #[test]
    fn capture_does_not_rewrap_captured_errors() {
        let original: Value<i32> = Value::capture(|| panic!("boom"));
        let first = original.error().unwrap().clone();
        let replayed: Value<i32> = Value::capture(|| Err(first.clone().into()));
        assert!(replayed.error().unwrap().same(&first));
    }

    #[test]
    fn equality_requires_matching_blocking() {
        assert_ne!(Value::of(1), Value::blocked_draft(1));
        assert_eq!(Value::of(1), Value::of(1));
    }

    #[test]
    fn errors_compare_by_description() {
        let a: Value<i32> = Value::capture(|| panic!("boom"));
        let b: Value<i32> = Value::capture(|| panic!("boom"));
        assert_eq!(a, b);
        assert!(!a.same(&b));
    }

    #[test]
    fn same_is_identity() {
        let a = Value::of("x".to_string());
        let b = a.clone();
        assert!(a.same(&b));
        assert!(!a.same(&Value::of("x".to_string())));
    }

    #[test]
    fn display_marks_blocking() {
        assert_eq!(format!("{}", Value::blocked_draft(5)), "5 [blocking]");
        assert_eq!(format!("{}", Value::of(5)), "5");
    }

    #[test]
    fn guarded_equality_swallows_panics() {
        struct Hostile;
        impl PartialEq for Hostile {
            fn eq(&self, _: &Hostile) -> bool {
                panic!("no comparisons today")
            }
        }
        let a = Value::of(Hostile);
        let b = Value::of(Hostile);
        assert!(!equal_guarded(&a, &b));
    }
}
