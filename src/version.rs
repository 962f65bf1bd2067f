use std::sync::atomic::{AtomicU64, Ordering};

/// Value of the version counter attached to a reactive variable.
///
/// Versions start at `V1` and grow monotonically by one for every accepted
/// write. Comparing the version recorded at read time against the current
/// version of a variable is how the rest of the runtime decides whether a
/// computation is out of date.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    counter: u64,
}

impl Version {
    /// Version that predates any write. Only ever recorded for synthetic
    /// outdated dependencies, which must compare unequal to every real
    /// version.
    pub(crate) const fn pre_start() -> Version {
        Version { counter: 0 }
    }

    /// The version a freshly created variable carries.
    pub const fn start() -> Version {
        Version { counter: 1 }
    }

    pub(crate) fn next(self) -> Version {
        Version {
            counter: self.counter + 1,
        }
    }

    /// The raw counter value.
    pub fn counter(self) -> u64 {
        self.counter
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "V{}", self.counter)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicVersion {
    data: AtomicU64,
}

impl AtomicVersion {
    pub(crate) fn start() -> AtomicVersion {
        AtomicVersion {
            data: AtomicU64::new(Version::start().counter),
        }
    }

    pub(crate) fn load(&self) -> Version {
        Version {
            counter: self.data.load(Ordering::SeqCst),
        }
    }

    /// Returns the version before the increment.
    pub(crate) fn fetch_then_increment(&self) -> Version {
        Version {
            counter: self.data.fetch_add(1, Ordering::SeqCst),
        }
    }
}
