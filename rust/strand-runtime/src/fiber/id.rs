use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counter used to mint unique [`FiberId`]s.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, opaque identifier for a fiber.
///
/// Ids are assigned sequentially from a global counter and are never reused
/// for the lifetime of the program. [`FiberId::NONE`] stands for "no fiber",
/// e.g. an interruption requested from outside the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next unique fiber id.
    pub(crate) fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value (useful for logging / tracing).
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("fiber:none")
        } else {
            write!(f, "fiber:{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn display_and_debug() {
        let id = FiberId(12);
        assert_eq!(id.to_string(), "fiber:12");
        assert_eq!(format!("{:?}", id), "FiberId(12)");
        assert_eq!(FiberId::NONE.to_string(), "fiber:none");
    }
}
