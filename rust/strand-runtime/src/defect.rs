//! Defects: unexpected failures that are not part of an effect's typed
//! error channel.
//!
//! Panics raised by user closures while a fiber is evaluating them never
//! escape the run loop. They are caught at the closure boundary and turned
//! into [`Defect`] values carried by `Cause::Die`.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Defect
// ---------------------------------------------------------------------------

/// An unexpected error, usually produced by a panic inside user code.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect with a specific message.
    pub fn new(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            message: Arc::from(message),
        }
    }

    /// Create a defect from a raw panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::new(panic_message(payload.as_ref()))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({:?})", &*self.message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Defect {}

/// Extract a human-readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Boundary
// ---------------------------------------------------------------------------

/// Run `f`, converting a panic into a [`Defect`].
///
/// Closures run by the interpreter only touch state through shared cells, so
/// observing them after an unwind is sound.
pub(crate) fn catch_defect<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_defect_on_success() {
        assert_eq!(catch_defect(|| 42).unwrap(), 42);
    }

    #[test]
    fn catch_defect_on_str_panic() {
        let err = catch_defect(|| -> i32 { panic!("boom") }).unwrap_err();
        assert_eq!(err.message(), "boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn catch_defect_on_formatted_panic() {
        let err = catch_defect(|| -> i32 {
            let n = 7;
            panic!("bad value {}", n);
        })
        .unwrap_err();
        assert_eq!(err.message(), "bad value 7");
    }

    #[test]
    fn catch_defect_unknown_payload() {
        let err = catch_defect(|| -> i32 { std::panic::panic_any(42_i32) }).unwrap_err();
        assert_eq!(err.message(), "unknown panic payload");
    }

    #[test]
    fn defects_compare_by_message() {
        assert_eq!(Defect::new("x"), Defect::new(String::from("x")));
        assert_ne!(Defect::new("x"), Defect::new("y"));
        assert_eq!(format!("{:?}", Defect::new("x")), "Defect(\"x\")");
    }
}
