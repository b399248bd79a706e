//! The instruction set interpreted by the fiber run loop.
//!
//! Typed [`Effect`](super::Effect) values are thin wrappers around a shared
//! [`Node`]. Values crossing the interpreter are type-erased to [`AnyValue`];
//! the typed layer downcasts them back, and a mismatch surfaces as a defect.

use std::any::{type_name, Any};
use std::sync::{Arc, OnceLock};

use crate::cause::{Cause, Exit};
use crate::defect::Defect;
use crate::fiber::runtime::FiberContext;
use crate::fiber::waker::Waker;

/// Bound for every value carried by an effect: success values, typed
/// errors, and anything captured by the descriptions themselves.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;
pub(crate) type AnyCause = Cause<AnyValue>;
pub(crate) type AnyExit = Exit<AnyValue, AnyValue>;
pub(crate) type Node = Arc<Primitive>;

pub(crate) type Cont = Arc<dyn Fn(AnyValue) -> Node + Send + Sync>;
pub(crate) type Handler = Arc<dyn Fn(AnyCause) -> Node + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(Waker) -> Option<Node> + Send + Sync>;

pub(crate) enum Primitive {
    Succeed(AnyValue),
    Failure(AnyCause),
    /// Run a side-effecting closure to completion on the current worker.
    Sync(Arc<dyn Fn() -> Result<AnyValue, AnyCause> + Send + Sync>),
    /// Build the next node lazily.
    Suspend(Arc<dyn Fn() -> Node + Send + Sync>),
    FlatMap(Node, Cont),
    Fold(Node, Handler, Cont),
    /// Suspend the fiber until the registered waker fires. The returned node,
    /// if any, cancels the registration when the fiber is interrupted.
    Async(Register),
    SetInterruptible(Node, bool),
    /// Continue with a node built from the current interrupt status.
    WithStatus(Arc<dyn Fn(bool) -> Node + Send + Sync>),
    WithFiber(Arc<dyn Fn(&FiberContext<'_>) -> Node + Send + Sync>),
    Yield,
}

// ---------------------------------------------------------------------------
// Erasure
// ---------------------------------------------------------------------------

pub(crate) fn erase<A: Payload>(value: A) -> AnyValue {
    Arc::new(value)
}

pub(crate) fn unerase<A: Payload>(value: AnyValue) -> Result<A, Defect> {
    match value.downcast::<A>() {
        Ok(shared) => Ok(Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone())),
        Err(_) => Err(Defect::new(format!(
            "internal type mismatch: expected {}",
            type_name::<A>()
        ))),
    }
}

pub(crate) fn erase_cause<E: Payload>(cause: Cause<E>) -> AnyCause {
    cause.map(erase)
}

pub(crate) fn unerase_cause<E: Payload>(cause: AnyCause) -> Cause<E> {
    cause.flat_map(&mut |value| match unerase::<E>(value) {
        Ok(e) => Cause::Fail(e),
        Err(defect) => Cause::Die(defect),
    })
}

pub(crate) fn unerase_exit<A: Payload, E: Payload>(exit: AnyExit) -> Exit<A, E> {
    match exit {
        Exit::Success(value) => match unerase::<A>(value) {
            Ok(a) => Exit::Success(a),
            Err(defect) => Exit::Failure(Cause::Die(defect)),
        },
        Exit::Failure(cause) => Exit::Failure(unerase_cause(cause)),
    }
}

// ---------------------------------------------------------------------------
// Node builders
// ---------------------------------------------------------------------------

pub(crate) fn unit_node() -> Node {
    static UNIT: OnceLock<Node> = OnceLock::new();
    Arc::clone(UNIT.get_or_init(|| Arc::new(Primitive::Succeed(Arc::new(())))))
}

pub(crate) fn succeed_node(value: AnyValue) -> Node {
    Arc::new(Primitive::Succeed(value))
}

pub(crate) fn fail_node(cause: AnyCause) -> Node {
    Arc::new(Primitive::Failure(cause))
}

pub(crate) fn die_node(defect: Defect) -> Node {
    fail_node(Cause::Die(defect))
}

pub(crate) fn result_node(result: Result<AnyValue, AnyCause>) -> Node {
    match result {
        Ok(value) => succeed_node(value),
        Err(cause) => fail_node(cause),
    }
}

pub(crate) fn sync_node(f: impl Fn() + Send + Sync + 'static) -> Node {
    let unit: AnyValue = Arc::new(());
    Arc::new(Primitive::Sync(Arc::new(move || -> Result<AnyValue, AnyCause> {
        f();
        Ok(Arc::clone(&unit))
    })))
}

pub(crate) fn suspend_node(f: impl Fn() -> Node + Send + Sync + 'static) -> Node {
    Arc::new(Primitive::Suspend(Arc::new(f)))
}

pub(crate) fn flat_map_node(node: Node, k: impl Fn(AnyValue) -> Node + Send + Sync + 'static) -> Node {
    Arc::new(Primitive::FlatMap(node, Arc::new(k)))
}

pub(crate) fn fold_node(
    node: Node,
    on_failure: impl Fn(AnyCause) -> Node + Send + Sync + 'static,
    on_success: impl Fn(AnyValue) -> Node + Send + Sync + 'static,
) -> Node {
    Arc::new(Primitive::Fold(node, Arc::new(on_failure), Arc::new(on_success)))
}

pub(crate) fn async_node(register: impl Fn(Waker) -> Option<Node> + Send + Sync + 'static) -> Node {
    Arc::new(Primitive::Async(Arc::new(register)))
}

pub(crate) fn set_interruptible_node(node: Node, interruptible: bool) -> Node {
    Arc::new(Primitive::SetInterruptible(node, interruptible))
}

pub(crate) fn with_status_node(f: impl Fn(bool) -> Node + Send + Sync + 'static) -> Node {
    Arc::new(Primitive::WithStatus(Arc::new(f)))
}

pub(crate) fn with_fiber_node(
    f: impl Fn(&FiberContext<'_>) -> Node + Send + Sync + 'static,
) -> Node {
    Arc::new(Primitive::WithFiber(Arc::new(f)))
}

pub(crate) fn yield_node() -> Node {
    Arc::new(Primitive::Yield)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_round_trip_unshared() {
        let v = erase(String::from("hello"));
        assert_eq!(unerase::<String>(v).unwrap(), "hello");
    }

    #[test]
    fn erase_round_trip_shared_clones() {
        let v = erase(vec![1, 2, 3]);
        let other = Arc::clone(&v);
        assert_eq!(unerase::<Vec<i32>>(v).unwrap(), vec![1, 2, 3]);
        assert_eq!(unerase::<Vec<i32>>(other).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn mismatch_is_a_defect() {
        let err = unerase::<u8>(erase("text")).unwrap_err();
        assert!(err.message().contains("expected u8"));
    }

    #[test]
    fn cause_mismatch_becomes_die() {
        let erased: AnyCause = Cause::fail(erase(5_i32)).then(Cause::fail(erase("x")));
        let typed: Cause<i32> = unerase_cause(erased);
        assert_eq!(typed.failures(), vec![&5]);
        assert!(typed.is_die());
    }
}
