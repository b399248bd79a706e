//! The `Cause` / `Exit` model.
//!
//! A [`Cause`] records *why* an effect did not succeed: expected failures,
//! defects and interruptions, composed sequentially ([`Cause::Then`]) or in
//! parallel ([`Cause::Both`]). Causes form a monoid with [`Cause::Empty`] as
//! the identity, so no information is lost when several things go wrong at
//! once (a failure followed by a failing finalizer, two failing branches of a
//! parallel region, ...).

use std::collections::BTreeSet;
use std::fmt::{self, Write as _};

use crate::defect::Defect;
use crate::fiber::FiberId;

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cause<E> {
    /// No failure at all; the identity of `then` and `both`.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected failure (usually a panic in user code).
    Die(Defect),
    /// The fiber was interrupted by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E> Cause<E> {
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    pub fn die_message(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential composition. `Empty` on either side is dropped.
    pub fn then(self, other: Cause<E>) -> Self {
        match (self, other) {
            (left, right) if right.is_empty() => left,
            (left, right) if left.is_empty() => right,
            (left, right) => Cause::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition. `Empty` on either side is dropped.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self, other) {
            (left, right) if right.is_empty() => left,
            (left, right) if left.is_empty() => right,
            (left, right) => Cause::Both(Box::new(left), Box::new(right)),
        }
    }

    /// `true` if the cause contains no failure, defect or interruption.
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => false,
            Cause::Then(l, r) | Cause::Both(l, r) => l.is_empty() && r.is_empty(),
        }
    }

    /// Typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Cause::Fail(e) = leaf {
                out.push(e);
            }
        });
        out
    }

    /// Defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Cause::Die(d) = leaf {
                out.push(d);
            }
        });
        out
    }

    /// Ids of every fiber that contributed an interruption.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.visit(&mut |leaf| {
            if let Cause::Interrupt(id) = leaf {
                out.insert(*id);
            }
        });
        out
    }

    pub fn is_failure(&self) -> bool {
        self.any(|leaf| matches!(leaf, Cause::Fail(_)))
    }

    pub fn is_die(&self) -> bool {
        self.any(|leaf| matches!(leaf, Cause::Die(_)))
    }

    pub fn is_interrupted(&self) -> bool {
        self.any(|leaf| matches!(leaf, Cause::Interrupt(_)))
    }

    /// `true` if the only non-empty leaves are interruptions.
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && !self.is_failure() && !self.is_die()
    }

    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// The first typed failure if there is one, otherwise the whole cause
    /// (which then holds only defects and interruptions).
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        if !self.is_failure() {
            return Err(self);
        }
        let mut first = None;
        self.into_leaves(&mut |leaf| {
            if first.is_none() {
                if let Cause::Fail(e) = leaf {
                    first = Some(e);
                }
            }
        });
        match first {
            Some(e) => Ok(e),
            None => Err(Cause::Empty),
        }
    }

    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.flat_map(&mut |e| Cause::Fail(f(e)))
    }

    /// Replace every `Fail` leaf with the cause produced by `f`.
    pub fn flat_map<E2>(self, f: &mut impl FnMut(E) -> Cause<E2>) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => f(e),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => l.flat_map(f).then(r.flat_map(f)),
            Cause::Both(l, r) => l.flat_map(f).both(r.flat_map(f)),
        }
    }

    /// Drop every typed failure, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        self.flat_map(&mut |_| Cause::Empty)
    }

    fn any(&self, mut pred: impl FnMut(&Cause<E>) -> bool) -> bool {
        let mut found = false;
        self.visit(&mut |leaf| found = found || pred(leaf));
        found
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Cause<E>)) {
        match self {
            Cause::Then(l, r) | Cause::Both(l, r) => {
                l.visit(f);
                r.visit(f);
            }
            leaf => f(leaf),
        }
    }

    fn into_leaves(self, f: &mut impl FnMut(Cause<E>)) {
        match self {
            Cause::Then(l, r) | Cause::Both(l, r) => {
                l.into_leaves(f);
                r.into_leaves(f);
            }
            leaf => f(leaf),
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Multi-line rendering of the full cause tree.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        // Writing into a String cannot fail.
        let _ = match self {
            Cause::Empty => writeln!(out, "{pad}Empty"),
            Cause::Fail(e) => writeln!(out, "{pad}Fail: {e:?}"),
            Cause::Die(d) => writeln!(out, "{pad}Die: {d}"),
            Cause::Interrupt(id) => writeln!(out, "{pad}Interrupt: by {id}"),
            Cause::Then(l, r) => {
                let _ = writeln!(out, "{pad}Then");
                l.render(out, depth + 1);
                r.render(out, depth + 1);
                Ok(())
            }
            Cause::Both(l, r) => {
                let _ = writeln!(out, "{pad}Both");
                l.render(out, depth + 1);
                r.render(out, depth + 1);
                Ok(())
            }
        };
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty().trim_end())
    }
}

// ---------------------------------------------------------------------------
// Exit
// ---------------------------------------------------------------------------

/// The final outcome of running an effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

/// Exit observed by scope finalizers: only the shape of the outcome.
pub type ScopeExit = Exit<(), ()>;

impl<A, E> Exit<A, E> {
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::Die(defect))
    }

    pub fn interrupt(by: FiberId) -> Self {
        Exit::Failure(Cause::Interrupt(by))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(c) if c.is_interrupted())
    }

    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    /// Combine two exits of concurrently running effects.
    pub fn zip_par<B>(self, other: Exit<B, E>) -> Exit<(A, B), E> {
        match (self, other) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (Exit::Failure(l), Exit::Failure(r)) => Exit::Failure(l.both(r)),
            (Exit::Failure(c), _) | (_, Exit::Failure(c)) => Exit::Failure(c),
        }
    }

    /// Collapse a set of parallel exits: all values in order, or every
    /// failure cause combined with `Both`.
    pub fn collect_all_par(exits: Vec<Exit<A, E>>) -> Exit<Vec<A>, E> {
        let mut values = Vec::with_capacity(exits.len());
        let mut cause: Option<Cause<E>> = None;
        for exit in exits {
            match exit {
                Exit::Success(a) => values.push(a),
                Exit::Failure(c) => {
                    cause = Some(match cause {
                        Some(prev) => prev.both(c),
                        None => c,
                    })
                }
            }
        }
        match cause {
            Some(c) => Exit::Failure(c),
            None => Exit::Success(values),
        }
    }
}

impl<A, E: Clone> Exit<A, E> {
    /// Shape of this exit as seen by scope finalizers.
    pub fn to_scope_exit(&self) -> ScopeExit {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(c) => Exit::Failure(c.clone().map(|_| ())),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::Failure(Cause::Fail(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
