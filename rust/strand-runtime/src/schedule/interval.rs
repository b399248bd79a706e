use std::fmt;

/// A half-open window `[start, end)` of time, in milliseconds. An `end` of
/// `u64::MAX` means the window never closes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    start: u64,
    end: u64,
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == u64::MAX {
            write!(f, "[{}, ∞)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Interval {
    pub const EMPTY: Interval = Interval { start: 0, end: 0 };

    /// `[start, end)`, or the empty interval if `start > end`.
    pub fn new(start: u64, end: u64) -> Self {
        if start > end {
            Self::EMPTY
        } else {
            Self { start, end }
        }
    }

    /// Everything from `start` on.
    pub fn after(start: u64) -> Self {
        Self::new(start, u64::MAX)
    }

    /// Everything before `end`.
    pub fn before(end: u64) -> Self {
        Self::new(0, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// The earlier of two intervals: the one that starts first, or, for
    /// equal starts, the one that ends first.
    pub fn min(self, that: Interval) -> Interval {
        if self.end <= that.start {
            self
        } else if that.end <= self.start {
            that
        } else if self.start < that.start {
            self
        } else if that.start < self.start {
            that
        } else if self.end <= that.end {
            self
        } else {
            that
        }
    }

    pub fn max(self, that: Interval) -> Interval {
        if self.min(that) == self {
            that
        } else {
            self
        }
    }

    pub fn less_than(&self, that: &Interval) -> bool {
        self.min(*that) == *self && self != that
    }

    pub fn intersect(&self, that: &Interval) -> Interval {
        Interval::new(self.start.max(that.start), self.end.min(that.end))
    }

    /// The smallest interval covering both, if they overlap or touch.
    pub fn union(&self, that: &Interval) -> Option<Interval> {
        if self.is_empty() {
            return Some(*that);
        }
        if that.is_empty() {
            return Some(*self);
        }
        if self.start.max(that.start) > self.end.min(that.end) {
            return None;
        }
        Some(Interval::new(
            self.start.min(that.start),
            self.end.max(that.end),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction() {
        assert!(Interval::new(5, 3).is_empty());
        assert!(Interval::EMPTY.is_empty());
        assert_eq!(Interval::after(10).end(), u64::MAX);
        assert_eq!(Interval::before(10), Interval::new(0, 10));
        assert_eq!(Interval::new(2, 7).size(), 5);
    }

    #[test]
    fn intersect_and_union() {
        let a = Interval::new(0, 10);
        let b = Interval::new(5, 20);
        let c = Interval::new(30, 40);
        assert_eq!(a.intersect(&b), Interval::new(5, 10));
        assert!(a.intersect(&c).is_empty());
        assert_eq!(a.union(&b), Some(Interval::new(0, 20)));
        assert_eq!(a.union(&Interval::new(10, 12)), Some(Interval::new(0, 12)));
        assert_eq!(a.union(&c), None);
        assert_eq!(a.union(&Interval::EMPTY), Some(a));
    }

    #[test]
    fn ordering() {
        let a = Interval::new(0, 10);
        let b = Interval::new(5, 20);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
        assert!(a.less_than(&b));
        assert!(!b.less_than(&a));
        assert!(!a.less_than(&a));
        assert_eq!(Interval::new(0, 5).min(Interval::new(0, 3)), Interval::new(0, 3));
    }

    #[test]
    fn debug_marks_unbounded() {
        assert_eq!(format!("{:?}", Interval::after(3)), "[3, ∞)");
        assert_eq!(format!("{:?}", Interval::new(1, 2)), "[1, 2)");
    }
}
