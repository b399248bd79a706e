use super::interval::Interval;

/// A sorted sequence of non-overlapping, non-empty intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intervals {
    items: Vec<Interval>,
}

impl Intervals {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(interval: Interval) -> Self {
        Self::from_iter([interval])
    }

    /// Everything from `start` on.
    pub fn after(start: u64) -> Self {
        Self::of(Interval::after(start))
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.items
    }

    /// Two-pointer merge of both sequences; overlapping or touching
    /// intervals coalesce.
    pub fn union(&self, that: &Intervals) -> Intervals {
        let (mut i, mut j) = (0, 0);
        let mut out: Vec<Interval> = Vec::with_capacity(self.items.len() + that.items.len());
        while i < self.items.len() || j < that.items.len() {
            let next = match (self.items.get(i), that.items.get(j)) {
                (Some(a), Some(b)) if a.start() <= b.start() => {
                    i += 1;
                    *a
                }
                (_, Some(b)) => {
                    j += 1;
                    *b
                }
                (Some(a), None) => {
                    i += 1;
                    *a
                }
                (None, None) => break,
            };
            match out.last_mut().and_then(|last| last.union(&next).map(|u| (last, u))) {
                Some((last, merged)) => *last = merged,
                None => out.push(next),
            }
        }
        Intervals { items: out }
    }

    /// Two-pointer intersection; whichever interval ends first advances.
    pub fn intersect(&self, that: &Intervals) -> Intervals {
        let (mut i, mut j) = (0, 0);
        let mut out = Vec::new();
        while let (Some(a), Some(b)) = (self.items.get(i), that.items.get(j)) {
            let overlap = a.intersect(b);
            if !overlap.is_empty() {
                out.push(overlap);
            }
            if a.end() <= b.end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        Intervals { items: out }
    }

    /// Start of the first interval, or 0 if empty.
    pub fn start(&self) -> u64 {
        self.items.first().map_or(0, Interval::start)
    }

    /// End of the last interval, or 0 if empty.
    pub fn end(&self) -> u64 {
        self.items.last().map_or(0, Interval::end)
    }

    pub fn less_than(&self, that: &Intervals) -> bool {
        self.start() < that.start()
    }

    pub fn max(self, that: Intervals) -> Intervals {
        if self.less_than(&that) {
            that
        } else {
            self
        }
    }

    pub fn is_non_empty(&self) -> bool {
        !self.items.is_empty()
    }

    /// Total covered time, saturating for unbounded intervals.
    pub fn total(&self) -> u64 {
        self.items
            .iter()
            .fold(0u64, |acc, interval| acc.saturating_add(interval.size()))
    }
}

impl FromIterator<Interval> for Intervals {
    /// Builds a normalized sequence from intervals in any order.
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        let mut items: Vec<Interval> = iter.into_iter().filter(|i| !i.is_empty()).collect();
        items.sort_by_key(|i| (i.start(), i.end()));
        let mut out: Vec<Interval> = Vec::with_capacity(items.len());
        for next in items {
            match out.last_mut().and_then(|last| last.union(&next).map(|u| (last, u))) {
                Some((last, merged)) => *last = merged,
                None => out.push(next),
            }
        }
        Intervals { items: out }
    }
}
