//! Interval-set algebra laws.

use strand_runtime::{Interval, Intervals};

fn set(pairs: &[(u64, u64)]) -> Intervals {
    pairs.iter().map(|&(s, e)| Interval::new(s, e)).collect()
}

fn samples() -> Vec<Intervals> {
    vec![
        Intervals::empty(),
        set(&[(0, 10)]),
        set(&[(0, 10), (20, 30), (40, 50)]),
        set(&[(5, 25), (45, 60)]),
        set(&[(9, 10), (10, 11), (30, 31)]),
        set(&[(100, 200)]),
        Intervals::after(42),
    ]
}

#[test]
fn union_preserves_covered_time() {
    for a in samples() {
        for b in samples() {
            let union = a.union(&b).total();
            let overlap = a.intersect(&b).total();
            assert_eq!(
                union.checked_add(overlap),
                a.total().checked_add(b.total()),
                "{a:?} ∪ {b:?}"
            );
        }
    }
}

#[test]
fn intersect_is_commutative_and_associative() {
    let all = samples();
    for a in &all {
        for b in &all {
            assert_eq!(a.intersect(b), b.intersect(a));
            for c in &all {
                assert_eq!(a.intersect(b).intersect(c), a.intersect(&b.intersect(c)));
            }
        }
    }
}

#[test]
fn empty_is_the_identity_of_union() {
    for a in samples() {
        assert_eq!(a.union(&Intervals::empty()), a);
        assert_eq!(Intervals::empty().union(&a), a);
    }
}

#[test]
fn results_stay_sorted_and_disjoint() {
    for a in samples() {
        for b in samples() {
            for result in [a.union(&b), a.intersect(&b)] {
                let items = result.as_slice();
                assert!(items.iter().all(|i| !i.is_empty()));
                assert!(items.windows(2).all(|w| w[0].end() < w[1].start()));
            }
        }
    }
}
