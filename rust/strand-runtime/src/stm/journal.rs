//! Transaction journal and the shared cells it reads and writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cell::SyncCell;
use crate::effect::primitive::AnyValue;
use crate::fiber::Resume;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WAITER_KEY: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Versioned {
    version: u64,
    value: AnyValue,
    waiters: BTreeMap<u64, Resume<()>>,
}

/// Shared slot behind a `TRef`.
pub(crate) struct TRefCore {
    id: u64,
    slot: SyncCell<Versioned>,
}

impl TRefCore {
    pub(crate) fn new(value: AnyValue) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            slot: SyncCell::new(Versioned {
                version: 0,
                value,
                waiters: BTreeMap::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Last committed value.
    pub(crate) fn committed(&self) -> AnyValue {
        self.slot.with(|v| Arc::clone(&v.value))
    }

    fn snapshot(&self) -> (u64, AnyValue) {
        self.slot.with(|v| (v.version, Arc::clone(&v.value)))
    }

    fn version(&self) -> u64 {
        self.slot.with(|v| v.version)
    }
}

/// Another transaction committed a ref this attempt depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Conflict;

#[derive(Clone)]
struct Entry {
    core: Arc<TRefCore>,
    observed_version: u64,
    observed: AnyValue,
    current: AnyValue,
    written: bool,
}

/// Private log of one transaction attempt, keyed by ref id so that commit
/// locks refs in ascending id order.
#[derive(Clone, Default)]
pub(crate) struct Journal {
    entries: BTreeMap<u64, Entry>,
}

/// Waiter registrations made by a transaction blocked in `retry`.
pub(crate) struct Registrations {
    keys: Vec<(Arc<TRefCore>, u64)>,
}

impl Registrations {
    pub(crate) fn empty() -> Self {
        Self { keys: Vec::new() }
    }

    pub(crate) fn release(&mut self) {
        for (core, key) in self.keys.drain(..) {
            core.slot.modify(|v| v.waiters.remove(&key));
        }
    }
}

impl Journal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Read through the journal. The first read of a ref re-validates every
    /// earlier read, so an attempt never keeps running on a torn view.
    pub(crate) fn read(&mut self, core: &Arc<TRefCore>) -> Result<AnyValue, Conflict> {
        if let Some(entry) = self.entries.get(&core.id) {
            return Ok(Arc::clone(&entry.current));
        }
        let (version, value) = core.snapshot();
        if !self.is_consistent() {
            return Err(Conflict);
        }
        self.entries.insert(
            core.id,
            Entry {
                core: Arc::clone(core),
                observed_version: version,
                observed: Arc::clone(&value),
                current: Arc::clone(&value),
                written: false,
            },
        );
        Ok(value)
    }

    pub(crate) fn write(&mut self, core: &Arc<TRefCore>, value: AnyValue) {
        match self.entries.get_mut(&core.id) {
            Some(entry) => {
                entry.current = value;
                entry.written = true;
            }
            None => {
                let (version, observed) = core.snapshot();
                self.entries.insert(
                    core.id,
                    Entry {
                        core: Arc::clone(core),
                        observed_version: version,
                        observed,
                        current: value,
                        written: true,
                    },
                );
            }
        }
    }

    /// Every ref still has the version this attempt first saw.
    pub(crate) fn is_consistent(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.core.version() == entry.observed_version)
    }

    /// Keep the reads of an abandoned branch (as plain reads of what it
    /// observed) so a later `retry` also waits on them.
    pub(crate) fn absorb_reads(&mut self, abandoned: Journal) {
        for (id, entry) in abandoned.entries {
            self.entries.entry(id).or_insert(Entry {
                current: Arc::clone(&entry.observed),
                written: false,
                ..entry
            });
        }
    }

    /// Publish all writes atomically. Locks every touched ref in id order,
    /// validates versions, then writes and bumps versions. Returns the
    /// fibers blocked in `retry` on a written ref.
    pub(crate) fn commit(&self) -> Result<Vec<Resume<()>>, Conflict> {
        let mut guards: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry, entry.core.slot.lock()))
            .collect();
        if guards
            .iter()
            .any(|(entry, slot)| slot.version != entry.observed_version)
        {
            return Err(Conflict);
        }
        let mut woken = Vec::new();
        for (entry, slot) in guards.iter_mut().filter(|(entry, _)| entry.written) {
            slot.value = Arc::clone(&entry.current);
            slot.version += 1;
            woken.extend(std::mem::take(&mut slot.waiters).into_values());
        }
        Ok(woken)
    }

    /// Register `resume` on every ref this attempt touched, unless one of
    /// them already changed (then `None`, and nothing stays registered).
    pub(crate) fn register(&self, resume: &Resume<()>) -> Option<Registrations> {
        let mut guards: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry, entry.core.slot.lock()))
            .collect();
        if guards
            .iter()
            .any(|(entry, slot)| slot.version != entry.observed_version)
        {
            return None;
        }
        let key = NEXT_WAITER_KEY.fetch_add(1, Ordering::Relaxed);
        let mut registrations = Registrations::empty();
        for (entry, slot) in guards.iter_mut() {
            slot.waiters.insert(key, resume.clone());
            registrations.keys.push((Arc::clone(&entry.core), key));
        }
        Some(registrations)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::primitive::{erase, unerase};

    fn value(v: AnyValue) -> i32 {
        unerase::<i32>(v).expect("i32")
    }

    #[test]
    fn writes_are_private_until_commit() {
        let core = TRefCore::new(erase(1));
        let mut journal = Journal::new();
        journal.write(&core, erase(2));
        assert_eq!(value(journal.read(&core).expect("read")), 2);
        assert_eq!(value(core.committed()), 1);
        assert!(journal.commit().expect("commit").is_empty());
        assert_eq!(value(core.committed()), 2);
        assert_eq!(core.version(), 1);
    }

    #[test]
    fn stale_read_fails_commit() {
        let core = TRefCore::new(erase(1));
        let mut first = Journal::new();
        let mut second = Journal::new();
        first.read(&core).expect("read");
        second.write(&core, erase(5));
        second.commit().expect("commit");
        first.write(&core, erase(7));
        assert_eq!(first.commit().err(), Some(Conflict));
        assert_eq!(value(core.committed()), 5);
    }

    #[test]
    fn new_read_detects_torn_view() {
        let a = TRefCore::new(erase(1));
        let b = TRefCore::new(erase(1));
        let mut journal = Journal::new();
        journal.read(&a).expect("read");
        let mut other = Journal::new();
        other.write(&a, erase(2));
        other.commit().expect("commit");
        assert_eq!(journal.read(&b).err(), Some(Conflict));
    }

    #[test]
    fn absorbed_reads_keep_observed_value() {
        let core = TRefCore::new(erase(1));
        let mut branch = Journal::new();
        branch.read(&core).expect("read");
        branch.write(&core, erase(9));
        let mut journal = Journal::new();
        journal.absorb_reads(branch);
        assert_eq!(journal.len(), 1);
        assert_eq!(value(journal.read(&core).expect("read")), 1);
        assert!(journal.commit().expect("commit").is_empty());
        assert_eq!(core.version(), 0);
    }
}
