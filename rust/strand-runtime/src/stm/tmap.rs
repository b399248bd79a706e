use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::journal::Journal;
use super::{Abort, Stm, TRef};
use crate::effect::Payload;

const BUCKETS: usize = 16;

type Bucket<K, V> = Vec<(K, V)>;

/// A transactional hash map. Entries are spread over a fixed set of
/// buckets, each its own [`TRef`], so transactions touching different keys
/// rarely conflict.
pub struct TMap<K, V> {
    buckets: Arc<[TRef<Bucket<K, V>>]>,
    size: TRef<usize>,
}

impl<K, V> Clone for TMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            buckets: Arc::clone(&self.buckets),
            size: self.size.clone(),
        }
    }
}

impl<K, V> fmt::Debug for TMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TMap").field("size", &self.size).finish()
    }
}

fn bucket_of<K: Hash>(key: &K) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % BUCKETS as u64) as usize
}

impl<K, V> TMap<K, V>
where
    K: Payload + Hash + Eq,
    V: Payload,
{
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut buckets: Vec<Bucket<K, V>> = vec![Vec::new(); BUCKETS];
        let mut size = 0;
        for (k, v) in entries {
            let bucket = &mut buckets[bucket_of(&k)];
            match bucket.iter_mut().find(|(existing, _)| *existing == k) {
                Some(slot) => slot.1 = v,
                None => {
                    bucket.push((k, v));
                    size += 1;
                }
            }
        }
        Self {
            buckets: buckets.into_iter().map(TRef::new).collect(),
            size: TRef::new(size),
        }
    }

    pub fn make<E: Payload>() -> Stm<Self, E> {
        Stm::from_fn(|_| Ok(TMap::new()))
    }

    fn with_journal<A: Payload, E: Payload>(
        &self,
        f: impl Fn(&TMap<K, V>, &mut Journal) -> Result<A, Abort<E>> + Send + Sync + 'static,
    ) -> Stm<A, E> {
        let this = self.clone();
        Stm::from_fn(move |journal| f(&this, journal))
    }

    fn entries<E>(&self, journal: &mut Journal) -> Result<Vec<(K, V)>, Abort<E>> {
        let mut all = Vec::new();
        for bucket in self.buckets.iter() {
            all.extend(bucket.read::<E>(journal)?);
        }
        Ok(all)
    }

    fn rebuild<E>(&self, journal: &mut Journal, entries: Vec<(K, V)>) -> Result<(), Abort<E>> {
        let mut buckets: Vec<Bucket<K, V>> = vec![Vec::new(); BUCKETS];
        let mut size = 0;
        for (k, v) in entries {
            let bucket = &mut buckets[bucket_of(&k)];
            match bucket.iter_mut().find(|(existing, _)| *existing == k) {
                Some(slot) => slot.1 = v,
                None => {
                    bucket.push((k, v));
                    size += 1;
                }
            }
        }
        for (cell, contents) in self.buckets.iter().zip(buckets) {
            cell.write(journal, contents);
        }
        self.size.write(journal, size);
        Ok(())
    }

    fn lookup<E>(&self, journal: &mut Journal, key: &K) -> Result<Option<V>, Abort<E>> {
        let bucket = self.buckets[bucket_of(key)].read::<E>(journal)?;
        Ok(bucket.into_iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }

    /// Insert or replace; returns the previous value.
    fn store<E>(&self, journal: &mut Journal, key: K, value: V) -> Result<Option<V>, Abort<E>> {
        let cell = &self.buckets[bucket_of(&key)];
        let mut bucket = cell.read::<E>(journal)?;
        let previous = match bucket.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => Some(std::mem::replace(&mut slot.1, value)),
            None => {
                bucket.push((key, value));
                None
            }
        };
        cell.write(journal, bucket);
        if previous.is_none() {
            let size = self.size.read::<E>(journal)?;
            self.size.write(journal, size + 1);
        }
        Ok(previous)
    }

    fn delete<E>(&self, journal: &mut Journal, key: &K) -> Result<Option<V>, Abort<E>> {
        let cell = &self.buckets[bucket_of(key)];
        let mut bucket = cell.read::<E>(journal)?;
        let Some(index) = bucket.iter().position(|(k, _)| k == key) else {
            return Ok(None);
        };
        let (_, removed) = bucket.swap_remove(index);
        cell.write(journal, bucket);
        let size = self.size.read::<E>(journal)?;
        self.size.write(journal, size - 1);
        Ok(Some(removed))
    }

    pub fn get<E: Payload>(&self, key: K) -> Stm<Option<V>, E> {
        self.with_journal(move |map, journal| map.lookup(journal, &key))
    }

    pub fn contains_key<E: Payload>(&self, key: K) -> Stm<bool, E> {
        self.get(key).map(|found| found.is_some())
    }

    pub fn put<E: Payload>(&self, key: K, value: V) -> Stm<(), E> {
        self.with_journal(move |map, journal| {
            map.store::<E>(journal, key.clone(), value.clone())?;
            Ok(())
        })
    }

    /// Insert unless the key is present; returns the existing value if any.
    pub fn put_if_absent<E: Payload>(&self, key: K, value: V) -> Stm<Option<V>, E> {
        self.with_journal(move |map, journal| match map.lookup::<E>(journal, &key)? {
            Some(existing) => Ok(Some(existing)),
            None => {
                map.store::<E>(journal, key.clone(), value.clone())?;
                Ok(None)
            }
        })
    }

    /// Remove the key; returns the removed value.
    pub fn remove<E: Payload>(&self, key: K) -> Stm<Option<V>, E> {
        self.with_journal(move |map, journal| map.delete(journal, &key))
    }

    /// Insert `value`, or combine it with the present one using `f`.
    /// Returns the stored value.
    pub fn merge<E: Payload>(
        &self,
        key: K,
        value: V,
        f: impl Fn(V, V) -> V + Send + Sync + 'static,
    ) -> Stm<V, E> {
        self.with_journal(move |map, journal| {
            let merged = match map.lookup::<E>(journal, &key)? {
                Some(existing) => f(existing, value.clone()),
                None => value.clone(),
            };
            map.store::<E>(journal, key.clone(), merged.clone())?;
            Ok(merged)
        })
    }

    /// Replace the value for `key` with `f(current)`; `None` removes it.
    /// Returns the previous value.
    pub fn update_with<E: Payload>(
        &self,
        key: K,
        f: impl Fn(Option<V>) -> Option<V> + Send + Sync + 'static,
    ) -> Stm<Option<V>, E> {
        self.with_journal(move |map, journal| {
            let previous = map.lookup::<E>(journal, &key)?;
            match f(previous.clone()) {
                Some(next) => {
                    map.store::<E>(journal, key.clone(), next)?;
                }
                None => {
                    map.delete::<E>(journal, &key)?;
                }
            }
            Ok(previous)
        })
    }

    /// Rewrite every entry. Entries mapped to the same key collapse, the
    /// last one winning.
    pub fn transform<E: Payload>(
        &self,
        f: impl Fn(K, V) -> (K, V) + Send + Sync + 'static,
    ) -> Stm<(), E> {
        self.with_journal(move |map, journal| {
            let entries = map.entries::<E>(journal)?;
            map.rebuild(journal, entries.into_iter().map(|(k, v)| f(k, v)).collect())
        })
    }

    pub fn transform_values<E: Payload>(
        &self,
        f: impl Fn(V) -> V + Send + Sync + 'static,
    ) -> Stm<(), E> {
        self.with_journal(move |map, journal| {
            for cell in map.buckets.iter() {
                let bucket = cell.read::<E>(journal)?;
                let next = bucket.into_iter().map(|(k, v)| (k, f(v))).collect();
                cell.write(journal, next);
            }
            Ok(())
        })
    }

    pub fn fold<B: Payload, E: Payload>(
        &self,
        zero: B,
        f: impl Fn(B, (K, V)) -> B + Send + Sync + 'static,
    ) -> Stm<B, E> {
        self.with_journal(move |map, journal| {
            Ok(map.entries::<E>(journal)?.into_iter().fold(zero.clone(), &f))
        })
    }

    /// Keep only the entries matching `keep`.
    pub fn retain<E: Payload>(
        &self,
        keep: impl Fn(&K, &V) -> bool + Send + Sync + 'static,
    ) -> Stm<(), E> {
        self.with_journal(move |map, journal| {
            let mut removed = 0;
            for cell in map.buckets.iter() {
                let bucket = cell.read::<E>(journal)?;
                let before = bucket.len();
                let kept: Bucket<K, V> = bucket.into_iter().filter(|(k, v)| keep(k, v)).collect();
                if kept.len() != before {
                    removed += before - kept.len();
                    cell.write(journal, kept);
                }
            }
            if removed > 0 {
                let size = map.size.read::<E>(journal)?;
                map.size.write(journal, size - removed);
            }
            Ok(())
        })
    }

    /// Remove and return the first entry for which `f` yields a value,
    /// retrying until there is one.
    pub fn take_first<B: Payload, E: Payload>(
        &self,
        f: impl Fn(&K, &V) -> Option<B> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        self.with_journal(move |map, journal| {
            for cell in map.buckets.iter() {
                let bucket = cell.read::<E>(journal)?;
                let hit = bucket
                    .iter()
                    .enumerate()
                    .find_map(|(i, (k, v))| f(k, v).map(|b| (i, b)));
                if let Some((index, out)) = hit {
                    let mut bucket = bucket;
                    bucket.swap_remove(index);
                    cell.write(journal, bucket);
                    let size = map.size.read::<E>(journal)?;
                    map.size.write(journal, size - 1);
                    return Ok(out);
                }
            }
            Err(Abort::Retry)
        })
    }

    pub fn keys<E: Payload>(&self) -> Stm<Vec<K>, E> {
        self.to_vec().map(|entries| entries.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values<E: Payload>(&self) -> Stm<Vec<V>, E> {
        self.to_vec().map(|entries| entries.into_iter().map(|(_, v)| v).collect())
    }

    /// All entries, in no particular order.
    pub fn to_vec<E: Payload>(&self) -> Stm<Vec<(K, V)>, E> {
        self.with_journal(|map, journal| map.entries(journal))
    }

    pub fn size<E: Payload>(&self) -> Stm<usize, E> {
        self.size.get()
    }

    pub fn is_empty<E: Payload>(&self) -> Stm<bool, E> {
        self.size().map(|n| n == 0)
    }
}

impl<K, V> Default for TMap<K, V>
where
    K: Payload + Hash + Eq,
    V: Payload,
{
    fn default() -> Self {
        Self::new()
    }
}
