//! Lock-striped map keyed by stream id.
//!
//! Each stream id hashes to one of `BUCKETS` buckets by `id % BUCKETS`; only
//! that bucket's lock is taken for a lookup, so the read loop and completion
//! paths on other streams do not contend.

use std::collections::HashMap;

use parking_lot::Mutex;

const BUCKETS: usize = 32;

/// Concurrent map from stream id to `V`.
pub struct StreamTable<V> {
    buckets: Box<[Mutex<HashMap<u32, V>>]>,
}

impl<V> StreamTable<V> {
    pub fn new() -> Self {
        let buckets = (0..BUCKETS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets }
    }

    #[inline]
    fn bucket(&self, stream_id: u32) -> &Mutex<HashMap<u32, V>> {
        &self.buckets[stream_id as usize % BUCKETS]
    }

    /// Insert, returning the previous value for the id.
    pub fn insert(&self, stream_id: u32, value: V) -> Option<V> {
        self.bucket(stream_id).lock().insert(stream_id, value)
    }

    /// Remove the entry. Removing an absent id is a no-op.
    pub fn remove(&self, stream_id: u32) -> Option<V> {
        self.bucket(stream_id).lock().remove(&stream_id)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.bucket(stream_id).lock().contains_key(&stream_id)
    }

    /// Run `f` against the entry while holding its bucket lock.
    pub fn with<R>(&self, stream_id: u32, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.bucket(stream_id).lock().get_mut(&stream_id).map(f)
    }

    /// Run `f` against the entry and take it out if `f` returns true.
    ///
    /// `None` if the id is absent, `Some(None)` if the entry stays,
    /// `Some(Some(v))` with the removed entry otherwise.
    pub fn update_or_take(&self, stream_id: u32, f: impl FnOnce(&mut V) -> bool) -> Option<Option<V>> {
        let mut bucket = self.bucket(stream_id).lock();
        if !f(bucket.get_mut(&stream_id)?) {
            return Some(None);
        }
        Some(bucket.remove(&stream_id))
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(u32, V)> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            out.extend(bucket.lock().drain());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for StreamTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_remove_idempotent() {
        let table = StreamTable::new();
        assert!(table.insert(1, "a").is_none());
        assert!(table.contains(1));
        assert_eq!(table.remove(1), Some("a"));
        assert_eq!(table.remove(1), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_in_same_bucket_are_distinct() {
        let table = StreamTable::new();
        table.insert(1, 10);
        table.insert(1 + BUCKETS as u32, 20);
        assert_eq!(table.len(), 2);
        assert_eq!(table.with(1, |v| *v), Some(10));
        assert_eq!(table.with(1 + BUCKETS as u32, |v| *v), Some(20));
    }

    #[test]
    fn test_update_or_take() {
        let table = StreamTable::new();
        table.insert(3, 0u32);
        assert_eq!(
            table.update_or_take(3, |v| {
                *v += 1;
                false
            }),
            Some(None)
        );
        assert_eq!(table.update_or_take(3, |v| *v == 1), Some(Some(1)));
        assert!(!table.contains(3));
        assert_eq!(table.update_or_take(3, |_| true), None);
    }

    #[test]
    fn test_concurrent_inserts() {
        let table = Arc::new(StreamTable::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        table.insert(t * 1000 + i, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 800);
        assert_eq!(table.drain().len(), 800);
        assert!(table.is_empty());
    }
}
