//! The map of entries along with its retention policy.
//!
//! Completed entries are tracked in completion order, which makes picking the
//! least-recently-completed entry an `O(log n)` operation. In-flight placeholders are not part
//! of that order and can therefore never be chosen as an eviction victim.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

use super::entry::{Completed, Entry, InFlight};

/// The outcome of publishing a result into the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Publish {
    /// The placeholder was replaced, evicting that many other entries to stay within bounds.
    Stored { evicted: usize },
    /// The placeholder was removed or replaced in the meantime, so the result was not stored.
    Discarded,
}

pub(crate) struct Entries<K, T, E> {
    map: HashMap<K, Entry<T, E>>,
    /// Keys of all completed entries, ordered by their completion sequence.
    completed: BTreeMap<u64, K>,
    max_entries: usize,
}

impl<K, T, E> Entries<K, T, E>
where
    K: Clone + Eq + Hash,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            completed: BTreeMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn in_flight(&self) -> usize {
        self.map.len() - self.completed.len()
    }

    pub fn get(&self, key: &K) -> Option<&Entry<T, E>> {
        self.map.get(key)
    }

    /// Installs a placeholder for a new call, replacing whatever entry `key` had before.
    ///
    /// Returns the number of completed entries that were evicted to make room. If the map is
    /// full of in-flight calls, the placeholder is inserted regardless.
    pub fn insert_in_flight(&mut self, key: K, in_flight: InFlight<T, E>) -> usize {
        self.remove(&key);
        let evicted = self.evict_until(self.max_entries - 1);
        self.map.insert(key, Entry::InProgress(in_flight));
        evicted
    }

    /// Replaces the placeholder of call `id` with its completed result.
    pub fn complete(&mut self, key: &K, id: u64, completed: Completed<T, E>) -> Publish {
        let Some(entry) = self.map.get_mut(key) else {
            return Publish::Discarded;
        };
        if entry.in_flight(id).is_none() {
            return Publish::Discarded;
        }

        self.completed.insert(completed.sequence, key.clone());
        *entry = Entry::Done(completed);

        // Placeholders are inserted even when the map is full, so trim it back down.
        let evicted = self.evict_until(self.max_entries);
        Publish::Stored { evicted }
    }

    /// Removes the placeholder of call `id`, if it is still installed.
    pub fn remove_in_flight(&mut self, key: &K, id: u64) -> bool {
        match self.map.get(key) {
            Some(entry) if entry.in_flight(id).is_some() => {
                self.map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes the completed entry for `key`, leaving in-flight calls alone.
    pub fn remove_completed(&mut self, key: &K) -> bool {
        match self.map.get(key) {
            Some(Entry::Done(_)) => {
                self.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes all completed entries.
    pub fn clear_completed(&mut self) -> usize {
        let completed = std::mem::take(&mut self.completed);
        for key in completed.values() {
            self.map.remove(key);
        }
        completed.len()
    }

    /// Removes all completed entries that are stale at `now`.
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .completed
            .values()
            .filter(|key| match self.map.get(*key) {
                Some(Entry::Done(completed)) => !completed.is_fresh(now),
                _ => false,
            })
            .cloned()
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn remove(&mut self, key: &K) -> Option<Entry<T, E>> {
        let entry = self.map.remove(key)?;
        if let Entry::Done(completed) = &entry {
            self.completed.remove(&completed.sequence);
        }
        Some(entry)
    }

    /// Evicts the least-recently-completed entries until at most `limit` entries remain, or no
    /// completed entries are left.
    fn evict_until(&mut self, limit: usize) -> usize {
        let mut evicted = 0;
        while self.map.len() > limit {
            let Some((_, key)) = self.completed.pop_first() else {
                break;
            };
            let removed = self.map.remove(&key);
            debug_assert!(matches!(removed, Some(Entry::Done(_))));
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    type TestEntries = Entries<&'static str, u32, ()>;

    fn complete(entries: &mut TestEntries, key: &'static str, id: u64, ttl: Duration) -> Publish {
        let (in_flight, _sender) = InFlight::new(id);
        entries.insert_in_flight(key, in_flight);
        entries.complete(&key, id, Completed::new(Ok(id as u32), ttl, id))
    }

    #[test]
    fn test_evicts_least_recently_completed() {
        let mut entries = TestEntries::new(2);
        let ttl = Duration::from_secs(60);

        complete(&mut entries, "a", 1, ttl);
        complete(&mut entries, "b", 2, ttl);
        assert_eq!(entries.len(), 2);

        let (in_flight, _sender) = InFlight::new(3);
        assert_eq!(entries.insert_in_flight("c", in_flight), 1);

        assert!(entries.get(&"a").is_none());
        assert!(entries.get(&"b").is_some());
        assert!(entries.get(&"c").is_some());
    }

    #[test]
    fn test_never_evicts_in_flight() {
        let mut entries = TestEntries::new(1);

        let (first, _first_sender) = InFlight::new(1);
        let (second, _second_sender) = InFlight::new(2);
        assert_eq!(entries.insert_in_flight("a", first), 0);
        assert_eq!(entries.insert_in_flight("b", second), 0);

        // saturated with in-flight calls, both are kept
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.in_flight(), 2);

        // publishing trims the map back to its bound
        let publish = entries.complete(&"a", 1, Completed::new(Ok(1), Duration::from_secs(1), 1));
        assert_eq!(publish, Publish::Stored { evicted: 1 });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.in_flight(), 1);
        assert!(entries.get(&"b").is_some());
    }

    #[test]
    fn test_complete_discards_unknown_call() {
        let mut entries = TestEntries::new(10);
        let completed = Completed::new(Ok(1), Duration::from_secs(1), 1);
        assert_eq!(entries.complete(&"a", 1, completed), Publish::Discarded);

        let (in_flight, _sender) = InFlight::new(2);
        entries.insert_in_flight("a", in_flight);
        let completed = Completed::new(Ok(1), Duration::from_secs(1), 1);
        assert_eq!(entries.complete(&"a", 1, completed), Publish::Discarded);
        assert_eq!(entries.in_flight(), 1);
    }

    #[test]
    fn test_remove_in_flight_checks_id() {
        let mut entries = TestEntries::new(10);
        let (in_flight, _sender) = InFlight::new(5);
        entries.insert_in_flight("a", in_flight);

        assert!(!entries.remove_in_flight(&"a", 4));
        assert!(!entries.remove_completed(&"a"));
        assert!(entries.remove_in_flight(&"a", 5));
        assert_eq!(entries.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired() {
        let mut entries = TestEntries::new(10);
        complete(&mut entries, "short", 1, Duration::from_secs(1));
        complete(&mut entries, "long", 2, Duration::from_secs(10));
        let (in_flight, _sender) = InFlight::new(3);
        entries.insert_in_flight("running", in_flight);

        assert_eq!(entries.remove_expired(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(entries.remove_expired(Instant::now()), 1);
        assert!(entries.get(&"short").is_none());
        assert!(entries.get(&"long").is_some());
        assert!(entries.get(&"running").is_some());
    }

    #[test]
    fn test_clear_completed() {
        let mut entries = TestEntries::new(10);
        complete(&mut entries, "a", 1, Duration::from_secs(1));
        complete(&mut entries, "b", 2, Duration::from_secs(1));
        let (in_flight, _sender) = InFlight::new(3);
        entries.insert_in_flight("c", in_flight);

        assert_eq!(entries.clear_completed(), 2);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.in_flight(), 1);
    }
}
