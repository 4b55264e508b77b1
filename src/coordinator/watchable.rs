//! Key/value maps that notify readers when they change

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;

/// A map plus a version counter readers can wait on.
///
/// Every effective write bumps the counter; writing a value equal to the one
/// already stored does not.
pub struct WatchableMap<K, V> {
    entries: RwLock<BTreeMap<K, V>>,
    version: watch::Sender<u64>,
}

impl<K: Ord + Clone, V: Clone + PartialEq> Default for WatchableMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> WatchableMap<K, V> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            version,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(&key) == Some(&value) {
            return;
        }
        entries.insert(key, value);
        self.version.send_modify(|v| *v += 1);
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(key);
        if removed.is_some() {
            self.version.send_modify(|v| *v += 1);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Version counter, bumped on every effective write
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let map: WatchableMap<u32, String> = WatchableMap::new();
        assert!(map.is_empty());
        map.set(1, "one".into());
        map.set(2, "two".into());
        assert_eq!(map.get(&1).as_deref(), Some("one"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.delete(&1).as_deref(), Some("one"));
        assert_eq!(map.delete(&1), None);
        assert_eq!(map.keys(), vec![2]);
    }

    #[test]
    fn test_only_effective_writes_notify() {
        let map: WatchableMap<u32, u32> = WatchableMap::new();
        let mut rx = map.subscribe();
        map.set(1, 10);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        map.set(1, 10);
        map.delete(&7);
        assert!(!rx.has_changed().unwrap());

        map.delete(&1);
        assert!(rx.has_changed().unwrap());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_wakes() {
        let map = std::sync::Arc::new(WatchableMap::<u32, u32>::new());
        let mut rx = map.subscribe();
        let writer = map.clone();
        tokio::spawn(async move { writer.set(5, 50) });
        rx.changed().await.unwrap();
        assert_eq!(map.get(&5), Some(50));
    }
}
