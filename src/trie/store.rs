//! Versioned, reader-lock-free store over the copy-on-write trie.

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Trie;

/// A concurrent key-value map built from immutable trie versions.
///
/// Two mutexes with sharply different jobs:
/// - `write_lock` serializes mutators end to end, so a put never computes
///   against a root another put is about to replace;
/// - `root` is held only long enough to copy or swap the root handle.
///
/// Readers copy the current root under the root mutex, release it, and run
/// the lookup against that private snapshot. A writer publishing a new
/// version can't invalidate a snapshot: old versions stay alive as long as
/// someone holds them.
#[derive(Default)]
pub struct TrieStore {
    root: Mutex<Trie>,
    write_lock: Mutex<()>,
}

impl TrieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `key`, returning a guard that keeps the value alive.
    ///
    /// Returns `None` on absence or on a value of a different type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<ValueGuard<T>> {
        let root = self.root.lock().clone();

        let value = root.get_value_handle(key)?;
        let value = value.downcast::<T>().ok()?;

        Some(ValueGuard { _root: root, value })
    }

    /// Store `value` at `key`, publishing a new version.
    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: T) {
        let _writer = self.write_lock.lock();

        let root = self.root.lock().clone();
        // The new version is computed outside both mutexes; readers keep
        // going against the old root meanwhile.
        let new_root = root.put(key, value);
        *self.root.lock() = new_root;
    }

    /// Remove the value at `key`, publishing a new version.
    pub fn remove(&self, key: &str) {
        let _writer = self.write_lock.lock();

        let root = self.root.lock().clone();
        let new_root = root.remove(key);
        *self.root.lock() = new_root;
    }
}

/// Keeps a looked-up value alive independent of later store mutations.
///
/// Bundles the snapshot root the lookup ran against with a shared handle to
/// the value itself; dereferences to `T`.
pub struct ValueGuard<T> {
    _root: Trie,
    value: Arc<T>,
}

impl<T> Deref for ValueGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_put_get_remove() {
        let store = TrieStore::new();

        assert!(store.get::<u32>("k").is_none());

        store.put("k", 5u32);
        assert_eq!(*store.get::<u32>("k").unwrap(), 5);

        store.put("k", 6u32);
        assert_eq!(*store.get::<u32>("k").unwrap(), 6);

        store.remove("k");
        assert!(store.get::<u32>("k").is_none());
    }

    #[test]
    fn test_type_mismatch_is_absent() {
        let store = TrieStore::new();
        store.put("k", String::from("text"));

        assert!(store.get::<u32>("k").is_none());
        assert_eq!(store.get::<String>("k").unwrap().as_str(), "text");
    }

    #[test]
    fn test_guard_survives_removal() {
        let store = TrieStore::new();
        store.put("k", 99u32);

        let guard = store.get::<u32>("k").unwrap();
        store.remove("k");

        // The store no longer has the key, the guard still sees the value.
        assert!(store.get::<u32>("k").is_none());
        assert_eq!(*guard, 99);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(TrieStore::new());
        store.put("k", 0u64);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..1000u64 {
                    if i % 2 == 0 {
                        store.put("k", i);
                    } else {
                        store.remove("k");
                    }
                }
                store.put("k", u64::MAX);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        // Every observed guard must hold a value that was
                        // genuinely published at some point.
                        if let Some(guard) = store.get::<u64>("k") {
                            let v = *guard;
                            assert!(v % 2 == 0 || v == u64::MAX);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(*store.get::<u64>("k").unwrap(), u64::MAX);
    }

    #[test]
    fn test_writers_serialize() {
        let store = Arc::new(TrieStore::new());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        store.put(&format!("t{}-{}", t, i), i);
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }

        // No writer's updates were lost to a racing publish.
        for t in 0..4 {
            for i in 0..100u32 {
                assert_eq!(*store.get::<u32>(&format!("t{}-{}", t, i)).unwrap(), i);
            }
        }
    }
}
