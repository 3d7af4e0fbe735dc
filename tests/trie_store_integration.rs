//! Integration tests for the trie and its versioned store.

use std::sync::Arc;
use std::thread;

use burrowdb::{Trie, TrieStore};

/// Versions share structure and never see each other's edits.
#[test]
fn test_version_isolation() {
    let t0 = Trie::new();
    let t1 = t0.put("ab", 1u32);
    let t2 = t1.put("ac", 2u32);
    let t3 = t2.remove("ab");

    assert_eq!(t0.get::<u32>("ab"), None);
    assert_eq!(t1.get::<u32>("ab"), Some(&1));
    assert_eq!(t2.get::<u32>("ab"), Some(&1));
    assert_eq!(t2.get::<u32>("ac"), Some(&2));
    assert_eq!(t3.get::<u32>("ab"), None);
    assert_eq!(t3.get::<u32>("ac"), Some(&2));
}

/// Heterogeneous value types coexist; lookups are type-checked.
#[test]
fn test_store_mixed_value_types() {
    let store = TrieStore::new();

    store.put("count", 42u64);
    store.put("name", String::from("burrow"));

    assert_eq!(*store.get::<u64>("count").unwrap(), 42);
    assert_eq!(store.get::<String>("name").unwrap().as_str(), "burrow");

    // Wrong-type reads look exactly like absence.
    assert!(store.get::<String>("count").is_none());
    assert!(store.get::<u64>("name").is_none());
}

/// One writer churning a key while readers hold guards: every guard stays
/// valid and every observed value was genuinely published.
#[test]
fn test_store_reader_writer_churn() {
    let store = Arc::new(TrieStore::new());

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..2000u32 {
                store.put("k", i);
                if i % 3 == 0 {
                    store.remove("k");
                }
            }
            store.put("k", u32::MAX);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..2000 {
                    if let Some(guard) = store.get::<u32>("k") {
                        // Hold a few guards across later mutations.
                        if held.len() < 8 {
                            held.push(guard);
                        }
                    }
                }
                // Guards held across thousands of publishes still read
                // their original values.
                for guard in &held {
                    let _ = **guard;
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(*store.get::<u32>("k").unwrap(), u32::MAX);
}
