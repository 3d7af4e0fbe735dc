//! Copy-on-write trie.
//!
//! An immutable trie keyed by strings. Edits never touch existing nodes:
//! they clone the nodes on the path from the root to the edit point and
//! share every untouched subtree with the previous version. Handles to old
//! roots therefore stay valid forever, which is what makes the lock-light
//! [`store::TrieStore`] possible.

pub mod store;

use std::any::Any;
use std::collections::HashMap;
use std::str::Chars;
use std::sync::Arc;

/// A type-erased value stored at a trie node.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// One immutable trie node.
///
/// A node may carry a value, children, both, or (transiently during
/// removal) neither; value-less nodes exist purely as interior path
/// segments.
#[derive(Default)]
pub(crate) struct TrieNode {
    pub(crate) children: HashMap<char, Arc<TrieNode>>,
    pub(crate) value: Option<Value>,
}

impl TrieNode {
    /// Shallow copy: children and value handles are shared, not deep-cloned.
    fn clone_shallow(&self) -> TrieNode {
        TrieNode {
            children: self.children.clone(),
            value: self.value.clone(),
        }
    }
}

/// A handle to one immutable trie version.
///
/// Cloning a `Trie` is cheap (one `Arc` bump) and yields an independent
/// handle to the same version. The empty key addresses the root node.
#[derive(Clone, Default)]
pub struct Trie {
    root: Option<Arc<TrieNode>>,
}

impl Trie {
    /// The empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `key`, expecting a value of type `T`.
    ///
    /// Returns `None` when the key is absent *or* when the stored value has
    /// a different type; the two cases are deliberately indistinguishable.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        let mut node = self.root.as_deref()?;
        for ch in key.chars() {
            node = node.children.get(&ch)?;
        }
        node.value.as_ref()?.downcast_ref::<T>()
    }

    /// Produce a new version with `value` stored at `key`.
    ///
    /// An existing value at `key` is replaced; its children are preserved.
    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: T) -> Trie {
        let value: Value = Arc::new(value);
        let new_root = Self::put_rec(self.root.as_deref(), key.chars(), value);
        Trie {
            root: Some(Arc::new(new_root)),
        }
    }

    fn put_rec(node: Option<&TrieNode>, mut path: Chars<'_>, value: Value) -> TrieNode {
        // Clone the node on the path (or conjure an empty one), then rebuild
        // the single child the path continues through.
        let mut new_node = node.map(TrieNode::clone_shallow).unwrap_or_default();

        match path.next() {
            None => {
                new_node.value = Some(value);
            }
            Some(ch) => {
                let child = node.and_then(|n| n.children.get(&ch)).map(Arc::as_ref);
                let new_child = Self::put_rec(child, path, value);
                new_node.children.insert(ch, Arc::new(new_child));
            }
        }

        new_node
    }

    /// Produce a new version with the value at `key` removed.
    ///
    /// Nodes left without a value and without children are pruned
    /// bottom-up. Removing an absent key yields an equivalent trie.
    pub fn remove(&self, key: &str) -> Trie {
        let Some(root) = self.root.as_deref() else {
            return Trie::new();
        };
        Trie {
            root: Self::remove_rec(root, key.chars()).map(Arc::new),
        }
    }

    /// Rebuild `node` with the value at `path` stripped. `None` means the
    /// node pruned itself away.
    fn remove_rec(node: &TrieNode, mut path: Chars<'_>) -> Option<TrieNode> {
        let Some(ch) = path.next() else {
            // Terminal node: drop the value, survive only if children remain.
            if node.children.is_empty() {
                return None;
            }
            return Some(TrieNode {
                children: node.children.clone(),
                value: None,
            });
        };

        let Some(child) = node.children.get(&ch) else {
            // Key not present; the (cloned) path is semantically unchanged.
            return Some(node.clone_shallow());
        };

        let mut new_node = node.clone_shallow();
        match Self::remove_rec(child, path) {
            Some(new_child) => {
                new_node.children.insert(ch, Arc::new(new_child));
            }
            None => {
                new_node.children.remove(&ch);
                if new_node.children.is_empty() && new_node.value.is_none() {
                    return None;
                }
            }
        }
        Some(new_node)
    }

    /// Type-erased lookup; used by the store to hand out value guards.
    pub(crate) fn get_value_handle(&self, key: &str) -> Option<Value> {
        let mut node = self.root.as_deref()?;
        for ch in key.chars() {
            node = node.children.get(&ch)?;
        }
        node.value.clone()
    }

    #[cfg(test)]
    fn root_node(&self) -> Option<&Arc<TrieNode>> {
        self.root.as_ref()
    }
}
