//! Per-account forest of remote paths that currently have work in flight.
//!
//! Nodes live in one concurrent map keyed by `account + path`; parent and child edges are
//! stored as keys, never as references. Every individual step is atomic on its own key, the
//! multi-step walks are not: a reader can briefly see a node whose ancestor chain is still
//! being built.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

pub const ROOT_PATH: &str = "/";

#[derive(Debug)]
struct ForestNode<V> {
    parent: Option<String>,
    children: HashSet<String>,
    payload: Option<V>,
}

impl<V> ForestNode<V> {
    fn is_prunable(&self) -> bool {
        self.payload.is_none() && self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: String,
    /// Nearest ancestor that was already tracked, or [`ROOT_PATH`] when the chain was built
    /// all the way up.
    pub linked_to: String,
    /// `false` when another payload already held the path; the existing one is kept.
    pub inserted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal<V> {
    pub payload: Option<V>,
    /// Lowest ancestor still alive after the cascade; `None` when nothing was removed or the
    /// cascade went past the root.
    pub unlinked_from: Option<String>,
}

impl<V> Removal<V> {
    fn none() -> Self {
        Self {
            payload: None,
            unlinked_from: None,
        }
    }
}

#[derive(Debug)]
pub struct IndexedForest<V> {
    map: DashMap<String, ForestNode<V>>,
}

impl<V> Default for IndexedForest<V> {
    fn default() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<V: Clone> IndexedForest<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` for `path` unless a payload is already there, then links the node
    /// into its ancestor chain, creating payload-less placeholders until an already tracked
    /// ancestor (or the root) is reached.
    pub fn put_if_absent(&self, account: &str, path: &str, value: V) -> PutOutcome {
        let path = normalize(path);
        let target_key = build_key(account, &path);

        let inserted = match self.map.entry(target_key.clone()) {
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();
                if node.payload.is_none() {
                    node.payload = Some(value);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(ForestNode {
                    parent: None,
                    children: HashSet::new(),
                    payload: Some(value),
                });
                true
            }
        };

        let linked_to = self.link_upward(account, path, target_key.clone());
        PutOutcome {
            key: target_key,
            linked_to,
            inserted,
        }
    }

    /// Links `key` into its ancestor chain, creating placeholders up to the first tracked
    /// ancestor. Returns the path it was linked to.
    fn link_upward(
        &self,
        account: &str,
        mut current_path: String,
        mut current_key: String,
    ) -> String {
        let mut linked_to = None;
        while current_path != ROOT_PATH && linked_to.is_none() {
            let parent_path = parent_of(&current_path);
            let parent_key = build_key(account, &parent_path);
            match self.map.entry(parent_key.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().children.insert(current_key.clone());
                    linked_to = Some(parent_path.clone());
                }
                Entry::Vacant(entry) => {
                    entry.insert(ForestNode {
                        parent: None,
                        children: HashSet::from([current_key.clone()]),
                        payload: None,
                    });
                }
            }
            if let Some(mut current) = self.map.get_mut(&current_key) {
                current.parent = Some(parent_key.clone());
            }
            current_path = parent_path;
            current_key = parent_key;
        }
        linked_to.unwrap_or_else(|| ROOT_PATH.to_string())
    }

    /// Clears the payload of `path`; the node goes away too once it has no children left.
    pub fn remove_payload(&self, account: &str, path: &str) -> Removal<V> {
        let key = build_key(account, &normalize(path));
        let payload = match self.map.get_mut(&key) {
            Some(mut node) => node.payload.take(),
            None => return Removal::none(),
        };
        match self.map.remove_if(&key, |_, node| node.is_prunable()) {
            Some((removed_key, node)) => Removal {
                payload,
                unlinked_from: self.unlink_upward(account, removed_key, node.parent),
            },
            None => Removal {
                payload,
                unlinked_from: None,
            },
        }
    }

    /// Removes `path` with its whole subtree, then prunes ancestors left with neither
    /// children nor payload.
    pub fn remove(&self, account: &str, path: &str) -> Removal<V> {
        let key = build_key(account, &normalize(path));
        let Some((removed_key, removed)) = self.map.remove(&key) else {
            return Removal::none();
        };
        self.remove_descendants(&removed.children);
        Removal {
            payload: removed.payload,
            unlinked_from: self.unlink_upward(account, removed_key, removed.parent),
        }
    }

    pub fn get(&self, account: &str, path: &str) -> Option<V> {
        let key = build_key(account, &normalize(path));
        self.map.get(&key).and_then(|node| node.payload.clone())
    }

    pub fn contains(&self, account: &str, path: &str) -> bool {
        self.map.contains_key(&build_key(account, &normalize(path)))
    }

    /// Drops every node of `account`. Not atomic with respect to concurrent inserts.
    pub fn remove_account(&self, account: &str) -> usize {
        let mut removed = 0;
        self.map.retain(|key, _| {
            let owned = key
                .strip_prefix(account)
                .is_some_and(|rest| rest.starts_with('/'));
            if owned {
                removed += 1;
            }
            !owned
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn remove_descendants(&self, children: &HashSet<String>) {
        for child in children {
            if let Some((_, node)) = self.map.remove(child) {
                self.remove_descendants(&node.children);
            }
        }
    }

    fn unlink_upward(
        &self,
        account: &str,
        mut removed_key: String,
        mut parent_key: Option<String>,
    ) -> Option<String> {
        while let Some(key) = parent_key {
            loop {
                match self.map.get_mut(&key) {
                    Some(mut parent) => {
                        parent.children.remove(&removed_key);
                    }
                    None => return None,
                }
                // A concurrent put may have re-created the node and relinked it before the
                // edge was dropped above.
                if !self.map.contains_key(&removed_key) {
                    break;
                }
                self.link_upward(account, path_of(account, &removed_key), removed_key.clone());
                if self.map.contains_key(&removed_key) {
                    return Some(path_of(account, &key));
                }
            }
            match self.map.remove_if(&key, |_, node| node.is_prunable()) {
                Some((key, node)) => {
                    removed_key = key;
                    parent_key = node.parent;
                }
                None => return Some(path_of(account, &key)),
            }
        }
        None
    }
}

fn build_key(account: &str, path: &str) -> String {
    format!("{account}{path}")
}

fn path_of(account: &str, key: &str) -> String {
    key.strip_prefix(account).unwrap_or(key).to_string()
}

/// Folder paths are tracked without their trailing separator so `/a/b` and `/a/b/` share a
/// node.
fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        ROOT_PATH.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => ROOT_PATH.to_string(),
        Some(index) => path[..index].to_string(),
    }
}
