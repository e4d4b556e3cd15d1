//! Scopes and blocks of random choices.
//!
//! Every unconstrained random choice lives in the default scope, in a block of
//! its own. Programs can additionally tag choices into named scopes and
//! blocks; samplers pick their principal nodes by scope and block.

use crate::arena::NodeId;
use crate::value::Value;
use rand::Rng;
use rand::RngCore;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::Hash;

pub const DEFAULT_SCOPE: &str = "default";

pub fn default_scope() -> Value {
    Value::symbol(DEFAULT_SCOPE)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockId {
    /// Default-scope block holding exactly this node.
    Node(NodeId),
    Named(Value),
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (BlockId::Node(a), BlockId::Node(b)) => a.partial_cmp(b),
            (BlockId::Node(_), BlockId::Named(_)) => Some(Ordering::Less),
            (BlockId::Named(_), BlockId::Node(_)) => Some(Ordering::Greater),
            (BlockId::Named(a), BlockId::Named(b)) => a.partial_cmp(b),
        }
    }
}

/// Map with O(1) insert, erase and uniform sampling of keys.
#[derive(Clone, Debug)]
pub struct SamplableMap<K, V> {
    index: FxHashMap<K, usize>,
    entries: Vec<(K, V)>,
}

impl<K: Clone + Eq + Hash, V> Default for SamplableMap<K, V> {
    fn default() -> Self {
        Self {
            index: FxHashMap::default(),
            entries: Vec::new(),
        }
    }
}

impl<K: Clone + Eq + Hash, V> SamplableMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, k: &K) -> bool {
        self.index.contains_key(k)
    }

    pub fn get(&self, k: &K) -> Option<&V> {
        self.index.get(k).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, k: &K) -> Option<&mut V> {
        self.index.get(k).map(|&i| &mut self.entries[i].1)
    }

    pub fn insert(&mut self, k: K, v: V) {
        assert!(!self.contains(&k), "key inserted twice into samplable map");
        self.index.insert(k.clone(), self.entries.len());
        self.entries.push((k, v));
    }

    /// Swap-remove: the last entry takes the erased entry's position.
    pub fn remove(&mut self, k: &K) -> V {
        let idx = self
            .index
            .remove(k)
            .unwrap_or_else(|| panic!("erasing a key absent from samplable map"));
        let (_, v) = self.entries.swap_remove(idx);
        if idx < self.entries.len() {
            let moved = self.entries[idx].0.clone();
            self.index.insert(moved, idx);
        }
        v
    }

    pub fn sample_key(&self, rng: &mut dyn RngCore) -> Option<&K> {
        if self.entries.is_empty() {
            return None;
        }
        let i = rng.gen_range(0..self.entries.len());
        Some(&self.entries[i].0)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl<K: Clone + Eq + Hash + PartialOrd, V> SamplableMap<K, V> {
    pub fn ordered_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.keys().cloned().collect();
        keys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        keys
    }
}

/// scope -> block -> registered nodes
#[derive(Clone, Debug, Default)]
pub struct ScopeIndex {
    scopes: FxHashMap<Value, SamplableMap<BlockId, BTreeSet<NodeId>>>,
}

impl ScopeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scope: Value, block: BlockId, node: NodeId) {
        let blocks = self.scopes.entry(scope).or_default();
        if let Some(nodes) = blocks.get_mut(&block) {
            assert!(nodes.insert(node), "node {} registered twice in block", node.0);
        } else {
            blocks.insert(block, BTreeSet::from([node]));
        }
    }

    pub fn unregister(&mut self, scope: &Value, block: &BlockId, node: NodeId) {
        let blocks = self
            .scopes
            .get_mut(scope)
            .unwrap_or_else(|| panic!("unregistering from unknown scope {scope}"));
        let nodes = blocks
            .get_mut(block)
            .unwrap_or_else(|| panic!("unregistering from unknown block in scope {scope}"));
        assert!(nodes.remove(&node), "node {} not registered in block", node.0);
        if nodes.is_empty() {
            blocks.remove(block);
        }
        if blocks.is_empty() {
            self.scopes.remove(scope);
        }
    }

    pub fn blocks(&self, scope: &Value) -> Option<&SamplableMap<BlockId, BTreeSet<NodeId>>> {
        self.scopes.get(scope)
    }

    pub fn num_blocks(&self, scope: &Value) -> usize {
        self.scopes.get(scope).map_or(0, SamplableMap::len)
    }

    pub fn registered(&self, scope: &Value, block: &BlockId) -> BTreeSet<NodeId> {
        self.scopes
            .get(scope)
            .and_then(|blocks| blocks.get(block))
            .cloned()
            .unwrap_or_default()
    }
}
