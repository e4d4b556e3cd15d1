use crate::arena::NodeId;
use crate::trace::Trace;
use crate::value::Value;
use rustc_hash::FxHashMap;

/// What a detach removed from the trace: the values of unapplied nodes and
/// the roots of families whose last request went away. A restoring regen
/// replays exactly these.
#[derive(Debug, Default)]
pub struct OmegaDb {
    values: FxHashMap<NodeId, Value>,
    /// (maker node, family id) -> detached family root.
    families: FxHashMap<(NodeId, Value), NodeId>,
    /// Detach order; reclamation frees in this order.
    family_order: Vec<NodeId>,
}

impl OmegaDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_value(&self, node: NodeId) -> bool {
        self.values.contains_key(&node)
    }

    pub fn value(&self, node: NodeId) -> Option<&Value> {
        self.values.get(&node)
    }

    pub fn extract_value(&mut self, node: NodeId, value: Value) {
        let prev = self.values.insert(node, value);
        assert!(prev.is_none(), "value of node {} extracted twice", node.0);
    }

    pub fn family(&self, maker: NodeId, id: &Value) -> Option<NodeId> {
        self.families.get(&(maker, id.clone())).copied()
    }

    pub fn register_family(&mut self, maker: NodeId, id: Value, root: NodeId) {
        let prev = self.families.insert((maker, id), root);
        assert!(prev.is_none(), "family rooted at {} detached twice", root.0);
        self.family_order.push(root);
    }

    pub fn num_families(&self) -> usize {
        self.families.len()
    }

    /// Free every detached family that nothing will restore.
    pub fn reclaim(self, trace: &mut Trace) -> usize {
        let n = self.family_order.len();
        for root in self.family_order {
            trace.free_family(root);
        }
        n
    }
}
