//! Arena - Node Storage for Execution Traces
//!
//! Every node of a trace lives in one arena slot addressed by a `NodeId`.
//! Edges (parents, children, ESR parents) are stored as ids, so the whole
//! graph is a plain value that can be cloned into an independent particle.

use crate::psp::SpRecord;
use crate::value::Value;
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Lightweight NodeId
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NULL: NodeId = NodeId(u32::MAX);
}

pub type Operands = SmallVec<[NodeId; 4]>;

/// Core Node Enum
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Literal value, no parents.
    Constant,
    /// Aliases the value of `source`.
    Lookup { source: NodeId },
    /// Issues the external stochastic requests of an application.
    Request {
        operator: NodeId,
        operands: Operands,
        output: NodeId,
    },
    /// Value of an application, produced by the operator's output PSP.
    Output {
        operator: NodeId,
        operands: Operands,
        request: NodeId,
    },
}

impl Node {
    /// Parents fixed at construction time, in evaluation order.
    pub fn definite_parents(&self) -> SmallVec<[NodeId; 6]> {
        match self {
            Node::Constant => SmallVec::new(),
            Node::Lookup { source } => smallvec::smallvec![*source],
            Node::Request { operator, operands, .. } => {
                let mut ps = SmallVec::with_capacity(operands.len() + 1);
                ps.push(*operator);
                ps.extend(operands.iter().copied());
                ps
            }
            Node::Output { operator, operands, request } => {
                let mut ps = SmallVec::with_capacity(operands.len() + 2);
                ps.push(*operator);
                ps.extend(operands.iter().copied());
                ps.push(*request);
                ps
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Constant => "constant",
            Node::Lookup { .. } => "lookup",
            Node::Request { .. } => "request",
            Node::Output { .. } => "output",
        }
    }
}

/// Per-node state. The node is active exactly when `value` is present.
#[derive(Clone, Debug)]
pub struct Slot {
    pub node: Node,
    pub value: Option<Value>,
    pub esr_parents: SmallVec<[NodeId; 2]>,
    pub children: BTreeSet<NodeId>,
    pub num_requests: u32,
    pub made_sp: Option<SpRecord>,
}

impl Slot {
    fn new(node: Node) -> Self {
        Self {
            node,
            value: None,
            esr_parents: SmallVec::new(),
            children: BTreeSet::new(),
            num_requests: 0,
            made_sp: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(256),
            free: Vec::new(),
        }
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        let slot = Some(Slot::new(node));
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = slot;
            return NodeId(idx);
        }
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(slot);
        id
    }

    /// Return a slot to the free list. The node must already be detached
    /// from every neighbour.
    pub fn free(&mut self, id: NodeId) {
        let slot = self.slots[id.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("double free of node {}", id.0));
        assert!(
            slot.children.is_empty(),
            "freeing node {} with live children {:?}",
            id.0,
            slot.children
        );
        assert_eq!(slot.num_requests, 0, "freeing requested node {}", id.0);
        self.free.push(id.0);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.0 as usize), Some(Some(_)))
    }

    pub fn slot(&self, id: NodeId) -> &Slot {
        self.slots[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("node {} has been reclaimed", id.0))
    }

    pub fn slot_mut(&mut self, id: NodeId) -> &mut Slot {
        self.slots[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("node {} has been reclaimed", id.0))
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.slot(id).node
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }
}
