//! # Scaffold - the subgraph touched by one proposal
//!
//! Starting from sets of principal nodes, the builder walks forward along
//! child edges and classifies every reached node:
//!
//! * **resampled** (DRG): its value is recomputed during regen.
//! * **absorbing**: its value stays; it is rescored against new parents.
//! * **AAA**: a maker whose applications absorb jointly through its
//!   sufficient statistics; regenerated through a local kernel.
//! * **brush**: families spawned only by requests that are being resampled.
//!   They are destroyed by detach and rebuilt by regen, so they carry no
//!   regen count.
//!
//! Regen counts record how many times a resampled node is reached during a
//! traversal; detach must drive every count to zero and regen back to its
//! initial value.

use crate::arena::{Node, NodeId};
use crate::psp::LKernel;
use crate::trace::Trace;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrgEntry {
    pub regen_count: u32,
    pub resampled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Scaffold {
    principal: Vec<BTreeSet<NodeId>>,
    /// Resampled nodes and absorbing nodes (`resampled == false`).
    drg: BTreeMap<NodeId, DrgEntry>,
    aaa: BTreeSet<NodeId>,
    brush: BTreeSet<NodeId>,
    /// Traversal roots per principal set, in node order.
    border: Vec<Vec<NodeId>>,
    lkernels: FxHashMap<NodeId, Arc<dyn LKernel>>,
}

impl Scaffold {
    /// Scaffold touching nothing; detaching or regenerating through it
    /// unapplies or applies families without any resampling bookkeeping.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn principal(&self) -> &[BTreeSet<NodeId>] {
        &self.principal
    }

    pub fn border(&self) -> &[Vec<NodeId>] {
        &self.border
    }

    pub fn entry(&self, node: NodeId) -> Option<&DrgEntry> {
        self.drg.get(&node)
    }

    pub fn drg(&self) -> impl Iterator<Item = (NodeId, &DrgEntry)> + '_ {
        self.drg.iter().map(|(&n, e)| (n, e))
    }

    pub fn is_resampling(&self, node: NodeId) -> bool {
        self.drg.get(&node).is_some_and(|e| e.resampled)
    }

    pub fn is_absorbing(&self, node: NodeId) -> bool {
        self.drg.get(&node).is_some_and(|e| !e.resampled)
    }

    pub fn is_aaa(&self, node: NodeId) -> bool {
        self.aaa.contains(&node)
    }

    pub fn is_brush(&self, node: NodeId) -> bool {
        self.brush.contains(&node)
    }

    pub fn brush(&self) -> &BTreeSet<NodeId> {
        &self.brush
    }

    pub fn aaa(&self) -> &BTreeSet<NodeId> {
        &self.aaa
    }

    pub fn resampled_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.drg.iter().filter(|(_, e)| e.resampled).map(|(&n, _)| n)
    }

    pub fn absorbing_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.drg.iter().filter(|(_, e)| !e.resampled).map(|(&n, _)| n)
    }

    pub fn regen_count(&self, node: NodeId) -> u32 {
        self.resampled_entry(node).regen_count
    }

    pub fn increment_regen_count(&mut self, node: NodeId) {
        self.resampled_entry_mut(node).regen_count += 1;
    }

    pub fn decrement_regen_count(&mut self, node: NodeId) {
        let entry = self.resampled_entry_mut(node);
        assert!(entry.regen_count > 0, "regen count underflow at node {}", node.0);
        entry.regen_count -= 1;
    }

    fn resampled_entry(&self, node: NodeId) -> &DrgEntry {
        match self.drg.get(&node) {
            Some(e) if e.resampled => e,
            _ => panic!("node {} is not resampled in this scaffold", node.0),
        }
    }

    fn resampled_entry_mut(&mut self, node: NodeId) -> &mut DrgEntry {
        match self.drg.get_mut(&node) {
            Some(e) if e.resampled => e,
            _ => panic!("node {} is not resampled in this scaffold", node.0),
        }
    }

    pub fn lkernel(&self, node: NodeId) -> Option<&Arc<dyn LKernel>> {
        self.lkernels.get(&node)
    }

    pub fn set_lkernel(&mut self, node: NodeId, kernel: Arc<dyn LKernel>) {
        self.lkernels.insert(node, kernel);
    }

    pub fn len(&self) -> usize {
        self.drg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drg.is_empty()
    }
}

#[derive(Default)]
struct Candidates {
    drg: BTreeSet<NodeId>,
    absorbing: BTreeSet<NodeId>,
    aaa: BTreeSet<NodeId>,
    /// Index of the principal set that last reached each node.
    index: FxHashMap<NodeId, usize>,
}

impl Candidates {
    fn add_resampling(&mut self, trace: &Trace, queue: &mut Vec<(NodeId, bool, NodeId)>, node: NodeId, i: usize) {
        self.absorbing.remove(&node);
        self.aaa.remove(&node);
        self.drg.insert(node);
        queue.extend(trace.children(node).iter().rev().map(|&c| (c, false, node)));
        self.index.insert(node, i);
    }

    fn add_absorbing(&mut self, node: NodeId, i: usize) {
        assert!(!self.drg.contains(&node), "absorbing node {} already resampled", node.0);
        assert!(!self.aaa.contains(&node), "absorbing node {} already AAA", node.0);
        self.absorbing.insert(node);
        self.index.insert(node, i);
    }

    fn add_aaa(&mut self, node: NodeId, i: usize) {
        self.absorbing.remove(&node);
        self.drg.insert(node);
        self.aaa.insert(node);
        self.index.insert(node, i);
    }

    fn extend(&mut self, trace: &Trace, pnodes: &BTreeSet<NodeId>, i: usize) {
        let mut queue: Vec<(NodeId, bool, NodeId)> =
            pnodes.iter().rev().map(|&p| (p, true, NodeId::NULL)).collect();
        while let Some((node, is_principal, parent)) = queue.pop() {
            if self.drg.contains(&node) && !self.aaa.contains(&node) {
                continue;
            }
            let operator_changed = match trace.node(node) {
                Node::Lookup { .. } => true,
                Node::Request { operator, .. } | Node::Output { operator, .. } => {
                    self.drg.contains(operator)
                }
                Node::Constant => false,
            };
            if operator_changed || self.aaa.contains(&node) {
                self.add_resampling(trace, &mut queue, node, i);
                continue;
            }
            let psp = trace.psp_at(node);
            if !is_principal && psp.can_absorb(trace, node, parent) {
                self.add_absorbing(node, i);
            } else if psp.children_can_aaa() {
                self.add_aaa(node, i);
            } else {
                self.add_resampling(trace, &mut queue, node, i);
            }
        }
    }
}

#[derive(Default)]
struct BrushFinder {
    disable_counts: FxHashMap<NodeId, u32>,
    disabled_requests: BTreeSet<NodeId>,
    brush: BTreeSet<NodeId>,
}

impl BrushFinder {
    fn disable_requests(&mut self, trace: &Trace, request: NodeId) {
        if !self.disabled_requests.insert(request) {
            return;
        }
        let output = trace.output_node(request);
        for &esr_parent in trace.esr_parents(output) {
            let count = self.disable_counts.entry(esr_parent).or_insert(0);
            *count += 1;
            if *count == trace.num_requests(esr_parent) {
                self.disable_family(trace, esr_parent);
            }
        }
    }

    fn disable_family(&mut self, trace: &Trace, node: NodeId) {
        if !self.brush.insert(node) {
            return;
        }
        if let Node::Output { operator, operands, request } = trace.node(node) {
            self.brush.insert(*request);
            self.disable_requests(trace, *request);
            self.disable_family(trace, *operator);
            for &operand in operands {
                self.disable_family(trace, operand);
            }
        }
    }
}

/// Build the scaffold for resampling the given principal sets, in order.
pub fn construct_scaffold(trace: &Trace, sets: &[BTreeSet<NodeId>]) -> Scaffold {
    let mut candidates = Candidates::default();
    for (i, pnodes) in sets.iter().enumerate() {
        candidates.extend(trace, pnodes, i);
    }

    let mut finder = BrushFinder::default();
    for &node in &candidates.drg {
        if matches!(trace.node(node), Node::Request { .. }) {
            finder.disable_requests(trace, node);
        }
    }
    let brush = finder.brush;

    let drg: BTreeSet<NodeId> = candidates.drg.difference(&brush).copied().collect();
    let absorbing: BTreeSet<NodeId> = candidates.absorbing.difference(&brush).copied().collect();
    let aaa: BTreeSet<NodeId> = candidates.aaa.difference(&brush).copied().collect();

    let mut border_set: BTreeSet<NodeId> = absorbing.union(&aaa).copied().collect();
    for &node in &drg {
        let has_child_in_scaffold = trace
            .children(node)
            .iter()
            .any(|c| drg.contains(c) || absorbing.contains(c));
        if !has_child_in_scaffold {
            border_set.insert(node);
        }
    }

    let mut counts: BTreeMap<NodeId, u32> = BTreeMap::new();
    for &node in &drg {
        let count = if aaa.contains(&node) {
            1
        } else if border_set.contains(&node) {
            trace.children(node).len() as u32 + 1
        } else {
            trace.children(node).len() as u32
        };
        counts.insert(node, count);
    }
    if !aaa.is_empty() {
        let mut bump = |value: Option<&Value>| {
            if let Some(Value::Procedure(maker)) = value {
                if aaa.contains(maker) {
                    *counts.get_mut(maker).unwrap_or_else(|| panic!("AAA maker {} not in DRG", maker.0)) += 1;
                }
            }
        };
        for &node in drg.iter().chain(absorbing.iter()) {
            for parent in trace.parents(node) {
                bump(trace.try_value(parent));
            }
        }
        for &node in &brush {
            match trace.node(node) {
                Node::Output { .. } => {
                    for &esr_parent in trace.esr_parents(node) {
                        bump(trace.try_value(esr_parent));
                    }
                }
                Node::Lookup { source } => bump(trace.try_value(*source)),
                _ => {}
            }
        }
    }

    let mut lkernels: FxHashMap<NodeId, Arc<dyn LKernel>> = FxHashMap::default();
    for &node in &aaa {
        if let Some(kernel) = trace.psp_at(node).aaa_kernel() {
            lkernels.insert(node, kernel);
        }
    }

    let mut border = vec![Vec::new(); sets.len().max(1)];
    for &node in &border_set {
        let i = candidates.index.get(&node).copied().unwrap_or(0);
        border[i].push(node);
    }

    let mut entries = BTreeMap::new();
    for (node, regen_count) in counts {
        entries.insert(node, DrgEntry { regen_count, resampled: true });
    }
    for &node in &absorbing {
        entries.insert(node, DrgEntry { regen_count: 0, resampled: false });
    }

    debug!(
        principal = sets.iter().map(BTreeSet::len).sum::<usize>(),
        resampled = drg.len(),
        absorbing = absorbing.len(),
        aaa = aaa.len(),
        brush = brush.len(),
        border = border_set.len(),
        "scaffold constructed"
    );

    Scaffold {
        principal: sets.to_vec(),
        drg: entries,
        aaa,
        brush,
        border,
        lkernels,
    }
}
