//! # Trace - Execution Graph of a Probabilistic Program
//!
//! The trace owns every node of one program execution together with the
//! bookkeeping inference needs: values, ESR edges and request counts, the
//! procedures made at maker nodes, the sets of constrained and unconstrained
//! random choices, scope/block indices and the directive registry.
//!
//! All mutation is explicit. Breaking a structural invariant (reading an
//! inactive value, adding a child twice, underflowing a request count) is a
//! contract violation and panics.

use crate::arena::{Graph, Node, NodeId, Operands};
use crate::error::{Result, TraceError};
use crate::psp::{Args, Psp, Sp, SpAux, SpRecord};
use crate::scope::{default_scope, BlockId, ScopeIndex};
use crate::value::Value;
use rand::RngCore;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

pub type DirectiveId = u64;

#[derive(Clone, Debug, Default)]
pub struct Trace {
    graph: Graph,
    unconstrained_choices: BTreeSet<NodeId>,
    constrained_choices: BTreeSet<NodeId>,
    ae_kernels: BTreeSet<NodeId>,
    /// Top-level directive -> root node of its family.
    families: FxHashMap<DirectiveId, NodeId>,
    /// Observation roots -> observed value.
    observations: FxHashMap<NodeId, Value>,
    scopes: ScopeIndex,
    /// Statistics of AAA makers, held while the maker is detached.
    aaa_aux: FxHashMap<NodeId, SpAux>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /* Primitive getters */

    pub fn node(&self, id: NodeId) -> &Node {
        self.graph.get(id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.graph.contains(id)
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.graph.slot(id).value.is_some()
    }

    pub fn value(&self, id: NodeId) -> &Value {
        self.graph
            .slot(id)
            .value
            .as_ref()
            .unwrap_or_else(|| panic!("value of inactive {} node {}", self.node(id).kind(), id.0))
    }

    pub fn try_value(&self, id: NodeId) -> Option<&Value> {
        self.graph.slot(id).value.as_ref()
    }

    pub fn children(&self, id: NodeId) -> &BTreeSet<NodeId> {
        &self.graph.slot(id).children
    }

    pub fn esr_parents(&self, id: NodeId) -> &[NodeId] {
        &self.graph.slot(id).esr_parents
    }

    pub fn num_requests(&self, id: NodeId) -> u32 {
        self.graph.slot(id).num_requests
    }

    pub fn definite_parents(&self, id: NodeId) -> SmallVec<[NodeId; 6]> {
        self.node(id).definite_parents()
    }

    pub fn parents(&self, id: NodeId) -> SmallVec<[NodeId; 6]> {
        let mut ps = self.definite_parents(id);
        ps.extend(self.esr_parents(id).iter().copied());
        ps
    }

    pub fn request_node(&self, output: NodeId) -> NodeId {
        match self.node(output) {
            Node::Output { request, .. } => *request,
            other => panic!("request node of {} node {}", other.kind(), output.0),
        }
    }

    pub fn output_node(&self, request: NodeId) -> NodeId {
        match self.node(request) {
            Node::Request { output, .. } => *output,
            other => panic!("output node of {} node {}", other.kind(), request.0),
        }
    }

    pub fn operator_node(&self, app: NodeId) -> NodeId {
        match self.node(app) {
            Node::Request { operator, .. } | Node::Output { operator, .. } => *operator,
            other => panic!("operator of {} node {}", other.kind(), app.0),
        }
    }

    pub fn operand_nodes(&self, app: NodeId) -> &Operands {
        match self.node(app) {
            Node::Request { operands, .. } | Node::Output { operands, .. } => operands,
            other => panic!("operands of {} node {}", other.kind(), app.0),
        }
    }

    /// Maker node of the procedure applied at `app`.
    pub fn operator_maker(&self, app: NodeId) -> Result<NodeId> {
        let value = self.value(self.operator_node(app));
        value
            .as_procedure()
            .ok_or_else(|| TraceError::NotAProcedure(value.clone()))
    }

    /// `operator_maker` for applications that have already been applied.
    pub fn maker_at(&self, app: NodeId) -> NodeId {
        self.operator_maker(app)
            .unwrap_or_else(|e| panic!("no procedure at node {}: {e}", app.0))
    }

    /// The value a PSP produced at `node`: a maker node reports its procedure
    /// itself rather than the reference to it.
    pub fn ground_value(&self, node: NodeId) -> Value {
        match self.value(node) {
            Value::Procedure(maker) if *maker == node => {
                Value::Sp(self.made_sp_record(node).sp.clone())
            }
            other => other.clone(),
        }
    }

    pub fn made_sp_record(&self, maker: NodeId) -> &SpRecord {
        self.graph
            .slot(maker)
            .made_sp
            .as_ref()
            .unwrap_or_else(|| panic!("node {} has no made procedure", maker.0))
    }

    pub fn try_made_sp_record(&self, maker: NodeId) -> Option<&SpRecord> {
        self.graph.slot(maker).made_sp.as_ref()
    }

    pub fn made_sp_record_mut(&mut self, maker: NodeId) -> &mut SpRecord {
        self.graph
            .slot_mut(maker)
            .made_sp
            .as_mut()
            .unwrap_or_else(|| panic!("node {} has no made procedure", maker.0))
    }

    /// The procedure applied at `app`.
    pub fn sp_at(&self, app: NodeId) -> Result<Arc<Sp>> {
        let maker = self.operator_maker(app)?;
        Ok(self.made_sp_record(maker).sp.clone())
    }

    pub fn try_psp_at(&self, app: NodeId) -> Result<Arc<dyn Psp>> {
        let sp = self.sp_at(app)?;
        Ok(match self.node(app) {
            Node::Request { .. } => sp.request.clone(),
            _ => sp.output.clone(),
        })
    }

    /// PSP of an application whose operator is known to be a procedure.
    pub fn psp_at(&self, app: NodeId) -> Arc<dyn Psp> {
        self.try_psp_at(app)
            .unwrap_or_else(|e| panic!("no procedure at node {}: {e}", app.0))
    }

    /// Sufficient statistics of the procedure applied at `app`.
    pub fn aux_at(&self, app: NodeId) -> &SpAux {
        &self.made_sp_record(self.maker_at(app)).aux
    }

    pub fn aux_at_mut(&mut self, app: NodeId) -> &mut SpAux {
        let maker = self.maker_at(app);
        &mut self.made_sp_record_mut(maker).aux
    }

    pub fn aaa_aux(&self, maker: NodeId) -> Option<&SpAux> {
        self.aaa_aux.get(&maker)
    }

    pub fn args_at(&self, app: NodeId) -> Args {
        let (operand_nodes, request) = match self.node(app) {
            Node::Request { operands, .. } => (operands.clone(), None),
            Node::Output { operands, request, .. } => (operands.clone(), Some(*request)),
            other => panic!("args of {} node {}", other.kind(), app.0),
        };
        let operands = operand_nodes.iter().map(|&n| self.value(n).clone()).collect();
        let request = request.map(|r| match self.value(r) {
            Value::Request(req) => req.clone(),
            other => panic!("request node {} holds {other}", r.0),
        });
        let esr_nodes: SmallVec<[NodeId; 2]> = self.esr_parents(app).iter().copied().collect();
        let esr_values = esr_nodes.iter().map(|&n| self.value(n).clone()).collect();
        Args {
            node: app,
            operand_nodes,
            operands,
            request,
            esr_nodes,
            esr_values,
        }
    }

    /* Primitive setters */

    pub fn set_value(&mut self, id: NodeId, value: Value) {
        self.graph.slot_mut(id).value = Some(value);
    }

    pub fn clear_value(&mut self, id: NodeId) -> Value {
        self.graph
            .slot_mut(id)
            .value
            .take()
            .unwrap_or_else(|| panic!("clearing value of inactive node {}", id.0))
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        let inserted = self.graph.slot_mut(parent).children.insert(child);
        assert!(inserted, "node {} is already a child of {}", child.0, parent.0);
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        let removed = self.graph.slot_mut(parent).children.remove(&child);
        assert!(removed, "node {} is not a child of {}", child.0, parent.0);
    }

    pub fn inc_num_requests(&mut self, id: NodeId) {
        self.graph.slot_mut(id).num_requests += 1;
    }

    pub fn dec_num_requests(&mut self, id: NodeId) {
        let slot = self.graph.slot_mut(id);
        assert!(slot.num_requests > 0, "request count underflow at node {}", id.0);
        slot.num_requests -= 1;
    }

    pub fn add_esr_edge(&mut self, esr_parent: NodeId, output: NodeId) {
        self.graph.slot_mut(output).esr_parents.push(esr_parent);
        self.add_child(esr_parent, output);
        self.inc_num_requests(esr_parent);
    }

    /// Sever the most recently added ESR edge of `output`.
    pub fn pop_last_esr_parent(&mut self, output: NodeId) -> NodeId {
        let esr_parent = self
            .graph
            .slot_mut(output)
            .esr_parents
            .pop()
            .unwrap_or_else(|| panic!("node {} has no ESR parents to pop", output.0));
        self.remove_child(esr_parent, output);
        self.dec_num_requests(esr_parent);
        esr_parent
    }

    pub fn disconnect_lookup(&mut self, lookup: NodeId) {
        let source = self.lookup_source(lookup);
        self.remove_child(source, lookup);
    }

    pub fn reconnect_lookup(&mut self, lookup: NodeId) {
        let source = self.lookup_source(lookup);
        self.add_child(source, lookup);
    }

    fn lookup_source(&self, lookup: NodeId) -> NodeId {
        match self.node(lookup) {
            Node::Lookup { source } => *source,
            other => panic!("lookup source of {} node {}", other.kind(), lookup.0),
        }
    }

    /* Node construction */

    pub fn create_constant_node(&mut self, value: Value) -> NodeId {
        let id = self.graph.add(Node::Constant);
        let is_sp = matches!(value, Value::Sp(_));
        self.set_value(id, value);
        if is_sp {
            self.process_made_sp(id, false);
        }
        id
    }

    pub fn create_lookup_node(&mut self, source: NodeId) -> NodeId {
        let id = self.graph.add(Node::Lookup { source });
        self.add_child(source, id);
        let value = self.value(source).clone();
        self.set_value(id, value);
        id
    }

    /// Create the request/output pair of an application. Both start inactive.
    pub fn create_application_nodes(
        &mut self,
        operator: NodeId,
        operands: Operands,
    ) -> (NodeId, NodeId) {
        let request = self.graph.add(Node::Request {
            operator,
            operands: operands.clone(),
            output: NodeId::NULL,
        });
        let output = self.graph.add(Node::Output {
            operator,
            operands: operands.clone(),
            request,
        });
        if let Node::Request { output: slot, .. } = &mut self.graph.slot_mut(request).node {
            *slot = output;
        }
        self.add_child(operator, request);
        self.add_child(operator, output);
        for &operand in &operands {
            self.add_child(operand, request);
            self.add_child(operand, output);
        }
        self.add_child(request, output);
        trace!(request = request.0, output = output.0, "application created");
        (request, output)
    }

    /// Release every node of a fully unevaluated family back to the arena.
    pub fn free_family(&mut self, root: NodeId) {
        match self.node(root).clone() {
            Node::Constant => {
                if let Some(Value::Procedure(maker)) = self.try_value(root) {
                    if *maker == root {
                        self.teardown_made_sp(root, false);
                    }
                }
                self.graph.free(root);
            }
            Node::Lookup { .. } => self.graph.free(root),
            Node::Output { operator, operands, request } => {
                for &operand in &operands {
                    self.remove_child(operand, request);
                    self.remove_child(operand, root);
                }
                self.remove_child(operator, request);
                self.remove_child(operator, root);
                self.remove_child(request, root);
                self.graph.free(root);
                self.graph.free(request);
                for &operand in operands.iter().rev() {
                    self.free_family(operand);
                }
                self.free_family(operator);
            }
            Node::Request { .. } => panic!("family root {} is a request node", root.0),
        }
    }

    /* Made procedures */

    /// Record the procedure just simulated at `node` and replace the node's
    /// value by a reference to it.
    pub fn process_made_sp(&mut self, node: NodeId, is_aaa: bool) {
        let sp = match self.value(node) {
            Value::Sp(sp) => sp.clone(),
            other => panic!("node {} made {other}, not a procedure", node.0),
        };
        let aux = if is_aaa {
            self.aaa_aux.remove(&node).unwrap_or_default()
        } else {
            SpAux::default()
        };
        let has_ae_kernel = sp.output.has_ae_kernel();
        self.graph.slot_mut(node).made_sp = Some(SpRecord::new(sp, aux));
        if has_ae_kernel {
            self.register_ae_kernel(node);
        }
        self.set_value(node, Value::Procedure(node));
    }

    /// Inverse of `process_made_sp`. AAA makers keep their statistics aside
    /// until the maker is regenerated.
    pub fn teardown_made_sp(&mut self, node: NodeId, is_aaa: bool) {
        let record = self
            .graph
            .slot_mut(node)
            .made_sp
            .take()
            .unwrap_or_else(|| panic!("tearing down node {} without a made procedure", node.0));
        assert!(
            record.families.is_empty(),
            "tearing down procedure at node {} with {} live families",
            node.0,
            record.families.len()
        );
        if record.sp.output.has_ae_kernel() {
            self.unregister_ae_kernel(node);
        }
        if is_aaa {
            self.aaa_aux.insert(node, record.aux);
        }
        self.set_value(node, Value::Sp(record.sp));
    }

    /* SP families */

    pub fn contains_family_at(&self, request: NodeId, id: &Value) -> Result<bool> {
        let maker = self.operator_maker(request)?;
        Ok(self.made_sp_record(maker).families.contains_key(id))
    }

    pub fn family_at(&self, request: NodeId, id: &Value) -> NodeId {
        let maker = self.maker_at(request);
        *self
            .made_sp_record(maker)
            .families
            .get(id)
            .unwrap_or_else(|| panic!("no family {id} at node {}", request.0))
    }

    pub fn register_family_at(&mut self, request: NodeId, id: Value, root: NodeId) -> Result<()> {
        let maker = self.operator_maker(request)?;
        let prev = self.made_sp_record_mut(maker).families.insert(id.clone(), root);
        assert!(prev.is_none(), "family {id} registered twice at maker {}", maker.0);
        Ok(())
    }

    pub fn unregister_family_at(&mut self, request: NodeId, id: &Value) -> NodeId {
        let maker = self.maker_at(request);
        self.made_sp_record_mut(maker)
            .families
            .remove(id)
            .unwrap_or_else(|| panic!("unregistering absent family {id} at maker {}", maker.0))
    }

    /* Registering metadata */

    pub fn register_ae_kernel(&mut self, node: NodeId) {
        assert!(self.ae_kernels.insert(node), "AE kernel registered twice at {}", node.0);
    }

    pub fn unregister_ae_kernel(&mut self, node: NodeId) {
        assert!(self.ae_kernels.remove(&node), "AE kernel not registered at {}", node.0);
    }

    pub fn register_unconstrained_choice(&mut self, node: NodeId) {
        assert!(
            self.unconstrained_choices.insert(node),
            "random choice {} registered twice",
            node.0
        );
        self.scopes.register(default_scope(), BlockId::Node(node), node);
    }

    pub fn unregister_unconstrained_choice(&mut self, node: NodeId) {
        assert!(
            self.unconstrained_choices.remove(&node),
            "random choice {} not registered",
            node.0
        );
        self.scopes.unregister(&default_scope(), &BlockId::Node(node), node);
    }

    pub fn register_constrained_choice(&mut self, node: NodeId) {
        assert!(
            self.constrained_choices.insert(node),
            "constrained choice {} registered twice",
            node.0
        );
    }

    pub fn unregister_constrained_choice(&mut self, node: NodeId) {
        assert!(
            self.constrained_choices.remove(&node),
            "constrained choice {} not registered",
            node.0
        );
    }

    pub fn register_choice_in_scope(&mut self, scope: Value, block: BlockId, node: NodeId) {
        self.scopes.register(scope, block, node);
    }

    pub fn unregister_choice_in_scope(&mut self, scope: &Value, block: &BlockId, node: NodeId) {
        self.scopes.unregister(scope, block, node);
    }

    pub fn unconstrained_choices(&self) -> &BTreeSet<NodeId> {
        &self.unconstrained_choices
    }

    pub fn constrained_choices(&self) -> &BTreeSet<NodeId> {
        &self.constrained_choices
    }

    pub fn ae_kernels(&self) -> &BTreeSet<NodeId> {
        &self.ae_kernels
    }

    pub fn num_unconstrained_choices(&self) -> usize {
        self.unconstrained_choices.len()
    }

    pub fn is_constrained(&self, node: NodeId) -> bool {
        self.constrained_choices.contains(&node)
    }

    /* Directives and observations */

    pub fn directive_root(&self, id: DirectiveId) -> Result<NodeId> {
        self.families
            .get(&id)
            .copied()
            .ok_or(TraceError::UnknownDirective(id))
    }

    pub fn directives(&self) -> impl Iterator<Item = (DirectiveId, NodeId)> + '_ {
        self.families.iter().map(|(&id, &root)| (id, root))
    }

    pub(crate) fn insert_directive(&mut self, id: DirectiveId, root: NodeId) -> Result<()> {
        if self.families.contains_key(&id) {
            return Err(TraceError::DuplicateDirective(id));
        }
        self.families.insert(id, root);
        Ok(())
    }

    pub(crate) fn remove_directive(&mut self, id: DirectiveId) -> Result<NodeId> {
        self.families.remove(&id).ok_or(TraceError::UnknownDirective(id))
    }

    pub fn is_observation(&self, node: NodeId) -> bool {
        self.observations.contains_key(&node)
    }

    pub fn observed_value(&self, node: NodeId) -> Option<&Value> {
        self.observations.get(&node)
    }

    pub(crate) fn set_observation(&mut self, node: NodeId, value: Value) {
        self.observations.insert(node, value);
    }

    pub(crate) fn clear_observation(&mut self, node: NodeId) -> Option<Value> {
        self.observations.remove(&node)
    }

    /// The application node whose value an observation of `node` pins down,
    /// looking through lookups and ESR references.
    pub fn constrainable_node(&self, node: NodeId) -> Result<NodeId> {
        match self.node(node) {
            Node::Lookup { source } => self.constrainable_node(*source),
            Node::Output { .. } => {
                let psp = self.try_psp_at(node)?;
                if psp.is_esr_reference() {
                    match self.esr_parents(node).first() {
                        Some(&parent) => self.constrainable_node(parent),
                        None => Err(TraceError::ConstrainDeterministic),
                    }
                } else if psp.is_random() {
                    Ok(node)
                } else {
                    Err(TraceError::ConstrainDeterministic)
                }
            }
            _ => Err(TraceError::ConstrainDeterministic),
        }
    }

    /* Scopes and blocks */

    pub fn sample_block(&self, scope: &Value, rng: &mut dyn RngCore) -> Result<BlockId> {
        self.scopes
            .blocks(scope)
            .and_then(|blocks| blocks.sample_key(rng))
            .cloned()
            .ok_or_else(|| TraceError::EmptyScope(scope.clone()))
    }

    /// Log probability of the block `sample_block` just picked.
    pub fn log_density_of_block(&self, scope: &Value) -> f64 {
        -(self.num_blocks_in_scope(scope) as f64).ln()
    }

    pub fn blocks_in_scope(&self, scope: &Value) -> Vec<BlockId> {
        self.scopes
            .blocks(scope)
            .map(|blocks| blocks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_blocks_in_scope(&self, scope: &Value) -> usize {
        self.scopes.num_blocks(scope)
    }

    pub fn all_nodes_in_scope(&self, scope: &Value) -> BTreeSet<NodeId> {
        let mut all = BTreeSet::new();
        for block in self.blocks_in_scope(scope) {
            all.extend(self.nodes_in_block(scope, &block));
        }
        all
    }

    pub fn ordered_sets_in_scope(&self, scope: &Value) -> Vec<BTreeSet<NodeId>> {
        self.scopes
            .blocks(scope)
            .map(|blocks| {
                blocks
                    .ordered_keys()
                    .iter()
                    .map(|block| self.nodes_in_block(scope, block))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Principal nodes of a block. Default-scope blocks hold the choices
    /// themselves; tagged blocks hold roots whose unconstrained random
    /// choices are collected dynamically.
    pub fn nodes_in_block(&self, scope: &Value, block: &BlockId) -> BTreeSet<NodeId> {
        let registered = self.scopes.registered(scope, block);
        if *scope == default_scope() {
            return registered;
        }
        let mut pnodes = BTreeSet::new();
        for node in registered {
            self.add_random_choices_in_block(scope, block, &mut pnodes, node);
        }
        pnodes
    }

    fn add_random_choices_in_block(
        &self,
        scope: &Value,
        block: &BlockId,
        pnodes: &mut BTreeSet<NodeId>,
        node: NodeId,
    ) {
        let Node::Output { operator, operands, request } = self.node(node) else {
            return;
        };
        let psp = self.psp_at(node);
        if psp.is_random() && !self.is_constrained(node) {
            pnodes.insert(node);
        }
        if self.psp_at(*request).is_random() {
            pnodes.insert(*request);
        }
        for &esr_parent in self.esr_parents(node) {
            self.add_random_choices_in_block(scope, block, pnodes, esr_parent);
        }
        self.add_random_choices_in_block(scope, block, pnodes, *operator);
        for (i, &operand) in operands.iter().enumerate() {
            if i == 2 && psp.is_scope_tag() {
                let inner_scope = self.value(operands[0]);
                let inner_block = BlockId::Named(self.value(operands[1]).clone());
                if inner_scope != scope || inner_block == *block {
                    self.add_random_choices_in_block(scope, block, pnodes, operand);
                }
            } else {
                self.add_random_choices_in_block(scope, block, pnodes, operand);
            }
        }
    }

    pub fn scope_has_entropy(&self, scope: &Value) -> bool {
        self.blocks_in_scope(scope)
            .iter()
            .any(|block| !self.nodes_in_block(scope, block).is_empty())
    }

    /// Log joint density of every random choice currently in the trace.
    ///
    /// Choices are peeled off one at a time, each scored against statistics
    /// that no longer include it, so exchangeable applications contribute
    /// their chain-rule joint rather than a product of full conditionals.
    pub fn global_log_score(&self) -> f64 {
        let mut scratch: FxHashMap<NodeId, SpAux> = FxHashMap::default();
        let mut total = 0.0;
        for &node in self
            .unconstrained_choices
            .iter()
            .chain(self.constrained_choices.iter())
        {
            let psp = self.psp_at(node);
            let args = self.args_at(node);
            let aux = scratch
                .entry(self.maker_at(node))
                .or_insert_with(|| self.aux_at(node).clone());
            let value = self.value(node);
            psp.unincorporate(value, &args, aux);
            total += psp.log_density(value, &args, aux);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esr_edges_follow_stack_discipline() {
        let mut t = Trace::new();
        let a = t.create_constant_node(Value::Number(1.0));
        let b = t.create_constant_node(Value::Number(2.0));
        let out = t.create_constant_node(Value::Nil);
        t.add_esr_edge(a, out);
        t.add_esr_edge(b, out);
        assert_eq!(t.esr_parents(out), &[a, b]);
        assert_eq!(t.num_requests(a), 1);
        assert!(t.children(b).contains(&out));

        assert_eq!(t.pop_last_esr_parent(out), b);
        assert_eq!(t.num_requests(b), 0);
        assert!(!t.children(b).contains(&out));
        assert_eq!(t.pop_last_esr_parent(out), a);
        assert!(t.esr_parents(out).is_empty());
    }

    #[test]
    fn test_lookup_aliases_source() {
        let mut t = Trace::new();
        let a = t.create_constant_node(Value::Number(4.0));
        let l = t.create_lookup_node(a);
        assert_eq!(t.value(l), &Value::Number(4.0));
        assert!(t.children(a).contains(&l));
        t.disconnect_lookup(l);
        assert!(t.children(a).is_empty());
        t.reconnect_lookup(l);
        assert!(t.children(a).contains(&l));
    }

    #[test]
    #[should_panic(expected = "is not a child")]
    fn test_removing_missing_child_is_fatal() {
        let mut t = Trace::new();
        let a = t.create_constant_node(Value::Nil);
        let b = t.create_constant_node(Value::Nil);
        t.remove_child(a, b);
    }

    #[test]
    #[should_panic(expected = "request count underflow")]
    fn test_request_underflow_is_fatal() {
        let mut t = Trace::new();
        let a = t.create_constant_node(Value::Nil);
        t.dec_num_requests(a);
    }

    #[test]
    #[should_panic(expected = "value of inactive")]
    fn test_inactive_value_is_fatal() {
        let mut t = Trace::new();
        let a = t.create_constant_node(Value::Nil);
        t.clear_value(a);
        t.value(a);
    }
}
