//! Detach: tear a scaffold down children-first.
//!
//! Absorbing nodes are unincorporated in place; resampled nodes are unapplied
//! once every scaffold dependent has released them (regen count reaches 0);
//! families whose last request disappears are unevaluated and parked in the
//! omega DB.

use super::{Density, OmegaDb};
use crate::arena::{Node, NodeId};
use crate::scaffold::Scaffold;
use crate::scope::BlockId;
use crate::trace::Trace;
use crate::value::Value;
use smallvec::SmallVec;
use tracing::debug;

pub fn detach_and_extract(trace: &mut Trace, scaffold: &mut Scaffold) -> (Density, OmegaDb) {
    let border: Vec<NodeId> = scaffold.border().iter().flatten().copied().collect();
    detach_border(trace, scaffold, &border)
}

/// Detach only the border of principal set `t`. Later sets must already be
/// detached.
pub fn detach_and_extract_set(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    t: usize,
) -> (Density, OmegaDb) {
    let border = scaffold.border()[t].clone();
    detach_border(trace, scaffold, &border)
}

fn detach_border(trace: &mut Trace, scaffold: &mut Scaffold, border: &[NodeId]) -> (Density, OmegaDb) {
    let mut omega = OmegaDb::new();
    let mut density = Density::default();
    for &node in border.iter().rev() {
        detach_border_node(trace, scaffold, node, &mut omega, &mut density);
    }
    debug!(
        absorbed = density.absorbed,
        resampled = density.resampled,
        families = omega.num_families(),
        "detach complete"
    );
    (density, omega)
}

pub(crate) fn detach_border_node(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    if scaffold.is_absorbing(node) {
        detach(trace, scaffold, node, omega, density);
    } else {
        if trace.is_observation(node) {
            let app = trace
                .constrainable_node(node)
                .unwrap_or_else(|e| panic!("observation {} lost its constrained node: {e}", node.0));
            density.absorbed += unconstrain(trace, app);
        }
        extract(trace, scaffold, node, omega, density);
    }
}

/// Rescore an absorbing node against its current parents and release them.
fn detach(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    let psp = trace.psp_at(node);
    let args = trace.args_at(node);
    let value = trace.ground_value(node);
    psp.unincorporate(&value, &args, trace.aux_at_mut(node));
    density.absorbed += psp.log_density(&value, &args, trace.aux_at(node));
    extract_parents(trace, scaffold, node, omega, density);
}

/// Turn a constrained choice back into an unconstrained one, returning the
/// log density of the value it keeps.
pub fn unconstrain(trace: &mut Trace, app: NodeId) -> f64 {
    let psp = trace.psp_at(app);
    let args = trace.args_at(app);
    let value = trace.value(app).clone();
    trace.unregister_constrained_choice(app);
    trace.register_unconstrained_choice(app);
    psp.unincorporate(&value, &args, trace.aux_at_mut(app));
    let weight = psp.log_density(&value, &args, trace.aux_at(app));
    psp.incorporate(&value, &args, trace.aux_at_mut(app));
    weight
}

pub(crate) fn aaa_maker_of(trace: &Trace, scaffold: &Scaffold, node: NodeId) -> Option<NodeId> {
    match trace.try_value(node) {
        Some(Value::Procedure(maker)) if *maker != node && scaffold.is_aaa(*maker) => Some(*maker),
        _ => None,
    }
}

pub(crate) fn extract(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    if let Some(maker) = aaa_maker_of(trace, scaffold, node) {
        extract(trace, scaffold, maker, omega, density);
    }
    extract_own(trace, scaffold, node, omega, density);
}

/// `extract` without the detour through an AAA maker.
pub(crate) fn extract_own(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    if !scaffold.is_resampling(node) {
        return;
    }
    scaffold.decrement_regen_count(node);
    if scaffold.regen_count(node) > 0 {
        return;
    }
    match trace.node(node) {
        Node::Lookup { .. } => {
            trace.clear_value(node);
        }
        Node::Request { .. } => {
            uneval_requests(trace, scaffold, node, omega, density, false);
            unapply_psp(trace, scaffold, node, omega, density);
        }
        Node::Output { .. } => unapply_psp(trace, scaffold, node, omega, density),
        Node::Constant => {}
    }
    extract_parents(trace, scaffold, node, omega, density);
}

pub(crate) fn extract_parents(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    let esr_parents: SmallVec<[NodeId; 2]> = trace.esr_parents(node).iter().copied().collect();
    let definite = trace.definite_parents(node);
    for &parent in esr_parents.iter().rev() {
        extract(trace, scaffold, parent, omega, density);
    }
    for &parent in definite.iter().rev() {
        extract(trace, scaffold, parent, omega, density);
    }
}

pub(crate) fn unapply_psp(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    let psp = trace.psp_at(node);
    let args = trace.args_at(node);
    if psp.is_scope_tag() {
        let block = BlockId::Named(args.operands[1].clone());
        trace.unregister_choice_in_scope(&args.operands[0], &block, args.operand_nodes[2]);
    }
    if psp.is_random() {
        trace.unregister_unconstrained_choice(node);
    }
    if matches!(trace.value(node), Value::Procedure(maker) if *maker == node) {
        trace.teardown_made_sp(node, scaffold.is_aaa(node));
    }
    let value = trace.value(node).clone();
    psp.unincorporate(&value, &args, trace.aux_at_mut(node));
    if psp.is_random() {
        density.resampled += psp.log_density(&value, &args, trace.aux_at(node));
    }
    if let Some(kernel) = scaffold.lkernel(node).cloned() {
        density.absorbed += kernel.reverse_weight(trace, &value, &args);
    }
    let value = trace.clear_value(node);
    omega.extract_value(node, value);
}

/// Release every ESR of `request`. With `touch_shared`, families that stay
/// alive are extracted too; a resampled request leaves that to its output.
pub(crate) fn uneval_requests(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    request: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
    touch_shared: bool,
) {
    let n = match trace.value(request) {
        Value::Request(req) => req.esrs.len(),
        other => panic!("request node {} holds {other}", request.0),
    };
    uneval_esrs(trace, scaffold, request, n, omega, density, touch_shared);
}

/// Release the first `n` ESRs of `request`, last first.
pub(crate) fn uneval_esrs(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    request: NodeId,
    n: usize,
    omega: &mut OmegaDb,
    density: &mut Density,
    touch_shared: bool,
) {
    let req = match trace.value(request) {
        Value::Request(req) => req.clone(),
        other => panic!("request node {} holds {other}", request.0),
    };
    let output = trace.output_node(request);
    for esr in req.esrs[..n].iter().rev() {
        let esr_parent = trace.pop_last_esr_parent(output);
        if trace.num_requests(esr_parent) == 0 {
            let root = trace.unregister_family_at(request, &esr.id);
            assert_eq!(root, esr_parent, "family {} is not rooted at its ESR parent", esr.id);
            omega.register_family(trace.maker_at(request), esr.id.clone(), esr_parent);
            uneval_family(trace, scaffold, esr_parent, omega, density);
        } else if touch_shared {
            extract(trace, scaffold, esr_parent, omega, density);
        }
    }
}

/// Deactivate a whole family bottom-up. Nodes stay allocated so a restoring
/// regen can bring the family back.
pub(crate) fn uneval_family(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    root: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    match trace.node(root).clone() {
        Node::Constant => {}
        Node::Lookup { .. } => {
            trace.disconnect_lookup(root);
            trace.clear_value(root);
            extract_parents(trace, scaffold, root, omega, density);
        }
        Node::Output { operator, operands, .. } => {
            unapply(trace, scaffold, root, omega, density);
            for &operand in operands.iter().rev() {
                uneval_family(trace, scaffold, operand, omega, density);
            }
            uneval_family(trace, scaffold, operator, omega, density);
        }
        Node::Request { .. } => panic!("family root {} is a request node", root.0),
    }
}

pub(crate) fn unapply(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    output: NodeId,
    omega: &mut OmegaDb,
    density: &mut Density,
) {
    let request = trace.request_node(output);
    unapply_psp(trace, scaffold, output, omega, density);
    uneval_requests(trace, scaffold, request, omega, density, true);
    unapply_psp(trace, scaffold, request, omega, density);
}
