//! Regen: rebuild a detached scaffold parents-first.
//!
//! Every operation here is atomic: when it returns `Err` it has already
//! undone its own partial effects, so a failed regen leaves the trace exactly
//! as detach left it. The undo path runs the detach operations into a scratch
//! omega DB and frees the families that this regen had created.

use super::detach::{
    aaa_maker_of, detach_border_node, extract, extract_own, uneval_esrs, uneval_family,
    uneval_requests, unapply_psp,
};
use super::{Density, OmegaDb};
use crate::arena::{Node, NodeId};
use crate::error::{Result, TraceError};
use crate::expr::Expr;
use crate::psp::Esr;
use crate::scaffold::Scaffold;
use crate::scope::BlockId;
use crate::trace::Trace;
use crate::value::Value;
use rand::RngCore;
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Where regenerated values come from.
#[derive(Clone, Copy, Debug)]
pub enum Mode<'a> {
    /// Simulate fresh values. Local kernels may consult the old values.
    Propose { old: &'a OmegaDb },
    /// Simulate fresh values with nothing to consult.
    Fresh,
    /// Replay the values and families a detach captured.
    Restore(&'a OmegaDb),
}

impl<'a> Mode<'a> {
    fn omega(&self) -> Option<&'a OmegaDb> {
        match *self {
            Mode::Propose { old } => Some(old),
            Mode::Restore(omega) => Some(omega),
            Mode::Fresh => None,
        }
    }

    pub fn is_restore(&self) -> bool {
        matches!(self, Mode::Restore(_))
    }
}

pub fn regen_and_attach(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
) -> Result<Density> {
    let border: Vec<NodeId> = scaffold.border().iter().flatten().copied().collect();
    regen_border(trace, scaffold, &border, mode, rng)
}

/// Regenerate only the border of principal set `t`. Earlier sets must already
/// be attached.
pub fn regen_and_attach_set(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    t: usize,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
) -> Result<Density> {
    let border = scaffold.border()[t].clone();
    regen_border(trace, scaffold, &border, mode, rng)
}

fn regen_border(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    border: &[NodeId],
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
) -> Result<Density> {
    let mut density = Density::default();
    for (i, &node) in border.iter().enumerate() {
        if let Err(e) = regen_border_node(trace, scaffold, node, mode, rng, &mut density) {
            undo(trace, scaffold, |trace, scaffold, omega, density| {
                for &done in border[..i].iter().rev() {
                    detach_border_node(trace, scaffold, done, omega, density);
                }
            });
            warn!(error = %e, node = node.0, "regen failed, scaffold rolled back");
            return Err(e);
        }
    }
    debug!(
        absorbed = density.absorbed,
        resampled = density.resampled,
        restore = mode.is_restore(),
        "regen complete"
    );
    Ok(density)
}

/// Run detach operations whose only purpose is undoing a partial regen.
fn undo<F>(trace: &mut Trace, scaffold: &mut Scaffold, f: F)
where
    F: FnOnce(&mut Trace, &mut Scaffold, &mut OmegaDb, &mut Density),
{
    let mut scratch = OmegaDb::new();
    let mut discarded = Density::default();
    f(trace, scaffold, &mut scratch, &mut discarded);
    scratch.reclaim(trace);
}

fn regen_border_node(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    if scaffold.is_absorbing(node) {
        return attach(trace, scaffold, node, mode, rng, density);
    }
    regen(trace, scaffold, node, mode, rng, density)?;
    if let Some(observed) = trace.observed_value(node).cloned() {
        let constrained = match trace.constrainable_node(node) {
            Ok(app) => constrain(trace, app, observed, rng, true),
            Err(e) => Err(e),
        };
        match constrained {
            Ok(weight) => density.absorbed += weight,
            Err(e) => {
                undo(trace, scaffold, |trace, scaffold, omega, density| {
                    extract(trace, scaffold, node, omega, density)
                });
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Rescore an absorbing node against its regenerated parents.
fn attach(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    regen_parents(trace, scaffold, node, mode, rng, density)?;
    let psp = trace.psp_at(node);
    let args = trace.args_at(node);
    let value = trace.ground_value(node);
    density.absorbed += psp.log_density(&value, &args, trace.aux_at(node));
    psp.incorporate(&value, &args, trace.aux_at_mut(node));
    Ok(())
}

pub(crate) fn regen(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    if scaffold.is_resampling(node) {
        if scaffold.regen_count(node) == 0 {
            regen_parents(trace, scaffold, node, mode, rng, density)?;
            if let Err(e) = regen_value(trace, scaffold, node, mode, rng, density) {
                undo(trace, scaffold, |trace, scaffold, omega, density| {
                    super::detach::extract_parents(trace, scaffold, node, omega, density)
                });
                return Err(e);
            }
        }
        scaffold.increment_regen_count(node);
    }
    if let Some(maker) = aaa_maker_of(trace, scaffold, node) {
        if let Err(e) = regen(trace, scaffold, maker, mode, rng, density) {
            undo(trace, scaffold, |trace, scaffold, omega, density| {
                extract_own(trace, scaffold, node, omega, density)
            });
            return Err(e);
        }
    }
    Ok(())
}

fn regen_value(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    match trace.node(node) {
        Node::Lookup { source } => {
            let value = trace.value(*source).clone();
            trace.set_value(node, value);
            Ok(())
        }
        Node::Request { .. } => {
            apply_psp(trace, scaffold, node, mode, rng, density)?;
            if let Err(e) = eval_requests(trace, scaffold, node, mode, rng, density, false) {
                undo(trace, scaffold, |trace, scaffold, omega, density| {
                    unapply_psp(trace, scaffold, node, omega, density)
                });
                return Err(e);
            }
            Ok(())
        }
        Node::Output { .. } => apply_psp(trace, scaffold, node, mode, rng, density),
        Node::Constant => Ok(()),
    }
}

fn regen_parents(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    let definite = trace.definite_parents(node);
    for (i, &parent) in definite.iter().enumerate() {
        if let Err(e) = regen(trace, scaffold, parent, mode, rng, density) {
            undo(trace, scaffold, |trace, scaffold, omega, density| {
                for &done in definite[..i].iter().rev() {
                    extract(trace, scaffold, done, omega, density);
                }
            });
            return Err(e);
        }
    }
    // Regenerating the request may have added ESR edges.
    let esr_parents: SmallVec<[NodeId; 2]> = trace.esr_parents(node).iter().copied().collect();
    for (i, &parent) in esr_parents.iter().enumerate() {
        if let Err(e) = regen(trace, scaffold, parent, mode, rng, density) {
            undo(trace, scaffold, |trace, scaffold, omega, density| {
                for &done in esr_parents[..i].iter().rev() {
                    extract(trace, scaffold, done, omega, density);
                }
                for &done in definite.iter().rev() {
                    extract(trace, scaffold, done, omega, density);
                }
            });
            return Err(e);
        }
    }
    Ok(())
}

/// Produce and record the value of an application node. Fails before
/// mutating anything.
fn apply_psp(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    node: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    let psp = trace.try_psp_at(node)?;
    let args = trace.args_at(node);
    let old = mode.omega().and_then(|omega| omega.value(node));
    let kernel = scaffold.lkernel(node).cloned();
    let value = if mode.is_restore() {
        old.cloned()
            .unwrap_or_else(|| panic!("no captured value to restore at node {}", node.0))
    } else if let Some(kernel) = &kernel {
        kernel.forward_simulate(trace, old, &args, rng)?
    } else {
        psp.simulate(&args, trace.aux_at(node), rng)?
    };
    // Restoring still owes the kernel's weight, or detach then restore would
    // not conserve density.
    if let Some(kernel) = &kernel {
        density.absorbed += kernel.forward_weight(trace, &value, old, &args);
    }

    if psp.is_random() {
        density.resampled += psp.log_density(&value, &args, trace.aux_at(node));
    }
    trace.set_value(node, value.clone());
    psp.incorporate(&value, &args, trace.aux_at_mut(node));
    if matches!(value, Value::Sp(_)) {
        trace.process_made_sp(node, scaffold.is_aaa(node));
    }
    if psp.is_random() {
        trace.register_unconstrained_choice(node);
    }
    if psp.is_scope_tag() {
        let block = BlockId::Named(args.operands[1].clone());
        trace.register_choice_in_scope(args.operands[0].clone(), block, args.operand_nodes[2]);
    }
    Ok(())
}

/// Satisfy every ESR of `request`. With `touch_shared`, families that
/// already exist are regenerated here; a resampled request leaves that to its
/// output's parents.
fn eval_requests(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    request: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
    touch_shared: bool,
) -> Result<()> {
    let req = match trace.value(request) {
        Value::Request(req) => req.clone(),
        other => panic!("request node {} holds {other}", request.0),
    };
    let output = trace.output_node(request);
    for (k, esr) in req.esrs.iter().enumerate() {
        if let Err(e) =
            eval_esr(trace, scaffold, request, output, esr, mode, rng, density, touch_shared)
        {
            undo(trace, scaffold, |trace, scaffold, omega, density| {
                uneval_esrs(trace, scaffold, request, k, omega, density, touch_shared)
            });
            return Err(e);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn eval_esr(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    request: NodeId,
    output: NodeId,
    esr: &Esr,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
    touch_shared: bool,
) -> Result<()> {
    let root = if trace.contains_family_at(request, &esr.id)? {
        let root = trace.family_at(request, &esr.id);
        if touch_shared {
            regen(trace, scaffold, root, mode, rng, density)?;
        }
        root
    } else {
        let maker = trace.maker_at(request);
        let detached = match mode {
            Mode::Restore(omega) => omega.family(maker, &esr.id),
            _ => None,
        };
        let root = match detached {
            Some(root) => {
                restore(trace, scaffold, root, mode, rng, density)?;
                root
            }
            None => eval_family(trace, scaffold, &esr.expr, mode, rng, density)?,
        };
        if trace.contains_family_at(request, &esr.id)? {
            if detached.is_none() {
                discard_family(trace, scaffold, root);
            }
            return Err(TraceError::RecursiveFamily(esr.id.clone()));
        }
        trace.register_family_at(request, esr.id.clone(), root)?;
        root
    };
    trace.add_esr_edge(root, output);
    Ok(())
}

/// Unevaluate and free a family this regen just built.
fn discard_family(trace: &mut Trace, scaffold: &mut Scaffold, root: NodeId) {
    undo(trace, scaffold, |trace, scaffold, omega, density| {
        uneval_family(trace, scaffold, root, omega, density)
    });
    trace.free_family(root);
}

/// Build and apply a new family for `expr`, returning its root.
pub(crate) fn eval_family(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    expr: &Expr,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<NodeId> {
    match expr {
        Expr::Constant(value) => Ok(trace.create_constant_node(value.clone())),
        Expr::Lookup(source) => {
            if !trace.contains_node(*source) {
                return Err(TraceError::DanglingLookup(*source));
            }
            regen(trace, scaffold, *source, mode, rng, density)?;
            Ok(trace.create_lookup_node(*source))
        }
        Expr::Apply(operator, operands) => {
            let operator = eval_family(trace, scaffold, operator, mode, rng, density)?;
            let mut built: SmallVec<[NodeId; 4]> = SmallVec::new();
            for operand in operands {
                match eval_family(trace, scaffold, operand, mode, rng, density) {
                    Ok(node) => built.push(node),
                    Err(e) => {
                        for &node in built.iter().rev() {
                            discard_family(trace, scaffold, node);
                        }
                        discard_family(trace, scaffold, operator);
                        return Err(e);
                    }
                }
            }
            let (request, output) = trace.create_application_nodes(operator, built.clone());
            if let Err(e) = apply(trace, scaffold, request, output, mode, rng, density) {
                undo(trace, scaffold, |trace, scaffold, omega, density| {
                    for &node in built.iter().rev() {
                        uneval_family(trace, scaffold, node, omega, density);
                    }
                    uneval_family(trace, scaffold, operator, omega, density);
                });
                trace.free_family(output);
                return Err(e);
            }
            Ok(output)
        }
    }
}

fn apply(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    request: NodeId,
    output: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    apply_psp(trace, scaffold, request, mode, rng, density)?;
    if let Err(e) = eval_requests(trace, scaffold, request, mode, rng, density, true) {
        undo(trace, scaffold, |trace, scaffold, omega, density| {
            unapply_psp(trace, scaffold, request, omega, density)
        });
        return Err(e);
    }
    if let Err(e) = apply_psp(trace, scaffold, output, mode, rng, density) {
        undo(trace, scaffold, |trace, scaffold, omega, density| {
            uneval_requests(trace, scaffold, request, omega, density, true);
            unapply_psp(trace, scaffold, request, omega, density);
        });
        return Err(e);
    }
    Ok(())
}

/// Bring a detached family back with the values it had.
fn restore(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    root: NodeId,
    mode: Mode<'_>,
    rng: &mut dyn RngCore,
    density: &mut Density,
) -> Result<()> {
    match trace.node(root).clone() {
        Node::Constant => Ok(()),
        Node::Lookup { source } => {
            regen_parents(trace, scaffold, root, mode, rng, density)?;
            trace.reconnect_lookup(root);
            let value = trace.value(source).clone();
            trace.set_value(root, value);
            Ok(())
        }
        Node::Output { operator, operands, request } => {
            restore(trace, scaffold, operator, mode, rng, density)?;
            for &operand in &operands {
                restore(trace, scaffold, operand, mode, rng, density)?;
            }
            apply(trace, scaffold, request, root, mode, rng, density)
        }
        Node::Request { .. } => panic!("family root {} is a request node", root.0),
    }
}

/// Pin the value of a random choice, returning the log density of the
/// constrained value. With `propagate`, deterministic dependents are
/// recomputed from it; random or requesting dependents are an error, in which
/// case nothing is changed.
pub fn constrain(
    trace: &mut Trace,
    app: NodeId,
    value: Value,
    rng: &mut dyn RngCore,
    propagate: bool,
) -> Result<f64> {
    if trace.is_constrained(app) {
        return Err(TraceError::AlreadyConstrained);
    }
    let psp = trace.psp_at(app);
    let args = trace.args_at(app);
    let old = trace.value(app).clone();
    psp.unincorporate(&old, &args, trace.aux_at_mut(app));
    let weight = psp.log_density(&value, &args, trace.aux_at(app));
    trace.set_value(app, value.clone());
    psp.incorporate(&value, &args, trace.aux_at_mut(app));
    trace.unregister_unconstrained_choice(app);
    trace.register_constrained_choice(app);

    if propagate {
        let mut journal = Vec::new();
        if let Err(e) = propagate_children(trace, app, rng, &mut journal) {
            for (node, prev) in journal.into_iter().rev() {
                trace.set_value(node, prev);
            }
            trace.unregister_constrained_choice(app);
            trace.register_unconstrained_choice(app);
            psp.unincorporate(&value, &args, trace.aux_at_mut(app));
            trace.set_value(app, old.clone());
            psp.incorporate(&old, &args, trace.aux_at_mut(app));
            return Err(e);
        }
    }
    Ok(weight)
}

fn propagate_children(
    trace: &mut Trace,
    node: NodeId,
    rng: &mut dyn RngCore,
    journal: &mut Vec<(NodeId, Value)>,
) -> Result<()> {
    let children: SmallVec<[NodeId; 8]> = trace.children(node).iter().copied().collect();
    for child in children {
        if trace.is_active(child) {
            propagate_constraint(trace, child, rng, journal)?;
        }
    }
    Ok(())
}

fn propagate_constraint(
    trace: &mut Trace,
    node: NodeId,
    rng: &mut dyn RngCore,
    journal: &mut Vec<(NodeId, Value)>,
) -> Result<()> {
    match trace.node(node) {
        Node::Lookup { source } => {
            let value = trace.value(*source).clone();
            let prev = trace.value(node).clone();
            journal.push((node, prev));
            trace.set_value(node, value);
        }
        Node::Request { .. } => {
            let requests = matches!(trace.value(node), Value::Request(r) if !r.esrs.is_empty());
            if requests {
                return Err(TraceError::ConstraintPropagation(
                    "cannot make requests downstream of a constrained choice",
                ));
            }
            return Ok(());
        }
        Node::Output { .. } => {
            let psp = trace.try_psp_at(node)?;
            if psp.is_random() {
                return Err(TraceError::ConstraintPropagation(
                    "cannot make random choices downstream of a constrained choice",
                ));
            }
            let args = trace.args_at(node);
            let value = psp.simulate(&args, trace.aux_at(node), rng)?;
            if matches!(value, Value::Sp(_)) {
                return Err(TraceError::ConstraintPropagation(
                    "cannot remake a procedure downstream of a constrained choice",
                ));
            }
            let prev = trace.value(node).clone();
            journal.push((node, prev));
            trace.set_value(node, value);
        }
        Node::Constant => return Ok(()),
    }
    propagate_children(trace, node, rng, journal)
}
