//! # Inference operators
//!
//! `mix_mh` picks a scaffold through a `BlockScaffoldIndexer`, lets an
//! `Operator` transform the trace, and accepts or rejects with the
//! Metropolis-Hastings ratio corrected for the index selection.

use crate::arena::NodeId;
use crate::check::{check_torus, check_whole};
use crate::config::InferConfig;
use crate::engine::{
    detach_and_extract, detach_and_extract_set, regen_and_attach, regen_and_attach_set, Mode,
    OmegaDb,
};
use crate::error::{Result, TraceError};
use crate::kernel::GKernel;
use crate::psp::{DeterministicLKernel, LKernel};
use crate::scaffold::{construct_scaffold, Scaffold};
use crate::scope::BlockId;
use crate::trace::Trace;
use crate::value::Value;
use rand::{Rng, RngCore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq)]
pub enum BlockSelector {
    /// One block, sampled uniformly.
    One,
    /// Every node of the scope as a single principal set.
    All,
    /// Every block of the scope as its own principal set, in block order.
    Ordered,
    /// A named block.
    Block(Value),
}

#[derive(Clone, Debug)]
pub struct BlockScaffoldIndexer {
    pub scope: Value,
    pub block: BlockSelector,
}

impl BlockScaffoldIndexer {
    pub fn new(scope: Value, block: BlockSelector) -> Self {
        Self { scope, block }
    }

    pub fn sample_index(&self, trace: &Trace, rng: &mut dyn RngCore) -> Result<Scaffold> {
        let sets: Vec<BTreeSet<NodeId>> = match &self.block {
            BlockSelector::One => {
                let block = trace.sample_block(&self.scope, rng)?;
                vec![trace.nodes_in_block(&self.scope, &block)]
            }
            BlockSelector::All => vec![trace.all_nodes_in_scope(&self.scope)],
            BlockSelector::Ordered => trace.ordered_sets_in_scope(&self.scope),
            BlockSelector::Block(name) => {
                vec![trace.nodes_in_block(&self.scope, &BlockId::Named(name.clone()))]
            }
        };
        Ok(construct_scaffold(trace, &sets))
    }

    /// Log probability of having picked this index.
    pub fn log_density_of_index(&self, trace: &Trace) -> f64 {
        match self.block {
            BlockSelector::One => trace.log_density_of_block(&self.scope),
            _ => 0.0,
        }
    }
}

/// An in-place transition over one scaffold.
pub trait Operator {
    fn name(&self) -> &'static str;

    /// Transform the trace and return the log acceptance weight.
    fn propose(&mut self, trace: &mut Trace, scaffold: Scaffold, rng: &mut dyn RngCore) -> Result<f64>;

    fn accept(&mut self, trace: &mut Trace);

    /// Operators that sample from the exact conditional skip the MH test.
    fn always_accepts(&self) -> bool {
        false
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore);
}

/// Resimulation Metropolis-Hastings.
#[derive(Debug, Default)]
pub struct MhOperator {
    kernel: GKernel,
}

impl MhOperator {
    pub fn new(check: bool) -> Self {
        Self {
            kernel: GKernel::new(check),
        }
    }
}

impl Operator for MhOperator {
    fn name(&self) -> &'static str {
        "mh"
    }

    fn propose(&mut self, trace: &mut Trace, scaffold: Scaffold, rng: &mut dyn RngCore) -> Result<f64> {
        Ok(self.kernel.propose(trace, scaffold, rng)?.log_weight())
    }

    fn accept(&mut self, trace: &mut Trace) {
        self.kernel.accept(trace);
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) {
        self.kernel.reject(trace, rng);
    }
}

/// Gibbs over principal nodes with finitely many values: every joint
/// assignment is regenerated in its own copy of the detached trace and one
/// is drawn in proportion to its weight. Always accepted.
#[derive(Debug, Default)]
pub struct EnumerativeGibbsOperator {
    check: bool,
}

impl EnumerativeGibbsOperator {
    pub fn new(check: bool) -> Self {
        Self { check }
    }
}

/// Every combination of one value per position, first position slowest.
fn cartesian_product(domains: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = vec![Vec::new()];
    for domain in domains {
        let mut next = Vec::with_capacity(out.len() * domain.len());
        for prefix in &out {
            for v in domain {
                let mut row = prefix.clone();
                row.push(v.clone());
                next.push(row);
            }
        }
        out = next;
    }
    out
}

/// Draw an index with probability proportional to `exp(log_weights[i])`.
pub fn sample_log_categorical(log_weights: &[f64], rng: &mut dyn RngCore) -> Option<usize> {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let weights: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return Some(i);
        }
        u -= w;
    }
    weights.iter().rposition(|w| *w > 0.0)
}

impl Operator for EnumerativeGibbsOperator {
    fn name(&self) -> &'static str {
        "enumerative_gibbs"
    }

    fn propose(&mut self, trace: &mut Trace, mut scaffold: Scaffold, rng: &mut dyn RngCore) -> Result<f64> {
        let pnodes: Vec<NodeId> = scaffold.principal().iter().flatten().copied().collect();
        let mut domains = Vec::with_capacity(pnodes.len());
        for &node in &pnodes {
            let psp = trace.psp_at(node);
            let args = trace.args_at(node);
            if !psp.can_enumerate_values(&args) {
                return Err(TraceError::invalid(
                    "enumerative_gibbs",
                    format!("{} cannot enumerate its values", psp.name()),
                ));
            }
            domains.push(psp.enumerate_values(&args, trace.aux_at(node)));
        }

        let (_, rho_db) = detach_and_extract(trace, &mut scaffold);
        let mut particles = Vec::new();
        let mut weights = Vec::new();
        for values in cartesian_product(&domains) {
            let mut particle = trace.clone();
            let mut sc = scaffold.clone();
            for (&node, value) in pnodes.iter().zip(values) {
                let kernel: Arc<dyn LKernel> = Arc::new(DeterministicLKernel { value });
                sc.set_lkernel(node, kernel);
            }
            match regen_and_attach(&mut particle, &mut sc, Mode::Propose { old: &rho_db }, rng) {
                Ok(xi) => {
                    if self.check {
                        check_whole(&particle, &sc);
                    }
                    weights.push(xi.absorbed);
                    particles.push(particle);
                }
                Err(e) => debug!(error = %e, "gibbs candidate failed"),
            }
        }

        match sample_log_categorical(&weights, rng) {
            Some(i) => {
                *trace = particles.swap_remove(i);
                rho_db.reclaim(trace);
                debug!(candidates = weights.len(), chosen = i, "gibbs step");
                Ok(0.0)
            }
            None => {
                regen_and_attach(trace, &mut scaffold, Mode::Restore(&rho_db), rng)
                    .unwrap_or_else(|e| panic!("restoring trace after failed gibbs step: {e}"));
                Err(TraceError::invalid(
                    "enumerative_gibbs",
                    "no candidate assignment has positive probability",
                ))
            }
        }
    }

    fn accept(&mut self, _trace: &mut Trace) {}

    fn always_accepts(&self) -> bool {
        true
    }

    fn reject(&mut self, _trace: &mut Trace, _rng: &mut dyn RngCore) {
        unreachable!("enumerative gibbs always accepts")
    }
}

/// Particle Gibbs over the principal sets of a scaffold, in order.
///
/// Set `t` is regenerated once per particle on top of an ancestor drawn from
/// the weights of step `t - 1`. The current state is kept as an extra
/// particle at every step, so omega DB column `particles` holds the detach of
/// the state the proposal started from. The final state is drawn from all
/// particles including that one, which makes the move a Gibbs step: it is
/// always accepted.
#[derive(Debug)]
pub struct PGibbsOperator {
    particles: usize,
    check: bool,
    pending: Option<PGibbsProposal>,
}

#[derive(Debug)]
struct PGibbsProposal {
    scaffold: Scaffold,
    /// `omega[t][p]`: what detaching set `t` of particle `p` removed.
    omega: Vec<Vec<Option<OmegaDb>>>,
    /// `ancestors[t][p]`: the step `t - 1` particle that `p` extends.
    ancestors: Vec<Vec<usize>>,
    /// Particle attached at the end of `propose`.
    chosen: usize,
}

impl PGibbsOperator {
    pub fn new(particles: usize, check: bool) -> Self {
        Self {
            particles: particles.max(1),
            check,
            pending: None,
        }
    }
}

/// Ancestors of particle `p` at steps `0..t`.
fn ancestor_path(ancestors: &[Vec<usize>], t: usize, p: usize) -> Vec<usize> {
    let mut path = Vec::with_capacity(t + 1);
    if t > 0 {
        let mut current = ancestors[t][p];
        path.push(current);
        for i in (1..t).rev() {
            current = ancestors[i][current];
            path.push(current);
        }
    }
    path.reverse();
    path
}

/// Ancestors of particle `p` at the last step, followed by `p` itself.
fn full_path(ancestors: &[Vec<usize>], p: usize) -> Vec<usize> {
    let mut path = ancestor_path(ancestors, ancestors.len() - 1, p);
    path.push(p);
    path
}

fn restore_path(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    omega: &[Vec<Option<OmegaDb>>],
    path: &[usize],
    rng: &mut dyn RngCore,
) {
    for (t, &p) in path.iter().enumerate() {
        let db = omega[t][p]
            .as_ref()
            .unwrap_or_else(|| panic!("particle {p} has no detach at set {t}"));
        regen_and_attach_set(trace, scaffold, t, Mode::Restore(db), rng)
            .unwrap_or_else(|e| panic!("restoring particle {p} at set {t}: {e}"));
    }
}

/// Detach sets `0..t`, last first. The omega DBs are dropped: every family
/// they name is already held by a stored DB.
fn detach_rest(trace: &mut Trace, scaffold: &mut Scaffold, t: usize) {
    for i in (0..t).rev() {
        detach_and_extract_set(trace, scaffold, i);
    }
}

/// Regenerate set `t` from scratch and detach it again, returning its weight.
/// A failed regen rolls itself back and yields an impossible particle.
fn simulate_set(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    t: usize,
    rng: &mut dyn RngCore,
) -> (f64, Option<OmegaDb>) {
    match regen_and_attach_set(trace, scaffold, t, Mode::Fresh, rng) {
        Ok(_) => {
            let (weight, db) = detach_and_extract_set(trace, scaffold, t);
            (weight.absorbed, Some(db))
        }
        Err(e) => {
            debug!(error = %e, set = t, "pgibbs particle failed");
            (f64::NEG_INFINITY, None)
        }
    }
}

/// Free the families of every detach that is not on `path`.
fn reclaim_off_path(trace: &mut Trace, omega: Vec<Vec<Option<OmegaDb>>>, path: &[usize]) -> usize {
    let mut reclaimed = 0;
    for (t, row) in omega.into_iter().enumerate() {
        for (p, db) in row.into_iter().enumerate() {
            if p != path[t] {
                reclaimed += db.map_or(0, |db| db.reclaim(trace));
            }
        }
    }
    reclaimed
}

impl Operator for PGibbsOperator {
    fn name(&self) -> &'static str {
        "pgibbs"
    }

    fn propose(&mut self, trace: &mut Trace, mut scaffold: Scaffold, rng: &mut dyn RngCore) -> Result<f64> {
        assert!(self.pending.is_none(), "pgibbs proposal already in flight");
        let sets = scaffold.border().len();
        let n = self.particles;
        let mut omega: Vec<Vec<Option<OmegaDb>>> =
            (0..sets).map(|_| (0..=n).map(|_| None).collect()).collect();
        let mut ancestors = vec![vec![n; n + 1]; sets];
        let mut rho_weights = vec![0.0; sets];

        for t in (0..sets).rev() {
            let (rho, db) = detach_and_extract_set(trace, &mut scaffold, t);
            rho_weights[t] = rho.absorbed;
            omega[t][n] = Some(db);
        }
        if self.check {
            check_torus(trace, &scaffold);
        }

        let mut xi_weights = Vec::with_capacity(n);
        for p in 0..n {
            let (weight, db) = simulate_set(trace, &mut scaffold, 0, rng);
            xi_weights.push(weight);
            omega[0][p] = db;
        }

        for t in 1..sets {
            let mut extended = xi_weights.clone();
            extended.push(rho_weights[t - 1]);
            let mut next = Vec::with_capacity(n);
            for p in 0..n {
                ancestors[t][p] = sample_log_categorical(&extended, rng).unwrap_or(n);
                let path = ancestor_path(&ancestors, t, p);
                restore_path(trace, &mut scaffold, &omega, &path, rng);
                let (weight, db) = simulate_set(trace, &mut scaffold, t, rng);
                next.push(weight);
                omega[t][p] = db;
                detach_rest(trace, &mut scaffold, t);
            }
            xi_weights = next;
        }

        let mut final_weights = xi_weights;
        final_weights.push(rho_weights[sets - 1]);
        let chosen = sample_log_categorical(&final_weights, rng).unwrap_or(n);
        let path = full_path(&ancestors, chosen);
        restore_path(trace, &mut scaffold, &omega, &path, rng);
        if self.check {
            check_whole(trace, &scaffold);
        }
        debug!(sets, particles = n, chosen, "pgibbs step");
        self.pending = Some(PGibbsProposal {
            scaffold,
            omega,
            ancestors,
            chosen,
        });
        Ok(0.0)
    }

    fn accept(&mut self, trace: &mut Trace) {
        let Some(pending) = self.pending.take() else {
            panic!("accept without a pgibbs proposal");
        };
        let path = full_path(&pending.ancestors, pending.chosen);
        reclaim_off_path(trace, pending.omega, &path);
    }

    fn always_accepts(&self) -> bool {
        true
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) {
        let Some(mut pending) = self.pending.take() else {
            panic!("reject without a pgibbs proposal");
        };
        let sets = pending.scaffold.border().len();
        detach_rest(trace, &mut pending.scaffold, sets);
        if self.check {
            check_torus(trace, &pending.scaffold);
        }
        let current = vec![self.particles; sets];
        restore_path(trace, &mut pending.scaffold, &pending.omega, &current, rng);
        if self.check {
            check_whole(trace, &pending.scaffold);
        }
        reclaim_off_path(trace, pending.omega, &current);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Accepted,
    Rejected,
    /// The scope had no random choices to move.
    Skipped,
}

/// One Metropolis-Hastings transition.
pub fn mix_mh(
    trace: &mut Trace,
    indexer: &BlockScaffoldIndexer,
    operator: &mut dyn Operator,
    rng: &mut dyn RngCore,
) -> Result<Step> {
    if !trace.scope_has_entropy(&indexer.scope) {
        return Ok(Step::Skipped);
    }
    let scaffold = indexer.sample_index(trace, rng)?;
    let rho_mix = indexer.log_density_of_index(trace);
    let log_alpha = operator.propose(trace, scaffold, rng)?;
    let xi_mix = indexer.log_density_of_index(trace);
    let alpha = xi_mix + log_alpha - rho_mix;
    if operator.always_accepts() || rng.gen::<f64>().ln() < alpha {
        operator.accept(trace);
        Ok(Step::Accepted)
    } else {
        operator.reject(trace, rng);
        Ok(Step::Rejected)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub accepted: usize,
    pub rejected: usize,
    pub skipped: usize,
}

/// `config.transitions` resimulation-MH steps over the configured scope.
pub fn run_mh(trace: &mut Trace, config: &InferConfig, rng: &mut dyn RngCore) -> Result<RunStats> {
    let indexer = BlockScaffoldIndexer::new(config.scope.clone(), config.block.clone());
    let mut operator = MhOperator::new(config.check);
    let mut stats = RunStats::default();
    for _ in 0..config.transitions {
        match mix_mh(trace, &indexer, &mut operator, rng)? {
            Step::Accepted => stats.accepted += 1,
            Step::Rejected => stats.rejected += 1,
            Step::Skipped => stats.skipped += 1,
        }
    }
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        skipped = stats.skipped,
        "mh run finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_cartesian_product_order() {
        let rows = cartesian_product(&[
            vec![Value::Bool(true), Value::Bool(false)],
            vec![Value::Number(1.0), Value::Number(2.0)],
        ]);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], vec![Value::Bool(true), Value::Number(2.0)]);
        assert_eq!(rows[2], vec![Value::Bool(false), Value::Number(1.0)]);
    }

    #[test]
    fn test_log_categorical_ignores_impossible_entries() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let i = sample_log_categorical(&[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY], &mut rng);
            assert_eq!(i, Some(1));
        }
        assert_eq!(sample_log_categorical(&[f64::NEG_INFINITY], &mut rng), None);
        assert_eq!(sample_log_categorical(&[], &mut rng), None);
    }

    #[test]
    fn test_ancestor_path_follows_parents_back() {
        // Two particles plus the retained one (index 2) over three sets.
        let ancestors = vec![vec![2, 2, 2], vec![1, 2, 2], vec![0, 0, 2]];
        assert_eq!(ancestor_path(&ancestors, 0, 1), Vec::<usize>::new());
        assert_eq!(ancestor_path(&ancestors, 1, 0), vec![1]);
        assert_eq!(ancestor_path(&ancestors, 2, 1), vec![1, 0]);
        assert_eq!(full_path(&ancestors, 0), vec![1, 0, 0]);
        assert_eq!(full_path(&ancestors, 2), vec![2, 2, 2]);
    }
}
