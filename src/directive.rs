//! Top-level directives: the surface a host evaluator drives.
//!
//! Each directive owns one family rooted at the node its expression
//! evaluated to. Observations pin the outermost non-reference application
//! under that root.

use crate::engine::regen::eval_family;
use crate::engine::detach::uneval_family;
use crate::engine::{
    constrain, detach_and_extract, regen_and_attach, unconstrain, Density, Mode, OmegaDb,
};
use crate::arena::NodeId;
use crate::error::{Result, TraceError};
use crate::expr::Expr;
use crate::psp::DeterministicLKernel;
use crate::scaffold::{construct_scaffold, Scaffold};
use crate::trace::{DirectiveId, Trace};
use crate::value::Value;
use rand::RngCore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

impl Trace {
    /// Evaluate `expr` as a new top-level family and return its value.
    pub fn eval(&mut self, id: DirectiveId, expr: &Expr, rng: &mut dyn RngCore) -> Result<Value> {
        let root = self.eval_root(id, expr, rng)?;
        Ok(self.value(root).clone())
    }

    fn eval_root(&mut self, id: DirectiveId, expr: &Expr, rng: &mut dyn RngCore) -> Result<NodeId> {
        if self.directive_root(id).is_ok() {
            return Err(TraceError::DuplicateDirective(id));
        }
        let mut scaffold = Scaffold::empty();
        let mut density = Density::default();
        let root = eval_family(self, &mut scaffold, expr, Mode::Fresh, rng, &mut density)?;
        self.insert_directive(id, root)?;
        info!(directive = id, root = root.0, "directive evaluated");
        Ok(root)
    }

    /// Evaluate a definition; the returned node can be referenced by later
    /// expressions through `Expr::Lookup`.
    pub fn assume(&mut self, id: DirectiveId, expr: &Expr, rng: &mut dyn RngCore) -> Result<NodeId> {
        self.eval_root(id, expr, rng)
    }

    pub fn predict(&mut self, id: DirectiveId, expr: &Expr, rng: &mut dyn RngCore) -> Result<Value> {
        self.eval(id, expr, rng)
    }

    /// Current value of a directive.
    pub fn report(&self, id: DirectiveId) -> Result<Value> {
        Ok(self.value(self.directive_root(id)?).clone())
    }

    /// Constrain directive `id` to `value`. The constrained choice is first
    /// moved to the observed value by regenerating everything downstream of
    /// it; returns the log density of the observation.
    pub fn observe(&mut self, id: DirectiveId, value: Value, rng: &mut dyn RngCore) -> Result<f64> {
        let root = self.directive_root(id)?;
        if self.is_observation(root) {
            return Err(TraceError::AlreadyConstrained);
        }
        let app = self.constrainable_node(root)?;
        if self.is_constrained(app) {
            return Err(TraceError::AlreadyConstrained);
        }

        let mut scaffold = construct_scaffold(self, &[BTreeSet::from([app])]);
        scaffold.set_lkernel(app, Arc::new(DeterministicLKernel { value: value.clone() }));
        let (_, rho_db) = detach_and_extract(self, &mut scaffold);
        if let Err(e) = regen_and_attach(self, &mut scaffold, Mode::Propose { old: &rho_db }, rng) {
            regen_and_attach(self, &mut scaffold, Mode::Restore(&rho_db), rng)
                .unwrap_or_else(|restore_err| {
                    panic!("restoring trace after failed observation ({e}): {restore_err}")
                });
            return Err(e);
        }
        rho_db.reclaim(self);

        let weight = constrain(self, app, value.clone(), rng, false)?;
        self.set_observation(root, value);
        if weight == f64::NEG_INFINITY {
            warn!(directive = id, "observed value has zero density");
        }
        info!(directive = id, app = app.0, weight, "observation constrained");
        Ok(weight)
    }

    /// Release the constraint of directive `id`. The choice keeps the
    /// observed value.
    pub fn unobserve(&mut self, id: DirectiveId) -> Result<()> {
        let root = self.directive_root(id)?;
        if !self.is_observation(root) {
            return Ok(());
        }
        let app = self.constrainable_node(root)?;
        unconstrain(self, app);
        self.clear_observation(root);
        Ok(())
    }

    /// Remove directive `id` and free its family.
    pub fn uneval(&mut self, id: DirectiveId) -> Result<()> {
        let root = self.directive_root(id)?;
        if !self.children(root).is_empty() {
            return Err(TraceError::DirectiveInUse(id));
        }
        self.unobserve(id)?;
        self.remove_directive(id)?;

        let mut scaffold = Scaffold::empty();
        let mut omega = OmegaDb::new();
        let mut density = Density::default();
        uneval_family(self, &mut scaffold, root, &mut omega, &mut density);
        let reclaimed = omega.reclaim(self);
        self.free_family(root);
        info!(directive = id, reclaimed, "directive forgotten");
        Ok(())
    }

    pub fn forget(&mut self, id: DirectiveId) -> Result<()> {
        self.uneval(id)
    }
}
