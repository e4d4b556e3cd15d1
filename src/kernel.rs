//! Generic proposal kernel: detach, regen, then commit or revert.

use crate::check::{check_torus, check_whole};
use crate::engine::{detach_and_extract, regen_and_attach, Density, Mode, OmegaDb};
use crate::error::Result;
use crate::scaffold::Scaffold;
use crate::trace::Trace;
use rand::RngCore;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    Idle,
    Proposed,
    Accepted,
    Rejected,
}

/// Densities removed (`rho`) and added (`xi`) by one proposal.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Proposal {
    pub rho: Density,
    pub xi: Density,
}

impl Proposal {
    /// Total log-density change of the trace.
    pub fn delta(&self) -> f64 {
        self.xi.total() - self.rho.total()
    }

    /// Log Metropolis-Hastings weight. Resampled choices were drawn from
    /// their priors and cancel out of the ratio.
    pub fn log_weight(&self) -> f64 {
        self.xi.absorbed - self.rho.absorbed
    }
}

#[derive(Debug)]
pub struct GKernel {
    state: KernelState,
    scaffold: Option<Scaffold>,
    rho_db: Option<OmegaDb>,
    check: bool,
}

impl Default for GKernel {
    fn default() -> Self {
        Self::new(false)
    }
}

impl GKernel {
    /// With `check`, torus/whole diagnostics run after every traversal.
    pub fn new(check: bool) -> Self {
        Self {
            state: KernelState::Idle,
            scaffold: None,
            rho_db: None,
            check,
        }
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Detach the scaffold and regenerate it with fresh values. On error the
    /// trace is restored to its previous state before returning.
    pub fn propose(
        &mut self,
        trace: &mut Trace,
        mut scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<Proposal> {
        assert_ne!(self.state, KernelState::Proposed, "proposal already in flight");
        let (rho, rho_db) = detach_and_extract(trace, &mut scaffold);
        if self.check {
            check_torus(trace, &scaffold);
        }
        match regen_and_attach(trace, &mut scaffold, Mode::Propose { old: &rho_db }, rng) {
            Ok(xi) => {
                if self.check {
                    check_whole(trace, &scaffold);
                }
                let proposal = Proposal { rho, xi };
                trace!(
                    delta = proposal.delta(),
                    log_weight = proposal.log_weight(),
                    "proposal made"
                );
                self.scaffold = Some(scaffold);
                self.rho_db = Some(rho_db);
                self.state = KernelState::Proposed;
                Ok(proposal)
            }
            Err(e) => {
                if self.check {
                    check_torus(trace, &scaffold);
                }
                regen_and_attach(trace, &mut scaffold, Mode::Restore(&rho_db), rng)
                    .unwrap_or_else(|restore_err| {
                        panic!("restoring trace after failed proposal ({e}): {restore_err}")
                    });
                self.state = KernelState::Rejected;
                Err(e)
            }
        }
    }

    /// Keep the proposed state. Families the proposal orphaned are freed;
    /// returns how many.
    pub fn accept(&mut self, trace: &mut Trace) -> usize {
        assert_eq!(self.state, KernelState::Proposed, "accept without a proposal");
        self.scaffold = None;
        let reclaimed = self.rho_db.take().map_or(0, |db| db.reclaim(trace));
        self.state = KernelState::Accepted;
        debug!(reclaimed, "proposal accepted");
        reclaimed
    }

    /// Detach the proposed state and restore the values captured by the
    /// proposal's detach.
    pub fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) {
        assert_eq!(self.state, KernelState::Proposed, "reject without a proposal");
        let mut scaffold = self.scaffold.take().unwrap_or_default();
        let rho_db = self.rho_db.take().unwrap_or_default();
        let (_, xi_db) = detach_and_extract(trace, &mut scaffold);
        if self.check {
            check_torus(trace, &scaffold);
        }
        regen_and_attach(trace, &mut scaffold, Mode::Restore(&rho_db), rng)
            .unwrap_or_else(|e| panic!("restoring trace on reject: {e}"));
        if self.check {
            check_whole(trace, &scaffold);
        }
        let reclaimed = xi_db.reclaim(trace);
        self.state = KernelState::Rejected;
        debug!(reclaimed, "proposal rejected");
    }

    /// Forget the last decision.
    pub fn reset(&mut self) {
        assert_ne!(self.state, KernelState::Proposed, "reset with a proposal in flight");
        self.state = KernelState::Idle;
    }
}
