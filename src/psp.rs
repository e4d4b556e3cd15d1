//! # PSP - Primitive Stochastic Procedures
//!
//! A procedure (`Sp`) is a pair of PSPs: the request PSP runs at the request
//! node of an application and decides which families it needs, the output PSP
//! runs at the output node and produces the application's value. Each made
//! procedure carries mutable sufficient statistics (`SpAux`) and the families
//! it has spawned through requests.

use crate::arena::NodeId;
use crate::error::{Result, TraceError};
use crate::expr::Expr;
use crate::trace::Trace;
use crate::value::Value;
use rand::RngCore;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// External stochastic request: "make sure the family `id` exists".
#[derive(Clone, Debug, PartialEq)]
pub struct Esr {
    pub id: Value,
    pub expr: Expr,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Request {
    pub esrs: Vec<Esr>,
}

impl Request {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Arguments of an application as seen by its PSP.
#[derive(Clone, Debug)]
pub struct Args {
    pub node: NodeId,
    pub operand_nodes: SmallVec<[NodeId; 4]>,
    pub operands: SmallVec<[Value; 4]>,
    /// The paired request's value, present for output nodes.
    pub request: Option<Arc<Request>>,
    pub esr_nodes: SmallVec<[NodeId; 2]>,
    pub esr_values: SmallVec<[Value; 2]>,
}

impl Args {
    pub fn expect_arity(&self, procedure: &'static str, expected: usize) -> Result<()> {
        if self.operands.len() != expected {
            return Err(TraceError::Arity {
                procedure,
                expected,
                got: self.operands.len(),
            });
        }
        Ok(())
    }

    pub fn number(&self, procedure: &'static str, i: usize) -> Result<f64> {
        self.operands
            .get(i)
            .and_then(Value::as_number)
            .ok_or_else(|| TraceError::invalid(procedure, format!("operand {i} is not a number")))
    }
}

/// Sufficient statistics of a made procedure: how often each value has been
/// incorporated by its applications.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpAux {
    pub counts: FxHashMap<Value, u32>,
    pub total: u32,
}

impl SpAux {
    pub fn count(&self, value: &Value) -> u32 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, value: &Value) {
        *self.counts.entry(value.clone()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn decrement(&mut self, value: &Value) {
        let count = self
            .counts
            .get_mut(value)
            .unwrap_or_else(|| panic!("unincorporating {value} that was never incorporated"));
        *count -= 1;
        if *count == 0 {
            self.counts.remove(value);
        }
        self.total -= 1;
    }
}

#[derive(Debug)]
pub struct Sp {
    pub request: Arc<dyn Psp>,
    pub output: Arc<dyn Psp>,
}

impl Sp {
    /// A procedure that issues no requests.
    pub fn no_request(output: impl Psp + 'static) -> Arc<Sp> {
        Arc::new(Sp {
            request: Arc::new(NullRequestPsp),
            output: Arc::new(output),
        })
    }
}

/// Everything recorded at a node whose value is a procedure.
#[derive(Clone, Debug)]
pub struct SpRecord {
    pub sp: Arc<Sp>,
    pub aux: SpAux,
    /// Families spawned by requests to this procedure, by family id.
    pub families: FxHashMap<Value, NodeId>,
}

impl SpRecord {
    pub fn new(sp: Arc<Sp>, aux: SpAux) -> Self {
        Self {
            sp,
            aux,
            families: FxHashMap::default(),
        }
    }
}

pub trait Psp: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn simulate(&self, args: &Args, aux: &SpAux, rng: &mut dyn RngCore) -> Result<Value>;

    fn log_density(&self, _value: &Value, _args: &Args, _aux: &SpAux) -> f64 {
        0.0
    }

    fn incorporate(&self, _value: &Value, _args: &Args, _aux: &mut SpAux) {}

    fn unincorporate(&self, _value: &Value, _args: &Args, _aux: &mut SpAux) {}

    fn is_random(&self) -> bool {
        false
    }

    /// Whether a change of `parent` can be absorbed at `app` by rescoring its
    /// current value. Random choices can always be rescored; deterministic
    /// values cannot.
    fn can_absorb(&self, _trace: &Trace, _app: NodeId, _parent: NodeId) -> bool {
        self.is_random()
    }

    /// True for makers whose procedures score all their applications jointly
    /// from their sufficient statistics.
    fn children_can_aaa(&self) -> bool {
        false
    }

    fn aaa_kernel(&self) -> Option<Arc<dyn LKernel>> {
        None
    }

    /// Joint log density of everything incorporated into `aux`.
    fn log_density_of_counts(&self, _aux: &SpAux) -> f64 {
        0.0
    }

    fn can_enumerate_values(&self, _args: &Args) -> bool {
        false
    }

    fn enumerate_values(&self, _args: &Args, _aux: &SpAux) -> Vec<Value> {
        Vec::new()
    }

    /// Applications of scope-tagging procedures register their third operand
    /// in the scope and block named by the first two.
    fn is_scope_tag(&self) -> bool {
        false
    }

    /// Output PSPs that forward the value of their single requested family.
    fn is_esr_reference(&self) -> bool {
        false
    }

    /// Procedures made by this PSP carry an auxiliary-evaluation kernel.
    fn has_ae_kernel(&self) -> bool {
        false
    }
}

/// Request PSP of procedures that never request families.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRequestPsp;

impl Psp for NullRequestPsp {
    fn name(&self) -> &'static str {
        "null_request"
    }

    fn simulate(&self, _args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        Ok(Value::Request(Arc::new(Request::empty())))
    }

    fn can_absorb(&self, _trace: &Trace, _app: NodeId, _parent: NodeId) -> bool {
        true
    }
}

/// Output PSP forwarding the value of the single family it requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct EsrRefOutputPsp;

impl Psp for EsrRefOutputPsp {
    fn name(&self) -> &'static str {
        "esr_ref"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        match args.esr_values.as_slice() {
            [value] => Ok(value.clone()),
            other => Err(TraceError::invalid(
                "esr_ref",
                format!("expected exactly one requested family, got {}", other.len()),
            )),
        }
    }

    fn can_absorb(&self, trace: &Trace, app: NodeId, parent: NodeId) -> bool {
        parent != trace.request_node(app) && trace.esr_parents(app).first() != Some(&parent)
    }

    fn is_esr_reference(&self) -> bool {
        true
    }
}

/// Local proposal kernel replacing resimulation at a scaffold node.
pub trait LKernel: fmt::Debug + Send + Sync {
    fn forward_simulate(
        &self,
        trace: &Trace,
        old: Option<&Value>,
        args: &Args,
        rng: &mut dyn RngCore,
    ) -> Result<Value>;

    fn forward_weight(&self, trace: &Trace, new: &Value, old: Option<&Value>, args: &Args) -> f64;

    fn reverse_weight(&self, trace: &Trace, old: &Value, args: &Args) -> f64;
}

/// Proposes a fixed value and weights it by the node's own density.
#[derive(Debug, Clone)]
pub struct DeterministicLKernel {
    pub value: Value,
}

impl LKernel for DeterministicLKernel {
    fn forward_simulate(
        &self,
        _trace: &Trace,
        _old: Option<&Value>,
        _args: &Args,
        _rng: &mut dyn RngCore,
    ) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn forward_weight(&self, trace: &Trace, new: &Value, _old: Option<&Value>, args: &Args) -> f64 {
        trace.psp_at(args.node).log_density(new, args, trace.aux_at(args.node))
    }

    fn reverse_weight(&self, trace: &Trace, old: &Value, args: &Args) -> f64 {
        trace.psp_at(args.node).log_density(old, args, trace.aux_at(args.node))
    }
}

/// Kernel for makers whose children are absorbed at the applications: the
/// maker is resimulated and weighted by the joint density of the statistics
/// its applications have already incorporated.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAaaKernel;

impl DefaultAaaKernel {
    fn counts_density(trace: &Trace, made: &Value, node: NodeId) -> f64 {
        match made {
            Value::Sp(sp) => trace
                .aaa_aux(node)
                .map(|aux| sp.output.log_density_of_counts(aux))
                .unwrap_or(0.0),
            other => panic!("AAA maker at node {} holds non-procedure {other}", node.0),
        }
    }
}

impl LKernel for DefaultAaaKernel {
    fn forward_simulate(
        &self,
        trace: &Trace,
        _old: Option<&Value>,
        args: &Args,
        rng: &mut dyn RngCore,
    ) -> Result<Value> {
        trace
            .psp_at(args.node)
            .simulate(args, trace.aux_at(args.node), rng)
    }

    fn forward_weight(&self, trace: &Trace, new: &Value, _old: Option<&Value>, args: &Args) -> f64 {
        Self::counts_density(trace, new, args.node)
    }

    fn reverse_weight(&self, trace: &Trace, old: &Value, args: &Args) -> f64 {
        Self::counts_density(trace, old, args.node)
    }
}
