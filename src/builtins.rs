//! # Builtin procedures
//!
//! A small library of PSPs used by the demo and the tests: deterministic
//! arithmetic, a few scalar distributions, a collapsed beta-bernoulli maker,
//! `mem` and scope tagging.

use crate::arena::NodeId;
use crate::error::{Result, TraceError};
use crate::expr::Expr;
use crate::psp::{
    Args, DefaultAaaKernel, Esr, EsrRefOutputPsp, LKernel, Psp, Request, Sp, SpAux,
};
use crate::value::Value;
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal, Uniform};
use std::f64::consts::PI;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericOp {
    Add,
    Sub,
    Mul,
    Square,
}

/// Deterministic arithmetic on numbers.
#[derive(Clone, Copy, Debug)]
pub struct NumericPsp(pub NumericOp);

impl Psp for NumericPsp {
    fn name(&self) -> &'static str {
        match self.0 {
            NumericOp::Add => "add",
            NumericOp::Sub => "sub",
            NumericOp::Mul => "mul",
            NumericOp::Square => "square",
        }
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        let name = self.name();
        let xs = (0..args.operands.len())
            .map(|i| args.number(name, i))
            .collect::<Result<Vec<f64>>>()?;
        let out = match self.0 {
            NumericOp::Add => xs.iter().sum(),
            NumericOp::Mul => xs.iter().product(),
            NumericOp::Sub => {
                args.expect_arity(name, 2)?;
                xs[0] - xs[1]
            }
            NumericOp::Square => {
                args.expect_arity(name, 1)?;
                xs[0] * xs[0]
            }
        };
        Ok(Value::Number(out))
    }
}

fn normal_params(args: &Args) -> Result<(f64, f64)> {
    args.expect_arity("normal", 2)?;
    let mu = args.number("normal", 0)?;
    let sigma = args.number("normal", 1)?;
    if !(sigma > 0.0) {
        return Err(TraceError::invalid("normal", format!("scale must be positive, got {sigma}")));
    }
    Ok((mu, sigma))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NormalPsp;

impl Psp for NormalPsp {
    fn name(&self) -> &'static str {
        "normal"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, rng: &mut dyn RngCore) -> Result<Value> {
        let (mu, sigma) = normal_params(args)?;
        let dist = Normal::new(mu, sigma).map_err(|e| TraceError::invalid("normal", e.to_string()))?;
        Ok(Value::Number(dist.sample(rng)))
    }

    fn log_density(&self, value: &Value, args: &Args, _aux: &SpAux) -> f64 {
        match (value.as_number(), normal_params(args)) {
            (Some(x), Ok((mu, sigma))) => {
                let z = (x - mu) / sigma;
                -0.5 * (2.0 * PI).ln() - sigma.ln() - 0.5 * z * z
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn is_random(&self) -> bool {
        true
    }
}

fn uniform_bounds(args: &Args) -> Result<(f64, f64)> {
    args.expect_arity("uniform_continuous", 2)?;
    let lo = args.number("uniform_continuous", 0)?;
    let hi = args.number("uniform_continuous", 1)?;
    if !(lo < hi) {
        return Err(TraceError::invalid(
            "uniform_continuous",
            format!("empty interval [{lo}, {hi})"),
        ));
    }
    Ok((lo, hi))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UniformContinuousPsp;

impl Psp for UniformContinuousPsp {
    fn name(&self) -> &'static str {
        "uniform_continuous"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, rng: &mut dyn RngCore) -> Result<Value> {
        let (lo, hi) = uniform_bounds(args)?;
        Ok(Value::Number(Uniform::new(lo, hi).sample(rng)))
    }

    fn log_density(&self, value: &Value, args: &Args, _aux: &SpAux) -> f64 {
        match (value.as_number(), uniform_bounds(args)) {
            (Some(x), Ok((lo, hi))) if lo <= x && x <= hi => -(hi - lo).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn is_random(&self) -> bool {
        true
    }
}

fn flip_weight(args: &Args) -> Result<f64> {
    match args.operands.len() {
        0 => Ok(0.5),
        1 => {
            let p = args.number("flip", 0)?;
            if !(0.0..=1.0).contains(&p) {
                return Err(TraceError::invalid("flip", format!("weight {p} outside [0, 1]")));
            }
            Ok(p)
        }
        got => Err(TraceError::Arity {
            procedure: "flip",
            expected: 1,
            got,
        }),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlipPsp;

impl Psp for FlipPsp {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, rng: &mut dyn RngCore) -> Result<Value> {
        let p = flip_weight(args)?;
        Ok(Value::Bool(rng.gen::<f64>() < p))
    }

    fn log_density(&self, value: &Value, args: &Args, _aux: &SpAux) -> f64 {
        match (value.as_bool(), flip_weight(args)) {
            (Some(true), Ok(p)) => p.ln(),
            (Some(false), Ok(p)) => (1.0 - p).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_enumerate_values(&self, _args: &Args) -> bool {
        true
    }

    fn enumerate_values(&self, _args: &Args, _aux: &SpAux) -> Vec<Value> {
        vec![Value::Bool(true), Value::Bool(false)]
    }
}

/// Makes collapsed beta-bernoulli coins. Their applications score jointly
/// through the heads/tails counts, so the maker can be resampled without
/// touching them.
#[derive(Clone, Copy, Debug, Default)]
pub struct MakeBetaBernoulliPsp;

impl Psp for MakeBetaBernoulliPsp {
    fn name(&self) -> &'static str {
        "make_beta_bernoulli"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        args.expect_arity("make_beta_bernoulli", 2)?;
        let alpha = args.number("make_beta_bernoulli", 0)?;
        let beta = args.number("make_beta_bernoulli", 1)?;
        if !(alpha > 0.0 && beta > 0.0) {
            return Err(TraceError::invalid(
                "make_beta_bernoulli",
                format!("pseudocounts must be positive, got ({alpha}, {beta})"),
            ));
        }
        Ok(Value::Sp(Sp::no_request(BetaBernoulliPsp { alpha, beta })))
    }

    fn children_can_aaa(&self) -> bool {
        true
    }

    fn aaa_kernel(&self) -> Option<Arc<dyn LKernel>> {
        Some(Arc::new(DefaultAaaKernel))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BetaBernoulliPsp {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaBernoulliPsp {
    fn heads_probability(&self, aux: &SpAux) -> f64 {
        let heads = aux.count(&Value::Bool(true)) as f64;
        (self.alpha + heads) / (self.alpha + self.beta + aux.total as f64)
    }
}

impl Psp for BetaBernoulliPsp {
    fn name(&self) -> &'static str {
        "beta_bernoulli"
    }

    fn simulate(&self, args: &Args, aux: &SpAux, rng: &mut dyn RngCore) -> Result<Value> {
        args.expect_arity("beta_bernoulli", 0)?;
        Ok(Value::Bool(rng.gen::<f64>() < self.heads_probability(aux)))
    }

    fn log_density(&self, value: &Value, _args: &Args, aux: &SpAux) -> f64 {
        let p = self.heads_probability(aux);
        match value.as_bool() {
            Some(true) => p.ln(),
            Some(false) => (1.0 - p).ln(),
            None => f64::NEG_INFINITY,
        }
    }

    fn incorporate(&self, value: &Value, _args: &Args, aux: &mut SpAux) {
        aux.increment(value);
    }

    fn unincorporate(&self, value: &Value, _args: &Args, aux: &mut SpAux) {
        aux.decrement(value);
    }

    fn is_random(&self) -> bool {
        true
    }

    fn log_density_of_counts(&self, aux: &SpAux) -> f64 {
        let heads = aux.count(&Value::Bool(true));
        let tails = aux.count(&Value::Bool(false));
        let mut total = 0.0;
        for i in 0..heads {
            total += (self.alpha + i as f64).ln();
        }
        for j in 0..tails {
            total += (self.beta + j as f64).ln();
        }
        for k in 0..heads + tails {
            total -= (self.alpha + self.beta + k as f64).ln();
        }
        total
    }

    fn can_enumerate_values(&self, _args: &Args) -> bool {
        true
    }

    fn enumerate_values(&self, _args: &Args, _aux: &SpAux) -> Vec<Value> {
        vec![Value::Bool(true), Value::Bool(false)]
    }
}

/// `(mem f)`: a procedure whose applications share one family per distinct
/// argument list.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemPsp;

impl Psp for MemPsp {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        args.expect_arity("mem", 1)?;
        if args.operands[0].as_procedure().is_none() {
            return Err(TraceError::NotAProcedure(args.operands[0].clone()));
        }
        Ok(Value::Sp(Arc::new(Sp {
            request: Arc::new(MemRequestPsp {
                shared: args.operand_nodes[0],
            }),
            output: Arc::new(EsrRefOutputPsp),
        })))
    }
}

/// Requests the family `(f args...)` keyed by the argument values.
#[derive(Clone, Copy, Debug)]
pub struct MemRequestPsp {
    pub shared: NodeId,
}

impl Psp for MemRequestPsp {
    fn name(&self) -> &'static str {
        "mem_request"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        let operands = args.operands.iter().cloned().map(Expr::Constant);
        let esr = Esr {
            id: Value::array(args.operands.iter().cloned()),
            expr: Expr::apply(Expr::Lookup(self.shared), operands),
        };
        Ok(Value::Request(Arc::new(Request { esrs: vec![esr] })))
    }
}

/// `(tag scope block value)`: returns `value` and files the random choices
/// that produced it under `scope`/`block`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TagPsp;

impl Psp for TagPsp {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        args.expect_arity("tag", 3)?;
        Ok(args.operands[2].clone())
    }

    fn is_scope_tag(&self) -> bool {
        true
    }
}

fn procedure(psp: impl Psp + 'static) -> Value {
    Value::Sp(Sp::no_request(psp))
}

pub fn add() -> Value {
    procedure(NumericPsp(NumericOp::Add))
}

pub fn sub() -> Value {
    procedure(NumericPsp(NumericOp::Sub))
}

pub fn mul() -> Value {
    procedure(NumericPsp(NumericOp::Mul))
}

pub fn square() -> Value {
    procedure(NumericPsp(NumericOp::Square))
}

pub fn normal() -> Value {
    procedure(NormalPsp)
}

pub fn uniform_continuous() -> Value {
    procedure(UniformContinuousPsp)
}

pub fn flip() -> Value {
    procedure(FlipPsp)
}

pub fn make_beta_bernoulli() -> Value {
    procedure(MakeBetaBernoulliPsp)
}

pub fn mem() -> Value {
    procedure(MemPsp)
}

pub fn tag() -> Value {
    procedure(TagPsp)
}

/// Builtin procedure by name.
pub fn builtin(name: &str) -> Option<Value> {
    Some(match name {
        "add" => add(),
        "sub" => sub(),
        "mul" => mul(),
        "square" => square(),
        "normal" => normal(),
        "uniform_continuous" => uniform_continuous(),
        "flip" => flip(),
        "make_beta_bernoulli" => make_beta_bernoulli(),
        "mem" => mem(),
        "tag" => tag(),
        _ => return None,
    })
}

/// `Expr` applying the builtin `name`.
pub fn call(name: &str, operands: impl IntoIterator<Item = Expr>) -> Expr {
    let op = builtin(name).unwrap_or_else(|| panic!("unknown builtin {name}"));
    Expr::apply(Expr::Constant(op), operands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn args(operands: &[f64]) -> Args {
        Args {
            node: NodeId(0),
            operand_nodes: operands.iter().enumerate().map(|(i, _)| NodeId(i as u32 + 1)).collect(),
            operands: operands.iter().map(|&x| Value::Number(x)).collect(),
            request: None,
            esr_nodes: smallvec![],
            esr_values: smallvec![],
        }
    }

    #[test]
    fn test_normal_log_density_at_mean() {
        let a = args(&[1.0, 2.0]);
        let lp = NormalPsp.log_density(&Value::Number(1.0), &a, &SpAux::default());
        let expected = -0.5 * (2.0 * PI).ln() - 2.0f64.ln();
        assert!((lp - expected).abs() < 1e-12);
    }

    #[test]
    fn test_normal_rejects_nonpositive_scale() {
        let a = args(&[0.0, 0.0]);
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        assert!(NormalPsp.simulate(&a, &SpAux::default(), &mut rng).is_err());
        assert_eq!(
            NormalPsp.log_density(&Value::Number(0.0), &a, &SpAux::default()),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_beta_bernoulli_counts_density_matches_sequential_predictive() {
        let coin = BetaBernoulliPsp { alpha: 2.0, beta: 3.0 };
        let mut aux = SpAux::default();
        let a = args(&[]);
        let mut sequential = 0.0;
        for v in [true, false, true, true] {
            let v = Value::Bool(v);
            sequential += coin.log_density(&v, &a, &aux);
            coin.incorporate(&v, &a, &mut aux);
        }
        assert!((coin.log_density_of_counts(&aux) - sequential).abs() < 1e-12);
        assert_eq!(aux.total, 4);
    }

    #[test]
    fn test_uniform_density_outside_support() {
        let a = args(&[0.0, 2.0]);
        let aux = SpAux::default();
        assert_eq!(UniformContinuousPsp.log_density(&Value::Number(1.0), &a, &aux), -(2.0f64.ln()));
        assert_eq!(
            UniformContinuousPsp.log_density(&Value::Number(3.0), &a, &aux),
            f64::NEG_INFINITY
        );
    }
}
