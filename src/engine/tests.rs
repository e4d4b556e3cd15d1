use crate::arena::NodeId;
use crate::builtins::{self, call};
use crate::check::{check_torus, check_whole};
use crate::engine::{detach_and_extract, regen_and_attach, Mode};
use crate::error::{Result, TraceError};
use crate::expr::Expr;
use crate::kernel::GKernel;
use crate::psp::{Args, DeterministicLKernel, Psp, Sp, SpAux};
use crate::scaffold::construct_scaffold;
use crate::trace::Trace;
use crate::value::Value;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn rng() -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(7)
}

fn normal(mu: Expr, sigma: f64) -> Expr {
    call("normal", [mu, Expr::constant(sigma)])
}

/// mu ~ N(0, 1); y ~ N(mu, 1)
fn gaussian_pair(rng: &mut ChaCha8Rng) -> (Trace, NodeId, NodeId) {
    let mut t = Trace::new();
    let mu = t.assume(1, &normal(Expr::constant(0.0), 1.0), rng).unwrap();
    let y = t.assume(2, &normal(Expr::Lookup(mu), 1.0), rng).unwrap();
    (t, mu, y)
}

/// Deterministic identity that fails once armed.
#[derive(Debug)]
struct Tripwire {
    armed: Arc<AtomicBool>,
}

impl Psp for Tripwire {
    fn name(&self) -> &'static str {
        "tripwire"
    }

    fn simulate(&self, args: &Args, _aux: &SpAux, _rng: &mut dyn RngCore) -> Result<Value> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(TraceError::invalid("tripwire", "armed"));
        }
        Ok(args.operands[0].clone())
    }
}

#[test]
fn test_scaffold_classifies_child_as_absorbing() {
    let mut r = rng();
    let (t, mu, y) = gaussian_pair(&mut r);
    let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);

    assert!(sc.is_resampling(mu));
    assert!(sc.is_absorbing(y));
    assert!(sc.is_absorbing(t.request_node(y)));
    // mu only reaches the border through its lookup.
    assert_eq!(sc.regen_count(mu), 1);
    assert!(sc.brush().is_empty());
    assert!(sc.border().iter().flatten().all(|n| *n != mu));
}

#[test]
fn test_detach_then_restore_is_identity() {
    let mut r = rng();
    let (mut t, mu, y) = gaussian_pair(&mut r);
    let mu_before = t.value(mu).clone();
    let y_before = t.value(y).clone();
    let score_before = t.global_log_score();

    let mut sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    let (rho, db) = detach_and_extract(&mut t, &mut sc);
    check_torus(&t, &sc);
    assert!(!t.is_active(mu));
    assert!(t.is_active(y), "absorbing nodes keep their values");
    assert!(!t.unconstrained_choices().contains(&mu));

    let xi = regen_and_attach(&mut t, &mut sc, Mode::Restore(&db), &mut r).unwrap();
    check_whole(&t, &sc);
    assert_eq!(t.value(mu), &mu_before);
    assert_eq!(t.value(y), &y_before);
    assert!((rho.total() - xi.total()).abs() < 1e-12);
    assert!((rho.absorbed - xi.absorbed).abs() < 1e-12);
    assert!((t.global_log_score() - score_before).abs() < 1e-12);
    assert_eq!(t.num_unconstrained_choices(), 2);
}

#[test]
fn test_proposal_delta_matches_score_change() {
    let mut r = rng();
    let (mut t, mu, y) = gaussian_pair(&mut r);
    t.observe(2, Value::Number(1.5), &mut r).unwrap();
    let before = t.global_log_score();

    let mut kernel = GKernel::new(true);
    let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    let proposal = kernel.propose(&mut t, sc, &mut r).unwrap();
    kernel.accept(&mut t);

    assert_eq!(t.value(y), &Value::Number(1.5));
    assert!((t.global_log_score() - before - proposal.delta()).abs() < 1e-9);
}

#[test]
fn test_reject_restores_values_and_choices() {
    let mut r = rng();
    let (mut t, mu, y) = gaussian_pair(&mut r);
    let mu_before = t.value(mu).clone();
    let y_before = t.value(y).clone();
    let nodes_before = t.graph().len();

    let mut kernel = GKernel::new(true);
    let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    kernel.propose(&mut t, sc, &mut r).unwrap();
    assert_ne!(t.value(mu), &mu_before);
    kernel.reject(&mut t, &mut r);

    assert_eq!(t.value(mu), &mu_before);
    assert_eq!(t.value(y), &y_before);
    assert_eq!(t.graph().len(), nodes_before);
    assert_eq!(
        t.unconstrained_choices().iter().copied().collect::<Vec<_>>(),
        vec![mu, y]
    );
}

#[test]
fn test_deterministic_child_is_resampled() {
    // A -> B (deterministic) -> C (random): B cannot absorb, C can.
    let mut r = rng();
    let mut t = Trace::new();
    let a = t.assume(1, &normal(Expr::constant(0.0), 1.0), &mut r).unwrap();
    let b = t
        .assume(2, &call("add", [Expr::Lookup(a), Expr::constant(1.0)]), &mut r)
        .unwrap();
    let c = t.assume(3, &normal(Expr::Lookup(b), 1.0), &mut r).unwrap();

    let sc = construct_scaffold(&t, &[BTreeSet::from([a])]);
    assert!(sc.is_resampling(b));
    assert!(sc.is_absorbing(c));

    let mut kernel = GKernel::new(true);
    kernel.propose(&mut t, sc, &mut r).unwrap();
    kernel.accept(&mut t);
    let a_val = t.value(a).as_number().unwrap();
    assert_eq!(t.value(b).as_number(), Some(a_val + 1.0));
}

#[test]
fn test_failed_regen_rolls_back() {
    let mut r = rng();
    let mut t = Trace::new();
    let armed = Arc::new(AtomicBool::new(false));
    let wire = Value::Sp(Sp::no_request(Tripwire { armed: armed.clone() }));

    let mu = t.assume(1, &normal(Expr::constant(0.0), 1.0), &mut r).unwrap();
    let w = t
        .assume(2, &Expr::apply(Expr::Constant(wire), [Expr::Lookup(mu)]), &mut r)
        .unwrap();
    let mu_before = t.value(mu).clone();
    let nodes_before = t.graph().len();

    armed.store(true, Ordering::SeqCst);
    let mut kernel = GKernel::new(true);
    let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    let err = kernel.propose(&mut t, sc, &mut r).unwrap_err();
    assert!(matches!(err, TraceError::InvalidArgument { procedure: "tripwire", .. }));

    assert_eq!(t.value(mu), &mu_before);
    assert_eq!(t.value(w), &mu_before);
    assert_eq!(t.graph().len(), nodes_before);
    assert!(t.unconstrained_choices().contains(&mu));

    // The restored trace is still usable.
    armed.store(false, Ordering::SeqCst);
    let mut kernel = GKernel::new(true);
    let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    kernel.propose(&mut t, sc, &mut r).unwrap();
    kernel.accept(&mut t);
    assert_eq!(t.value(w), t.value(mu));
}

#[test]
fn test_resampled_requester_rebuilds_brush_family() {
    let mut r = rng();
    let mut t = Trace::new();
    let f = t
        .assume(1, &call("mem", [Expr::constant(builtins::flip())]), &mut r)
        .unwrap();
    let p = t
        .assume(2, &call("uniform_continuous", [Expr::constant(0.0), Expr::constant(1.0)]), &mut r)
        .unwrap();
    let app = t
        .assume(3, &Expr::apply(Expr::Lookup(f), [Expr::Lookup(p)]), &mut r)
        .unwrap();
    let family = t.esr_parents(app)[0];
    assert_eq!(t.value(app), t.value(family));

    let sc = construct_scaffold(&t, &[BTreeSet::from([p])]);
    assert!(sc.is_resampling(t.request_node(app)));
    assert!(sc.is_resampling(app));
    assert!(sc.is_brush(family));

    let mut kernel = GKernel::new(true);
    kernel.propose(&mut t, sc, &mut r).unwrap();
    let fresh = t.esr_parents(app)[0];
    assert_ne!(fresh, family);
    assert!(!t.is_active(family));
    kernel.reject(&mut t, &mut r);
    assert_eq!(t.esr_parents(app)[0], family);
    assert!(t.is_active(family));
    assert!(!t.contains_node(fresh));

    let sc = construct_scaffold(&t, &[BTreeSet::from([p])]);
    kernel.propose(&mut t, sc, &mut r).unwrap();
    let fresh = t.esr_parents(app)[0];
    assert_eq!(kernel.accept(&mut t), 1);
    assert!(t.contains_node(fresh));
    assert_eq!(t.value(app), t.value(fresh));
    assert_eq!(t.num_unconstrained_choices(), 2);
}

#[test]
fn test_aaa_weight_is_counts_density_ratio() {
    let mut r = rng();
    let mut t = Trace::new();
    let alpha = t
        .assume(1, &call("uniform_continuous", [Expr::constant(0.5), Expr::constant(5.0)]), &mut r)
        .unwrap();
    let coin = t
        .assume(2, &call("make_beta_bernoulli", [Expr::Lookup(alpha), Expr::constant(1.0)]), &mut r)
        .unwrap();
    let mut flips = Vec::new();
    for (i, heads) in [true, true, false, true].into_iter().enumerate() {
        let id = 10 + i as u64;
        flips.push(t.assume(id, &Expr::apply(Expr::Lookup(coin), []), &mut r).unwrap());
        t.observe(id, Value::Bool(heads), &mut r).unwrap();
    }
    let aux = t.aux_at(flips[0]).clone();
    assert_eq!(aux.total, 4);

    let sc = construct_scaffold(&t, &[BTreeSet::from([alpha])]);
    assert!(sc.is_aaa(coin));
    assert_eq!(sc.regen_count(coin), 1);
    assert!(flips.iter().all(|&n| sc.entry(n).is_none()));

    let counts = |a: f64| builtins::BetaBernoulliPsp { alpha: a, beta: 1.0 }.log_density_of_counts(&aux);
    let old = counts(t.value(alpha).as_number().unwrap());
    let mut kernel = GKernel::new(true);
    let proposal = kernel.propose(&mut t, sc, &mut r).unwrap();
    let new = counts(t.value(alpha).as_number().unwrap());
    assert!((proposal.log_weight() - (new - old)).abs() < 1e-9);
    kernel.accept(&mut t);

    assert_eq!(t.aux_at(flips[0]), &aux);
    assert!(t.aaa_aux(coin).is_none());
}

#[test]
fn test_observe_pins_value_and_unobserve_releases() {
    let mut r = rng();
    let (mut t, mu, y) = gaussian_pair(&mut r);
    let w = t.observe(2, Value::Number(0.25), &mut r).unwrap();
    assert!(t.is_constrained(y));
    assert!(!t.unconstrained_choices().contains(&y));
    let expected = normal_log_density(0.25, t.value(mu).as_number().unwrap(), 1.0);
    assert!((w - expected).abs() < 1e-12);

    let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    assert!(sc.is_absorbing(y));

    t.unobserve(2).unwrap();
    assert!(!t.is_constrained(y));
    assert_eq!(t.value(y), &Value::Number(0.25));
    assert!(t.unconstrained_choices().contains(&y));
}

#[test]
fn test_observing_through_lookup_updates_alias() {
    let mut r = rng();
    let mut t = Trace::new();
    let mu = t.assume(1, &normal(Expr::constant(0.0), 1.0), &mut r).unwrap();
    let alias = t.assume(2, &Expr::Lookup(mu), &mut r).unwrap();
    t.observe(2, Value::Number(3.0), &mut r).unwrap();
    assert_eq!(t.value(mu), &Value::Number(3.0));
    assert_eq!(t.value(alias), &Value::Number(3.0));
    assert!(t.is_constrained(mu));
    assert!(matches!(
        t.observe(1, Value::Number(1.0), &mut r),
        Err(TraceError::AlreadyConstrained)
    ));
}

#[test]
fn test_propagation_refuses_random_dependents() {
    let mut r = rng();
    let (mut t, mu, y) = gaussian_pair(&mut r);
    let y_before = t.value(y).clone();
    let err = crate::engine::constrain(&mut t, mu, Value::Number(2.0), &mut r, true).unwrap_err();
    assert!(matches!(err, TraceError::ConstraintPropagation(_)));
    assert!(!t.is_constrained(mu));
    assert_eq!(t.value(y), &y_before);
}

fn normal_log_density(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * (2.0 * std::f64::consts::PI).ln() - sigma.ln() - 0.5 * z * z
}

#[test]
fn test_detach_conserves_regen_counts_over_many_steps() {
    let mut r = rng();
    let (mut t, mu, _) = gaussian_pair(&mut r);
    let b = t
        .assume(3, &call("square", [Expr::Lookup(mu)]), &mut r)
        .unwrap();
    let mut kernel = GKernel::new(true);
    for _ in 0..200 {
        let sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
        kernel.propose(&mut t, sc, &mut r).unwrap();
        if r.gen::<bool>() {
            kernel.accept(&mut t);
        } else {
            kernel.reject(&mut t, &mut r);
        }
        kernel.reset();
        let m = t.value(mu).as_number().unwrap();
        assert_eq!(t.value(b).as_number(), Some(m * m));
    }
}

#[test]
fn test_deterministic_principal_consults_child_absorption() {
    // A (const 2) -> B (square A) -> C (add B 3)
    let mut r = rng();
    let mut t = Trace::new();
    let a = t.assume(1, &Expr::constant(2.0), &mut r).unwrap();
    let b = t.assume(2, &call("square", [Expr::Lookup(a)]), &mut r).unwrap();
    let c = t
        .assume(3, &call("add", [Expr::Lookup(b), Expr::constant(3.0)]), &mut r)
        .unwrap();

    let mut sc = construct_scaffold(&t, &[BTreeSet::from([b])]);
    assert!(sc.is_resampling(b));
    assert!(sc.is_resampling(c), "add cannot absorb a changed operand");
    assert!(sc.entry(a).is_none());

    let (rho, db) = detach_and_extract(&mut t, &mut sc);
    check_torus(&t, &sc);
    assert!(!t.is_active(c));
    assert_eq!(rho.total(), 0.0);
    regen_and_attach(&mut t, &mut sc, Mode::Restore(&db), &mut r).unwrap();
    check_whole(&t, &sc);
    assert_eq!(t.value(b), &Value::Number(4.0));
    assert_eq!(t.value(c), &Value::Number(7.0));
}

/// alpha ~ U(0.5, 5) drives a collapsed coin with three observed flips and
/// z ~ N(alpha, 1). f = (mem flip) is applied twice to p ~ U(0, 1), sharing
/// one family, and once to 0.3 with the result observed. y ~ N(p, 1) is
/// observed too.
fn mixed_model(rng: &mut ChaCha8Rng) -> Trace {
    let mut t = Trace::new();
    let alpha = t
        .assume(1, &call("uniform_continuous", [Expr::constant(0.5), Expr::constant(5.0)]), rng)
        .unwrap();
    let coin = t
        .assume(2, &call("make_beta_bernoulli", [Expr::Lookup(alpha), Expr::constant(1.0)]), rng)
        .unwrap();
    for (id, heads) in [(3, true), (4, false), (5, true)] {
        t.assume(id, &Expr::apply(Expr::Lookup(coin), []), rng).unwrap();
        t.observe(id, Value::Bool(heads), rng).unwrap();
    }
    t.assume(6, &normal(Expr::Lookup(alpha), 1.0), rng).unwrap();

    let f = t
        .assume(7, &call("mem", [Expr::constant(builtins::flip())]), rng)
        .unwrap();
    let p = t
        .assume(8, &call("uniform_continuous", [Expr::constant(0.0), Expr::constant(1.0)]), rng)
        .unwrap();
    t.assume(9, &Expr::apply(Expr::Lookup(f), [Expr::Lookup(p)]), rng).unwrap();
    t.assume(10, &Expr::apply(Expr::Lookup(f), [Expr::Lookup(p)]), rng).unwrap();
    t.assume(11, &Expr::apply(Expr::Lookup(f), [Expr::constant(0.3)]), rng).unwrap();
    t.observe(11, Value::Bool(true), rng).unwrap();
    t.assume(12, &normal(Expr::Lookup(p), 1.0), rng).unwrap();
    t.observe(12, Value::Number(0.2), rng).unwrap();
    t
}

#[derive(Debug, PartialEq)]
struct NodeState {
    value: Option<Value>,
    esr_parents: Vec<NodeId>,
    children: BTreeSet<NodeId>,
    num_requests: u32,
    aux: Option<SpAux>,
}

fn snapshot(t: &Trace) -> BTreeMap<NodeId, NodeState> {
    t.graph()
        .ids()
        .map(|id| {
            let state = NodeState {
                value: t.try_value(id).cloned(),
                esr_parents: t.esr_parents(id).to_vec(),
                children: t.children(id).clone(),
                num_requests: t.num_requests(id),
                aux: t.try_made_sp_record(id).map(|r| r.aux.clone()),
            };
            (id, state)
        })
        .collect()
}

/// Every node's request count equals the number of ESR edges into it.
fn assert_request_counts(t: &Trace) {
    let mut edges: BTreeMap<NodeId, u32> = BTreeMap::new();
    for id in t.graph().ids() {
        for &parent in t.esr_parents(id) {
            *edges.entry(parent).or_insert(0) += 1;
        }
    }
    for id in t.graph().ids() {
        assert_eq!(
            t.num_requests(id),
            edges.get(&id).copied().unwrap_or(0),
            "request count of node {}",
            id.0
        );
    }
}

#[test]
fn test_detach_restore_round_trip_on_mixed_model() {
    let mut r = rng();
    let mut t = mixed_model(&mut r);
    assert_request_counts(&t);
    let choices: Vec<NodeId> = t.unconstrained_choices().iter().copied().collect();
    assert_eq!(choices.len(), 4);

    for node in choices {
        let before = snapshot(&t);
        let unconstrained = t.unconstrained_choices().clone();
        let constrained = t.constrained_choices().clone();
        let score = t.global_log_score();

        let mut sc = construct_scaffold(&t, &[BTreeSet::from([node])]);
        let (rho, db) = detach_and_extract(&mut t, &mut sc);
        check_torus(&t, &sc);
        assert_request_counts(&t);

        let xi = regen_and_attach(&mut t, &mut sc, Mode::Restore(&db), &mut r).unwrap();
        check_whole(&t, &sc);
        assert_request_counts(&t);
        assert!(
            (rho.total() - xi.total()).abs() < 1e-9,
            "node {} aaa={:?} {rho:?} {xi:?}",
            node.0,
            sc.aaa()
        );
        assert!((rho.absorbed - xi.absorbed).abs() < 1e-9);
        assert_eq!(snapshot(&t), before, "node {}", node.0);
        assert_eq!(t.unconstrained_choices(), &unconstrained);
        assert_eq!(t.constrained_choices(), &constrained);
        assert!((t.global_log_score() - score).abs() < 1e-9);
    }
}

#[test]
fn test_restore_adds_local_kernel_weight() {
    let mut r = rng();
    let (mut t, mu, y) = gaussian_pair(&mut r);
    let m = t.value(mu).as_number().unwrap();
    let yv = t.value(y).as_number().unwrap();
    let mut sc = construct_scaffold(&t, &[BTreeSet::from([mu])]);
    sc.set_lkernel(mu, Arc::new(DeterministicLKernel { value: Value::Number(0.5) }));

    let (rho, db) = detach_and_extract(&mut t, &mut sc);
    let xi = regen_and_attach(&mut t, &mut sc, Mode::Restore(&db), &mut r).unwrap();
    assert_eq!(t.value(mu), &Value::Number(m));
    // Kernel weight of the restored value plus the absorbing child.
    let expected = normal_log_density(m, 0.0, 1.0) + normal_log_density(yv, m, 1.0);
    assert!((xi.absorbed - expected).abs() < 1e-9);
    assert!((rho.absorbed - xi.absorbed).abs() < 1e-12);
    assert!((rho.total() - xi.total()).abs() < 1e-12);
}

#[test]
fn test_proposal_delta_matches_score_on_mixed_model() {
    let mut r = rng();
    let mut t = mixed_model(&mut r);
    let mut kernel = GKernel::new(true);
    for step in 0..40 {
        let choices: Vec<NodeId> = t.unconstrained_choices().iter().copied().collect();
        let node = choices[step % choices.len()];
        let before = t.global_log_score();

        let sc = construct_scaffold(&t, &[BTreeSet::from([node])]);
        let proposal = kernel.propose(&mut t, sc, &mut r).unwrap();
        let after = t.global_log_score();
        assert!(
            (after - before - proposal.delta()).abs() < 1e-9,
            "step {step}: score moved {} but delta is {}",
            after - before,
            proposal.delta()
        );
        if step % 2 == 0 {
            kernel.accept(&mut t);
        } else {
            kernel.reject(&mut t, &mut r);
            assert!((t.global_log_score() - before).abs() < 1e-9);
        }
        kernel.reset();
        assert_request_counts(&t);
    }
}

#[test]
fn test_shared_family_survives_partial_detach() {
    // f = (mem normal); a = (f (mul p 0) 1); b = (f (mul q 0) 1)
    let mut r = rng();
    let mut t = Trace::new();
    let f = t
        .assume(1, &call("mem", [Expr::constant(builtins::normal())]), &mut r)
        .unwrap();
    let unit = || call("uniform_continuous", [Expr::constant(0.0), Expr::constant(1.0)]);
    let p = t.assume(2, &unit(), &mut r).unwrap();
    let q = t.assume(3, &unit(), &mut r).unwrap();
    let zeroed = |src: NodeId| call("mul", [Expr::Lookup(src), Expr::constant(0.0)]);
    let a = t
        .assume(4, &Expr::apply(Expr::Lookup(f), [zeroed(p), Expr::constant(1.0)]), &mut r)
        .unwrap();
    let b = t
        .assume(5, &Expr::apply(Expr::Lookup(f), [zeroed(q), Expr::constant(1.0)]), &mut r)
        .unwrap();
    let family = t.esr_parents(a)[0];
    assert_eq!(t.esr_parents(b), &[family]);
    assert_eq!(t.num_requests(family), 2);
    let family_value = t.value(family).clone();

    // Only a's request is resampled; b keeps the family alive.
    let mut sc = construct_scaffold(&t, &[BTreeSet::from([p])]);
    assert!(sc.is_resampling(t.request_node(a)));
    assert!(!sc.is_brush(family));
    assert!(sc.entry(family).is_none());
    let (rho, db) = detach_and_extract(&mut t, &mut sc);
    check_torus(&t, &sc);
    assert!(t.is_active(family));
    assert_eq!(t.num_requests(family), 1);
    assert_eq!(db.num_families(), 0);
    assert_request_counts(&t);

    let xi = regen_and_attach(&mut t, &mut sc, Mode::Restore(&db), &mut r).unwrap();
    check_whole(&t, &sc);
    assert_eq!(t.esr_parents(a), &[family]);
    assert_eq!(t.num_requests(family), 2);
    assert!((rho.total() - xi.total()).abs() < 1e-12);

    // Both requests are resampled: the family is brush and leaves with them.
    let mut sc = construct_scaffold(&t, &[BTreeSet::from([p, q])]);
    assert!(sc.is_brush(family));
    let (rho, db) = detach_and_extract(&mut t, &mut sc);
    check_torus(&t, &sc);
    assert!(!t.is_active(family));
    assert_eq!(t.num_requests(family), 0);
    assert_eq!(db.num_families(), 1);
    assert_request_counts(&t);

    let xi = regen_and_attach(&mut t, &mut sc, Mode::Restore(&db), &mut r).unwrap();
    check_whole(&t, &sc);
    assert!(t.is_active(family));
    assert_eq!(t.value(family), &family_value);
    assert_eq!(t.esr_parents(b), &[family]);
    assert_eq!(t.num_requests(family), 2);
    assert!((rho.total() - xi.total()).abs() < 1e-12);
}
