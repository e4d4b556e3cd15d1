use drgtrace::builtins::{self, call};
use drgtrace::{Expr, Trace, TraceError, Value};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn std_normal() -> Expr {
    call("normal", [Expr::constant(0.0), Expr::constant(1.0)])
}

#[test]
fn test_report_and_predict() {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut t = Trace::new();
    let x = t.assume(1, &Expr::constant(2.0), &mut rng).unwrap();
    let v = t
        .predict(2, &call("mul", [Expr::Lookup(x), Expr::constant(3.0)]), &mut rng)
        .unwrap();
    assert_eq!(v, Value::Number(6.0));
    assert_eq!(t.report(2).unwrap(), Value::Number(6.0));
    assert_eq!(t.num_unconstrained_choices(), 0);
    assert_eq!(t.global_log_score(), 0.0);
}

#[test]
fn test_directive_errors() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let mut t = Trace::new();
    let mu = t.assume(1, &std_normal(), &mut rng).unwrap();
    t.assume(2, &call("square", [Expr::Lookup(mu)]), &mut rng).unwrap();

    assert!(matches!(
        t.assume(1, &std_normal(), &mut rng),
        Err(TraceError::DuplicateDirective(1))
    ));
    assert!(matches!(t.report(9), Err(TraceError::UnknownDirective(9))));
    assert!(matches!(
        t.observe(2, Value::Number(4.0), &mut rng),
        Err(TraceError::ConstrainDeterministic)
    ));
    assert!(matches!(t.forget(1), Err(TraceError::DirectiveInUse(1))));
    assert!(matches!(
        t.assume(3, &call("normal", [Expr::constant(0.0), Expr::constant(-1.0)]), &mut rng),
        Err(TraceError::InvalidArgument { procedure: "normal", .. })
    ));
    assert!(matches!(
        t.assume(4, &Expr::apply(Expr::constant(1.0), []), &mut rng),
        Err(TraceError::NotAProcedure(_))
    ));
    assert!(t.directive_root(3).is_err());
}

#[test]
fn test_failed_directive_leaves_no_nodes() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut t = Trace::new();
    t.assume(1, &std_normal(), &mut rng).unwrap();
    let nodes = t.graph().len();
    let bad = call(
        "add",
        [std_normal(), call("flip", [Expr::constant(2.0)])],
    );
    assert!(t.assume(2, &bad, &mut rng).is_err());
    assert_eq!(t.graph().len(), nodes);
    assert_eq!(t.num_unconstrained_choices(), 1);
}

#[test]
fn test_mem_family_shared_until_last_requester_forgotten() {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let mut t = Trace::new();
    let f = t
        .assume(1, &call("mem", [Expr::constant(builtins::normal())]), &mut rng)
        .unwrap();
    let apply_f = || Expr::apply(Expr::Lookup(f), [Expr::constant(0.0), Expr::constant(1.0)]);
    let a = t.assume(2, &apply_f(), &mut rng).unwrap();
    let b = t.assume(3, &apply_f(), &mut rng).unwrap();

    let family = t.esr_parents(a)[0];
    assert_eq!(t.esr_parents(b), &[family]);
    assert_eq!(t.num_requests(family), 2);
    assert_eq!(t.value(a), t.value(b));
    assert_eq!(t.num_unconstrained_choices(), 1);

    t.forget(3).unwrap();
    assert!(t.is_active(family));
    assert_eq!(t.num_requests(family), 1);

    t.forget(2).unwrap();
    assert!(!t.contains_node(family));
    assert_eq!(t.num_unconstrained_choices(), 0);

    t.forget(1).unwrap();
    assert!(t.graph().is_empty());
}

#[test]
fn test_distinct_mem_arguments_get_distinct_families() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let mut t = Trace::new();
    let f = t
        .assume(1, &call("mem", [Expr::constant(builtins::flip())]), &mut rng)
        .unwrap();
    let a = t
        .assume(2, &Expr::apply(Expr::Lookup(f), [Expr::constant(0.2)]), &mut rng)
        .unwrap();
    let b = t
        .assume(3, &Expr::apply(Expr::Lookup(f), [Expr::constant(0.7)]), &mut rng)
        .unwrap();
    assert_ne!(t.esr_parents(a)[0], t.esr_parents(b)[0]);
    assert_eq!(t.num_unconstrained_choices(), 2);
}

#[test]
fn test_observe_through_mem_reference() {
    let mut rng = ChaCha8Rng::seed_from_u64(6);
    let mut t = Trace::new();
    let f = t
        .assume(1, &call("mem", [Expr::constant(builtins::flip())]), &mut rng)
        .unwrap();
    let a = t
        .assume(2, &Expr::apply(Expr::Lookup(f), [Expr::constant(0.5)]), &mut rng)
        .unwrap();
    let family = t.esr_parents(a)[0];

    let w = t.observe(2, Value::Bool(true), &mut rng).unwrap();
    assert!((w - 0.5f64.ln()).abs() < 1e-12);
    assert!(t.is_constrained(family));
    assert_eq!(t.value(a), &Value::Bool(true));
    assert!(t.is_observation(a));

    t.unobserve(2).unwrap();
    assert!(!t.is_constrained(family));
    assert!(!t.is_observation(a));
}

#[test]
fn test_forget_observation_releases_constraint() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut t = Trace::new();
    let mu = t.assume(1, &std_normal(), &mut rng).unwrap();
    let y = t
        .assume(2, &call("normal", [Expr::Lookup(mu), Expr::constant(1.0)]), &mut rng)
        .unwrap();
    t.observe(2, Value::Number(0.5), &mut rng).unwrap();
    assert_eq!(t.constrained_choices().len(), 1);

    t.forget(2).unwrap();
    assert!(t.constrained_choices().is_empty());
    assert!(!t.contains_node(y));
    assert!(t.children(mu).is_empty());
    assert_eq!(t.num_unconstrained_choices(), 1);
}

#[test]
fn test_global_score_is_joint_of_exchangeable_flips() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let mut t = Trace::new();
    let maker = call("make_beta_bernoulli", [Expr::constant(1.0), Expr::constant(1.0)]);
    let coin = t.assume(1, &maker, &mut rng).unwrap();
    for id in [2, 3] {
        t.assume(id, &Expr::apply(Expr::Lookup(coin), []), &mut rng).unwrap();
        t.observe(id, Value::Bool(true), &mut rng).unwrap();
    }
    // P(heads, heads) = 1/2 * 2/3 under a uniform prior on the weight.
    let joint = (1.0f64 / 3.0).ln();
    assert!((t.global_log_score() - joint).abs() < 1e-12);
}

#[test]
fn test_lookup_of_forgotten_node_is_an_error() {
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let mut t = Trace::new();
    let x = t.assume(1, &std_normal(), &mut rng).unwrap();
    t.forget(1).unwrap();
    assert!(t.graph().is_empty());

    let stale = call("add", [Expr::constant(1.0), Expr::Lookup(x)]);
    let err = t.assume(2, &stale, &mut rng).unwrap_err();
    assert!(matches!(err, TraceError::DanglingLookup(n) if n == x));
    assert!(t.graph().is_empty());
    assert!(t.directive_root(2).is_err());
}
