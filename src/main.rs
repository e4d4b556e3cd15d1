use drgtrace::builtins::call;
use drgtrace::config::InferConfig;
use drgtrace::infer::run_mh;
use drgtrace::{Expr, Trace, Value};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn run(cfg: &InferConfig) -> drgtrace::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let mut trace = Trace::new();

    // Gaussian mean with two noisy observations.
    let mu = trace.assume(1, &call("normal", [Expr::constant(0.0), Expr::constant(1.0)]), &mut rng)?;
    for (i, y) in [(10, 1.8), (11, 2.2)] {
        trace.assume(i, &call("normal", [Expr::Lookup(mu), Expr::constant(0.5)]), &mut rng)?;
        trace.observe(i, Value::Number(y), &mut rng)?;
    }

    // Collapsed coin whose prior weight is itself uncertain.
    let weight = trace.assume(
        2,
        &call("uniform_continuous", [Expr::constant(0.5), Expr::constant(5.0)]),
        &mut rng,
    )?;
    let coin = trace.assume(
        3,
        &call("make_beta_bernoulli", [Expr::Lookup(weight), Expr::constant(1.0)]),
        &mut rng,
    )?;
    for (i, heads) in [(20, true), (21, true), (22, false), (23, true)] {
        trace.assume(i, &Expr::apply(Expr::Lookup(coin), []), &mut rng)?;
        trace.observe(i, Value::Bool(heads), &mut rng)?;
    }

    let mut mean_mu = 0.0;
    let rounds = 10usize;
    let per_round = InferConfig {
        transitions: (cfg.transitions / rounds).max(1),
        ..cfg.clone()
    };
    for _ in 0..rounds {
        run_mh(&mut trace, &per_round, &mut rng)?;
        mean_mu += trace.report(1)?.as_number().unwrap_or(0.0);
    }
    info!(
        mu = mean_mu / rounds as f64,
        weight = %trace.report(2)?,
        log_score = trace.global_log_score(),
        nodes = trace.graph().len(),
        "posterior summary"
    );
    println!("posterior mean of mu ~ {:.3}", mean_mu / rounds as f64);
    println!("coin weight: {}", trace.report(2)?);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = InferConfig::from_env();
    info!(transitions = cfg.transitions, seed = cfg.seed, check = cfg.check, "starting");
    if let Err(e) = run(&cfg) {
        error!(error = %e, "inference failed");
        std::process::exit(1);
    }
}
