use crate::infer::BlockSelector;
use crate::scope::default_scope;
use crate::value::Value;

/// Inference run settings.
#[derive(Clone, Debug)]
pub struct InferConfig {
    pub scope: Value,
    pub block: BlockSelector,
    pub transitions: usize,
    pub seed: u64,
    /// Run `check_torus`/`check_whole` after every traversal.
    pub check: bool,
}

impl Default for InferConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            block: BlockSelector::One,
            transitions: 1000,
            seed: 0,
            check: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl InferConfig {
    /// Defaults overridden by `DRGTRACE_TRANSITIONS`, `DRGTRACE_SEED` and
    /// `DRGTRACE_CHECK` (`1`/`true`).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<usize>("DRGTRACE_TRANSITIONS") {
            cfg.transitions = n;
        }
        if let Some(seed) = env_parse::<u64>("DRGTRACE_SEED") {
            cfg.seed = seed;
        }
        if let Ok(v) = std::env::var("DRGTRACE_CHECK") {
            cfg.check = matches!(v.trim(), "1" | "true" | "yes");
        }
        cfg
    }
}
