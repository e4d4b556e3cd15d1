//! Detach/regen engine
//!
//! `detach_and_extract` and `regen_and_attach` are the two traversals over a
//! scaffold. Each reports the log density it removed or added, split into
//! the part that enters the Metropolis-Hastings ratio (`absorbed`: rescored
//! border nodes, local-kernel weights, constraints) and the density of the
//! random choices that were simulated or unapplied (`resampled`).

pub mod detach;
pub mod omega;
pub mod regen;

#[cfg(test)]
mod tests;

pub use detach::{detach_and_extract, detach_and_extract_set, unconstrain};
pub use omega::OmegaDb;
pub use regen::{constrain, regen_and_attach, regen_and_attach_set, Mode};

use std::ops::AddAssign;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Density {
    pub absorbed: f64,
    pub resampled: f64,
}

impl Density {
    pub fn total(&self) -> f64 {
        self.absorbed + self.resampled
    }
}

impl AddAssign for Density {
    fn add_assign(&mut self, rhs: Self) {
        self.absorbed += rhs.absorbed;
        self.resampled += rhs.resampled;
    }
}
