use itertools::Itertools;

use crate::{
    chain::{Chain, CopyNumber},
    error::{DiagnosticsError, Result},
};

/// Per-target frequencies of each copy number after burn-in.
///
/// Draws are thinned by taking every `autocor_slice`-th draw after burn-in,
/// so that strongly autocorrelated neighbours are not counted repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyNumberPosterior {
    support: Vec<CopyNumber>,
    // target-major, `support.len()` entries per target
    probabilities: Vec<f64>,
    n_targets: usize,
    n_draws: usize,
}

impl CopyNumberPosterior {
    pub fn from_chain(chain: &Chain, burn_in: usize, autocor_slice: usize) -> Result<Self> {
        if burn_in >= chain.len() {
            return Err(DiagnosticsError::EmptyChain);
        }
        let iterations = (burn_in..chain.len())
            .step_by(autocor_slice.max(1))
            .collect_vec();
        let n_targets = chain.n_targets();
        let support = iterations
            .iter()
            .flat_map(|&i| chain.copy_numbers(i).iter().copied())
            .sorted_unstable()
            .dedup()
            .collect_vec();

        let mut probabilities = vec![0f64; n_targets * support.len()];
        let weight = (iterations.len() as f64).recip();
        for &i in iterations.iter() {
            for (target, copy_number) in chain.copy_numbers(i).iter().enumerate() {
                // Every value is in the support by construction.
                let Ok(pos) = support.binary_search(copy_number) else {
                    continue;
                };
                probabilities[target * support.len() + pos] += weight;
            }
        }

        Ok(CopyNumberPosterior {
            support,
            probabilities,
            n_targets,
            n_draws: iterations.len(),
        })
    }

    /// Copy numbers observed in any target after burn-in, ascending.
    pub fn support(&self) -> &[CopyNumber] {
        &self.support
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// Number of draws that entered the summary after thinning.
    pub fn n_draws(&self) -> usize {
        self.n_draws
    }

    pub fn probabilities(&self, target: usize) -> &[f64] {
        let width = self.support.len();
        &self.probabilities[target * width..(target + 1) * width]
    }

    pub fn probability(&self, target: usize, copy_number: CopyNumber) -> f64 {
        match self.support.binary_search(&copy_number) {
            Ok(pos) => self.probabilities(target)[pos],
            Err(_) => 0.,
        }
    }

    /// Most frequent copy number per target; ties go to the smaller copy number.
    pub fn mode(&self) -> Vec<CopyNumber> {
        (0..self.n_targets)
            .map(|target| {
                self.probabilities(target)
                    .iter()
                    .zip(self.support.iter())
                    .fold((f64::NEG_INFINITY, 0), |best, (&p, &cn)| {
                        if p > best.0 {
                            (p, cn)
                        } else {
                            best
                        }
                    })
                    .1
            })
            .collect()
    }
}
