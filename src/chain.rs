//! Sampled traces of a copy-number MCMC chain.
//!
//! A [`Chain`] stores, for every iteration, the log-likelihood, the intensity
//! of each target and the discrete copy number of each target. Draws are only
//! ever appended, so a chain that was warm-restarted keeps its earlier draws
//! as a prefix and exposes its last draw as the [`TerminalState`] to continue
//! from.

use crate::error::{DiagnosticsError, Result};

/// Discrete copy-number state of a single target.
pub type CopyNumber = u32;

/// The last draw of a chain, used to warm-restart a longer run.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalState {
    pub copy_numbers: Box<[CopyNumber]>,
    pub intensities: Box<[f64]>,
}

/// Append-only trace of a single chain.
///
/// Intensities and copy numbers are stored iteration-major in flat buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    n_targets: usize,
    loglikes: Vec<f64>,
    intensities: Vec<f64>,
    copy_numbers: Vec<CopyNumber>,
}

impl Chain {
    pub fn new(n_targets: usize) -> Self {
        Self::with_capacity(n_targets, 0)
    }

    pub fn with_capacity(n_targets: usize, n_iterations: usize) -> Self {
        Chain {
            n_targets,
            loglikes: Vec::with_capacity(n_iterations),
            intensities: Vec::with_capacity(n_iterations * n_targets),
            copy_numbers: Vec::with_capacity(n_iterations * n_targets),
        }
    }

    /// Append one draw.
    ///
    /// Fails without modifying the chain if the vectors do not have one entry
    /// per target.
    pub fn push_draw(
        &mut self,
        loglike: f64,
        intensities: &[f64],
        copy_numbers: &[CopyNumber],
    ) -> Result<()> {
        if intensities.len() != self.n_targets || copy_numbers.len() != self.n_targets {
            return Err(DiagnosticsError::DrawWidthMismatch {
                expected: self.n_targets,
                intensities: intensities.len(),
                copy_numbers: copy_numbers.len(),
            });
        }
        self.loglikes.push(loglike);
        self.intensities.extend_from_slice(intensities);
        self.copy_numbers.extend_from_slice(copy_numbers);
        Ok(())
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.loglikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loglikes.is_empty()
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    pub fn loglikes(&self) -> &[f64] {
        &self.loglikes
    }

    /// Intensities of all targets at one iteration.
    pub fn intensities(&self, iteration: usize) -> &[f64] {
        let start = iteration * self.n_targets;
        &self.intensities[start..start + self.n_targets]
    }

    /// Copy numbers of all targets at one iteration.
    pub fn copy_numbers(&self, iteration: usize) -> &[CopyNumber] {
        let start = iteration * self.n_targets;
        &self.copy_numbers[start..start + self.n_targets]
    }

    /// Intensity of one target at one iteration.
    pub fn intensity(&self, iteration: usize, target: usize) -> f64 {
        self.intensities[iteration * self.n_targets + target]
    }

    /// The intensity trace of a single target.
    pub fn target_intensities(&self, target: usize) -> impl Iterator<Item = f64> + '_ {
        self.intensities
            .iter()
            .skip(target)
            .step_by(self.n_targets.max(1))
            .copied()
    }

    /// The copy-number trace of a single target.
    pub fn target_copy_numbers(&self, target: usize) -> impl Iterator<Item = CopyNumber> + '_ {
        self.copy_numbers
            .iter()
            .skip(target)
            .step_by(self.n_targets.max(1))
            .copied()
    }

    pub fn terminal_state(&self) -> Option<TerminalState> {
        let last = self.len().checked_sub(1)?;
        Some(TerminalState {
            copy_numbers: self.copy_numbers(last).into(),
            intensities: self.intensities(last).into(),
        })
    }
}

/// A set of chains of identical shape, treated as independent replicates.
#[derive(Debug, Clone, Copy)]
pub struct ChainBatch<'a> {
    chains: &'a [&'a Chain],
    n_iterations: usize,
    n_targets: usize,
}

impl<'a> ChainBatch<'a> {
    /// Check that there are at least two chains and that all of them have the
    /// same number of draws and targets.
    pub fn new(chains: &'a [&'a Chain]) -> Result<Self> {
        let [first, ..] = chains else {
            return Err(DiagnosticsError::TooFewChains { num_chains: 0 });
        };
        if chains.len() < 2 {
            return Err(DiagnosticsError::TooFewChains { num_chains: 1 });
        }
        let n_iterations = first.len();
        let n_targets = first.n_targets();
        if n_iterations == 0 {
            return Err(DiagnosticsError::EmptyChain);
        }
        if let Some((chain, other)) = chains
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != n_iterations || c.n_targets() != n_targets)
        {
            return Err(DiagnosticsError::ShapeMismatch {
                chain,
                expected_iterations: n_iterations,
                expected_targets: n_targets,
                found_iterations: other.len(),
                found_targets: other.n_targets(),
            });
        }
        Ok(ChainBatch {
            chains,
            n_iterations,
            n_targets,
        })
    }

    pub fn chains(&self) -> &'a [&'a Chain] {
        self.chains
    }

    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn n_iterations(&self) -> usize {
        self.n_iterations
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// True if `target` has one and the same intensity in every chain for
    /// every draw after `burn_in`.
    pub fn is_target_fixed(&self, target: usize, burn_in: usize) -> bool {
        let reference = self.chains[0].intensity(burn_in.min(self.n_iterations - 1), target);
        self.chains.iter().all(|chain| {
            chain
                .target_intensities(target)
                .skip(burn_in)
                .all(|value| value == reference)
        })
    }
}
