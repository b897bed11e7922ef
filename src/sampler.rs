use anyhow::Result;
use rand::Rng;

use crate::{
    chain::{Chain, CopyNumber, TerminalState},
    mode_jump::{self, ModeJump},
};

/// A copy-number MCMC chain that can be advanced and summarized.
///
/// Implementations own their trace. Every call to [`run`](Self::run) appends
/// draws to it, so a sampler that was created from a warm [`StartState`]
/// reports the previous draws followed by the new ones.
pub trait PloidySampler: Send {
    /// Posterior summary produced by [`report_posterior`](Self::report_posterior).
    type Posterior: Send;

    /// Advance the chain by `n_iterations` draws.
    fn run<R: Rng + ?Sized>(&mut self, n_iterations: usize, rng: &mut R) -> Result<()>;

    /// All draws of this chain, including those it was warm-started with.
    fn trace(&self) -> &Chain;

    fn into_trace(self) -> Chain
    where
        Self: Sized;

    /// Summarize the draws after `burn_in`, thinned by `autocor_slice`.
    fn report_posterior(&self, burn_in: usize, autocor_slice: usize) -> Result<Self::Posterior>;

    /// Optimized log-likelihood of the mode reported in `posterior` minus the
    /// log-likelihood of `reference`.
    fn compare_likelihood(
        &self,
        posterior: &Self::Posterior,
        reference: &[CopyNumber],
    ) -> Result<f64>;

    /// Locate the largest jump in the log-likelihood trace.
    fn detect_mode_jump(&self) -> Result<ModeJump> {
        Ok(mode_jump::detect(
            self.trace().loglikes(),
            mode_jump::DEFAULT_WINDOW,
        ))
    }
}

/// Where a new chain starts.
#[derive(Debug, Clone, PartialEq)]
pub enum StartState {
    /// Start from the sampler's own initial state with an empty trace.
    Fresh,
    /// Continue from the last draw of this trace and keep it as a prefix.
    Warm(Chain),
}

impl StartState {
    pub fn terminal_state(&self) -> Option<TerminalState> {
        match self {
            StartState::Fresh => None,
            StartState::Warm(chain) => chain.terminal_state(),
        }
    }

    /// The trace a new chain appends to.
    pub fn into_history(self, n_targets: usize) -> Chain {
        match self {
            StartState::Fresh => Chain::new(n_targets),
            StartState::Warm(chain) => chain,
        }
    }
}

/// Constructs samplers for one subject.
///
/// The factory carries everything a sampler needs (copy-number support,
/// model hyperparameters, the observed coverage, the index of the first
/// baseline target). Samplers never keep state between constructions; all
/// continuation goes through [`StartState`].
pub trait SamplerFactory: Sync {
    type Sampler: PloidySampler;

    fn new_sampler<R: Rng + ?Sized>(
        &self,
        chain_id: u64,
        start: StartState,
        rng: &mut R,
    ) -> Result<Self::Sampler>;
}

/// Construct a chain and draw `draws` samples.
///
/// This has no dependency on any other chain, so chains of one batch can be
/// run in any order or in parallel.
pub fn run_chain<F: SamplerFactory, R: Rng + ?Sized>(
    factory: &F,
    chain_id: u64,
    start: StartState,
    draws: usize,
    rng: &mut R,
) -> Result<F::Sampler> {
    let mut sampler = factory.new_sampler(chain_id, start, rng)?;
    sampler.run(draws, rng)?;
    Ok(sampler)
}
