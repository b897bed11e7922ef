//! Adaptive Gelman-Rubin convergence analysis over several chains.
//!
//! The driver runs `num_chains` independent chains and evaluates the PSRF of
//! the log-likelihood and of the target intensities. While the PSRF is above
//! threshold it first discards more burn-in (in steps of `burn_in_step`), and
//! only once the burn-in proportion exceeds `max_prop` does it extend every
//! chain by `iter_step_size` draws, continuing each from its last draw.

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    chain::{Chain, ChainBatch},
    error::DiagnosticsError,
    math::burn_in_index,
    psrf::{compute_psrf_at, FixedTargets, PsrfResult, PsrfThresholds},
    sampler::{run_chain, PloidySampler, SamplerFactory, StartState},
};

/// Settings for [`analyze`].
#[derive(Debug, Clone, PartialEq)]
pub struct GelmanRubinSettings {
    /// Number of independent chains, at least 2.
    pub num_chains: usize,
    /// Number of targets in the model, baselines included.
    pub n_test_targets: usize,
    /// Chain length of the first attempt.
    pub n_iterations: usize,
    /// Burn-in proportion every chain length starts from.
    pub burn_in_prop: f64,
    /// Draws added to every chain when the burn-in proportion is exhausted.
    pub iter_step_size: usize,
    /// Longest chain to attempt.
    pub max_iterations: usize,
    /// Largest burn-in proportion to try before extending the chains.
    pub max_prop: f64,
    pub burn_in_step: f64,
    pub thresholds: PsrfThresholds,
    /// Targets left out of the mean intensity PSRF.
    pub fixed_targets: FixedTargets,
    pub seed: u64,
    /// Run the chains of one step on this many threads. 0 and 1 run them
    /// sequentially.
    pub num_cores: usize,
}

impl Default for GelmanRubinSettings {
    fn default() -> Self {
        Self {
            num_chains: 2,
            n_test_targets: 0,
            n_iterations: 5000,
            burn_in_prop: 0.1,
            iter_step_size: 5000,
            max_iterations: 25000,
            max_prop: 0.5,
            burn_in_step: 0.05,
            thresholds: PsrfThresholds::default(),
            fixed_targets: FixedTargets::Last,
            seed: 0,
            num_cores: 1,
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> DiagnosticsError {
    DiagnosticsError::InvalidSetting {
        name,
        reason: reason.into(),
    }
}

impl GelmanRubinSettings {
    pub fn validate(&self) -> Result<(), DiagnosticsError> {
        if self.num_chains < 2 {
            return Err(DiagnosticsError::TooFewChains {
                num_chains: self.num_chains,
            });
        }
        if self.n_test_targets == 0 {
            return Err(invalid("n_test_targets", "must be positive"));
        }
        if self.iter_step_size == 0 {
            return Err(invalid("iter_step_size", "must be positive"));
        }
        if !(self.burn_in_step > 0. && self.burn_in_step.is_finite()) {
            return Err(invalid("burn_in_step", "must be positive and finite"));
        }
        if !(0.0..1.0).contains(&self.burn_in_prop) {
            return Err(DiagnosticsError::InvalidBurnIn {
                burn_in_prop: self.burn_in_prop,
            });
        }
        if !(0.0..1.0).contains(&self.max_prop) {
            return Err(invalid("max_prop", "must lie in [0, 1)"));
        }
        let largest = self.max_prop.max(self.burn_in_prop);
        let remaining = self.n_iterations - burn_in_index(largest, self.n_iterations).min(self.n_iterations);
        if remaining < 5 {
            return Err(invalid(
                "n_iterations",
                format!(
                    "{} draws leave only {} after a burn-in proportion of {}",
                    self.n_iterations, remaining, largest
                ),
            ));
        }
        self.fixed_targets.resolve(self.n_test_targets)?;
        Ok(())
    }

    /// Upper bound on the number of PSRF evaluations of one analysis.
    ///
    /// Every chain length is diagnosed at most once per burn-in proportion
    /// up to `max_prop`, and the number of chain lengths is limited by
    /// `max_iterations`.
    pub fn max_diagnoses(&self) -> usize {
        if self.n_iterations > self.max_iterations || self.iter_step_size == 0 {
            return 0;
        }
        let lengths = (self.max_iterations - self.n_iterations) / self.iter_step_size + 1;
        let per_length = if self.burn_in_prop > self.max_prop {
            1
        } else {
            ((self.max_prop - self.burn_in_prop) / self.burn_in_step).floor() as usize + 2
        };
        lengths * per_length
    }
}

/// Adaptation state threaded through the analysis loop.
///
/// Each transition returns a new state; the burn-in proportion is derived
/// from the number of increments applied since the chains were last sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceState {
    pub n_iterations: usize,
    pub burn_in_increments: u32,
    pub tries: u32,
}

/// What the driver does before the next PSRF evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run every chain from its initial state for `n_iterations` draws.
    SampleFresh { n_iterations: usize },
    /// Continue every chain from its last draw by `draws`, reaching
    /// `n_iterations` in total.
    Extend { draws: usize, n_iterations: usize },
    /// Evaluate the current chains at the current burn-in.
    Diagnose,
    /// The next chain length would exceed `max_iterations`.
    Stop,
}

impl ConvergenceState {
    pub fn initial(settings: &GelmanRubinSettings) -> Self {
        ConvergenceState {
            n_iterations: settings.n_iterations,
            burn_in_increments: 0,
            tries: 0,
        }
    }

    pub fn burn_in_prop(&self, settings: &GelmanRubinSettings) -> f64 {
        settings.burn_in_prop + self.burn_in_increments as f64 * settings.burn_in_step
    }

    /// Burn-in is always grown before the chains are.
    pub fn next_action(&self, settings: &GelmanRubinSettings) -> Action {
        if self.tries > 0 && self.burn_in_prop(settings) <= settings.max_prop {
            return Action::Diagnose;
        }
        let n_iterations = if self.tries == 0 {
            self.n_iterations
        } else {
            self.n_iterations + settings.iter_step_size
        };
        if n_iterations > settings.max_iterations {
            Action::Stop
        } else if self.tries == 0 {
            Action::SampleFresh { n_iterations }
        } else {
            Action::Extend {
                draws: settings.iter_step_size,
                n_iterations,
            }
        }
    }

    /// The chains now have `n_iterations` draws; burn-in starts over.
    pub fn sampled(self, n_iterations: usize) -> Self {
        ConvergenceState {
            n_iterations,
            burn_in_increments: 0,
            ..self
        }
    }

    /// The PSRF was above threshold.
    pub fn rejected(self) -> Self {
        ConvergenceState {
            burn_in_increments: self.burn_in_increments + 1,
            tries: self.tries + 1,
            ..self
        }
    }
}

/// One PSRF evaluation of the analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationStep {
    pub n_iterations: usize,
    pub burn_in_prop: f64,
    /// Draws discarded per chain, after rounding to an even remainder.
    pub burn_in: usize,
    pub psrf: PsrfResult,
    pub mean_intensity_psrf: Option<f64>,
    pub converged: bool,
}

/// Result of [`analyze`].
///
/// Not converging within `max_iterations` is not an error: `converged` is
/// false and the caller decides whether to accept the chains.
pub struct ConvergenceOutcome<S> {
    pub converged: bool,
    pub n_iterations: usize,
    pub burn_in_prop: f64,
    pub history: Vec<AdaptationStep>,
    /// Samplers of the last chain length, one per chain. Empty if the
    /// initial chain length already exceeded `max_iterations`.
    pub samplers: Vec<S>,
}

impl<S: PloidySampler> ConvergenceOutcome<S> {
    /// Number of draws in each returned chain.
    ///
    /// Differs from `n_iterations` after a stop at `max_iterations` that is
    /// not reached by whole `iter_step_size` steps, because `n_iterations`
    /// is then clamped to `max_iterations`.
    pub fn chain_length(&self) -> usize {
        self.samplers
            .last()
            .map_or(self.n_iterations, |sampler| sampler.trace().len())
    }

    /// Number of draws discarded at the final burn-in proportion.
    pub fn burn_in(&self) -> usize {
        burn_in_index(self.burn_in_prop, self.chain_length())
    }

    pub fn last_psrf(&self) -> Option<&PsrfResult> {
        self.history.last().map(|step| &step.psrf)
    }

    pub fn last_sampler(&self) -> Option<&S> {
        self.samplers.last()
    }

    pub fn traces(&self) -> Vec<&Chain> {
        self.samplers.iter().map(|s| s.trace()).collect()
    }
}

struct ChainSlot<S> {
    rng: ChaCha8Rng,
    sampler: Option<S>,
}

fn new_slots<S>(settings: &GelmanRubinSettings) -> Vec<ChainSlot<S>> {
    (0..settings.num_chains)
        .map(|chain_id| {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(chain_id as u64);
            ChainSlot { rng, sampler: None }
        })
        .collect()
}

fn advance_slot<F: SamplerFactory>(
    factory: &F,
    chain_id: usize,
    slot: &mut ChainSlot<F::Sampler>,
    draws: usize,
) -> Result<()> {
    let start = match slot.sampler.take() {
        Some(sampler) => StartState::Warm(sampler.into_trace()),
        None => StartState::Fresh,
    };
    debug!("Chain {}: drawing {} samples", chain_id, draws);
    let sampler = run_chain(factory, chain_id as u64, start, draws, &mut slot.rng)?;
    slot.sampler = Some(sampler);
    Ok(())
}

fn advance_all<F: SamplerFactory>(
    factory: &F,
    slots: &mut [ChainSlot<F::Sampler>],
    draws: usize,
    pool: Option<&ThreadPool>,
) -> Result<()> {
    match pool {
        Some(pool) => pool.install(|| {
            slots
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(chain_id, slot)| advance_slot(factory, chain_id, slot, draws))
        }),
        None => slots
            .iter_mut()
            .enumerate()
            .try_for_each(|(chain_id, slot)| advance_slot(factory, chain_id, slot, draws)),
    }
}

/// Burn-in index for `burn_in_prop`, moved up by one draw if needed so that
/// the remaining draws split into equal halves.
pub fn even_split_burn_in(burn_in_prop: f64, n_iterations: usize) -> usize {
    let burn_in = burn_in_index(burn_in_prop, n_iterations);
    if (n_iterations - burn_in) % 2 == 0 {
        burn_in
    } else {
        burn_in + 1
    }
}

fn check_shape(
    traces: &[&Chain],
    n_iterations: usize,
    n_targets: usize,
) -> Result<(), DiagnosticsError> {
    match traces
        .iter()
        .enumerate()
        .find(|(_, c)| c.len() != n_iterations || c.n_targets() != n_targets)
    {
        Some((chain, trace)) => Err(DiagnosticsError::ShapeMismatch {
            chain,
            expected_iterations: n_iterations,
            expected_targets: n_targets,
            found_iterations: trace.len(),
            found_targets: trace.n_targets(),
        }),
        None => Ok(()),
    }
}

/// Run the adaptive Gelman-Rubin analysis.
///
/// Terminates after at most [`GelmanRubinSettings::max_diagnoses`] PSRF
/// evaluations. Errors from the sampler are returned unchanged.
pub fn analyze<F: SamplerFactory>(
    factory: &F,
    settings: &GelmanRubinSettings,
) -> Result<ConvergenceOutcome<F::Sampler>> {
    settings.validate()?;
    let fixed = settings.fixed_targets.resolve(settings.n_test_targets)?;

    let pool = if settings.num_cores > 1 {
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.num_cores)
            .thread_name(|i| format!("ploidy-chain-{}", i))
            .build()
            .context("Could not start thread pool")?;
        Some(pool)
    } else {
        None
    };

    let mut slots = new_slots(settings);
    let mut history: Vec<AdaptationStep> = Vec::new();
    let mut warned_fixed = false;
    let mut state = ConvergenceState::initial(settings);

    loop {
        match state.next_action(settings) {
            Action::Stop => {
                let last = history.last();
                warn!(
                    "Poor convergence even after {} iterations; checking for metastability \
                     error next. PSRF (log-likelihood): {:?}, mean PSRF (intensities): {:?}",
                    settings.max_iterations,
                    last.map(|step| step.psrf.loglike),
                    last.and_then(|step| step.mean_intensity_psrf),
                );
                return Ok(ConvergenceOutcome {
                    converged: false,
                    n_iterations: settings.max_iterations,
                    burn_in_prop: settings.burn_in_prop + settings.burn_in_step,
                    history,
                    samplers: slots.into_iter().filter_map(|slot| slot.sampler).collect(),
                });
            }
            Action::SampleFresh { n_iterations } => {
                info!(
                    "Performing Gelman-Rubin analysis with {} iterations and burn-in prop of {}.",
                    n_iterations, settings.burn_in_prop
                );
                advance_all(factory, &mut slots, n_iterations, pool.as_ref())?;
                state = state.sampled(n_iterations);
            }
            Action::Extend {
                draws,
                n_iterations,
            } => {
                info!(
                    "Extending chains by {} to {} iterations, burn-in prop reset to {}.",
                    draws, n_iterations, settings.burn_in_prop
                );
                advance_all(factory, &mut slots, draws, pool.as_ref())?;
                state = state.sampled(n_iterations);
            }
            Action::Diagnose => {}
        }

        let burn_in_prop = state.burn_in_prop(settings);
        let burn_in = even_split_burn_in(burn_in_prop, state.n_iterations);
        let traces = slots
            .iter()
            .filter_map(|slot| slot.sampler.as_ref().map(|s| s.trace()))
            .collect_vec();
        check_shape(&traces, state.n_iterations, settings.n_test_targets)?;
        let batch = ChainBatch::new(&traces)?;
        let psrf = compute_psrf_at(&batch, burn_in)?;

        if !warned_fixed {
            if let Some(&target) = fixed.iter().find(|&&t| !batch.is_target_fixed(t, burn_in)) {
                warn!(
                    "Target {} is treated as fixed but its intensity varies between draws",
                    target
                );
                warned_fixed = true;
            }
        }

        let mean_intensity_psrf = psrf.mean_intensity_psrf(&fixed);
        let converged = psrf.is_converged(&settings.thresholds, &fixed);
        info!(
            "Burn-in prop: {:.2}, PSRF (log-likelihood): {:.4}, mean PSRF (intensities): {:?}",
            burn_in_prop, psrf.loglike, mean_intensity_psrf
        );
        history.push(AdaptationStep {
            n_iterations: state.n_iterations,
            burn_in_prop,
            burn_in,
            psrf,
            mean_intensity_psrf,
            converged,
        });

        if converged {
            info!(
                "Completed Gelman-Rubin convergence analysis. Used {} iterations and {:.2} burn-in prop.",
                state.n_iterations, burn_in_prop
            );
            return Ok(ConvergenceOutcome {
                converged: true,
                n_iterations: state.n_iterations,
                burn_in_prop,
                history,
                samplers: slots.into_iter().filter_map(|slot| slot.sampler).collect(),
            });
        }
        state = state.rejected();
    }
}
