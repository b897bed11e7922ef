//! Checks a single chain for metastability error.
//!
//! A sampler that is stuck in a secondary mode can report copy numbers that
//! look plausible but fit the data much worse than the normal copy-number
//! state. The detector compares the optimized log-likelihood of the reported
//! mode with that of a reference state. While the reported mode is worse by
//! more than `thresh_loglike_diff`, it alternately moves the burn-in past a
//! detected mode jump and reruns the chain with more iterations.

use anyhow::Result;
use log::{error, info};
use rand::Rng;

use crate::{
    chain::CopyNumber,
    error::DiagnosticsError,
    gelman_rubin::ConvergenceOutcome,
    math::burn_in_index,
    sampler::{run_chain, PloidySampler, SamplerFactory, StartState},
};

/// What to do once `max_tries` retries did not resolve the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExhausted {
    /// Log an error and return the last posterior.
    #[default]
    Stop,
    /// Log an error on every further retry and keep going until the
    /// log-likelihood difference is acceptable.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetastabilitySettings {
    /// Relative jump height above which a mode switch is accepted as the new
    /// burn-in.
    pub grad_threshold: f64,
    /// Lowest acceptable log-likelihood difference between the reported mode
    /// and the reference state.
    pub thresh_loglike_diff: f64,
    /// Thinning of the draws that enter the posterior.
    pub autocor_slice: usize,
    pub max_tries: u32,
    /// Every retry adds this fraction of the initial chain length.
    pub growth_fraction: f64,
    pub on_exhausted: OnExhausted,
}

impl Default for MetastabilitySettings {
    fn default() -> Self {
        Self {
            grad_threshold: 0.35,
            thresh_loglike_diff: -30.,
            autocor_slice: 50,
            max_tries: 5,
            growth_fraction: 0.5,
            on_exhausted: OnExhausted::Stop,
        }
    }
}

impl MetastabilitySettings {
    pub fn validate(&self) -> Result<(), DiagnosticsError> {
        let invalid = |name, reason: &str| DiagnosticsError::InvalidSetting {
            name,
            reason: reason.into(),
        };
        if !(self.growth_fraction > 0. && self.growth_fraction.is_finite()) {
            return Err(invalid("growth_fraction", "must be positive and finite"));
        }
        if !self.grad_threshold.is_finite() {
            return Err(invalid("grad_threshold", "must be finite"));
        }
        if self.thresh_loglike_diff.is_nan() {
            return Err(invalid("thresh_loglike_diff", "must not be NaN"));
        }
        if self.autocor_slice == 0 {
            return Err(invalid("autocor_slice", "must be positive"));
        }
        Ok(())
    }
}

/// Chain and burn-in the detector starts from.
pub struct DetectionStart<S> {
    pub n_iterations: usize,
    pub burn_in_prop: f64,
    pub chain_id: u64,
    /// A chain that was already run for `n_iterations`. If `None`, the
    /// detector runs one first.
    pub sampler: Option<S>,
}

impl<S> DetectionStart<S> {
    pub fn new(n_iterations: usize, burn_in_prop: f64) -> Self {
        DetectionStart {
            n_iterations,
            burn_in_prop,
            chain_id: 0,
            sampler: None,
        }
    }

    pub fn with_sampler(self, chain_id: u64, sampler: S) -> Self {
        DetectionStart {
            chain_id,
            sampler: Some(sampler),
            ..self
        }
    }
}

/// Continue with the last chain of a Gelman-Rubin analysis, at its actual
/// length.
impl<S: PloidySampler> From<ConvergenceOutcome<S>> for DetectionStart<S> {
    fn from(outcome: ConvergenceOutcome<S>) -> Self {
        let start = DetectionStart::new(outcome.chain_length(), outcome.burn_in_prop);
        let chain_id = outcome.samplers.len().saturating_sub(1) as u64;
        match outcome.samplers.into_iter().last() {
            Some(sampler) => start.with_sampler(chain_id, sampler),
            None => start,
        }
    }
}

/// Search state after one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetastabilityState {
    /// Absolute index of the first draw in the posterior.
    pub burn_in: usize,
    pub loglike_diff: f64,
    pub tries: u32,
    /// Chain length of the next fresh chain.
    pub n_iterations: usize,
}

impl MetastabilityState {
    pub fn is_acceptable(&self, settings: &MetastabilitySettings) -> bool {
        self.loglike_diff >= settings.thresh_loglike_diff
    }

    pub fn is_exhausted(&self, settings: &MetastabilitySettings) -> bool {
        self.tries > settings.max_tries
    }

    pub fn measured(self, burn_in: usize, loglike_diff: f64) -> Self {
        MetastabilityState {
            burn_in,
            loglike_diff,
            ..self
        }
    }

    /// The next retry runs a new chain that is `step` draws longer.
    pub fn retried(self, step: usize) -> Self {
        MetastabilityState {
            tries: self.tries + 1,
            n_iterations: self.n_iterations + step,
            ..self
        }
    }
}

pub struct MetastabilityOutcome<S: PloidySampler> {
    pub posterior: S::Posterior,
    pub loglike_diff: f64,
    pub burn_in: usize,
    /// Length of the chain the posterior was computed from.
    pub n_iterations: usize,
    pub tries: u32,
    /// Whether `loglike_diff` reached `thresh_loglike_diff`.
    pub resolved: bool,
    pub sampler: S,
}

fn measure<S: PloidySampler>(
    sampler: &S,
    burn_in: usize,
    settings: &MetastabilitySettings,
    norm_copy_num: &[CopyNumber],
) -> Result<(S::Posterior, f64)> {
    let posterior = sampler.report_posterior(burn_in, settings.autocor_slice)?;
    let loglike_diff = sampler.compare_likelihood(&posterior, norm_copy_num)?;
    Ok((posterior, loglike_diff))
}

/// Run the metastability search.
///
/// Not resolving the error is reported through
/// [`MetastabilityOutcome::resolved`]; the caller decides whether to accept
/// the posterior. Sampler errors are returned unchanged.
pub fn detect<F, R>(
    factory: &F,
    settings: &MetastabilitySettings,
    start: DetectionStart<F::Sampler>,
    norm_copy_num: &[CopyNumber],
    rng: &mut R,
) -> Result<MetastabilityOutcome<F::Sampler>>
where
    F: SamplerFactory,
    R: Rng + ?Sized,
{
    let DetectionStart {
        n_iterations,
        burn_in_prop,
        chain_id,
        sampler,
    } = start;
    settings.validate()?;
    let step = (settings.growth_fraction * n_iterations as f64).round_ties_even() as usize;
    // Every retry must run a longer chain.
    let step = step.max(1);

    let mut sampler = match sampler {
        Some(sampler) => sampler,
        None => run_chain(factory, chain_id, StartState::Fresh, n_iterations, rng)?,
    };
    let burn_in = burn_in_index(burn_in_prop, n_iterations);
    let (mut posterior, loglike_diff) = measure(&sampler, burn_in, settings, norm_copy_num)?;
    let mut state = MetastabilityState {
        burn_in,
        loglike_diff,
        tries: 0,
        n_iterations,
    };

    while !state.is_acceptable(settings) {
        info!(
            "Run {}; trying {} iterations; latest loglike_diff: {}",
            state.tries, state.n_iterations, state.loglike_diff
        );
        if state.is_exhausted(settings) {
            error!("Metastability error: unable to reach convergence at most likely mode");
            if settings.on_exhausted == OnExhausted::Stop {
                break;
            }
        }

        if state.tries > 0 {
            sampler = run_chain(factory, chain_id, StartState::Fresh, state.n_iterations, rng)?;
            let (new_posterior, loglike_diff) =
                measure(&sampler, state.burn_in, settings, norm_copy_num)?;
            posterior = new_posterior;
            state = state.measured(state.burn_in, loglike_diff);
        }

        // Prefer a later burn-in over a longer chain.
        if !state.is_acceptable(settings) {
            let jump = sampler.detect_mode_jump()?;
            let burn_in = if jump.height > settings.grad_threshold {
                jump.position
            } else {
                burn_in_index(burn_in_prop, state.n_iterations)
            };
            info!("Setting burn-in to {} on run {}", burn_in, state.tries);
            let (new_posterior, loglike_diff) =
                measure(&sampler, burn_in, settings, norm_copy_num)?;
            posterior = new_posterior;
            state = state.measured(burn_in, loglike_diff);
        }

        state = state.retried(step);
    }

    Ok(MetastabilityOutcome {
        posterior,
        loglike_diff: state.loglike_diff,
        burn_in: state.burn_in,
        n_iterations: sampler.trace().len(),
        tries: state.tries,
        resolved: state.is_acceptable(settings),
        sampler,
    })
}
