//! Convergence and metastability diagnostics for copy-number MCMC samplers.
//!
//! [`analyze`] runs several chains and adapts burn-in and chain length until
//! the split-chain Gelman-Rubin PSRF of the log-likelihood and the target
//! intensities is below threshold. [`detect`] then checks one chain for a
//! sampler stuck in a secondary mode. Samplers are supplied by the caller
//! through [`SamplerFactory`] and [`PloidySampler`].

pub(crate) mod chain;
pub(crate) mod error;
pub(crate) mod gelman_rubin;
pub(crate) mod math;
pub(crate) mod metastability;
pub(crate) mod mode_jump;
pub(crate) mod posterior;
pub(crate) mod psrf;
pub(crate) mod sampler;

pub use chain::{Chain, ChainBatch, CopyNumber, TerminalState};
pub use error::{DiagnosticsError, Result};
pub use gelman_rubin::{
    analyze, even_split_burn_in, Action, AdaptationStep, ConvergenceOutcome, ConvergenceState,
    GelmanRubinSettings,
};
pub use math::burn_in_index;
pub use metastability::{
    detect, DetectionStart, MetastabilityOutcome, MetastabilitySettings, MetastabilityState,
    OnExhausted,
};
pub use mode_jump::{detect as detect_mode_jump, ModeJump, DEFAULT_WINDOW};
pub use posterior::CopyNumberPosterior;
pub use psrf::{
    compute_psrf, compute_psrf_at, FixedTargets, PsrfResult, PsrfThresholds,
    VarianceDecomposition,
};
pub use sampler::{run_chain, PloidySampler, SamplerFactory, StartState};
