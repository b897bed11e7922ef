use thiserror::Error;

/// Precondition violations detected by the diagnostics engine.
///
/// These describe misuse of the API (too few chains, chains of different
/// shape, a burn-in that leaves nothing to analyze). They are never caused by
/// the sampled values themselves; poor convergence is reported through the
/// outcome types instead.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DiagnosticsError {
    #[error("Gelman-Rubin analysis needs at least 2 chains, got {num_chains}")]
    TooFewChains { num_chains: usize },

    #[error(
        "chain {chain} has {found_iterations} draws of {found_targets} targets, \
         expected {expected_iterations} draws of {expected_targets} targets"
    )]
    ShapeMismatch {
        chain: usize,
        expected_iterations: usize,
        expected_targets: usize,
        found_iterations: usize,
        found_targets: usize,
    },

    #[error(
        "draw has {intensities} intensities and {copy_numbers} copy numbers, \
         expected {expected} targets"
    )]
    DrawWidthMismatch {
        expected: usize,
        intensities: usize,
        copy_numbers: usize,
    },

    #[error("burn-in proportion must lie in [0, 1), got {burn_in_prop}")]
    InvalidBurnIn { burn_in_prop: f64 },

    #[error("{remaining} draws left after burn-in, need at least 4 to split into halves")]
    ChainTooShort { remaining: usize },

    #[error("{remaining} draws left after burn-in cannot be split into equal halves")]
    OddRemainder { remaining: usize },

    #[error("chain has no draws")]
    EmptyChain,

    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("fixed target {index} is out of range for {n_targets} targets")]
    FixedTargetOutOfRange { index: usize, n_targets: usize },
}

pub type Result<T> = std::result::Result<T, DiagnosticsError>;
