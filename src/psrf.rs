//! Gelman-Rubin potential scale reduction factor (PSRF).
//!
//! After burn-in, every chain is split into two contiguous halves so that
//! drift within a chain shows up as between-sequence variance. With `m`
//! sequences of length `n`:
//!
//! ```text
//! B    = n / (m - 1) * Σ (mean_j - mean)²
//! W    = mean_j(var_j)                       (var_j with n - 1 denominator)
//! var+ = (n - 1) / n * W + B / n
//! PSRF = sqrt(var+ / W)
//! ```
//!
//! See Gelman et al., Bayesian Data Analysis (3rd ed.), section 11.4.

use itertools::{izip, Itertools};

use crate::{
    chain::{Chain, ChainBatch},
    error::{DiagnosticsError, Result},
    math::{burn_in_index, finite_mean_excluding, mean},
};

/// Targets whose intensity is held fixed by the model and therefore carry no
/// between-chain variance. They are left out of the mean intensity PSRF.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FixedTargets {
    /// The last target is the fixed reference target.
    #[default]
    Last,
    Indices(Vec<usize>),
    None,
}

impl FixedTargets {
    pub fn resolve(&self, n_targets: usize) -> Result<Vec<usize>> {
        match self {
            FixedTargets::Last => Ok(n_targets.checked_sub(1).into_iter().collect()),
            FixedTargets::None => Ok(vec![]),
            FixedTargets::Indices(indices) => {
                if let Some(&index) = indices.iter().find(|&&index| index >= n_targets) {
                    return Err(DiagnosticsError::FixedTargetOutOfRange { index, n_targets });
                }
                Ok(indices.iter().copied().sorted_unstable().dedup().collect())
            }
        }
    }
}

/// Convergence cutoffs. 1.1 is the usual cutoff in the literature; the
/// intensities get a bit more slack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsrfThresholds {
    pub loglike: f64,
    pub intensity: f64,
}

impl Default for PsrfThresholds {
    fn default() -> Self {
        Self {
            loglike: 1.1,
            intensity: 1.15,
        }
    }
}

/// Between- and within-sequence variance of one scalar series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceDecomposition {
    pub between: f64,
    pub within: f64,
    pub chain_length: usize,
}

impl VarianceDecomposition {
    /// Pooled estimate of the marginal posterior variance.
    pub fn var_plus(&self) -> f64 {
        let n = self.chain_length as f64;
        (n - 1.) / n * self.within + self.between / n
    }

    /// Not finite if the within-sequence variance is zero.
    pub fn psrf(&self) -> f64 {
        (self.var_plus() / self.within).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PsrfResult {
    pub loglike: f64,
    /// One entry per target, fixed targets included.
    pub intensities: Box<[f64]>,
    /// Number of discarded draws per chain.
    pub burn_in: usize,
    /// Length of each half-chain.
    pub chain_length: usize,
    /// Number of half-chains, twice the number of chains.
    pub num_sequences: usize,
}

impl PsrfResult {
    /// Mean intensity PSRF over the targets not in `excluded`.
    ///
    /// Non-finite entries (targets without within-sequence variance) are
    /// skipped as well. `None` if no target is left.
    pub fn mean_intensity_psrf(&self, excluded: &[usize]) -> Option<f64> {
        finite_mean_excluding(&self.intensities, excluded)
    }

    pub fn is_converged(&self, thresholds: &PsrfThresholds, excluded: &[usize]) -> bool {
        let intensities_ok = self
            .mean_intensity_psrf(excluded)
            .map_or(true, |mean| mean <= thresholds.intensity);
        self.loglike <= thresholds.loglike && intensities_ok
    }
}

/// PSRF of the log-likelihood and of every target intensity, discarding the
/// first `round(burn_in_prop * n_iterations)` draws of each chain.
pub fn compute_psrf(batch: &ChainBatch, burn_in_prop: f64) -> Result<PsrfResult> {
    if !(0.0..1.0).contains(&burn_in_prop) {
        return Err(DiagnosticsError::InvalidBurnIn { burn_in_prop });
    }
    compute_psrf_at(batch, burn_in_index(burn_in_prop, batch.n_iterations()))
}

/// PSRF after discarding exactly `burn_in` draws of each chain.
///
/// The remaining draws must split into two halves of at least two draws each.
pub fn compute_psrf_at(batch: &ChainBatch, burn_in: usize) -> Result<PsrfResult> {
    let remaining = batch.n_iterations().saturating_sub(burn_in);
    if remaining < 4 {
        return Err(DiagnosticsError::ChainTooShort { remaining });
    }
    if remaining % 2 != 0 {
        return Err(DiagnosticsError::OddRemainder { remaining });
    }
    let chain_length = remaining / 2;

    let sequences = batch
        .chains()
        .iter()
        .flat_map(|&chain| [(chain, burn_in), (chain, burn_in + chain_length)])
        .collect_vec();

    let loglike = decompose(&sequences, chain_length, 1, |chain, i| {
        std::slice::from_ref(&chain.loglikes()[i])
    });
    let intensities = decompose(&sequences, chain_length, batch.n_targets(), |chain, i| {
        chain.intensities(i)
    });

    Ok(PsrfResult {
        loglike: loglike[0].psrf(),
        intensities: intensities.iter().map(|d| d.psrf()).collect(),
        burn_in,
        chain_length,
        num_sequences: sequences.len(),
    })
}

/// Variance decomposition of every column of `dim`-wide rows.
///
/// Each sequence is given by its chain and start iteration; `row` returns the
/// values of one iteration.
fn decompose<'a>(
    sequences: &[(&'a Chain, usize)],
    chain_length: usize,
    dim: usize,
    row: impl Fn(&'a Chain, usize) -> &'a [f64],
) -> Vec<VarianceDecomposition> {
    let length = chain_length as f64;
    let mut seq_means = vec![vec![0f64; dim]; sequences.len()];
    let mut seq_vars = vec![vec![0f64; dim]; sequences.len()];

    for (&(chain, start), means, vars) in izip!(sequences, &mut seq_means, &mut seq_vars) {
        let draws = start..start + chain_length;
        for i in draws.clone() {
            izip!(means.iter_mut(), row(chain, i)).for_each(|(mean, &x)| *mean += x);
        }
        means.iter_mut().for_each(|mean| *mean /= length);
        for i in draws {
            izip!(vars.iter_mut(), row(chain, i), means.iter()).for_each(|(var, &x, &mean)| {
                let diff = x - mean;
                *var += diff * diff;
            });
        }
        vars.iter_mut().for_each(|var| *var /= length - 1.);
    }

    let num_sequences = sequences.len() as f64;
    (0..dim)
        .map(|k| {
            let column = seq_means.iter().map(|means| means[k]).collect_vec();
            let grand_mean = mean(&column);
            let spread: f64 = column.iter().map(|m| (m - grand_mean).powi(2)).sum();
            let within = seq_vars.iter().map(|vars| vars[k]).sum::<f64>() / num_sequences;
            VarianceDecomposition {
                between: length / (num_sequences - 1.) * spread,
                within,
                chain_length,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::chain::Chain;

    fn chain_from(loglikes: &[f64], intensities: impl Fn(usize) -> Vec<f64>) -> Chain {
        let width = intensities(0).len();
        let mut chain = Chain::new(width);
        for (i, &ll) in loglikes.iter().enumerate() {
            chain.push_draw(ll, &intensities(i), &vec![2; width]).unwrap();
        }
        chain
    }

    fn by_hand(sequences: &[&[f64]]) -> f64 {
        let m = sequences.len() as f64;
        let n = sequences[0].len() as f64;
        let means: Vec<f64> = sequences
            .iter()
            .map(|s| s.iter().sum::<f64>() / n)
            .collect();
        let grand = means.iter().sum::<f64>() / m;
        let b = n / (m - 1.) * means.iter().map(|x| (x - grand).powi(2)).sum::<f64>();
        let w = sequences
            .iter()
            .zip(&means)
            .map(|(s, mu)| s.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / (n - 1.))
            .sum::<f64>()
            / m;
        let var_plus = (n - 1.) / n * w + b / n;
        (var_plus / w).sqrt()
    }

    #[test]
    fn two_ramps_by_hand() {
        let first = (0..100).map(|x| x as f64).collect_vec();
        let second = (100..200).map(|x| x as f64).collect_vec();
        let a = chain_from(&first, |i| vec![i as f64, 1.]);
        let b = chain_from(&second, |i| vec![i as f64, 1.]);
        let chains = [&a, &b];
        let batch = ChainBatch::new(&chains).unwrap();

        let result = compute_psrf(&batch, 0.).unwrap();
        let expected = by_hand(&[&first[..50], &first[50..], &second[..50], &second[50..]]);
        assert_abs_diff_eq!(result.loglike, expected, epsilon = 1e-9);
        // B = 50 / 3 * 12500, W = 212.5
        let closed_form: f64 = ((49. / 50.) * 212.5 + (50. / 3. * 12500.) / 50.) / 212.5;
        assert_abs_diff_eq!(result.loglike, closed_form.sqrt(), epsilon = 1e-9);
        assert!(result.loglike > 1.1);

        assert_eq!(result.chain_length, 50);
        assert_eq!(result.num_sequences, 4);
        assert_eq!(result.intensities.len(), 2);
        // the constant second target has no variance at all
        assert!(result.intensities[1].is_nan());
        assert_eq!(result.mean_intensity_psrf(&[1]), Some(result.intensities[0]));
    }

    #[test]
    fn identical_chains_have_no_between_variance() {
        // both halves of every chain have the same mean
        let trace = (0..200).map(|i| ((i % 10) as f64).sin()).collect_vec();
        let a = chain_from(&trace, |i| vec![(i % 5) as f64, ((i % 10) as f64).cos(), 0.]);
        let b = a.clone();
        let c = a.clone();
        let chains = [&a, &b, &c];
        let batch = ChainBatch::new(&chains).unwrap();

        for prop in [0., 0.1, 0.5] {
            let result = compute_psrf(&batch, prop).unwrap();
            let n = result.chain_length as f64;
            let floor = ((n - 1.) / n).sqrt();
            assert_abs_diff_eq!(result.loglike, floor, epsilon = 1e-9);
            assert_abs_diff_eq!(result.intensities[0], floor, epsilon = 1e-9);
            assert_abs_diff_eq!(result.intensities[1], floor, epsilon = 1e-9);
            assert!(result.is_converged(&PsrfThresholds::default(), &[2]));
        }
    }

    #[test]
    fn excluded_target_never_enters_the_mean() {
        let trace = (0..40).map(|i| (i % 7) as f64).collect_vec();
        let a = chain_from(&trace, |i| vec![(i % 3) as f64, 1e9 * i as f64]);
        let b = chain_from(&trace, |i| vec![(i % 3) as f64, -1e9 * i as f64]);
        let chains = [&a, &b];
        let batch = ChainBatch::new(&chains).unwrap();
        let mut result = compute_psrf(&batch, 0.).unwrap();
        assert!(result.intensities[1] > 2.);
        let mean = result.mean_intensity_psrf(&[1]);
        assert_eq!(mean, Some(result.intensities[0]));
        for extreme in [f64::INFINITY, f64::NAN, 1e300, -4.] {
            result.intensities[1] = extreme;
            assert_eq!(result.mean_intensity_psrf(&[1]), mean);
        }
    }

    #[test]
    fn zero_within_variance_is_not_finite() {
        let a = chain_from(&[1., 2., 3., 4.], |_| vec![5., 0.]);
        let b = chain_from(&[4., 3., 2., 1.], |_| vec![6., 0.]);
        let chains = [&a, &b];
        let batch = ChainBatch::new(&chains).unwrap();
        let result = compute_psrf(&batch, 0.).unwrap();
        assert!(result.intensities[0].is_infinite());
        assert!(result.intensities[1].is_nan());
        assert_eq!(result.mean_intensity_psrf(&[1]), None);
        // no usable target: intensities do not block convergence
        let thresholds = PsrfThresholds {
            loglike: f64::INFINITY,
            ..Default::default()
        };
        assert!(result.is_converged(&thresholds, &[1]));
    }

    #[test]
    fn rejects_bad_burn_in() {
        let a = chain_from(&[0.; 10], |_| vec![0.]);
        let chains = [&a, &a];
        let batch = ChainBatch::new(&chains).unwrap();
        assert_eq!(
            compute_psrf(&batch, 1.),
            Err(DiagnosticsError::InvalidBurnIn { burn_in_prop: 1. })
        );
        assert_eq!(
            compute_psrf(&batch, -0.1),
            Err(DiagnosticsError::InvalidBurnIn { burn_in_prop: -0.1 })
        );
        assert_eq!(
            compute_psrf_at(&batch, 1),
            Err(DiagnosticsError::OddRemainder { remaining: 9 })
        );
        assert_eq!(
            compute_psrf_at(&batch, 8),
            Err(DiagnosticsError::ChainTooShort { remaining: 2 })
        );
    }

    #[test]
    fn resolve_fixed_targets() {
        assert_eq!(FixedTargets::Last.resolve(4), Ok(vec![3]));
        assert_eq!(FixedTargets::Last.resolve(0), Ok(vec![]));
        assert_eq!(FixedTargets::None.resolve(4), Ok(vec![]));
        assert_eq!(
            FixedTargets::Indices(vec![2, 0, 2]).resolve(4),
            Ok(vec![0, 2])
        );
        assert_eq!(
            FixedTargets::Indices(vec![4]).resolve(4),
            Err(DiagnosticsError::FixedTargetOutOfRange {
                index: 4,
                n_targets: 4
            })
        );
    }

    proptest! {
        #[test]
        fn psrf_matches_formula(
            values in prop::collection::vec(-50f64..50f64, 36),
            burn_in in 0usize..3,
        ) {
            let burn_in = burn_in * 2;
            let (first, second) = values.split_at(18);
            let a = chain_from(first, |_| vec![0.]);
            let b = chain_from(second, |_| vec![0.]);
            let chains = [&a, &b];
            let batch = ChainBatch::new(&chains).unwrap();
            let result = compute_psrf_at(&batch, burn_in).unwrap();
            let half = (18 - burn_in) / 2;
            let expected = by_hand(&[
                &first[burn_in..burn_in + half],
                &first[burn_in + half..],
                &second[burn_in..burn_in + half],
                &second[burn_in + half..],
            ]);
            prop_assert!((result.loglike - expected).abs() < 1e-9 * (1. + expected.abs()));
        }

        #[test]
        fn psrf_is_affine_invariant(
            values in prop::collection::vec(-50f64..50f64, 40),
            shift in -1e3f64..1e3f64,
            scale in 0.1f64..10f64,
        ) {
            let (first, second) = values.split_at(20);
            let transform = |v: &[f64]| v.iter().map(|x| x * scale + shift).collect_vec();
            let a = chain_from(first, |_| vec![0.]);
            let b = chain_from(second, |_| vec![0.]);
            let ta = chain_from(&transform(first), |_| vec![0.]);
            let tb = chain_from(&transform(second), |_| vec![0.]);
            let chains = [&a, &b];
            let transformed = [&ta, &tb];
            let plain = compute_psrf(&ChainBatch::new(&chains).unwrap(), 0.).unwrap();
            let moved = compute_psrf(&ChainBatch::new(&transformed).unwrap(), 0.).unwrap();
            prop_assert!((plain.loglike - moved.loglike).abs() < 1e-6 * plain.loglike);
            let n = plain.chain_length as f64;
            prop_assert!(plain.loglike >= ((n - 1.) / n).sqrt() - 1e-12);
        }
    }
}
