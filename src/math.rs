pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Convert a burn-in proportion to the number of discarded draws.
///
/// Ties round to even so that e.g. `0.25 * 10 = 2.5` always maps to 2,
/// independent of how the product was reached.
pub fn burn_in_index(burn_in_prop: f64, n_iterations: usize) -> usize {
    let index = (burn_in_prop * n_iterations as f64).round_ties_even();
    if index <= 0. {
        0
    } else {
        (index as usize).min(n_iterations)
    }
}

/// Mean over the finite entries of `values` whose index is not in `excluded`.
///
/// Returns `None` when no entry survives.
pub(crate) fn finite_mean_excluding(values: &[f64], excluded: &[usize]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .enumerate()
        .filter(|(i, v)| v.is_finite() && !excluded.contains(i))
        .fold((0f64, 0usize), |(sum, count), (_, &v)| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Running sums with a leading zero, so that the sum of `values[lo..hi]` is
/// `prefix[hi] - prefix[lo]`.
pub(crate) fn prefix_sums(values: &[f64]) -> Vec<f64> {
    let mut prefix = Vec::with_capacity(values.len() + 1);
    let mut total = 0f64;
    prefix.push(total);
    for &v in values {
        total += v;
        prefix.push(total);
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_prefix_window_sums(values in prop::collection::vec(-100f64..100f64, 1..50)) {
            let prefix = prefix_sums(&values);
            prop_assert_eq!(prefix.len(), values.len() + 1);
            let total: f64 = values.iter().sum();
            prop_assert!((prefix[values.len()] - total).abs() < 1e-9);
            prop_assert!((mean(&values) - total / values.len() as f64).abs() < 1e-12);
        }

        #[test]
        fn check_burn_in_index_bounds(prop in 0f64..1f64, n in 0usize..100_000) {
            let index = burn_in_index(prop, n);
            prop_assert!(index <= n);
        }
    }

    #[test]
    fn check_round_half_even() {
        assert_eq!(burn_in_index(0.25, 10), 2);
        assert_eq!(burn_in_index(0.75, 10), 8);
        assert_eq!(burn_in_index(0.5, 5), 2);
        assert_eq!(burn_in_index(0.1, 5000), 500);
        assert_eq!(burn_in_index(0., 100), 0);
    }

    #[test]
    fn check_finite_mean() {
        let values = [1., 2., f64::NAN, 3., f64::INFINITY, 100.];
        assert_eq!(finite_mean_excluding(&values, &[5]), Some(2.));
        assert_eq!(finite_mean_excluding(&[f64::NAN], &[]), None);
        assert_eq!(finite_mean_excluding(&[1.], &[0]), None);
    }

    #[test]
    fn check_prefix_sums() {
        let prefix = prefix_sums(&[1., 2., 3., 4.]);
        assert_eq!(prefix, vec![0., 1., 3., 6., 10.]);
        assert_eq!(prefix[4] - prefix[1], 9.);
    }
}
