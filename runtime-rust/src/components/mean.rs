use hushmap_accountant::base::NoisedResult;

/// Compose a mean from an independently noised sum and count.
///
/// Each sub-aggregate draws its own allocation; the composition happens
/// strictly post-noising, so no allocation is ever reused across the two.
/// The spent budget of the mean is the sum of both sub-aggregates' budgets.
/// The noised count is floored at one so a small partition cannot produce a
/// division blow-up.
pub fn compose_mean(noised_sum: &NoisedResult, noised_count: &NoisedResult) -> NoisedResult {
    let denominator = noised_count.value.max(1.0);
    NoisedResult {
        value: noised_sum.value / denominator,
        mechanism: noised_sum.mechanism,
        epsilon: noised_sum.epsilon + noised_count.epsilon,
        delta: noised_sum.delta + noised_count.delta,
    }
}

#[cfg(test)]
mod test_mean {
    use super::*;
    use hushmap_accountant::base::MechanismKind;

    fn result(value: f64, epsilon: f64, delta: f64) -> NoisedResult {
        NoisedResult {
            value,
            mechanism: MechanismKind::Laplace,
            epsilon,
            delta,
        }
    }

    #[test]
    fn mean_divides_sum_by_count() {
        let mean = compose_mean(&result(120., 0.25, 0.), &result(40., 0.25, 0.));
        assert_eq!(mean.value, 3.);
        assert_eq!(mean.epsilon, 0.5);
    }

    #[test]
    fn tiny_noised_counts_are_floored() {
        let mean = compose_mean(&result(10., 0.1, 0.), &result(-3., 0.1, 0.));
        assert_eq!(mean.value, 10.);
    }

    #[test]
    fn spent_budget_sums_both_allocations() {
        let mean = compose_mean(&result(1., 0.2, 1e-7), &result(1., 0.3, 2e-7));
        assert!((mean.epsilon - 0.5).abs() < 1e-12);
        assert!((mean.delta - 3e-7).abs() < 1e-18);
    }
}
