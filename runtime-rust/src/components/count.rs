use hushmap_accountant::base::{BudgetAllocation, MechanismKind, NoisedResult};
use hushmap_accountant::bounds::ContributionBounds;
use hushmap_accountant::errors::*;

use crate::utilities::mechanisms;
use crate::utilities::noise::NoiseSource;

/// Sensitivity of a per-partition count under these bounds, in the norm the
/// allocation's mechanism calibrates against.
pub fn count_sensitivity(bounds: &ContributionBounds, kind: MechanismKind) -> f64 {
    let per_partition = bounds.per_partition_count_sensitivity();
    if kind.uses_delta() {
        bounds.l2_sensitivity(per_partition)
    } else {
        bounds.l1_sensitivity(per_partition)
    }
}

/// Noise one partition's raw count.
pub fn noised_count(
    count: i64,
    bounds: &ContributionBounds,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<NoisedResult> {
    let sensitivity = count_sensitivity(bounds, allocation.kind());
    let value = mechanisms::add_noise(count as f64, sensitivity, allocation, source)?;
    Ok(NoisedResult {
        value,
        mechanism: allocation.kind(),
        epsilon: allocation.epsilon(),
        delta: allocation.delta(),
    })
}

#[cfg(test)]
mod test_count {
    use super::*;
    use hushmap_accountant::base::AggregationKind;
    use hushmap_accountant::bounds::compute_bounds;

    #[test]
    fn sensitivity_reflects_contribution_caps() {
        let bounds = compute_bounds(AggregationKind::Count, None, None, 4, 3).unwrap();
        assert_eq!(count_sensitivity(&bounds, MechanismKind::Laplace), 12.);
        assert!((count_sensitivity(&bounds, MechanismKind::Gaussian) - 6.).abs() < 1e-12);
    }

    #[test]
    fn noised_count_centers_on_the_raw_count() {
        let bounds = compute_bounds(AggregationKind::Count, None, None, 1, 1).unwrap();
        let allocation = BudgetAllocation::new(50.0, 0.0, MechanismKind::Laplace);
        let mut source = NoiseSource::seeded(41);

        let mean = (0..2000)
            .map(|_| noised_count(100, &bounds, &allocation, &mut source).unwrap().value)
            .sum::<f64>() / 2000.;
        assert!((mean - 100.).abs() < 0.05, "mean {}", mean);
    }

    #[test]
    fn discrete_counts_stay_integral() {
        let bounds = compute_bounds(AggregationKind::Count, None, None, 2, 1).unwrap();
        let allocation = BudgetAllocation::new(1.0, 0.0, MechanismKind::DiscreteLaplace);
        let mut source = NoiseSource::seeded(43);
        let result = noised_count(25, &bounds, &allocation, &mut source).unwrap();
        assert_eq!(result.value, result.value.round());
        assert_eq!(result.mechanism, MechanismKind::DiscreteLaplace);
    }

    #[test]
    fn spent_budget_is_reported() {
        let bounds = compute_bounds(AggregationKind::Count, None, None, 1, 1).unwrap();
        let allocation = BudgetAllocation::new(0.25, 0.0, MechanismKind::Laplace);
        let mut source = NoiseSource::seeded(47);
        let result = noised_count(5, &bounds, &allocation, &mut source).unwrap();
        assert_eq!(result.epsilon, 0.25);
        assert_eq!(result.delta, 0.0);
    }
}
