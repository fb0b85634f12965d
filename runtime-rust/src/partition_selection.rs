//! Private partition selection: the noised-threshold test deciding whether a
//! partition may be released at all.
//!
//! Partitions with very few contributors are re-identifying; the test adds
//! mechanism noise to the distinct-contributor count and releases the
//! partition only when the noised count clears a threshold derived from the
//! delta budget and the cross-partition contribution cap. The test touches
//! sensitive data, so it consumes its own budget allocation, separate from
//! the aggregate's noise. Rejected partitions are silently absent from the
//! output; rejection is never an error.

use hushmap_accountant::base::{BudgetAllocation, MechanismKind};
use hushmap_accountant::errors::*;

use probability::distribution::{Gaussian, Inverse};

use crate::utilities::analytic_gaussian::analytic_gaussian_sigma;
use crate::utilities::mechanisms::CALIBRATION_TOLERANCE;
use crate::utilities::noise;
use crate::utilities::noise::NoiseSource;

#[derive(Debug)]
enum ThresholdNoise {
    Laplace { scale: f64 },
    Gaussian { sigma: f64 },
}

/// A configured noised-threshold test for one aggregation.
#[derive(Debug)]
pub struct NoisedThresholdTest {
    noise: ThresholdNoise,
    threshold: f64,
    epsilon: f64,
    delta: f64,
}

/// Build the threshold test for an aggregation from its selection allocation
/// and its cross-partition contribution cap.
///
/// With Laplace noise of scale `k / epsilon` the threshold is
/// `1 + (k / epsilon) * ln(k / (2 delta))`; an entity present in up to `k`
/// partitions then creates a spurious release with probability at most
/// delta. The Gaussian variant splits delta evenly between calibrating the
/// noise and bounding the tail above the threshold.
pub fn noised_threshold(
    allocation: &BudgetAllocation,
    max_partitions_contributed: i64,
) -> Result<NoisedThresholdTest> {
    if !allocation.epsilon().is_finite() || allocation.epsilon() <= 0.0 {
        return Err(ErrorKind::InsufficientBudget(allocation.epsilon()).into());
    }
    if !allocation.delta().is_finite() || allocation.delta() <= 0.0 {
        bail!("partition selection requires a positive delta allocation, not {}", allocation.delta());
    }
    if max_partitions_contributed <= 0 {
        return Err(ErrorKind::InvalidBounds(format!(
            "max_partitions_contributed must be positive, not {}", max_partitions_contributed)).into());
    }

    let k = max_partitions_contributed as f64;
    let epsilon = allocation.epsilon();
    let delta = allocation.delta();

    let (noise, threshold) = match allocation.kind() {
        MechanismKind::Laplace | MechanismKind::DiscreteLaplace => {
            let scale = k / epsilon;
            let threshold = 1. + scale * (k / (2. * delta)).ln();
            (ThresholdNoise::Laplace { scale }, threshold)
        }
        MechanismKind::Gaussian | MechanismKind::DiscreteGaussian => {
            // one user shifts the count of up to k partitions by one each
            let sigma = analytic_gaussian_sigma(epsilon, delta / 2., k.sqrt(), CALIBRATION_TOLERANCE)?;
            let tail = Gaussian::new(0., 1.).inverse(1. - delta / (2. * k));
            let threshold = 1. + sigma * tail;
            (ThresholdNoise::Gaussian { sigma }, threshold)
        }
    };

    Ok(NoisedThresholdTest {
        noise,
        threshold,
        epsilon,
        delta,
    })
}

impl NoisedThresholdTest {
    /// Whether a partition with this many distinct contributors is released.
    pub fn should_keep(&self, privacy_id_count: i64, source: &mut NoiseSource) -> Result<bool> {
        let noised = privacy_id_count as f64
            + match &self.noise {
                ThresholdNoise::Laplace { scale } => noise::sample_laplace(0., *scale, source)?,
                ThresholdNoise::Gaussian { sigma } => noise::sample_gaussian(0., *sigma, source)?,
            };
        Ok(noised > self.threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }
}

#[cfg(test)]
mod test_partition_selection {
    use super::*;

    fn selection_allocation(epsilon: f64, delta: f64, kind: MechanismKind) -> BudgetAllocation {
        BudgetAllocation::new(epsilon, delta, kind)
    }

    #[test]
    fn empty_partitions_are_kept_at_most_delta_often() {
        let delta = 0.05;
        let allocation = selection_allocation(1.0, delta, MechanismKind::Laplace);
        let test = noised_threshold(&allocation, 1).unwrap();

        let mut source = NoiseSource::seeded(101);
        let trials = 20_000;
        let kept = (0..trials)
            .filter(|_| test.should_keep(0, &mut source).unwrap())
            .count();
        let rate = kept as f64 / trials as f64;
        assert!(rate <= delta, "empty partitions kept at rate {}", rate);
    }

    #[test]
    fn well_populated_partitions_are_kept() {
        let allocation = selection_allocation(1.0, 1e-6, MechanismKind::Laplace);
        let test = noised_threshold(&allocation, 3).unwrap();
        // far above the threshold: every draw clears it
        let count = test.threshold() as i64 + 500;

        let mut source = NoiseSource::seeded(103);
        assert!((0..500).all(|_| test.should_keep(count, &mut source).unwrap()));
    }

    #[test]
    fn gaussian_threshold_also_bounds_false_keeps() {
        let delta = 0.05;
        let allocation = selection_allocation(1.0, delta, MechanismKind::Gaussian);
        let test = noised_threshold(&allocation, 2).unwrap();

        let mut source = NoiseSource::seeded(107);
        let trials = 20_000;
        let kept = (0..trials)
            .filter(|_| test.should_keep(0, &mut source).unwrap())
            .count();
        let rate = kept as f64 / trials as f64;
        assert!(rate <= delta, "empty partitions kept at rate {}", rate);
    }

    #[test]
    fn threshold_grows_with_the_partition_cap() {
        let allocation = selection_allocation(1.0, 1e-6, MechanismKind::Laplace);
        let narrow = noised_threshold(&allocation, 1).unwrap();
        let wide = noised_threshold(&allocation, 5).unwrap();
        assert!(wide.threshold() > narrow.threshold());
    }

    #[test]
    fn selection_requires_budget_and_delta() {
        let no_epsilon = selection_allocation(0.0, 1e-6, MechanismKind::Laplace);
        match noised_threshold(&no_epsilon, 1) {
            Err(Error(ErrorKind::InsufficientBudget(_), _)) => (),
            other => panic!("expected InsufficientBudget, got {:?}", other),
        }

        let no_delta = selection_allocation(1.0, 0.0, MechanismKind::Laplace);
        assert!(noised_threshold(&no_delta, 1).is_err());

        let allocation = selection_allocation(1.0, 1e-6, MechanismKind::Laplace);
        assert!(noised_threshold(&allocation, 0).is_err());
    }
}
