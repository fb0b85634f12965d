//! The mechanism layer: calibrated noise added to raw aggregates under a
//! budget allocation.
//!
//! Every entry point checks its allocation before touching data. A zero or
//! negative allocation is an orchestration bug upstream and fails with
//! `InsufficientBudget`; no mechanism ever silently degrades.

use hushmap_accountant::base::{BudgetAllocation, MechanismKind};
use hushmap_accountant::errors::*;

use num::{Signed, ToPrimitive};

use crate::utilities::analytic_gaussian::analytic_gaussian_sigma;
use crate::utilities::noise;
use crate::utilities::noise::NoiseSource;

/// Distance from the target delta accepted by the Gaussian calibration.
pub const CALIBRATION_TOLERANCE: f64 = 1e-12;

fn check_allocation(allocation: &BudgetAllocation) -> Result<()> {
    if !allocation.epsilon().is_finite() || allocation.epsilon() <= 0.0 {
        return Err(ErrorKind::InsufficientBudget(allocation.epsilon()).into());
    }
    Ok(())
}

fn check_delta(allocation: &BudgetAllocation) -> Result<()> {
    if !allocation.delta().is_finite() || allocation.delta() <= 0.0 {
        bail!("a delta-consuming mechanism was invoked with delta {}", allocation.delta());
    }
    Ok(())
}

fn check_sensitivity(sensitivity: f64) -> Result<()> {
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        bail!("sensitivity must be positive, not {}", sensitivity);
    }
    Ok(())
}

/// Add Laplace noise with scale `sensitivity / epsilon` to a raw value.
///
/// Pure-epsilon guarantee; the allocation's delta is ignored.
pub fn laplace_mechanism(
    value: f64,
    sensitivity: f64,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<f64> {
    check_allocation(allocation)?;
    check_sensitivity(sensitivity)?;
    let scale = sensitivity / allocation.epsilon();
    Ok(value + noise::sample_laplace(0., scale, source)?)
}

/// Add Gaussian noise to a raw value, with sigma from the analytic Gaussian
/// calibration so the allocation is satisfied exactly.
pub fn gaussian_mechanism(
    value: f64,
    sensitivity: f64,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<f64> {
    check_allocation(allocation)?;
    check_delta(allocation)?;
    check_sensitivity(sensitivity)?;
    let sigma = analytic_gaussian_sigma(
        allocation.epsilon(), allocation.delta(), sensitivity, CALIBRATION_TOLERANCE)?;
    Ok(value + noise::sample_gaussian(0., sigma, source)?)
}

/// Add discrete Laplace noise to an integer-valued aggregate.
///
/// The noise scale `sensitivity / epsilon` is converted to its exact
/// rational form and the sample is drawn with integer arithmetic, so no
/// floating artifact of the true value can survive into the release.
pub fn discrete_laplace_mechanism(
    value: i64,
    sensitivity: f64,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<i64> {
    check_allocation(allocation)?;
    check_sensitivity(sensitivity)?;

    let scale = noise::rational_from_f64(sensitivity / allocation.epsilon())?;
    let numer = scale.numer().abs().to_biguint()
        .ok_or_else(|| Error::from("unable to express the noise scale as a ratio"))?;
    let denom = scale.denom().abs().to_biguint()
        .ok_or_else(|| Error::from("unable to express the noise scale as a ratio"))?;

    let sample = noise::sample_discrete_laplace(&numer, &denom, source)?;
    let sample = sample.to_i64()
        .ok_or_else(|| Error::from("discrete Laplace noise overflowed an i64"))?;
    value.checked_add(sample)
        .ok_or_else(|| Error::from("the noised count overflowed an i64"))
}

/// Add discrete Gaussian noise to an integer-valued aggregate, with sigma
/// from the analytic Gaussian calibration.
pub fn discrete_gaussian_mechanism(
    value: i64,
    sensitivity: f64,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<i64> {
    check_allocation(allocation)?;
    check_delta(allocation)?;
    check_sensitivity(sensitivity)?;

    let sigma = analytic_gaussian_sigma(
        allocation.epsilon(), allocation.delta(), sensitivity, CALIBRATION_TOLERANCE)?;
    let sample = noise::sample_discrete_gaussian(sigma, source)?;
    let sample = sample.to_i64()
        .ok_or_else(|| Error::from("discrete Gaussian noise overflowed an i64"))?;
    value.checked_add(sample)
        .ok_or_else(|| Error::from("the noised count overflowed an i64"))
}

/// Add calibrated noise from whatever mechanism the allocation was granted
/// for. The uniform entry point the aggregation engine drives.
///
/// Discrete mechanisms round the raw value to the nearest integer first;
/// they are meant for integer-valued aggregates.
pub fn add_noise(
    value: f64,
    sensitivity: f64,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<f64> {
    match allocation.kind() {
        MechanismKind::Laplace => laplace_mechanism(value, sensitivity, allocation, source),
        MechanismKind::Gaussian => gaussian_mechanism(value, sensitivity, allocation, source),
        MechanismKind::DiscreteLaplace => {
            discrete_laplace_mechanism(value.round() as i64, sensitivity, allocation, source)
                .map(|noised| noised as f64)
        }
        MechanismKind::DiscreteGaussian => {
            discrete_gaussian_mechanism(value.round() as i64, sensitivity, allocation, source)
                .map(|noised| noised as f64)
        }
    }
}

/// Standard deviation of the noise `add_noise` draws for this allocation.
///
/// For the discrete variants this is the matching continuous mechanism's
/// deviation, which bounds the discrete one from above.
pub fn noise_standard_deviation(sensitivity: f64, allocation: &BudgetAllocation) -> Result<f64> {
    check_allocation(allocation)?;
    check_sensitivity(sensitivity)?;
    match allocation.kind() {
        MechanismKind::Laplace | MechanismKind::DiscreteLaplace => {
            Ok(2.0_f64.sqrt() * sensitivity / allocation.epsilon())
        }
        MechanismKind::Gaussian | MechanismKind::DiscreteGaussian => {
            check_delta(allocation)?;
            analytic_gaussian_sigma(
                allocation.epsilon(), allocation.delta(), sensitivity, CALIBRATION_TOLERANCE)
        }
    }
}

#[cfg(test)]
mod test_mechanisms {
    use super::*;

    #[test]
    fn zero_allocation_is_insufficient() {
        let mut source = NoiseSource::seeded(1);
        let empty = BudgetAllocation::new(0.0, 0.0, MechanismKind::Laplace);
        match laplace_mechanism(1.0, 1.0, &empty, &mut source) {
            Err(Error(ErrorKind::InsufficientBudget(_), _)) => (),
            other => panic!("expected InsufficientBudget, got {:?}", other),
        }

        let negative = BudgetAllocation::new(-0.5, 0.0, MechanismKind::Laplace);
        assert!(add_noise(1.0, 1.0, &negative, &mut source).is_err());
    }

    #[test]
    fn bad_sensitivity_is_rejected() {
        let mut source = NoiseSource::seeded(2);
        let allocation = BudgetAllocation::new(1.0, 0.0, MechanismKind::Laplace);
        assert!(laplace_mechanism(1.0, 0.0, &allocation, &mut source).is_err());
        assert!(laplace_mechanism(1.0, f64::NAN, &allocation, &mut source).is_err());
    }

    #[test]
    fn gaussian_needs_delta() {
        let mut source = NoiseSource::seeded(3);
        let no_delta = BudgetAllocation::new(1.0, 0.0, MechanismKind::Gaussian);
        assert!(gaussian_mechanism(1.0, 1.0, &no_delta, &mut source).is_err());
    }

    #[test]
    fn laplace_noise_variance_matches_scale() {
        let mut source = NoiseSource::seeded(4);
        let allocation = BudgetAllocation::new(0.5, 0.0, MechanismKind::Laplace);
        let sensitivity = 2.0;
        let raw = 10.0;
        let samples = (0..20_000)
            .map(|_| laplace_mechanism(raw, sensitivity, &allocation, &mut source).unwrap())
            .collect::<Vec<f64>>();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;

        let scale = sensitivity / allocation.epsilon();
        assert!((mean - raw).abs() < 0.2, "mean {}", mean);
        assert!((variance - 2. * scale * scale).abs() < 4.0, "variance {}", variance);
    }

    #[test]
    fn gaussian_noise_variance_matches_calibration() {
        let mut source = NoiseSource::seeded(5);
        let allocation = BudgetAllocation::new(1.0, 1e-5, MechanismKind::Gaussian);
        let sigma = noise_standard_deviation(1.0, &allocation).unwrap();
        let samples = (0..20_000)
            .map(|_| gaussian_mechanism(0.0, 1.0, &allocation, &mut source).unwrap())
            .collect::<Vec<f64>>();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 0.2, "mean {}", mean);
        assert!((variance - sigma * sigma).abs() < sigma * sigma * 0.1, "variance {}", variance);
    }

    #[test]
    fn discrete_laplace_keeps_counts_integral() {
        let mut source = NoiseSource::seeded(6);
        let allocation = BudgetAllocation::new(1.0, 0.0, MechanismKind::DiscreteLaplace);
        let noised = add_noise(41.6, 1.0, &allocation, &mut source).unwrap();
        assert_eq!(noised, noised.round());
    }

}
