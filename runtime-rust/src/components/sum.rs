use hushmap_accountant::base::{BudgetAllocation, MechanismKind, NoisedResult};
use hushmap_accountant::bounds::ContributionBounds;
use hushmap_accountant::errors::*;

use crate::utilities::mechanisms;
use crate::utilities::noise::NoiseSource;

/// Sensitivity of a per-partition clamped sum under these bounds, in the
/// norm the allocation's mechanism calibrates against.
pub fn sum_sensitivity(bounds: &ContributionBounds, kind: MechanismKind) -> Result<f64> {
    let per_partition = bounds.per_partition_sum_sensitivity()?;
    Ok(if kind.uses_delta() {
        bounds.l2_sensitivity(per_partition)
    } else {
        bounds.l1_sensitivity(per_partition)
    })
}

/// Noise one partition's raw clamped sum.
pub fn noised_sum(
    sum: f64,
    bounds: &ContributionBounds,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<NoisedResult> {
    let sensitivity = sum_sensitivity(bounds, allocation.kind())?;
    let value = mechanisms::add_noise(sum, sensitivity, allocation, source)?;
    Ok(NoisedResult {
        value,
        mechanism: allocation.kind(),
        epsilon: allocation.epsilon(),
        delta: allocation.delta(),
    })
}
