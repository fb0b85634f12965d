use hushmap_accountant::base::{BudgetAllocation, NoisedResult};
use hushmap_accountant::bounds::ContributionBounds;
use hushmap_accountant::errors::*;

use noisy_float::prelude::*;

use crate::utilities::noise;
use crate::utilities::noise::NoiseSource;

/// Differentially private quantile of one partition's bounded values.
///
/// Scores every gap between adjacent clamped values by its width and its
/// rank distance from the target, perturbs the scores with standard Gumbel
/// noise, and samples uniformly inside the winning gap; the Gumbel-max trick
/// makes this an exponential mechanism over intervals. The allocated epsilon
/// is divided by the per-partition contribution cap, since one entity may
/// move that many records inside the partition.
///
/// # Arguments
/// * `values` - the partition's contribution-bounded values
/// * `rank` - the quantile rank in (0, 1), e.g. 0.5 for the median
/// * `bounds` - contribution bounds; the clamping range brackets the output
/// * `allocation` - the budget slice spent on this release
pub fn noised_quantile(
    values: &[f64],
    rank: f64,
    bounds: &ContributionBounds,
    allocation: &BudgetAllocation,
    source: &mut NoiseSource,
) -> Result<NoisedResult> {
    if !(rank > 0.0 && rank < 1.0) {
        bail!("quantile rank must be within (0, 1), not {}", rank);
    }
    if !allocation.epsilon().is_finite() || allocation.epsilon() <= 0.0 {
        return Err(ErrorKind::InsufficientBudget(allocation.epsilon()).into());
    }
    let lower = bounds.lower().ok_or_else(|| Error::from(ErrorKind::InvalidBounds(
        "quantile aggregations require a declared clamping range".to_string())))?;
    let upper = bounds.upper().ok_or_else(|| Error::from(ErrorKind::InvalidBounds(
        "quantile aggregations require a declared clamping range".to_string())))?;

    let release = |value: f64| NoisedResult {
        value,
        mechanism: allocation.kind(),
        epsilon: allocation.epsilon(),
        delta: allocation.delta(),
    };

    if lower == upper {
        // a degenerate public range admits only one answer
        return Ok(release(lower));
    }

    // ensure there is always a gap with positive width
    let mut clipped = values.iter()
        .filter(|v| !v.is_nan())
        .map(|v| bounds.clamp(*v))
        .chain(vec![lower, upper])
        .collect::<Vec<f64>>();
    clipped.sort_by_key(|v| n64(*v));

    let epsilon = allocation.epsilon() / bounds.max_contributions_per_partition() as f64;
    let target_rank = rank * clipped.len() as f64;

    let mut max_noisy_score = f64::NEG_INFINITY;
    let mut arg_max_noisy_score: usize = 1;
    for i in 1..clipped.len() {
        let width = clipped[i] - clipped[i - 1];
        let rank_distance = (i as f64 - target_rank).abs().ceil();
        let score = width.ln() - (epsilon / 2.0) * rank_distance;

        let noisy_score = score + noise::sample_gumbel(0.0, 1.0, source)?;
        if noisy_score > max_noisy_score {
            max_noisy_score = noisy_score;
            arg_max_noisy_score = i;
        }
    }

    let left = clipped[arg_max_noisy_score - 1];
    let right = clipped[arg_max_noisy_score];
    Ok(release(noise::sample_uniform(left, right, source)?))
}
