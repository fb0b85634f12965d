//! Contribution bounds and sensitivity derivation.
//!
//! Bounds are derived once from the user-declared aggregation parameters,
//! before execution, and are immutable during a run. Every sensitivity used
//! to calibrate noise comes from here; nothing downstream recomputes it.

use crate::base::AggregationKind;
use crate::errors::*;

/// Per-aggregation contribution limits and value clamping range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContributionBounds {
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
    lower: Option<f64>,
    upper: Option<f64>,
}

/// Derive contribution bounds from declared aggregation parameters.
///
/// A pure function of its arguments: identical declared ranges yield
/// identical bounds.
///
/// # Arguments
/// * `kind` - the statistic the bounds will parametrize
/// * `lower`, `upper` - value clamping range; required unless `kind` is a count
/// * `max_partitions_contributed` - cap on distinct partitions per entity
/// * `max_contributions_per_partition` - cap on records per entity per partition
///
/// # Example
/// ```
/// use hushmap_accountant::base::AggregationKind;
/// use hushmap_accountant::bounds::compute_bounds;
/// let bounds = compute_bounds(AggregationKind::Sum, Some(0.), Some(100.), 3, 2).unwrap();
/// assert_eq!(bounds.l1_sensitivity(bounds.per_partition_sum_sensitivity().unwrap()), 600.);
/// ```
pub fn compute_bounds(
    kind: AggregationKind,
    lower: Option<f64>,
    upper: Option<f64>,
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
) -> Result<ContributionBounds> {
    if max_partitions_contributed <= 0 {
        return Err(ErrorKind::InvalidBounds(format!(
            "max_partitions_contributed must be positive, not {}", max_partitions_contributed)).into());
    }
    if max_contributions_per_partition <= 0 {
        return Err(ErrorKind::InvalidBounds(format!(
            "max_contributions_per_partition must be positive, not {}", max_contributions_per_partition)).into());
    }

    if kind.needs_value_range() {
        let lower = lower.ok_or_else(|| Error::from(ErrorKind::InvalidBounds(
            format!("a lower clamping bound is required for {:?} aggregations", kind))))?;
        let upper = upper.ok_or_else(|| Error::from(ErrorKind::InvalidBounds(
            format!("an upper clamping bound is required for {:?} aggregations", kind))))?;
        if !lower.is_finite() || !upper.is_finite() {
            return Err(ErrorKind::InvalidBounds(
                format!("clamping bounds must be finite: [{}, {}]", lower, upper)).into());
        }
        if lower > upper {
            return Err(ErrorKind::InvalidBounds(
                format!("the clamping range is inverted: lower {} > upper {}", lower, upper)).into());
        }
    }

    Ok(ContributionBounds {
        max_partitions_contributed,
        max_contributions_per_partition,
        lower,
        upper,
    })
}

impl ContributionBounds {
    pub fn max_partitions_contributed(&self) -> i64 {
        self.max_partitions_contributed
    }

    pub fn max_contributions_per_partition(&self) -> i64 {
        self.max_contributions_per_partition
    }

    pub fn lower(&self) -> Option<f64> {
        self.lower
    }

    pub fn upper(&self) -> Option<f64> {
        self.upper
    }

    /// Clamp a value into the declared range, if one was declared.
    pub fn clamp(&self, value: f64) -> f64 {
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => num::clamp(value, lower, upper),
            _ => value,
        }
    }

    /// L0 sensitivity: the number of partitions one entity can change.
    pub fn l0_sensitivity(&self) -> i64 {
        self.max_partitions_contributed
    }

    /// L-infinity sensitivity of a per-partition count: the records one
    /// entity can add to or remove from a single partition.
    pub fn per_partition_count_sensitivity(&self) -> f64 {
        self.max_contributions_per_partition as f64
    }

    /// L-infinity sensitivity of a per-partition clamped sum.
    pub fn per_partition_sum_sensitivity(&self) -> Result<f64> {
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => {
                Ok(self.max_contributions_per_partition as f64 * lower.abs().max(upper.abs()))
            }
            _ => Err(ErrorKind::InvalidBounds(
                "sum sensitivity requires a declared clamping range".to_string()).into()),
        }
    }

    /// L1 sensitivity across partitions, for pure-epsilon mechanisms.
    pub fn l1_sensitivity(&self, per_partition: f64) -> f64 {
        per_partition * self.max_partitions_contributed as f64
    }

    /// L2 sensitivity across partitions, for Gaussian mechanisms.
    pub fn l2_sensitivity(&self, per_partition: f64) -> f64 {
        per_partition * (self.max_partitions_contributed as f64).sqrt()
    }
}

#[cfg(test)]
mod test_bounds {
    use super::*;
    use crate::base::AggregationKind;

    #[test]
    fn inverted_range_is_rejected() {
        let result = compute_bounds(AggregationKind::Sum, Some(10.), Some(0.), 1, 1);
        match result {
            Err(Error(ErrorKind::InvalidBounds(_), _)) => (),
            other => panic!("expected InvalidBounds, got {:?}", other),
        }
    }

    #[test]
    fn non_positive_caps_are_rejected() {
        assert!(compute_bounds(AggregationKind::Count, None, None, 0, 1).is_err());
        assert!(compute_bounds(AggregationKind::Count, None, None, 1, -2).is_err());
    }

    #[test]
    fn count_needs_no_range_but_sum_does() {
        assert!(compute_bounds(AggregationKind::Count, None, None, 2, 4).is_ok());
        assert!(compute_bounds(AggregationKind::Sum, None, None, 2, 4).is_err());
        assert!(compute_bounds(AggregationKind::Sum, Some(0.), None, 2, 4).is_err());
        assert!(compute_bounds(AggregationKind::Sum, Some(f64::NAN), Some(1.), 2, 4).is_err());
    }

    #[test]
    fn sum_sensitivities_scale_with_caps() {
        let bounds = compute_bounds(AggregationKind::Sum, Some(-5.), Some(100.), 3, 2).unwrap();
        let per_partition = bounds.per_partition_sum_sensitivity().unwrap();
        assert_eq!(per_partition, 200.);
        assert_eq!(bounds.l1_sensitivity(per_partition), 600.);
        assert!((bounds.l2_sensitivity(per_partition) - 200. * 3f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn clamping_respects_declared_range() {
        let bounds = compute_bounds(AggregationKind::Sum, Some(0.), Some(10.), 1, 1).unwrap();
        assert_eq!(bounds.clamp(-3.), 0.);
        assert_eq!(bounds.clamp(3.), 3.);
        assert_eq!(bounds.clamp(30.), 10.);

        let unbounded = compute_bounds(AggregationKind::Count, None, None, 1, 1).unwrap();
        assert_eq!(unbounded.clamp(30.), 30.);
    }

    #[test]
    fn bounds_computation_is_idempotent() {
        let first = compute_bounds(AggregationKind::Sum, Some(0.), Some(100.), 3, 2).unwrap();
        let second = compute_bounds(AggregationKind::Sum, Some(0.), Some(100.), 3, 2).unwrap();
        assert_eq!(first, second);
    }
}
