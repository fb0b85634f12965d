//! Core data model shared by the accountant and the runtime.
//!
//! Everything here is configuration or bookkeeping state: the privacy
//! specification for a computation, the per-aggregation parameters, and the
//! budget slices granted by the accountant. None of these types touch data.

use crate::errors::*;
use crate::utilities::privacy::validate_privacy_parameters;

use serde::{Deserialize, Serialize};

/// Composition rule used when combining privacy loss across aggregations.
///
/// Sequential composition sums privacy loss over all allocations. Parallel
/// composition applies when aggregations touch disjoint partition sets, where
/// privacy loss is the maximum over branches rather than the sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Composition {
    Sequential,
    Parallel,
}

/// The noise distribution a budget slice will be spent on.
///
/// Selected at configuration time, never via runtime type inspection. The
/// discrete variants sample with exact integer arithmetic and are meant for
/// integer-valued aggregates such as counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    Laplace,
    Gaussian,
    DiscreteLaplace,
    DiscreteGaussian,
}

impl MechanismKind {
    /// Whether the mechanism consumes delta in addition to epsilon.
    pub fn uses_delta(self) -> bool {
        match self {
            MechanismKind::Laplace | MechanismKind::DiscreteLaplace => false,
            MechanismKind::Gaussian | MechanismKind::DiscreteGaussian => true,
        }
    }

    /// Whether the mechanism samples integer-valued noise.
    pub fn is_discrete(self) -> bool {
        match self {
            MechanismKind::DiscreteLaplace | MechanismKind::DiscreteGaussian => true,
            MechanismKind::Laplace | MechanismKind::Gaussian => false,
        }
    }
}

/// The statistic computed per partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    Sum,
    Mean,
    Quantile,
}

impl AggregationKind {
    /// Whether the aggregation needs a declared value clamping range.
    pub fn needs_value_range(self) -> bool {
        match self {
            AggregationKind::Count => false,
            AggregationKind::Sum | AggregationKind::Mean | AggregationKind::Quantile => true,
        }
    }
}

/// Immutable privacy configuration for one computation.
///
/// Created once, owned by the budget accountant, never mutated. The total
/// epsilon and delta here bound the privacy loss of everything released by
/// the computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacySpec {
    epsilon: f64,
    delta: f64,
    composition: Composition,
}

impl PrivacySpec {
    /// Validate and construct a privacy specification.
    ///
    /// # Arguments
    /// * `epsilon` - total epsilon for the computation, must be positive
    /// * `delta` - total delta for the computation, must be in [0, 1)
    /// * `composition` - composition rule for combining allocations
    ///
    /// # Example
    /// ```
    /// use hushmap_accountant::base::{Composition, PrivacySpec};
    /// let spec = PrivacySpec::new(1.0, 1e-6, Composition::Sequential).unwrap();
    /// assert_eq!(spec.epsilon(), 1.0);
    /// ```
    pub fn new(epsilon: f64, delta: f64, composition: Composition) -> Result<PrivacySpec> {
        // warnings are surfaced through check(), violations fail here
        validate_privacy_parameters(epsilon, delta)?;
        Ok(PrivacySpec { epsilon, delta, composition })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn composition(&self) -> Composition {
        self.composition
    }

    /// Re-run parameter validation, returning the non-fatal warnings.
    pub fn check(&self) -> Result<Vec<Error>> {
        validate_privacy_parameters(self.epsilon, self.delta)
    }
}

/// Per-aggregation request parameters: the metric, its mechanism, the value
/// range, the contribution caps, and the relative budget weights.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateParams {
    pub kind: AggregationKind,
    pub mechanism: MechanismKind,
    /// Lower clamping bound. Required for all aggregations except counts.
    #[serde(default)]
    pub lower: Option<f64>,
    /// Upper clamping bound. Required for all aggregations except counts.
    #[serde(default)]
    pub upper: Option<f64>,
    pub max_partitions_contributed: i64,
    pub max_contributions_per_partition: i64,
    /// Relative share of the budget consumed by this aggregation's noise,
    /// compared to the other aggregations in the same computation.
    #[serde(default = "default_weight")]
    pub budget_weight: f64,
    /// Relative share consumed by this aggregation's partition selection.
    /// Selection draws its own allocation, separate from the noise.
    #[serde(default = "default_weight")]
    pub partition_selection_weight: f64,
    /// Rank in (0, 1) for quantile aggregations, e.g. 0.5 for the median.
    #[serde(default)]
    pub quantile: Option<f64>,
}

fn default_weight() -> f64 {
    1.0
}

impl AggregateParams {
    /// Parameters for one aggregation with default weights and no range.
    pub fn new(kind: AggregationKind, mechanism: MechanismKind) -> AggregateParams {
        AggregateParams {
            kind,
            mechanism,
            lower: None,
            upper: None,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            budget_weight: 1.0,
            partition_selection_weight: 1.0,
            quantile: None,
        }
    }

    pub fn with_range(mut self, lower: f64, upper: f64) -> AggregateParams {
        self.lower = Some(lower);
        self.upper = Some(upper);
        self
    }

    pub fn with_contribution_caps(
        mut self,
        max_partitions_contributed: i64,
        max_contributions_per_partition: i64,
    ) -> AggregateParams {
        self.max_partitions_contributed = max_partitions_contributed;
        self.max_contributions_per_partition = max_contributions_per_partition;
        self
    }

    pub fn with_quantile(mut self, quantile: f64) -> AggregateParams {
        self.quantile = Some(quantile);
        self
    }

    /// The number of noise allocations this aggregation will draw, in
    /// addition to its partition selection allocation. Composite metrics draw
    /// one allocation per sub-aggregate.
    pub fn noise_allocations(&self) -> usize {
        match self.kind {
            AggregationKind::Mean => 2,
            AggregationKind::Count | AggregationKind::Sum | AggregationKind::Quantile => 1,
        }
    }
}

/// A reserved (epsilon, delta) slice drawn from the total budget for one
/// mechanism invocation.
///
/// Allocations are move-only: a mechanism consumes one by value exactly once,
/// and an unconsumed allocation may be handed back to the accountant. They
/// cannot be cloned or otherwise reused.
#[derive(Debug)]
pub struct BudgetAllocation {
    epsilon: f64,
    delta: f64,
    kind: MechanismKind,
    parallel: bool,
}

impl BudgetAllocation {
    /// Construct an allocation directly.
    ///
    /// Budget requested through a `BudgetAccountant` is tracked in its
    /// ledger; a hand-built allocation is not, and bypasses exhaustion
    /// checks.
    pub fn new(epsilon: f64, delta: f64, kind: MechanismKind) -> BudgetAllocation {
        BudgetAllocation { epsilon, delta, kind, parallel: false }
    }

    pub(crate) fn parallel(epsilon: f64, delta: f64, kind: MechanismKind) -> BudgetAllocation {
        BudgetAllocation { epsilon, delta, kind, parallel: true }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn kind(&self) -> MechanismKind {
        self.kind
    }

    pub(crate) fn is_parallel(&self) -> bool {
        self.parallel
    }
}

/// Terminal artifact of the pipeline: one noised value per released
/// partition, with the mechanism used and the budget spent on it. The raw
/// aggregate does not survive past noising.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NoisedResult {
    pub value: f64,
    pub mechanism: MechanismKind,
    pub epsilon: f64,
    pub delta: f64,
}
