//! Per-metric aggregation components.
//!
//! Each module computes the raw statistic for one metric and noises it under
//! a budget allocation. The accumulator types here are what flows through
//! the collection-transform backend: first per (partition, entity), then per
//! partition, so the distinct-contributor count stays an associative fold.

pub mod count;
pub mod mean;
pub mod quantile;
pub mod sum;

/// Raw accumulation of one entity's bounded records within one partition.
#[derive(Clone, Debug, Default)]
pub struct EntityContribution {
    pub count: i64,
    pub sum: f64,
    pub sum_squares: f64,
    /// Individual values, collected only when the metric needs the full
    /// multiset (quantiles).
    pub values: Vec<f64>,
}

impl EntityContribution {
    pub fn observe(&mut self, value: f64, collect_values: bool) {
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
        if collect_values {
            self.values.push(value);
        }
    }
}

/// Raw aggregate of one partition across entities.
///
/// Consumed by partition selection and noising, then discarded; raw values
/// never flow past the mechanism layer.
#[derive(Clone, Debug, Default)]
pub struct PartitionAggregate {
    pub privacy_id_count: i64,
    pub count: i64,
    pub sum: f64,
    pub sum_squares: f64,
    pub values: Vec<f64>,
}

impl PartitionAggregate {
    /// Fold one entity's contribution in. Each contribution is a distinct
    /// entity by construction of the two-stage grouping.
    pub fn absorb(&mut self, contribution: EntityContribution) {
        self.privacy_id_count += 1;
        self.count += contribution.count;
        self.sum += contribution.sum;
        self.sum_squares += contribution.sum_squares;
        self.values.extend(contribution.values);
    }
}
