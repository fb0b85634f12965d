//! The aggregation engine: per-metric orchestration of the fixed pipeline
//! bound contributions -> raw aggregate -> partition selection -> noise ->
//! emit.
//!
//! The budget accountant is passed in explicitly and shared by every metric
//! in the computation session, so the total spend is tracked in one ledger.
//! The engine owns the run's noise source; a fixed seed reproduces the whole
//! run, and a seed is never shared between runs.

use hushmap_accountant::accountant::BudgetAccountant;
use hushmap_accountant::base::{
    AggregateParams, AggregationKind, BudgetAllocation, MechanismKind, NoisedResult,
};
use hushmap_accountant::bounds::{compute_bounds, ContributionBounds};
use hushmap_accountant::errors::*;
use hushmap_accountant::utilities::privacy::split_weight;

use indexmap::IndexMap;
use std::hash::Hash;

use crate::bounding::bound_contributions;
use crate::components::{count, mean, quantile, sum, EntityContribution, PartitionAggregate};
use crate::partition_selection::noised_threshold;
use crate::transform::PipelineBackend;
use crate::utilities::noise::NoiseSource;

/// Declare the weight denominators for a whole computation session on its
/// accountant, from the aggregations it will run.
///
/// Every aggregation consumes its `partition_selection_weight` (epsilon and
/// delta) plus its `budget_weight` for noise (delta only for delta-consuming
/// mechanisms). Must be called once, before the first `aggregate` call.
pub fn declare_aggregations(accountant: &BudgetAccountant, requests: &[AggregateParams]) -> Result<()> {
    if requests.is_empty() {
        return Err("at least one aggregation must be declared".into());
    }
    let mut epsilon_weight = 0.0;
    let mut delta_weight = 0.0;
    for params in requests {
        if !params.budget_weight.is_finite() || params.budget_weight <= 0.0 {
            bail!("budget_weight must be positive, not {}", params.budget_weight);
        }
        if !params.partition_selection_weight.is_finite() || params.partition_selection_weight <= 0.0 {
            bail!("partition_selection_weight must be positive, not {}", params.partition_selection_weight);
        }
        epsilon_weight += params.budget_weight + params.partition_selection_weight;
        delta_weight += params.partition_selection_weight;
        if params.mechanism.uses_delta() {
            delta_weight += params.budget_weight;
        }
    }
    accountant.declare_weights(epsilon_weight, delta_weight)
}

/// One computation session's execution state: the shared accountant and the
/// run-scoped noise source.
pub struct DpEngine<'a> {
    accountant: &'a BudgetAccountant,
    source: NoiseSource,
    tie_break_seed: u64,
}

impl<'a> DpEngine<'a> {
    /// Build an engine over a shared accountant.
    ///
    /// The contribution-dropping tie-break seed is drawn from the source, so
    /// a seeded source reproduces bounding decisions as well as noise.
    pub fn new(accountant: &'a BudgetAccountant, mut source: NoiseSource) -> Result<DpEngine<'a>> {
        let tie_break_seed = source.next_u64()?;
        Ok(DpEngine { accountant, source, tie_break_seed })
    }

    /// Run one metric over `(entity, partition, value)` records and emit the
    /// per-partition noised results.
    ///
    /// Partitions failing the selection test are absent from the output by
    /// design. On failure, allocations not yet spent on data are handed back
    /// to the ledger.
    pub fn aggregate<B, E, K>(
        &mut self,
        backend: &B,
        records: Vec<(E, K, f64)>,
        params: &AggregateParams,
    ) -> Result<IndexMap<K, NoisedResult>>
    where
        B: PipelineBackend,
        E: Hash + Eq + Clone,
        K: Hash + Eq + Clone,
    {
        let bounds = compute_bounds(
            params.kind,
            params.lower,
            params.upper,
            params.max_partitions_contributed,
            params.max_contributions_per_partition,
        )?;
        if params.kind == AggregationKind::Quantile && params.quantile.is_none() {
            return Err(ErrorKind::InvalidBounds(
                "quantile aggregations require a declared rank".to_string()).into());
        }

        // selection noise follows the metric's mechanism family
        let selection_kind = if params.mechanism.uses_delta() {
            MechanismKind::Gaussian
        } else {
            MechanismKind::Laplace
        };

        let mut selection = Some(
            self.accountant.request_selection_budget(selection_kind, params.partition_selection_weight)?);
        let mut noise: Vec<Option<BudgetAllocation>> = Vec::new();
        for weight in split_weight(params.budget_weight, params.noise_allocations())? {
            match self.accountant.request_budget(params.mechanism, weight) {
                Ok(allocation) => noise.push(Some(allocation)),
                Err(error) => {
                    self.give_back(selection.take(), &mut noise);
                    return Err(error);
                }
            }
        }

        let result = self.run_pipeline(backend, records, params, &bounds, &mut selection, &mut noise);
        if result.is_err() {
            // no partial spend for a partially executed aggregation
            self.give_back(selection.take(), &mut noise);
        }
        result
    }

    fn run_pipeline<B, E, K>(
        &mut self,
        backend: &B,
        records: Vec<(E, K, f64)>,
        params: &AggregateParams,
        bounds: &ContributionBounds,
        selection: &mut Option<BudgetAllocation>,
        noise: &mut Vec<Option<BudgetAllocation>>,
    ) -> Result<IndexMap<K, NoisedResult>>
    where
        B: PipelineBackend,
        E: Hash + Eq + Clone,
        K: Hash + Eq + Clone,
    {
        let collect_values = params.kind == AggregationKind::Quantile;

        // contribution bounding runs before any raw aggregate is computed
        let bounded = bound_contributions(records, bounds, self.tie_break_seed);

        // stage one groups per (partition, entity) so that stage two sees
        // each entity exactly once per partition
        let keyed = bounded.into_iter()
            .map(|(entity, partition, value)| ((partition, entity), value))
            .collect::<Vec<((K, E), f64)>>();
        let per_entity = backend.fold_by_key(
            keyed,
            EntityContribution::default(),
            |contribution, value| contribution.observe(value, collect_values),
        );

        let keyed = per_entity.into_iter()
            .map(|((partition, _entity), contribution)| (partition, contribution))
            .collect::<Vec<(K, EntityContribution)>>();
        let per_partition = backend.fold_by_key(
            keyed,
            PartitionAggregate::default(),
            |aggregate, contribution| aggregate.absorb(contribution),
        );

        let test = {
            let allocation = selection.as_ref().ok_or_else(|| Error::from(ErrorKind::BudgetAccounting(
                "the selection allocation was already consumed".to_string())))?;
            noised_threshold(allocation, bounds.max_partitions_contributed())?
        };
        // the test is about to touch sensitive counts: its budget is spent
        let _selection_spent = selection.take();

        let mut kept: IndexMap<K, PartitionAggregate> = IndexMap::new();
        for (partition, aggregate) in per_partition {
            if test.should_keep(aggregate.privacy_id_count, &mut self.source)? {
                kept.insert(partition, aggregate);
            }
        }

        let mut results: IndexMap<K, NoisedResult> = IndexMap::with_capacity(kept.len());
        match params.kind {
            AggregationKind::Count => {
                let allocation = take_allocation(noise, 0)?;
                for (partition, aggregate) in kept {
                    let noised = count::noised_count(aggregate.count, bounds, &allocation, &mut self.source)?;
                    results.insert(partition, noised);
                }
            }
            AggregationKind::Sum => {
                let allocation = take_allocation(noise, 0)?;
                for (partition, aggregate) in kept {
                    let noised = sum::noised_sum(aggregate.sum, bounds, &allocation, &mut self.source)?;
                    results.insert(partition, noised);
                }
            }
            AggregationKind::Mean => {
                let sum_allocation = take_allocation(noise, 0)?;
                let count_allocation = take_allocation(noise, 1)?;
                for (partition, aggregate) in kept {
                    let noised_sum = sum::noised_sum(aggregate.sum, bounds, &sum_allocation, &mut self.source)?;
                    let noised_count = count::noised_count(aggregate.count, bounds, &count_allocation, &mut self.source)?;
                    results.insert(partition, mean::compose_mean(&noised_sum, &noised_count));
                }
            }
            AggregationKind::Quantile => {
                let allocation = take_allocation(noise, 0)?;
                let rank = params.quantile.ok_or_else(|| Error::from(ErrorKind::InvalidBounds(
                    "quantile aggregations require a declared rank".to_string())))?;
                for (partition, aggregate) in kept {
                    let noised = quantile::noised_quantile(
                        &aggregate.values, rank, bounds, &allocation, &mut self.source)?;
                    results.insert(partition, noised);
                }
            }
        }
        Ok(results)
    }

    fn give_back(&self, selection: Option<BudgetAllocation>, noise: &mut Vec<Option<BudgetAllocation>>) {
        // the original failure is what the caller needs to see; a give-back
        // failure cannot unwind anything further
        if let Some(allocation) = selection {
            let _ = self.accountant.return_allocation(allocation);
        }
        for slot in noise.iter_mut() {
            if let Some(allocation) = slot.take() {
                let _ = self.accountant.return_allocation(allocation);
            }
        }
    }
}

fn take_allocation(noise: &mut Vec<Option<BudgetAllocation>>, index: usize) -> Result<BudgetAllocation> {
    noise.get_mut(index)
        .and_then(|slot| slot.take())
        .ok_or_else(|| Error::from(ErrorKind::BudgetAccounting(
            "a noise allocation was consumed twice".to_string())))
}
