//! Contribution bounding: the step that makes sensitivity finite.
//!
//! Runs strictly before any raw aggregate is computed. Aggregating first and
//! bounding after would leak unbounded-sensitivity information into
//! intermediate state, so the engine never exposes unbounded records to the
//! backend.

use hushmap_accountant::bounds::ContributionBounds;

use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Deterministic 64-bit rank for dropping excess contributions.
///
/// Depends only on the run seed and the hashed operands, never on map
/// iteration order, so a fixed seed reproduces the same drops regardless of
/// how the underlying engine ordered the records.
fn stable_rank<T: Hash>(seed: u64, value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Enforce the contribution caps and the clamping range on a collection of
/// `(entity, partition, value)` records.
///
/// Each entity retains at most `max_partitions_contributed` partitions and at
/// most `max_contributions_per_partition` records in each retained partition,
/// keeping the lowest-ranked candidates under `stable_rank`. Retained values
/// are clamped into the declared range.
pub fn bound_contributions<E, K>(
    records: Vec<(E, K, f64)>,
    bounds: &ContributionBounds,
    seed: u64,
) -> Vec<(E, K, f64)>
where
    E: Hash + Eq + Clone,
    K: Hash + Eq + Clone,
{
    let max_partitions = bounds.max_partitions_contributed() as usize;
    let max_per_partition = bounds.max_contributions_per_partition() as usize;

    let mut per_entity: IndexMap<E, IndexMap<K, Vec<f64>>> = IndexMap::new();
    for (entity, partition, value) in records {
        per_entity
            .entry(entity)
            .or_insert_with(IndexMap::new)
            .entry(partition)
            .or_insert_with(Vec::new)
            .push(value);
    }

    let mut bounded = Vec::new();
    for (entity, mut partitions) in per_entity {
        if partitions.len() > max_partitions {
            let keep = partitions.keys()
                .map(|partition| (stable_rank(seed, &(&entity, partition)), partition.clone()))
                .sorted_by_key(|(rank, _)| *rank)
                .take(max_partitions)
                .map(|(_, partition)| partition)
                .collect::<HashSet<K>>();
            partitions.retain(|partition, _| keep.contains(partition));
        }

        for (partition, values) in partitions {
            let values = if values.len() > max_per_partition {
                // duplicates share a rank; dropping either copy is equivalent
                values.into_iter()
                    .map(|value| (stable_rank(seed, &(&entity, &partition, value.to_bits())), value))
                    .sorted_by_key(|(rank, _)| *rank)
                    .take(max_per_partition)
                    .map(|(_, value)| value)
                    .collect::<Vec<f64>>()
            } else {
                values
            };

            for value in values {
                bounded.push((entity.clone(), partition.clone(), bounds.clamp(value)));
            }
        }
    }
    bounded
}
