//! The narrow seam onto the external data-processing engine.
//!
//! The core needs exactly two capabilities from whatever runs it: keyed
//! grouping with per-key reduction, and per-key value mapping. Distribution,
//! shuffling and fault tolerance all live on the other side of this trait.

use indexmap::IndexMap;
use std::hash::Hash;

/// Collection transforms the aggregation engine is allowed to ask for.
///
/// The reduction must be associative and commutative in effect: the backend
/// may combine per-key accumulators in any grouping, so `fold` has to reach
/// the same result for any record order within a key.
pub trait PipelineBackend {
    /// Group `(key, value)` records and fold each group into an accumulator.
    fn fold_by_key<K, V, A, F>(&self, records: Vec<(K, V)>, init: A, fold: F) -> IndexMap<K, A>
    where
        K: Hash + Eq,
        A: Clone,
        F: Fn(&mut A, V);

    /// Transform the value of every group, keeping keys in place.
    fn map_values<K, A, B, F>(&self, groups: IndexMap<K, A>, map: F) -> IndexMap<K, B>
    where
        K: Hash + Eq,
        F: Fn(&K, A) -> B;
}

/// In-process reference backend over an order-preserving map, for tests and
/// single-machine runs.
pub struct LocalBackend;

impl PipelineBackend for LocalBackend {
    fn fold_by_key<K, V, A, F>(&self, records: Vec<(K, V)>, init: A, fold: F) -> IndexMap<K, A>
    where
        K: Hash + Eq,
        A: Clone,
        F: Fn(&mut A, V),
    {
        let mut groups: IndexMap<K, A> = IndexMap::new();
        for (key, value) in records {
            let accumulator = groups.entry(key).or_insert_with(|| init.clone());
            fold(accumulator, value);
        }
        groups
    }

    fn map_values<K, A, B, F>(&self, groups: IndexMap<K, A>, map: F) -> IndexMap<K, B>
    where
        K: Hash + Eq,
        F: Fn(&K, A) -> B,
    {
        groups.into_iter().map(|(key, value)| {
            let mapped = map(&key, value);
            (key, mapped)
        }).collect()
    }
}
