//! The process-wide privacy budget ledger.
//!
//! One `BudgetAccountant` instance tracks the total (epsilon, delta) budget
//! of one computation and hands out proportional slices to every mechanism
//! invocation in it. The accountant is passed explicitly to whatever needs
//! an allocation; it is never a process-wide singleton, so concurrent
//! computations cannot cross-contaminate budgets.

use crate::base::{BudgetAllocation, Composition, MechanismKind, PrivacySpec};
use crate::errors::*;
use crate::utilities::exceeds;

use itertools::Itertools;
use serde::Serialize;
use std::sync::Mutex;

/// Maximum cumulative rounding error the ledger arithmetic may accumulate
/// before requests are rejected.
pub const DEFAULT_LEDGER_TOLERANCE: f64 = 1e-9;

/// One entry in the grant history. Returned allocations append a
/// compensating entry with negated amounts.
#[derive(Clone, Copy, Debug)]
struct Grant {
    kind: MechanismKind,
    epsilon: f64,
    delta: f64,
}

#[derive(Debug)]
struct Ledger {
    epsilon_spent: f64,
    delta_spent: f64,
    // high-water marks for parallel-exempt grants; the parallel composition
    // theorem bounds their loss by the maximum, not the sum
    parallel_epsilon_peak: f64,
    parallel_delta_peak: f64,
    epsilon_weight_total: Option<f64>,
    delta_weight_total: Option<f64>,
    sealed: bool,
    grants: Vec<Grant>,
}

/// Ledger for the total privacy budget of one computation.
///
/// All allocation math happens under one mutex, as a single ledger update per
/// request: allocate-then-confirm, no optimistic retry. Retrying a budget
/// request with a fresh random outcome would double-spend privacy.
pub struct BudgetAccountant {
    spec: PrivacySpec,
    tolerance: f64,
    ledger: Mutex<Ledger>,
}

/// Per-mechanism spend, for the JSON report.
#[derive(Serialize)]
struct MechanismSpend {
    kind: MechanismKind,
    epsilon: f64,
    delta: f64,
}

/// Snapshot of the ledger, for the JSON report.
#[derive(Serialize)]
struct SpendSummary {
    epsilon_total: f64,
    delta_total: f64,
    epsilon_spent: f64,
    delta_spent: f64,
    epsilon_remaining: f64,
    delta_remaining: f64,
    sealed: bool,
    mechanisms: Vec<MechanismSpend>,
}

impl BudgetAccountant {
    /// Accountant with undeclared weight totals. `declare_weights` must be
    /// called before the first request.
    pub fn new(spec: PrivacySpec) -> BudgetAccountant {
        BudgetAccountant {
            spec,
            tolerance: DEFAULT_LEDGER_TOLERANCE,
            ledger: Mutex::new(Ledger {
                epsilon_spent: 0.0,
                delta_spent: 0.0,
                parallel_epsilon_peak: 0.0,
                parallel_delta_peak: 0.0,
                epsilon_weight_total: None,
                delta_weight_total: None,
                sealed: false,
                grants: Vec::new(),
            }),
        }
    }

    /// Accountant for a known number of equally weighted aggregations, each
    /// making one unit-weight request.
    ///
    /// # Example
    /// ```
    /// use hushmap_accountant::accountant::BudgetAccountant;
    /// use hushmap_accountant::base::{Composition, MechanismKind, PrivacySpec};
    ///
    /// let spec = PrivacySpec::new(1.0, 0.0, Composition::Sequential).unwrap();
    /// let accountant = BudgetAccountant::for_aggregations(spec, 2).unwrap();
    /// let alloc = accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();
    /// assert_eq!(alloc.epsilon(), 0.5);
    /// ```
    pub fn for_aggregations(spec: PrivacySpec, n_aggregations: usize) -> Result<BudgetAccountant> {
        if n_aggregations == 0 {
            return Err("n_aggregations must be positive".into());
        }
        let accountant = BudgetAccountant::new(spec);
        accountant.declare_weights(n_aggregations as f64, n_aggregations as f64)?;
        Ok(accountant)
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> BudgetAccountant {
        self.tolerance = tolerance;
        self
    }

    pub fn spec(&self) -> &PrivacySpec {
        &self.spec
    }

    /// Declare the weight denominators for the whole computation: the summed
    /// weights of every epsilon-consuming and every delta-consuming request
    /// that will be made. Callable exactly once, before any request.
    pub fn declare_weights(&self, epsilon_weight_total: f64, delta_weight_total: f64) -> Result<()> {
        if !epsilon_weight_total.is_finite() || epsilon_weight_total <= 0.0 {
            return Err(format!("total epsilon weight must be positive, not {}", epsilon_weight_total).into());
        }
        if !delta_weight_total.is_finite() || delta_weight_total < 0.0 {
            return Err(format!("total delta weight may not be negative or NaN: {}", delta_weight_total).into());
        }
        let mut ledger = self.lock_ledger()?;
        if ledger.epsilon_weight_total.is_some() {
            return Err(ErrorKind::BudgetAccounting("weight totals are already declared".to_string()).into());
        }
        ledger.epsilon_weight_total = Some(epsilon_weight_total);
        ledger.delta_weight_total = Some(delta_weight_total);
        Ok(())
    }

    /// Reserve a slice of the sequential budget for one mechanism invocation.
    ///
    /// The grant is `total_epsilon * weight / epsilon_weight_total`, and the
    /// corresponding delta share when the mechanism consumes delta.
    pub fn request_budget(&self, kind: MechanismKind, weight: f64) -> Result<BudgetAllocation> {
        self.grant(kind, weight, kind.uses_delta(), false)
    }

    /// Reserve a slice for a partition selection test.
    ///
    /// Selection always consumes delta: the release threshold is derived from
    /// it. This is a separate allocation from the aggregate's own noise.
    pub fn request_selection_budget(&self, kind: MechanismKind, weight: f64) -> Result<BudgetAllocation> {
        if self.spec.delta() <= 0.0 {
            return Err("partition selection requires that the total delta is greater than 0".into());
        }
        self.grant(kind, weight, true, false)
    }

    /// Reserve a parallel-exempt slice for an aggregation over a partition
    /// set disjoint from every other parallel aggregation.
    ///
    /// `weight` is the fraction of the full budget used within the branch, so
    /// grants do not reduce the sequential remainder. Disjointness across
    /// branches is the caller's contract; it is not observable here.
    pub fn request_parallel_budget(&self, kind: MechanismKind, weight: f64) -> Result<BudgetAllocation> {
        if self.spec.composition() != Composition::Parallel {
            return Err("parallel budget requests require a parallel composition privacy spec".into());
        }
        self.grant(kind, weight, kind.uses_delta(), true)
    }

    fn grant(&self, kind: MechanismKind, weight: f64, uses_delta: bool, parallel: bool) -> Result<BudgetAllocation> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(format!("budget weight must be positive, not {}", weight).into());
        }
        if kind.uses_delta() && self.spec.delta() <= 0.0 {
            return Err("the Gaussian mechanism requires that the total delta is greater than 0".into());
        }

        let mut ledger = self.lock_ledger()?;
        if ledger.sealed {
            return Err(ErrorKind::BudgetSealed.into());
        }

        let (epsilon, delta) = if parallel {
            if weight > 1.0 {
                return Err("a parallel weight is a within-branch fraction and may not exceed 1".into());
            }
            let epsilon = self.spec.epsilon() * weight;
            let delta = if uses_delta { self.spec.delta() * weight } else { 0.0 };
            ledger.parallel_epsilon_peak = ledger.parallel_epsilon_peak.max(epsilon);
            ledger.parallel_delta_peak = ledger.parallel_delta_peak.max(delta);
            (epsilon, delta)
        } else {
            let epsilon_weight_total = ledger.epsilon_weight_total
                .ok_or_else(|| Error::from(ErrorKind::BudgetAccounting(
                    "weight totals must be declared before requesting budget".to_string())))?;

            let epsilon = self.spec.epsilon() * weight / epsilon_weight_total;
            if exceeds(ledger.epsilon_spent + epsilon, self.spec.epsilon(), self.tolerance) {
                return Err(ErrorKind::BudgetExhausted(epsilon, self.spec.epsilon() - ledger.epsilon_spent).into());
            }

            let delta = if uses_delta {
                let delta_weight_total = ledger.delta_weight_total
                    .filter(|total| *total > 0.0)
                    .ok_or_else(|| Error::from(ErrorKind::BudgetAccounting(
                        "a delta-consuming request was made but no delta weight was declared".to_string())))?;
                let delta = self.spec.delta() * weight / delta_weight_total;
                if exceeds(ledger.delta_spent + delta, self.spec.delta(), self.tolerance) {
                    return Err(ErrorKind::BudgetExhausted(delta, self.spec.delta() - ledger.delta_spent).into());
                }
                delta
            } else {
                0.0
            };

            ledger.epsilon_spent += epsilon;
            ledger.delta_spent += delta;
            self.check_drift(&ledger)?;
            (epsilon, delta)
        };

        ledger.grants.push(Grant { kind, epsilon, delta });
        Ok(if parallel {
            BudgetAllocation::parallel(epsilon, delta, kind)
        } else {
            BudgetAllocation::new(epsilon, delta, kind)
        })
    }

    /// Hand an unconsumed allocation back to the ledger.
    ///
    /// Cancellation support: a partially executed aggregation must not leave
    /// a partial spend behind. Parallel-exempt grants leave their high-water
    /// mark in place, which is the conservative direction.
    pub fn return_allocation(&self, allocation: BudgetAllocation) -> Result<()> {
        let mut ledger = self.lock_ledger()?;
        if !allocation.is_parallel() {
            ledger.epsilon_spent -= allocation.epsilon();
            ledger.delta_spent -= allocation.delta();
            if ledger.epsilon_spent < -self.tolerance || ledger.delta_spent < -self.tolerance {
                return Err(ErrorKind::BudgetAccounting(
                    "more budget was returned than was ever granted".to_string()).into());
            }
        }
        ledger.grants.push(Grant {
            kind: allocation.kind(),
            epsilon: -allocation.epsilon(),
            delta: -allocation.delta(),
        });
        Ok(())
    }

    /// Seal the accountant. Every later request fails with `BudgetSealed`.
    pub fn finalize(&self) -> Result<()> {
        let mut ledger = self.lock_ledger()?;
        if ledger.sealed {
            return Err(ErrorKind::BudgetSealed.into());
        }
        ledger.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        match self.lock_ledger() {
            Ok(ledger) => ledger.sealed,
            Err(_) => true,
        }
    }

    pub fn remaining_epsilon(&self) -> Result<f64> {
        let ledger = self.lock_ledger()?;
        self.check_drift(&ledger)?;
        Ok(self.spec.epsilon() - ledger.epsilon_spent)
    }

    pub fn remaining_delta(&self) -> Result<f64> {
        let ledger = self.lock_ledger()?;
        self.check_drift(&ledger)?;
        Ok(self.spec.delta() - ledger.delta_spent)
    }

    /// Generate a json string with a summary of the budget spent so far,
    /// broken down by mechanism kind.
    pub fn summarize(&self) -> Result<String> {
        let ledger = self.lock_ledger()?;

        let mechanisms = ledger.grants.iter()
            .map(|grant| (grant.kind, (grant.epsilon, grant.delta)))
            .into_group_map()
            .into_iter()
            .map(|(kind, spends)| MechanismSpend {
                kind,
                epsilon: spends.iter().map(|(epsilon, _)| epsilon).sum(),
                delta: spends.iter().map(|(_, delta)| delta).sum(),
            })
            .sorted_by_key(|spend| spend.kind)
            .collect::<Vec<MechanismSpend>>();

        let summary = SpendSummary {
            epsilon_total: self.spec.epsilon(),
            delta_total: self.spec.delta(),
            epsilon_spent: ledger.epsilon_spent,
            delta_spent: ledger.delta_spent,
            epsilon_remaining: self.spec.epsilon() - ledger.epsilon_spent,
            delta_remaining: self.spec.delta() - ledger.delta_spent,
            sealed: ledger.sealed,
            mechanisms,
        };

        match serde_json::to_string(&summary) {
            Ok(serialized) => Ok(serialized),
            Err(_) => Err("unable to parse budget summary into json".into()),
        }
    }

    fn lock_ledger(&self) -> Result<std::sync::MutexGuard<Ledger>> {
        self.ledger.lock()
            .map_err(|_| Error::from(ErrorKind::BudgetAccounting("the budget ledger mutex is poisoned".to_string())))
    }

    fn check_drift(&self, ledger: &Ledger) -> Result<()> {
        if self.spec.epsilon() - ledger.epsilon_spent < -self.tolerance {
            return Err(ErrorKind::BudgetAccounting(format!(
                "remaining epsilon drifted negative: {}", self.spec.epsilon() - ledger.epsilon_spent)).into());
        }
        if self.spec.delta() - ledger.delta_spent < -self.tolerance {
            return Err(ErrorKind::BudgetAccounting(format!(
                "remaining delta drifted negative: {}", self.spec.delta() - ledger.delta_spent)).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_accountant {
    use super::*;

    fn sequential_spec() -> PrivacySpec {
        PrivacySpec::new(1.0, 1e-6, Composition::Sequential).unwrap()
    }

    // small deterministic generator so the allocation-sequence property test
    // does not depend on an rng crate
    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn equal_split_consumes_budget_exactly() {
        let accountant = BudgetAccountant::for_aggregations(sequential_spec(), 2).unwrap();

        let count = accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();
        let sum = accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();
        assert_eq!(count.epsilon(), 0.5);
        assert_eq!(sum.epsilon(), 0.5);
        assert_eq!(count.delta(), 0.0);

        assert_eq!(accountant.remaining_epsilon().unwrap(), 0.0);
    }

    #[test]
    fn granted_epsilon_never_exceeds_total() {
        let mut state = 0x9e3779b97f4a7c15_u64;
        for trial in 0..20 {
            let n_requests = 1 + (xorshift(&mut state) % 12) as usize;
            let weights = (0..n_requests)
                .map(|_| 1.0 + (xorshift(&mut state) % 8) as f64)
                .collect::<Vec<f64>>();
            let total_weight: f64 = weights.iter().sum();

            let accountant = BudgetAccountant::new(sequential_spec());
            accountant.declare_weights(total_weight, total_weight).unwrap();

            let mut granted = 0.0;
            for (i, weight) in weights.iter().enumerate() {
                let kind = if i % 2 == 0 { MechanismKind::Laplace } else { MechanismKind::Gaussian };
                let allocation = accountant.request_budget(kind, *weight).unwrap();
                granted += allocation.epsilon();
            }
            assert!(granted <= 1.0 + DEFAULT_LEDGER_TOLERANCE, "trial {}: granted {}", trial, granted);
            assert!(accountant.remaining_epsilon().unwrap() >= -DEFAULT_LEDGER_TOLERANCE);
            assert!(accountant.remaining_delta().unwrap() >= -DEFAULT_LEDGER_TOLERANCE);
        }
    }

    #[test]
    fn over_requesting_fails_with_exhausted() {
        let accountant = BudgetAccountant::for_aggregations(sequential_spec(), 1).unwrap();
        accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();

        let denied = accountant.request_budget(MechanismKind::Laplace, 1.0);
        match denied {
            Err(Error(ErrorKind::BudgetExhausted(_, _), _)) => (),
            other => panic!("expected BudgetExhausted, got {:?}", other),
        }
    }

    #[test]
    fn sealed_accountant_rejects_requests() {
        let accountant = BudgetAccountant::for_aggregations(sequential_spec(), 2).unwrap();
        accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();
        accountant.finalize().unwrap();

        match accountant.request_budget(MechanismKind::Laplace, 1.0) {
            Err(Error(ErrorKind::BudgetSealed, _)) => (),
            other => panic!("expected BudgetSealed, got {:?}", other),
        }
        // finalize is not re-entrant
        assert!(accountant.finalize().is_err());
    }

    #[test]
    fn undeclared_weights_fail_accounting() {
        let accountant = BudgetAccountant::new(sequential_spec());
        match accountant.request_budget(MechanismKind::Laplace, 1.0) {
            Err(Error(ErrorKind::BudgetAccounting(_), _)) => (),
            other => panic!("expected BudgetAccounting, got {:?}", other),
        }
    }

    #[test]
    fn gaussian_requires_positive_delta() {
        let spec = PrivacySpec::new(1.0, 0.0, Composition::Sequential).unwrap();
        let accountant = BudgetAccountant::for_aggregations(spec, 1).unwrap();
        assert!(accountant.request_budget(MechanismKind::Gaussian, 1.0).is_err());
        assert!(accountant.request_selection_budget(MechanismKind::Laplace, 1.0).is_err());
    }

    #[test]
    fn parallel_requests_leave_sequential_budget_untouched() {
        let spec = PrivacySpec::new(1.0, 1e-6, Composition::Parallel).unwrap();
        let accountant = BudgetAccountant::new(spec);
        accountant.declare_weights(2.0, 2.0).unwrap();

        let parallel = accountant.request_parallel_budget(MechanismKind::Laplace, 1.0).unwrap();
        assert_eq!(parallel.epsilon(), 1.0);
        assert_eq!(accountant.remaining_epsilon().unwrap(), 1.0);

        // sequential requests still draw from the untouched pool
        let sequential = accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();
        assert_eq!(sequential.epsilon(), 0.5);
        assert_eq!(accountant.remaining_epsilon().unwrap(), 0.5);
    }

    #[test]
    fn parallel_requests_rejected_under_sequential_composition() {
        let accountant = BudgetAccountant::for_aggregations(sequential_spec(), 1).unwrap();
        assert!(accountant.request_parallel_budget(MechanismKind::Laplace, 1.0).is_err());
    }

    #[test]
    fn returned_allocation_restores_remaining_budget() {
        let accountant = BudgetAccountant::for_aggregations(sequential_spec(), 2).unwrap();
        let allocation = accountant.request_budget(MechanismKind::Gaussian, 1.0).unwrap();
        assert!((accountant.remaining_epsilon().unwrap() - 0.5).abs() < 1e-12);

        accountant.return_allocation(allocation).unwrap();
        assert!((accountant.remaining_epsilon().unwrap() - 1.0).abs() < 1e-12);
        assert!((accountant.remaining_delta().unwrap() - 1e-6).abs() < 1e-18);

        // the freed share may be granted again
        accountant.request_budget(MechanismKind::Gaussian, 1.0).unwrap();
    }

    #[test]
    fn summary_reports_per_mechanism_spend() {
        let accountant = BudgetAccountant::for_aggregations(sequential_spec(), 2).unwrap();
        accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap();
        accountant.request_budget(MechanismKind::Gaussian, 1.0).unwrap();

        let summary: serde_json::Value = serde_json::from_str(&accountant.summarize().unwrap()).unwrap();
        assert_eq!(summary["epsilon_total"], 1.0);
        assert_eq!(summary["epsilon_remaining"], 0.0);
        assert_eq!(summary["mechanisms"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_requests_are_linearized() {
        use std::sync::Arc;
        use std::thread;

        let spec = PrivacySpec::new(1.0, 1e-6, Composition::Sequential).unwrap();
        let accountant = Arc::new(BudgetAccountant::for_aggregations(spec, 8).unwrap());

        let handles = (0..8).map(|_| {
            let accountant = Arc::clone(&accountant);
            thread::spawn(move || accountant.request_budget(MechanismKind::Laplace, 1.0).unwrap().epsilon())
        }).collect::<Vec<_>>();

        let granted: f64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!((granted - 1.0).abs() < 1e-9);
        assert!(accountant.remaining_epsilon().unwrap().abs() < 1e-9);
    }
}
