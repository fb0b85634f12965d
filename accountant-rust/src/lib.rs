
// `error_chain!` can recurse deeply
#![recursion_limit = "1024"]
#[macro_use]
extern crate error_chain;

// Create the Error, ErrorKind, ResultExt, and Result types.
//
// The named kinds are the fatal failures of the budget machinery:
// `InvalidBounds` for malformed clamping/contribution configuration (caught
// before execution), `BudgetExhausted`/`BudgetSealed` for requests the ledger
// cannot honor, `BudgetAccounting` for internal ledger drift (aborts the
// whole computation), and `InsufficientBudget` for a mechanism invoked with
// an empty allocation (an orchestration bug upstream). None of them are
// retryable: retrying with a fresh random draw against the same allocation
// would double-spend privacy.
#[doc(hidden)]
pub mod errors {
    error_chain! {
        errors {
            InvalidBounds(message: String) {
                description("invalid contribution bounds")
                display("invalid contribution bounds: {}", message)
            }
            BudgetExhausted(requested: f64, remaining: f64) {
                description("privacy budget exhausted")
                display("privacy budget exhausted: requested {}, remaining {}", requested, remaining)
            }
            BudgetSealed {
                description("budget accountant sealed")
                display("budget accountant sealed: no further allocations may be requested")
            }
            BudgetAccounting(message: String) {
                description("budget accounting inconsistency")
                display("budget accounting inconsistency: {}", message)
            }
            InsufficientBudget(epsilon: f64) {
                description("mechanism invoked with insufficient budget")
                display("mechanism invoked with insufficient budget: epsilon {}", epsilon)
            }
        }
    }
}

#[doc(hidden)]
pub use errors::*;

pub mod accountant;
pub mod base;
pub mod bounds;
pub mod utilities;
