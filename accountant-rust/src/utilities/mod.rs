pub mod privacy;

/// Whether `left` exceeds `right` by more than `tolerance`.
///
/// Ledger comparisons must absorb the rounding error of repeated budget
/// splits, so every exhaustion check goes through this.
pub fn exceeds(left: f64, right: f64, tolerance: f64) -> bool {
    left > right + tolerance
}
