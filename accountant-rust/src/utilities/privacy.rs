use crate::errors::*;

use std::cmp::Ordering;

/// Check epsilon and delta for a differentially private release.
///
/// Violations fail; questionable-but-legal parameters are returned as
/// warnings for the caller to surface.
///
/// # Arguments
/// * `epsilon` - privacy parameter epsilon, must be positive
/// * `delta` - privacy parameter delta, must be in [0, 1)
///
/// # Return
/// Warnings accumulated while checking.
pub fn validate_privacy_parameters(epsilon: f64, delta: f64) -> Result<Vec<Error>> {
    let mut warnings = Vec::new();

    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(format!("epsilon: privacy parameter epsilon must be positive, not {}", epsilon).into());
    }

    if epsilon > 1.0 {
        warnings.push(format!("Warning: A large privacy parameter of epsilon = {} is in use", epsilon).into());
    }

    match delta.partial_cmp(&0.0).ok_or_else(|| Error::from("delta: must not be null"))? {
        Ordering::Less => return Err("delta: privacy parameter delta may not be less than 0".into()),
        Ordering::Equal => (),
        Ordering::Greater => {
            if delta >= 1.0 {
                return Err("delta: privacy parameter delta must be smaller than one".into());
            }
        }
    }

    Ok(warnings)
}

/// Split one weight into `count` equal shares.
///
/// Composite metrics draw one allocation per sub-aggregate; this spreads the
/// metric's declared weight across them.
///
/// # Example
/// ```
/// use hushmap_accountant::utilities::privacy::split_weight;
/// assert_eq!(split_weight(1.0, 2).unwrap(), vec![0.5, 0.5]);
/// ```
pub fn split_weight(weight: f64, count: usize) -> Result<Vec<f64>> {
    if count == 0 {
        return Err("a weight cannot be split zero ways".into());
    }
    if !weight.is_finite() || weight <= 0.0 {
        return Err(format!("budget weight must be positive, not {}", weight).into());
    }
    Ok((0..count).map(|_| weight / count as f64).collect())
}
