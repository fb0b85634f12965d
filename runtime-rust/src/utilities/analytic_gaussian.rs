//! Calibration of the Gaussian mechanism via the analytic privacy profile
//! (Balle and Wang 2018), rather than the classical
//! `sqrt(2 ln(1.25/delta))` bound, which overshoots the variance.

use hushmap_accountant::errors::*;

use statrs::function::erf;

/// Standard Gaussian CDF.
fn phi(t: f64) -> f64 {
    0.5 * (1. + erf::erf(t / 2.0_f64.sqrt()))
}

/// Privacy profile for delta above the threshold.
fn case_a(epsilon: f64, s: f64) -> f64 {
    phi((epsilon * s).sqrt()) - epsilon.exp() * phi(-(epsilon * (s + 2.)).sqrt())
}

/// Privacy profile for delta below the threshold.
fn case_b(epsilon: f64, s: f64) -> f64 {
    phi(-(epsilon * s).sqrt()) - epsilon.exp() * phi(-(epsilon * (s + 2.)).sqrt())
}

/// Smallest standard deviation for which the Gaussian mechanism with the
/// given sensitivity satisfies (epsilon, delta)-differential privacy.
///
/// The profile is inverted by doubling out an upper bracket and bisecting
/// until the achieved delta is within `tolerance` of the target.
///
/// # Arguments
/// * `epsilon` - privacy parameter, must be positive
/// * `delta` - privacy parameter, must be in (0, 1)
/// * `sensitivity` - L2 sensitivity of the statistic being noised
/// * `tolerance` - acceptable distance from the target delta
///
/// # Example
/// ```
/// use hushmap_runtime::utilities::analytic_gaussian::analytic_gaussian_sigma;
/// let sigma = analytic_gaussian_sigma(1.0, 1e-6, 1.0, 1e-12).unwrap();
/// assert!(sigma > 0.);
/// ```
pub fn analytic_gaussian_sigma(epsilon: f64, delta: f64, sensitivity: f64, tolerance: f64) -> Result<f64> {
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(format!("epsilon must be positive, not {}", epsilon).into());
    }
    if !(delta > 0.0 && delta < 1.0) {
        return Err(format!("delta must be within (0, 1), not {}", delta).into());
    }
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        return Err(format!("sensitivity must be positive, not {}", sensitivity).into());
    }
    if !tolerance.is_finite() || tolerance <= 0.0 {
        return Err(format!("tolerance must be positive, not {}", tolerance).into());
    }

    let delta_threshold = case_a(epsilon, 0.);

    let alpha = if (delta - delta_threshold).abs() <= tolerance {
        1.
    } else {
        let above_threshold = delta > delta_threshold;
        let profile = |s: f64| if above_threshold { case_a(epsilon, s) } else { case_b(epsilon, s) };
        // case_a grows towards 1 with s, case_b decays towards 0: either way
        // this predicate holds beyond the crossing point
        let crossed = |s: f64| if above_threshold { profile(s) >= delta } else { profile(s) <= delta };

        let mut s_inf = 0.;
        let mut s_sup = 1.;
        while !crossed(s_sup) {
            s_inf = s_sup;
            s_sup *= 2.;
        }

        let mut s_mid = s_inf + (s_sup - s_inf) / 2.;
        let mut iterations = 0;
        while (profile(s_mid) - delta).abs() > tolerance && iterations < 200 {
            if crossed(s_mid) {
                s_sup = s_mid;
            } else {
                s_inf = s_mid;
            }
            s_mid = s_inf + (s_sup - s_inf) / 2.;
            iterations += 1;
        }

        if above_threshold {
            (1. + s_mid / 2.).sqrt() - (s_mid / 2.).sqrt()
        } else {
            (1. + s_mid / 2.).sqrt() + (s_mid / 2.).sqrt()
        }
    };

    Ok(alpha * sensitivity / (2. * epsilon).sqrt())
}
