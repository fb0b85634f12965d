//! Sampling primitives for every mechanism in the runtime.
//!
//! Continuous samples are drawn with the Mironov precision-band uniform
//! sampler and inverse transform; integer-valued samples are generated from
//! coin flips with exact big-integer arithmetic rather than floating noise
//! rounded afterward, to avoid finite precision attacks.

use hushmap_accountant::errors::*;

use byteorder::{ByteOrder, LittleEndian};
use ieee754::Ieee754;
use num::bigint::{BigInt, BigUint};
use num::rational::{BigRational, Ratio};
use num::{Integer, One, Signed, Zero};
use openssl::rand::rand_bytes;
use probability::distribution::{Gaussian, Inverse, Laplace};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::cmp;

use crate::utilities::get_bytes;

/// Entropy behind every sampler.
///
/// Production runs draw from the system's cryptographic source; tests and
/// reproducibility runs use a per-run seeded generator. The same seed must
/// never be reused across two computations against the same data, so the
/// engine owns the source for the lifetime of a run.
pub enum NoiseSource {
    Secure,
    Seeded(StdRng),
}

impl NoiseSource {
    pub fn secure() -> NoiseSource {
        NoiseSource::Secure
    }

    pub fn seeded(seed: u64) -> NoiseSource {
        NoiseSource::Seeded(StdRng::seed_from_u64(seed))
    }

    pub fn fill_bytes(&mut self, buffer: &mut [u8]) -> Result<()> {
        match self {
            NoiseSource::Secure => rand_bytes(buffer)
                .map_err(|_| Error::from("the system entropy source failed")),
            NoiseSource::Seeded(rng) => {
                rng.fill_bytes(buffer);
                Ok(())
            }
        }
    }

    pub fn next_u64(&mut self) -> Result<u64> {
        let mut buffer = [0_u8; 8];
        self.fill_bytes(&mut buffer)?;
        Ok(LittleEndian::read_u64(&buffer))
    }
}

/// Returns random sample from Uniform[min, max).
///
/// The uniform sampler first selects a "precision band": a range of floating
/// point numbers sharing one unit of least precision, situated between powers
/// of two. A band is chosen with geometric probability, then a 52-bit
/// mantissa is generated uniformly within it, so every representable float is
/// drawn proportionally to its measure. Due to Mironov (2012).
pub fn sample_uniform(min: f64, max: f64, source: &mut NoiseSource) -> Result<f64> {
    if min > max {
        return Err("min may not be greater than max".into());
    }

    // generate mantissa
    let binary_string = get_bytes(source, 7)?;
    let mantissa = &binary_string[0..52];
    let mantissa_int = u64::from_str_radix(mantissa, 2)
        .map_err(|_| Error::from("unable to parse the mantissa bits"))?;

    // generate exponent
    let geom = sample_censored_bit_index(source)?;
    let exponent = (-geom + 1023) as u16;

    let uniform = f64::recompose_raw(false, exponent, mantissa_int);
    Ok(uniform * (max - min) + min)
}

/// Return the 1-based index of the first set bit in a stream of up to 1023
/// random bits, censored at 1023.
///
/// This generates an exponent for the floating point representation of a
/// uniform number on [0, 1), distributing values proportionally to their
/// unit of least precision.
fn sample_censored_bit_index(source: &mut NoiseSource) -> Result<i16> {
    let mut geom: i16 = 1023;
    // read bytes in one at a time, need 128 to fully generate geometric
    for i in 0..128_i16 {
        let binary_string = get_bytes(source, 1)?;
        if let Some(first_one_index) = binary_string.chars().position(|c| c == '1') {
            geom = cmp::min(geom, 8 * i + first_one_index as i16 + 1);
            break;
        }
    }
    Ok(geom)
}

/// Sample a single bit with arbitrary probability of success, using only an
/// unbiased source of coin flips.
///
/// The probability is decomposed into its IEEE-754 mantissa and exponent;
/// the bit at the index of the first heads in a fair coin sequence decides
/// the outcome, so two flips are needed in expectation.
///
/// # Arguments
/// * `prob` - probability of success (bit == 1), in [0, 1]
///
/// # Return
/// A bit that is 1 with probability `prob`.
pub fn sample_bit(prob: f64, source: &mut NoiseSource) -> Result<i64> {
    if !(0.0..=1.0).contains(&prob) {
        return Err(format!("probability must be within [0, 1], not {}", prob).into());
    }
    if prob == 0.0 {
        return Ok(0);
    }
    if prob == 1.0 {
        return Ok(1);
    }

    // identify index (0-based) of first heads in repeated fair coin flips
    let first_heads_index = sample_censored_bit_index(source)? - 1;

    // decompose probability into mantissa bits and exponent to read off the
    // bit at the index of interest
    let (_sign, exponent, mantissa) = prob.decompose_raw();
    let mantissa_string = format!("1{:052b}", mantissa); // add implicit 1 to mantissa
    let mantissa_vec = mantissa_string.chars()
        .map(|x| x.to_digit(2).map(|bit| bit as i64))
        .collect::<Option<Vec<i64>>>()
        .ok_or_else(|| Error::from("unable to decompose the probability mantissa"))?;
    let num_leading_zeros = cmp::max(1022_i16 - exponent as i16, 0);

    if first_heads_index < num_leading_zeros {
        return Ok(0);
    }
    let index = (first_heads_index - num_leading_zeros) as usize;
    Ok(*mantissa_vec.get(index).unwrap_or(&0))
}

/// Sample from the Laplace distribution centered at `shift` with scale
/// `scale`, by inverse transform from the precision-band uniform sampler.
///
/// # Example
/// ```
/// use hushmap_runtime::utilities::noise::{sample_laplace, NoiseSource};
/// let mut source = NoiseSource::seeded(1);
/// let n: f64 = sample_laplace(0.0, 2.0, &mut source).unwrap();
/// ```
pub fn sample_laplace(shift: f64, scale: f64, source: &mut NoiseSource) -> Result<f64> {
    if scale <= 0.0 {
        return Err(format!("noise scale must be positive, not {}", scale).into());
    }
    let probability = sample_uniform(0., 1., source)?;
    Ok(Laplace::new(shift, scale).inverse(probability))
}

/// Sample from the Gaussian distribution centered at `shift` with standard
/// deviation `scale`.
pub fn sample_gaussian(shift: f64, scale: f64, source: &mut NoiseSource) -> Result<f64> {
    if scale <= 0.0 {
        return Err(format!("noise scale must be positive, not {}", scale).into());
    }
    let probability = sample_uniform(0., 1., source)?;
    Ok(Gaussian::new(shift, scale).inverse(probability))
}

/// Sample from the Gumbel distribution at `location` with scale `scale`.
///
/// Used by the exponential mechanism through the Gumbel-max trick.
pub fn sample_gumbel(location: f64, scale: f64, source: &mut NoiseSource) -> Result<f64> {
    if scale <= 0.0 {
        return Err(format!("noise scale must be positive, not {}", scale).into());
    }
    let uniform = sample_uniform(0., 1., source)?;
    Ok(location - scale * (-uniform.ln()).ln())
}

/// Sample a uniform big integer in [0, bound).
///
/// Rejection sampling over the minimal number of random bits, so the draw is
/// exact; no floating point is involved.
pub fn sample_biguint_below(bound: &BigUint, source: &mut NoiseSource) -> Result<BigUint> {
    if bound.is_zero() {
        return Err("the sampling bound must be positive".into());
    }

    let bits = bound.bits() as usize;
    let n_bytes = (bits + 7) / 8;
    let excess_bits = (n_bytes * 8 - bits) as u32;

    let mut buffer = vec![0_u8; n_bytes];
    loop {
        source.fill_bytes(&mut buffer)?;
        // mask the excess high bits so the candidate stays near the bound
        buffer[n_bytes - 1] &= 0xFF_u8 >> excess_bits;
        let candidate = BigUint::from_bytes_le(&buffer);
        if &candidate < bound {
            return Ok(candidate);
        }
    }
}

/// Sample a Bernoulli variable with exactly rational success probability
/// `numer / denom`.
pub fn sample_bernoulli_ratio(numer: &BigUint, denom: &BigUint, source: &mut NoiseSource) -> Result<bool> {
    if denom.is_zero() {
        return Err("the Bernoulli denominator must be positive".into());
    }
    if numer >= denom {
        return Ok(true);
    }
    Ok(&sample_biguint_below(denom, source)? < numer)
}

/// Sample a Bernoulli variable with success probability `exp(-gamma)` for a
/// non-negative rational `gamma`, with exact arithmetic throughout.
///
/// Follows Canonne, Kapralov and Steinke (2020): for gamma in [0, 1] a run
/// of Bernoulli(gamma / k) draws decides the outcome by the parity of its
/// length; larger gamma is reduced one unit of exp(-1) at a time.
pub fn sample_bernoulli_exp(gamma: &BigRational, source: &mut NoiseSource) -> Result<bool> {
    if gamma.is_negative() {
        return Err("gamma must be non-negative".into());
    }

    let one = BigRational::one();
    let mut remaining = gamma.clone();
    while remaining > one {
        if !sample_bernoulli_exp_unit(&one, source)? {
            return Ok(false);
        }
        remaining = remaining - &one;
    }
    sample_bernoulli_exp_unit(&remaining, source)
}

/// `exp(-gamma)` Bernoulli for gamma restricted to [0, 1].
fn sample_bernoulli_exp_unit(gamma: &BigRational, source: &mut NoiseSource) -> Result<bool> {
    let gamma_numer = gamma.numer().to_biguint()
        .ok_or_else(|| Error::from("gamma must be non-negative"))?;
    let gamma_denom = gamma.denom().to_biguint()
        .ok_or_else(|| Error::from("gamma must have a positive denominator"))?;

    let mut k = BigUint::one();
    loop {
        // continue the run with probability gamma / k
        if sample_bernoulli_ratio(&gamma_numer, &(&gamma_denom * &k), source)? {
            k += BigUint::one();
        } else {
            break;
        }
    }
    // k is the 1-based index of the first failure
    Ok(k.is_odd())
}

/// Sample from the discrete Laplace distribution with rational scale
/// `scale_numer / scale_denom`: P(z) proportional to exp(-|z| / scale).
///
/// The sampling procedure is exact integer arithmetic end to end (Canonne,
/// Kapralov and Steinke 2020, algorithm 2); the geometric body is generated
/// from Bernoulli(exp(-1)) runs and the remainder from a uniform residue.
pub fn sample_discrete_laplace(
    scale_numer: &BigUint,
    scale_denom: &BigUint,
    source: &mut NoiseSource,
) -> Result<BigInt> {
    if scale_numer.is_zero() || scale_denom.is_zero() {
        return Err("the discrete Laplace scale must be positive".into());
    }
    let t = scale_numer;
    let s = scale_denom;
    let t_int = BigInt::from(t.clone());

    loop {
        let residue = sample_biguint_below(t, source)?;
        let gamma = Ratio::new(BigInt::from(residue.clone()), t_int.clone());
        if !sample_bernoulli_exp(&gamma, source)? {
            continue;
        }

        // run length of Bernoulli(exp(-1)) successes
        let mut body = BigUint::zero();
        let one_rational = BigRational::one();
        while sample_bernoulli_exp(&one_rational, source)? {
            body += BigUint::one();
        }

        let magnitude = (&residue + t * &body) / s;
        // a half is exact in IEEE-754, so the sign flip stays exact
        let negate = sample_bit(0.5, source)? == 1;
        if negate && magnitude.is_zero() {
            continue;
        }
        let magnitude = BigInt::from(magnitude);
        return Ok(if negate { -magnitude } else { magnitude });
    }
}

/// Sample from the discrete Gaussian distribution with standard deviation
/// `sigma`: P(z) proportional to exp(-z^2 / (2 sigma^2)).
///
/// Rejection from a discrete Laplace envelope with exact acceptance
/// probabilities (Canonne, Kapralov and Steinke 2020, algorithm 3).
pub fn sample_discrete_gaussian(sigma: f64, source: &mut NoiseSource) -> Result<BigInt> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(format!("sigma must be positive, not {}", sigma).into());
    }

    let sigma_rational = BigRational::from_float(sigma)
        .ok_or_else(|| Error::from("sigma is not representable as a rational"))?;
    let sigma_squared: BigRational = &sigma_rational * &sigma_rational;

    let t = BigUint::from(sigma.floor() as u64 + 1);
    let t_rational = Ratio::from_integer(BigInt::from(t.clone()));
    let two = Ratio::from_integer(BigInt::from(2_u8));

    loop {
        let candidate = sample_discrete_laplace(&t, &BigUint::one(), source)?;

        // accept with probability exp(-(|Y| - sigma^2/t)^2 / (2 sigma^2))
        let deviation = Ratio::from_integer(candidate.abs()) - &sigma_squared / &t_rational;
        let gamma = (&deviation * &deviation) / (&two * &sigma_squared);
        if sample_bernoulli_exp(&gamma, source)? {
            return Ok(candidate);
        }
    }
}

/// Convert a positive finite float to its exact rational representation.
pub fn rational_from_f64(value: f64) -> Result<BigRational> {
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("expected a positive finite value, not {}", value).into());
    }
    BigRational::from_float(value).ok_or_else(|| Error::from("value is not representable as a rational"))
}
