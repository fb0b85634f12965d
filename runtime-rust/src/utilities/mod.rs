pub mod analytic_gaussian;
pub mod mechanisms;
pub mod noise;

use hushmap_accountant::errors::*;

use crate::utilities::noise::NoiseSource;

/// Return bytes of binary data as `String`.
///
/// Reads bytes from the noise source, converts them into their binary
/// representations, concatenates them, and returns the combined string.
///
/// # Arguments
/// * `source` - the entropy source to draw from
/// * `n_bytes` - the number of random bytes to read
///
/// # Return
/// The `String` representation of the bytes.
pub fn get_bytes(source: &mut NoiseSource, n_bytes: usize) -> Result<String> {
    let mut buffer = vec![0_u8; n_bytes];
    source.fill_bytes(&mut buffer)?;

    // create new buffer of binary representations, rather than u8
    let binary_string = buffer.iter()
        .map(|byte| format!("{:08b}", byte))
        .collect::<Vec<String>>()
        .join("");

    Ok(binary_string)
}

#[cfg(test)]
mod test_utilities {
    use super::*;

    #[test]
    fn get_bytes_yields_binary_strings() {
        let mut source = NoiseSource::seeded(7);
        let bits = get_bytes(&mut source, 7).unwrap();
        assert_eq!(bits.len(), 56);
        assert!(bits.chars().all(|c| c == '0' || c == '1'));
    }

    #[test]
    fn seeded_bytes_are_reproducible() {
        let mut first = NoiseSource::seeded(42);
        let mut second = NoiseSource::seeded(42);
        assert_eq!(get_bytes(&mut first, 16).unwrap(), get_bytes(&mut second, 16).unwrap());
    }
}
