//! Pool difficulty and its conversion to a share target.

use std::fmt;

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::pow::Target;
use ruint::aliases::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DifficultyError {
    #[error("difficulty must be a positive finite number, got {0}")]
    NotPositive(f64),
}

/// Fixed-point scale applied before 256-bit division so that fractional
/// difficulties (testnets, proxies) convert without going through floats.
const FRACTION_BITS: usize = 32;

/// Mining difficulty as communicated by `mining.set_difficulty`.
///
/// Stratum pools express share difficulty as a multiple of the difficulty-1
/// target (`0x00000000ffff0000...`, i.e. [`Target::MAX`]). The relationship
/// is inverse:
///
/// ```text
/// target = DIFF1_TARGET / difficulty
/// ```
///
/// Pools may send fractional values, so this wraps an `f64`. Construction
/// rejects zero, negative and non-finite values.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Difficulty(f64);

impl Difficulty {
    pub const ONE: Difficulty = Difficulty(1.0);

    pub fn new(value: f64) -> Result<Self, DifficultyError> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(DifficultyError::NotPositive(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Convert to the share target.
    ///
    /// The difficulty is scaled to 32.32 fixed point and the division is done
    /// in 256 bits, so integer difficulties are exact and the result never
    /// increases as difficulty rises. Difficulties too small to represent
    /// saturate to the all-ones target.
    pub fn to_target(self) -> Target {
        let scaled = (self.0 * (1u64 << FRACTION_BITS) as f64) as u128;
        if scaled == 0 {
            return Target::from_le_bytes([0xff; 32]);
        }

        let diff1 = U256::from_le_bytes::<32>(Target::MAX.to_le_bytes());
        let quotient = (diff1 << FRACTION_BITS) / U256::from(scaled);
        Target::from_le_bytes(quotient.to_le_bytes::<32>())
    }

    /// Difficulty a given hash would satisfy, for logging found shares.
    pub fn from_hash(hash: &BlockHash) -> Self {
        Self(Target::from_le_bytes(hash.to_byte_array()).difficulty_float())
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else if scaled >= 1.0 || !suffix.is_empty() {
            write!(f, "{:.2}{}", scaled, suffix)
        } else {
            write!(f, "{:.4}", scaled)
        }
    }
}

/// Number of leading zero bits every hash meeting `target` must have.
///
/// A hash `h <= target` can only have at least as many leading zeros as the
/// target itself, so this is the lower bound consumers can check cheaply.
pub fn min_leading_zeros(target: &Target) -> u32 {
    let mut zeros = 0;
    for byte in target.to_be_bytes() {
        if byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn difficulty_one_is_max_target() {
        assert_eq!(Difficulty::ONE.to_target(), Target::MAX);
    }

    #[test]
    fn rejects_non_positive() {
        assert!(Difficulty::new(0.0).is_err());
        assert!(Difficulty::new(-4.0).is_err());
        assert!(Difficulty::new(f64::NAN).is_err());
        assert!(Difficulty::new(f64::INFINITY).is_err());
        assert!(Difficulty::new(0.5).is_ok());
    }

    #[test_case(1.0, 2.0)]
    #[test_case(0.001, 0.002)]
    #[test_case(0.5, 1.0)]
    #[test_case(1024.0, 1025.0)]
    #[test_case(65536.0, 1e12)]
    #[test_case(1e12, 1e18)]
    fn harder_difficulty_never_raises_target(easy: f64, hard: f64) {
        let easy = Difficulty::new(easy).unwrap().to_target();
        let hard = Difficulty::new(hard).unwrap().to_target();
        assert!(hard <= easy);
    }

    #[test]
    fn monotonic_over_a_sweep() {
        let mut last = Difficulty::new(1e-6).unwrap().to_target();
        let mut d = 1e-6;
        while d < 1e15 {
            d *= 1.7;
            let target = Difficulty::new(d).unwrap().to_target();
            assert!(target <= last, "target rose at difficulty {}", d);
            last = target;
        }
    }

    #[test]
    fn doubling_difficulty_halves_target() {
        let t1 = U256::from_le_bytes::<32>(Difficulty::new(512.0).unwrap().to_target().to_le_bytes());
        let t2 = U256::from_le_bytes::<32>(Difficulty::new(1024.0).unwrap().to_target().to_le_bytes());
        assert_eq!(t2, t1 / U256::from(2u8));
    }

    #[test]
    fn fractional_difficulty_is_easier_than_one() {
        let target = Difficulty::new(0.25).unwrap().to_target();
        assert!(target > Target::MAX);
    }

    #[test]
    fn leading_zeros() {
        assert_eq!(min_leading_zeros(&Target::MAX), 32);
        assert_eq!(min_leading_zeros(&Difficulty::new(256.0).unwrap().to_target()), 40);
        assert_eq!(min_leading_zeros(&Target::from_le_bytes([0xff; 32])), 0);
    }

    #[test]
    fn from_hash_of_max_target_is_one() {
        let hash = BlockHash::from_byte_array(Target::MAX.to_le_bytes());
        let diff = Difficulty::from_hash(&hash);
        assert!((diff.value() - 1.0).abs() < 1e-9);
    }

    #[test_case(500.0, "500")]
    #[test_case(1_500_000.0, "1.50M")]
    #[test_case(11_200_000_000_000.0, "11.2T")]
    #[test_case(112_700_000_000_000.0, "113T")]
    #[test_case(0.001, "0.0010")]
    fn display(value: f64, expect: &str) {
        assert_eq!(Difficulty::new(value).unwrap().to_string(), expect);
    }
}
