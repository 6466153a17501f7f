//! Extranonce2 values and ranges.
//!
//! The pool fixes the byte width of extranonce2 at subscribe time (typically
//! 4 to 8 bytes). Every distinct extranonce2 yields a distinct coinbase and so
//! a fresh 2^32 nonce space. Workers are handed disjoint sub-ranges so no two
//! ever search the same coinbase.
//!
//! - [`Extranonce2`]: one value with its fixed width
//! - [`Extranonce2Range`]: an inclusive `[min, max]` span, splittable
//! - [`Extranonce2Iter`]: walks a range in order

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Extranonce2Error {
    #[error("Invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(u8),

    #[error("Value {0} exceeds maximum for size {1} bytes")]
    ValueTooLarge(u64, u8),

    #[error("Invalid range: min {0} > max {1}")]
    InvalidRange(u64, u64),

    #[error("Expected {expected} extranonce2 bytes, got {actual}")]
    WrongLength { expected: u8, actual: usize },
}

/// A specific extranonce2 value with fixed size.
///
/// Serializes little-endian into the coinbase and as hex of those same bytes
/// in `mining.submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

impl Extranonce2 {
    pub fn new(value: u64, size: u8) -> Result<Self, Extranonce2Error> {
        check_size(size)?;
        if value > max_for_size(size) {
            return Err(Extranonce2Error::ValueTooLarge(value, size));
        }
        Ok(Self { value, size })
    }

    /// Parse from wire bytes (little-endian, exactly `size` long).
    pub fn from_bytes(bytes: &[u8], size: u8) -> Result<Self, Extranonce2Error> {
        check_size(size)?;
        if bytes.len() != size as usize {
            return Err(Extranonce2Error::WrongLength {
                expected: size,
                actual: bytes.len(),
            });
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            value: u64::from_le_bytes(buf),
            size,
        })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Append the serialized bytes of this extranonce2.
    pub fn extend_vec(&self, vec: &mut Vec<u8>) {
        vec.extend_from_slice(&self.value.to_le_bytes()[..self.size as usize]);
    }
}

impl From<Extranonce2> for Vec<u8> {
    fn from(ext: Extranonce2) -> Vec<u8> {
        ext.value.to_le_bytes()[..ext.size as usize].to_vec()
    }
}

/// Hex of the wire bytes, as sent in `mining.submit`.
impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(Vec::<u8>::from(*self)))
    }
}

fn check_size(size: u8) -> Result<(), Extranonce2Error> {
    if size == 0 || size > 8 {
        Err(Extranonce2Error::InvalidSize(size))
    } else {
        Ok(())
    }
}

fn max_for_size(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// An inclusive range of extranonce2 values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extranonce2Range {
    pub min: u64,
    pub max: u64,
    pub size: u8,
}

impl Extranonce2Range {
    /// The full space for the given size.
    pub fn new(size: u8) -> Result<Self, Extranonce2Error> {
        check_size(size)?;
        Ok(Self {
            min: 0,
            max: max_for_size(size),
            size,
        })
    }

    pub fn new_range(min: u64, max: u64, size: u8) -> Result<Self, Extranonce2Error> {
        check_size(size)?;
        if min > max {
            return Err(Extranonce2Error::InvalidRange(min, max));
        }
        if max > max_for_size(size) {
            return Err(Extranonce2Error::ValueTooLarge(max, size));
        }
        Ok(Self { min, max, size })
    }

    /// Number of values in the range. Saturates for the full 8-byte space.
    pub fn len(&self) -> u64 {
        (self.max - self.min).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, en2: &Extranonce2) -> bool {
        en2.size == self.size && en2.value >= self.min && en2.value <= self.max
    }

    /// Split into `n` contiguous, non-overlapping sub-ranges.
    ///
    /// Sizes differ by at most one; the remainder goes to the first ranges.
    /// Returns `None` if `n` is zero or exceeds the number of values.
    pub fn split(&self, n: usize) -> Option<Vec<Extranonce2Range>> {
        if n == 0 {
            return None;
        }
        if n == 1 {
            return Some(vec![self.clone()]);
        }

        let total = self.len();
        if total < n as u64 {
            return None;
        }

        let chunk = total / n as u64;
        let remainder = total % n as u64;

        let mut ranges = Vec::with_capacity(n);
        let mut start = self.min;
        for i in 0..n as u64 {
            let len = chunk + u64::from(i < remainder);
            let end = start + (len - 1);
            ranges.push(Self {
                min: start,
                max: end,
                size: self.size,
            });
            start = end.wrapping_add(1);
        }

        Some(ranges)
    }

    pub fn iter(&self) -> Extranonce2Iter {
        Extranonce2Iter {
            range: self.clone(),
            current: Some(self.min),
        }
    }
}

/// Iterator over the values of an [`Extranonce2Range`].
#[derive(Debug, Clone)]
pub struct Extranonce2Iter {
    range: Extranonce2Range,
    current: Option<u64>,
}

impl Iterator for Extranonce2Iter {
    type Item = Extranonce2;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.current?;
        if value > self.range.max {
            self.current = None;
            return None;
        }
        self.current = value.checked_add(1);
        Some(Extranonce2 {
            value,
            size: self.range.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_errors() {
        assert_eq!(Extranonce2::new(0, 0), Err(Extranonce2Error::InvalidSize(0)));
        assert_eq!(Extranonce2::new(0, 9), Err(Extranonce2Error::InvalidSize(9)));
        assert_eq!(
            Extranonce2::new(0x100, 1),
            Err(Extranonce2Error::ValueTooLarge(0x100, 1))
        );
    }

    #[test]
    fn serializes_little_endian() {
        let ext = Extranonce2::new(0x1234, 4).unwrap();
        assert_eq!(Vec::<u8>::from(ext), vec![0x34, 0x12, 0, 0]);
        assert_eq!(ext.to_string(), "34120000");

        let mut coinbase = vec![0xaa];
        ext.extend_vec(&mut coinbase);
        assert_eq!(coinbase, vec![0xaa, 0x34, 0x12, 0, 0]);
    }

    #[test]
    fn from_bytes_checks_length() {
        let ext = Extranonce2::from_bytes(&[0x01, 0x02], 2).unwrap();
        assert_eq!(ext.value(), 0x0201);
        assert_eq!(
            Extranonce2::from_bytes(&[0x01], 2),
            Err(Extranonce2Error::WrongLength {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn full_range_len() {
        assert_eq!(Extranonce2Range::new(4).unwrap().len(), 1u64 << 32);
        assert_eq!(Extranonce2Range::new(8).unwrap().len(), u64::MAX);
    }

    #[test]
    fn split_is_disjoint_and_covering() {
        let range = Extranonce2Range::new_range(0, 9, 1).unwrap();
        let parts = range.split(3).unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].min, parts[0].max), (0, 3));
        assert_eq!((parts[1].min, parts[1].max), (4, 6));
        assert_eq!((parts[2].min, parts[2].max), (7, 9));
    }

    #[test]
    fn split_full_eight_byte_space() {
        let parts = Extranonce2Range::new(8).unwrap().split(4).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].min, 0);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].max + 1, pair[1].min);
        }
    }

    #[test]
    fn split_rejects_degenerate() {
        let range = Extranonce2Range::new_range(0, 2, 1).unwrap();
        assert!(range.split(0).is_none());
        assert!(range.split(4).is_none());
        assert_eq!(range.split(1).unwrap(), vec![range.clone()]);
    }

    #[test]
    fn iter_walks_inclusive() {
        let range = Extranonce2Range::new_range(5, 7, 1).unwrap();
        let values: Vec<u64> = range.iter().map(|e| e.value()).collect();
        assert_eq!(values, vec![5, 6, 7]);
    }

    #[test]
    fn iter_stops_at_type_max() {
        let range = Extranonce2Range::new_range(u64::MAX - 1, u64::MAX, 8).unwrap();
        assert_eq!(range.iter().count(), 2);
    }

    #[test]
    fn contains_checks_size_and_bounds() {
        let range = Extranonce2Range::new_range(10, 20, 2).unwrap();
        assert!(range.contains(&Extranonce2::new(10, 2).unwrap()));
        assert!(!range.contains(&Extranonce2::new(21, 2).unwrap()));
        assert!(!range.contains(&Extranonce2::new(15, 4).unwrap()));
    }
}
