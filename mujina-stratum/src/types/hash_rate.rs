//! Hash rate, for telemetry.

use std::fmt;
use std::time::Duration;

/// Hashes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Rate implied by `hashes` evaluated over `elapsed`.
    pub fn from_hashes(hashes: f64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self(0.0);
        }
        Self(hashes / secs)
    }
}

impl std::ops::Add for HashRate {
    type Output = HashRate;

    fn add(self, rhs: HashRate) -> HashRate {
        HashRate(self.0 + rhs.0)
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 6] = ["H/s", "kH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
        let mut value = self.0;
        let mut unit = 0;
        while value >= 1000.0 && unit < UNITS.len() - 1 {
            value /= 1000.0;
            unit += 1;
        }
        write!(f, "{:.2} {}", value, UNITS[unit])
    }
}
