use std::{fmt, str::FromStr, time::Duration};

use crate::constants::NANOS_PER_SEC;

/// A transmission rate, stored in **bytes per second**.
///
/// Configuration inputs usually speak bits per second (`rate_bps`). The conversion happens exactly
/// once, when the [`Rate`] is constructed with [`Rate::from_bits_per_sec`], and everything
/// downstream works in bytes. Sub-byte remainders are truncated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(u64);

impl Rate {
    /// A rate of zero. A token bucket with this rate never refills.
    pub const ZERO: Self = Self(0);

    /// Creates a rate from bytes per second.
    #[inline]
    pub const fn from_bytes_per_sec(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Converts from bits per second, rounding down to whole bytes.
    #[inline]
    pub const fn from_bits_per_sec(bits: u64) -> Self {
        Self(bits / 8)
    }

    /// Creates a rate from megabits per second, the unit used by `tc` and most link datasheets.
    pub fn from_mbit_per_sec(mbit: f64) -> Self {
        Self((mbit * 1_000_000.0 / 8.0) as u64)
    }

    /// The rate in bytes per second.
    #[inline]
    pub const fn bytes_per_sec(self) -> u64 {
        self.0
    }

    /// The rate in bits per second, saturating.
    #[inline]
    pub const fn bits_per_sec(self) -> u64 {
        self.0.saturating_mul(8)
    }

    /// Whether this is a zero rate.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Time it takes to transmit `bytes` at this rate. Returns `None` for a zero rate.
    pub fn time_for(self, bytes: u64) -> Option<Duration> {
        if self.0 == 0 {
            return None;
        }

        // Round up so that after sleeping this long the bytes are guaranteed to be available.
        let nanos = (bytes as u128 * NANOS_PER_SEC as u128).div_ceil(self.0 as u128);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

/// Error returned when parsing a [`Rate`] from a `tc` style string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseRateError {
    /// The input was empty.
    #[error("empty rate")]
    Empty,
    /// The numeric part did not parse.
    #[error("invalid rate value: {0}")]
    InvalidValue(String),
    /// The unit suffix is not recognised.
    #[error("unknown rate unit: {0}")]
    UnknownUnit(String),
}

impl FromStr for Rate {
    type Err = ParseRateError;

    /// Parses a rate using `tc` unit conventions.
    ///
    /// `bit`, `kbit`, `mbit`, `gbit` are bits per second (SI multiples), `bps`, `kbps`, `mbps`,
    /// `gbps` are bytes per second. A bare number is bits per second.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseRateError::Empty);
        }

        let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
        let (value, unit) = s.split_at(split);

        let value: f64 =
            value.parse().map_err(|_| ParseRateError::InvalidValue(value.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(ParseRateError::InvalidValue(value.to_string()));
        }

        let bytes_per_sec = match unit.to_ascii_lowercase().as_str() {
            "" | "bit" => value / 8.0,
            "kbit" => value * 1e3 / 8.0,
            "mbit" => value * 1e6 / 8.0,
            "gbit" => value * 1e9 / 8.0,
            "bps" => value,
            "kbps" => value * 1e3,
            "mbps" => value * 1e6,
            "gbps" => value * 1e9,
            other => return Err(ParseRateError::UnknownUnit(other.to_string())),
        };

        Ok(Self(bytes_per_sec as u64))
    }
}
