//! Postgres log sequence numbers
//!
//! The slot reports positions as `X/Y`, the upper and lower 32 bits of a
//! byte offset into the WAL, both in hexadecimal.

use std::fmt;
use std::str::FromStr;

use solarflare_common::error::Error;

/// A position in the write-ahead log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn halves(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (high, low) = self.halves();
        write!(f, "{high:X}/{low:X}")
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::MalformedChange(format!("invalid LSN: {s}"));
        let (high, low) = s.split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}
