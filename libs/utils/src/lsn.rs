//! A log sequence number, the byte offset of a position in the WAL.
//!
//! Displayed and parsed the same way `pg_lsn` is: `<hi 32 bits>/<lo 32 bits>`
//! in hex, e.g. `0/3000028`.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use anyhow::{bail, Context};

#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Smallest valid LSN; never a real WAL position.
    pub const INVALID: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    pub fn checked_add(self, offset: u64) -> Option<Lsn> {
        self.0.checked_add(offset).map(Lsn)
    }

    pub fn checked_sub(self, other: impl Into<u64>) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }

    /// WAL segment number this LSN falls into, given `wal_seg_size`.
    pub fn segment_number(self, wal_seg_size: u64) -> u64 {
        self.0 / wal_seg_size
    }

    /// Offset of this LSN within its WAL segment.
    pub fn segment_offset(self, wal_seg_size: u64) -> u64 {
        self.0 % wal_seg_size
    }

    /// First LSN of the segment that contains `self`.
    pub fn segment_lsn(self, wal_seg_size: u64) -> Lsn {
        Lsn(self.0 - self.segment_offset(wal_seg_size))
    }

    pub fn min(a: Lsn, b: Lsn) -> Lsn {
        std::cmp::min(a, b)
    }

    pub fn max(a: Lsn, b: Lsn) -> Lsn {
        std::cmp::max(a, b)
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Lsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .with_context(|| format!("malformed LSN '{s}': expected '<hex>/<hex>'"))?;
        let hi = u32::from_str_radix(hi, 16).with_context(|| format!("malformed LSN '{s}'"))?;
        let lo = u32::from_str_radix(lo, 16).with_context(|| format!("malformed LSN '{s}'"))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, offset: u64) -> Lsn {
        self.checked_add(offset)
            .expect("Lsn overflow on addition")
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, offset: u64) {
        *self = *self + offset;
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;

    fn sub(self, other: Lsn) -> u64 {
        self.0
            .checked_sub(other.0)
            .expect("Lsn underflow on subtraction")
    }
}

/// Parses a 16-character WAL segment file name prefix into a timeline id and
/// segment number, the way `XLogFromFileName` does on the C side.
pub fn try_parse_wal_segment_name(name: &str, wal_seg_size: u64) -> anyhow::Result<(u32, u64)> {
    if name.len() < 24 {
        bail!("wal segment file name '{name}' too short");
    }
    let tli = u32::from_str_radix(&name[0..8], 16)?;
    let log = u64::from_str_radix(&name[8..16], 16)?;
    let seg = u64::from_str_radix(&name[16..24], 16)?;
    let segments_per_xlog = 0x1_0000_0000u64 / wal_seg_size;
    Ok((tli, log * segments_per_xlog + seg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let lsn = Lsn(0x3000028);
        assert_eq!(lsn.to_string(), "0/3000028");
        assert_eq!("0/3000028".parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn ordering() {
        assert!(Lsn(10) < Lsn(20));
        assert_eq!(Lsn::max(Lsn(10), Lsn(20)), Lsn(20));
    }

    #[test]
    fn segment_arithmetic() {
        let seg_size = 16 * 1024 * 1024;
        let lsn = Lsn(seg_size * 3 + 100);
        assert_eq!(lsn.segment_number(seg_size), 3);
        assert_eq!(lsn.segment_lsn(seg_size), Lsn(seg_size * 3));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("not-an-lsn".parse::<Lsn>().is_err());
    }
}
