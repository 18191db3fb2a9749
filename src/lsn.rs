//! Log Sequence Number handling.
//!
//! An LSN is a monotonically increasing byte offset into the source's
//! write-ahead log, rendered by PostgreSQL as `X/Y` with both halves in
//! hex. Every CDC structure (slot state, segment names, apply cursor,
//! endpos) is keyed by LSNs, so they get a real ordered type here instead
//! of ad-hoc string comparison.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ShuttleError;

/// A WAL position. `Lsn(0)` is "0/0", the invalid/unset position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The WAL segment filename-style hex form used to name CDC segment
    /// files: 16 uppercase hex digits, lexicographic order == LSN order.
    pub fn to_segment_name(&self) -> String {
        format!("{:016X}", self.0)
    }

    /// Parse a segment file stem produced by [`Lsn::to_segment_name`].
    pub fn from_segment_name(stem: &str) -> Option<Lsn> {
        if stem.len() != 16 {
            return None;
        }
        u64::from_str_radix(stem, 16).ok().map(Lsn)
    }

    /// Byte distance from `earlier` to `self`, saturating at zero.
    pub fn delta_from(&self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = ShuttleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| ShuttleError::Config(format!("invalid LSN: {s:?}")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|_| ShuttleError::Config(format!("invalid LSN: {s:?}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|_| ShuttleError::Config(format!("invalid LSN: {s:?}")))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(ShuttleError::Config(format!("LSN out of range: {s:?}")));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        for s in ["0/0", "0/1A2B3C", "1/0", "16/B374D848", "FFFFFFFF/FFFFFFFF"] {
            let lsn: Lsn = s.parse().unwrap();
            assert_eq!(lsn.to_string(), s);
        }
    }

    #[test]
    fn test_ordering() {
        let a: Lsn = "0/1".parse().unwrap();
        let b: Lsn = "0/2".parse().unwrap();
        let c: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!("0/FFFFFFFF".parse::<Lsn>().unwrap() < c);
    }

    #[test]
    fn test_invalid_forms_rejected() {
        assert!("".parse::<Lsn>().is_err());
        assert!("12345".parse::<Lsn>().is_err());
        assert!("0/GG".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_segment_name_round_trip() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        let name = lsn.to_segment_name();
        assert_eq!(name, "00000016B374D848");
        assert_eq!(Lsn::from_segment_name(&name), Some(lsn));
        assert_eq!(Lsn::from_segment_name("xyz"), None);
        assert_eq!(Lsn::from_segment_name("00000016B374D84"), None);
    }

    #[test]
    fn test_segment_names_sort_like_lsns() {
        let mut lsns: Vec<Lsn> = ["1/0", "0/FFFFFFFF", "0/1", "2/A"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let mut names: Vec<String> = lsns.iter().map(|l| l.to_segment_name()).collect();
        lsns.sort();
        names.sort();
        let from_names: Vec<Lsn> = names
            .iter()
            .map(|n| Lsn::from_segment_name(n).unwrap())
            .collect();
        assert_eq!(lsns, from_names);
    }

    #[test]
    fn test_delta() {
        let a: Lsn = "0/1000".parse().unwrap();
        let b: Lsn = "0/1800".parse().unwrap();
        assert_eq!(b.delta_from(a), 0x800);
        assert_eq!(a.delta_from(b), 0);
    }

    #[test]
    fn test_serde_as_text() {
        let lsn: Lsn = "A/BC".parse().unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"A/BC\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
