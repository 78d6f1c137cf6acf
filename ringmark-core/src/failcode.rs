//! Encoded fail codes.
//!
//! Every recorded failure packs (protocol version, call-site major, call-site
//! minor, raw runtime code) into a single sortable integer so that one number
//! in a log line identifies exactly which call on which rank went wrong.

use std::fmt;

const VERSION_BASE: u64 = 10_000_000;
const MAJOR_BASE: u64 = 100_000;
const MINOR_BASE: u64 = 1_000;

/// A packed failure identifier. Zero means clean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FailCode(u64);

impl FailCode {
    pub const CLEAN: FailCode = FailCode(0);

    /// Pack the four components. The raw code is reduced to its magnitude
    /// modulo 1000 to bound it; runtime libraries that report negative codes
    /// therefore encode the same as their positive counterparts.
    pub fn encode(version: u32, major: u32, minor: u32, raw: i32) -> Self {
        let raw = u64::from(raw.unsigned_abs()) % 1000;
        FailCode(
            u64::from(version) * VERSION_BASE
                + u64::from(major) * MAJOR_BASE
                + u64::from(minor) * MINOR_BASE
                + raw,
        )
    }

    /// Recover (version, major, minor, raw). Exact inverse of `encode` for
    /// major/minor below 100 and raw in [0, 999].
    pub fn decode(self) -> (u32, u32, u32, u32) {
        let v = self.0;
        (
            (v / VERSION_BASE) as u32,
            ((v / MAJOR_BASE) % 100) as u32,
            ((v / MINOR_BASE) % 100) as u32,
            (v % 1000) as u32,
        )
    }

    pub fn from_raw(value: u64) -> Self {
        FailCode(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FailCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clean_is_zero() {
        assert!(FailCode::CLEAN.is_clean());
        assert_eq!(FailCode::CLEAN.value(), 0);
    }

    #[test]
    fn encode_matches_positional_layout() {
        let code = FailCode::encode(11, 4, 6, 124);
        assert_eq!(code.value(), 110_406_124);
    }

    #[test]
    fn negative_raw_codes_encode_by_magnitude() {
        assert_eq!(
            FailCode::encode(11, 2, 3, -7),
            FailCode::encode(11, 2, 3, 7)
        );
    }

    #[test]
    fn raw_code_reduced_modulo_1000() {
        let (_, _, _, raw) = FailCode::encode(1, 1, 1, 123_456).decode();
        assert_eq!(raw, 456);
    }

    proptest! {
        #[test]
        fn round_trip(version in 0u32..100, major in 0u32..100,
                      minor in 0u32..100, raw in 0i32..1000) {
            let decoded = FailCode::encode(version, major, minor, raw).decode();
            prop_assert_eq!(decoded, (version, major, minor, raw as u32));
        }

        #[test]
        fn injective(a in (0u32..100, 0u32..100, 0u32..100, 0i32..1000),
                     b in (0u32..100, 0u32..100, 0u32..100, 0i32..1000)) {
            let ca = FailCode::encode(a.0, a.1, a.2, a.3);
            let cb = FailCode::encode(b.0, b.1, b.2, b.3);
            if a != b {
                prop_assert_ne!(ca, cb);
            } else {
                prop_assert_eq!(ca, cb);
            }
        }
    }
}
