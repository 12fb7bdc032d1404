//! Trace and span identifiers.
//!
//! A trace is identified by 128 bits rendered as 32 lowercase hex digits, a
//! span within it by 64 bits rendered as 16. The zero span ID is the
//! sentinel for "no span"; the zero trace ID is invalid.

use std::fmt;

use crate::error::SpanError;

/// A 16-byte value which identifies a given trace.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid trace id
    pub const INVALID: TraceId = TraceId(0);

    /// Converts a string of exactly 32 hex digits to a trace id.
    ///
    /// # Examples
    ///
    /// ```
    /// use cloudtrace_spans::TraceId;
    ///
    /// assert!(TraceId::from_hex("58406520a006649127e371903a2de979").is_ok());
    ///
    /// assert!(TraceId::from_hex("42").is_err());
    /// assert!(TraceId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, SpanError> {
        if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SpanError::InvalidTraceId(hex.to_owned()));
        }
        u128::from_str_radix(hex, 16)
            .map(TraceId)
            .map_err(|_| SpanError::InvalidTraceId(hex.to_owned()))
    }

    /// Assemble a trace id from its high and low 64-bit halves.
    pub const fn from_halves(hi: u64, lo: u64) -> Self {
        TraceId(((hi as u128) << 64) | lo as u128)
    }

    /// The high and low 64-bit halves of this trace id.
    pub const fn halves(self) -> (u64, u64) {
        ((self.0 >> 64) as u64, self.0 as u64)
    }

    pub const fn to_u128(self) -> u128 {
        self.0
    }

    /// `false` for the all-zero id.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value which identifies a given span.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid span id
    pub const INVALID: SpanId = SpanId(0);

    /// Converts a string of exactly 16 hex digits to a span id.
    ///
    /// # Examples
    ///
    /// ```
    /// use cloudtrace_spans::SpanId;
    ///
    /// assert!(SpanId::from_hex("58406520a0066491").is_ok());
    ///
    /// assert!(SpanId::from_hex("42").is_err());
    /// assert!(SpanId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, SpanError> {
        if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SpanError::InvalidSpanId(hex.to_owned()));
        }
        u64::from_str_radix(hex, 16)
            .map(SpanId)
            .map_err(|_| SpanError::InvalidSpanId(hex.to_owned()))
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// `false` for the zero "no span" sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    fn trace_id_test_data() -> Vec<(TraceId, &'static str)> {
        vec![
            (TraceId(0), "00000000000000000000000000000000"),
            (TraceId(42), "0000000000000000000000000000002a"),
            (TraceId(126642714606581564793456114182061442190), "5f467fe7bf42676c05e20ba4a90e448e"),
        ]
    }

    #[rustfmt::skip]
    fn span_id_test_data() -> Vec<(SpanId, &'static str)> {
        vec![
            (SpanId(0), "0000000000000000"),
            (SpanId(42), "000000000000002a"),
            (SpanId(5508496025762705295), "4c721bf33e3caf8f"),
        ]
    }

    #[test]
    fn trace_id_round_trip() {
        for (id, hex) in trace_id_test_data() {
            assert_eq!(format!("{}", id), hex);
            assert_eq!(format!("{:032x}", id), hex);
            assert_eq!(id, TraceId::from_hex(hex).unwrap());
        }
    }

    #[test]
    fn span_id_round_trip() {
        for (id, hex) in span_id_test_data() {
            assert_eq!(format!("{}", id), hex);
            assert_eq!(format!("{:016x}", id), hex);
            assert_eq!(id, SpanId::from_hex(hex).unwrap());
        }
    }

    #[test]
    fn trace_id_rejects_bad_input() {
        for bad in [
            "",
            "42",
            "5f467fe7bf42676c05e20ba4a90e448e00", // 34 digits
            "qq467fe7bf42676c05e20ba4a90e448e",
            "+f467fe7bf42676c05e20ba4a90e448e",
        ] {
            assert!(TraceId::from_hex(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn halves_round_trip() {
        let id = TraceId::from_hex("5f467fe7bf42676c05e20ba4a90e448e").unwrap();
        let (hi, lo) = id.halves();
        assert_eq!(hi, 0x5f467fe7bf42676c);
        assert_eq!(lo, 0x05e20ba4a90e448e);
        assert_eq!(TraceId::from_halves(hi, lo), id);
    }

    #[test]
    fn validity() {
        assert!(!TraceId::INVALID.is_valid());
        assert!(!SpanId::INVALID.is_valid());
        assert!(TraceId::from(1u128).is_valid());
        assert!(SpanId::from(1u64).is_valid());
    }
}
