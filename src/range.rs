//! `Range` header parsing and resolution against an object's size.
//!
//! Parsing is purely syntactic and keeps an omitted end distinct from an end
//! of `0`. Resolution clamps against the object size and rejects ranges that
//! cannot be served.

use std::{fmt, ops::Range};
use thiserror::Error;

const BYTES_UNIT: &str = "bytes";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid Range header `{0}`")]
    Malformed(String),
    #[error("multiple ranges are not supported")]
    MultipleRanges,
    #[error("requested range not satisfiable for object of {size} bytes")]
    Unsatisfiable { size: u64 },
}

/// A single range as written by the client, before it is checked against a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-end` or `bytes=start-`.
    FromStart { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

/// Inclusive byte interval `[start, end]` within an object of at least one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// The whole object. Returns `None` for an empty object.
    pub fn full(size: u64) -> Option<Self> {
        size.checked_sub(1).map(|end| Self { start: 0, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered; never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Half-open form, as object stores expect it.
    pub fn to_exclusive(&self) -> Range<u64> {
        self.start..self.end + 1
    }

    /// `Content-Range` header value for an object of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("{} {}-{}/{}", BYTES_UNIT, self.start, self.end, total)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parse a raw `Range` header value.
///
/// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n`. The unit is matched
/// case-insensitively; anything else, including multi-range lists, is rejected.
pub fn parse_range_header(raw: &str) -> Result<RangeSpec, RangeError> {
    let malformed = || RangeError::Malformed(raw.to_string());

    let trimmed = raw.trim();
    let (unit, spec) = trimmed.split_once('=').ok_or_else(malformed)?;
    if !unit.trim().eq_ignore_ascii_case(BYTES_UNIT) {
        return Err(malformed());
    }

    if spec.contains(',') {
        return Err(RangeError::MultipleRanges);
    }

    let (start_s, end_s) = spec.trim().split_once('-').ok_or_else(malformed)?;
    let (start_s, end_s) = (start_s.trim(), end_s.trim());

    if start_s.is_empty() {
        let suffix = parse_position(end_s).ok_or_else(malformed)?;
        return Ok(RangeSpec::Suffix(suffix));
    }

    let start = parse_position(start_s).ok_or_else(malformed)?;
    let end = if end_s.is_empty() {
        None
    } else {
        Some(parse_position(end_s).ok_or_else(malformed)?)
    };

    Ok(RangeSpec::FromStart { start, end })
}

/// Resolve an optional `Range` header against an object of `size` bytes.
///
/// With no header the whole object is returned. The end is clamped to the
/// last byte; a start beyond the object or after the end is unsatisfiable.
pub fn resolve_range(raw: Option<&str>, size: u64) -> Result<ByteRange, RangeError> {
    let last = size
        .checked_sub(1)
        .ok_or(RangeError::Unsatisfiable { size })?;

    let Some(raw) = raw else {
        return Ok(ByteRange { start: 0, end: last });
    };

    match parse_range_header(raw)? {
        RangeSpec::Suffix(0) => Err(RangeError::Unsatisfiable { size }),
        RangeSpec::Suffix(n) => Ok(ByteRange {
            start: size.saturating_sub(n),
            end: last,
        }),
        RangeSpec::FromStart { start, end } => {
            let end = end.unwrap_or(last).min(last);
            if start > end {
                return Err(RangeError::Unsatisfiable { size });
            }
            Ok(ByteRange { start, end })
        }
    }
}

/// Digits only; `u64::from_str` would also take a leading `+`.
fn parse_position(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
