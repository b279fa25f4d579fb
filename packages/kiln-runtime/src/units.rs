//! Human-readable size and duration grammars
//!
//! Experiment requests describe resources as strings such as `"2gb"` or
//! `"512 MiB"`. Decimal suffixes scale by powers of 1000, binary suffixes
//! (`kib`, `mib`, ...) by powers of 1024; a bare number is bytes. A
//! fractional mantissa is allowed.

use crate::error::{Result, WorkerError};
use std::time::Duration;

const DECIMAL: [(&str, u64); 6] = [
    ("pb", 1_000_000_000_000_000),
    ("tb", 1_000_000_000_000),
    ("gb", 1_000_000_000),
    ("mb", 1_000_000),
    ("kb", 1_000),
    ("b", 1),
];

const BINARY: [(&str, u64); 5] = [
    ("pib", 1 << 50),
    ("tib", 1 << 40),
    ("gib", 1 << 30),
    ("mib", 1 << 20),
    ("kib", 1 << 10),
];

/// Parse a human size string into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let text = input.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err(WorkerError::malformed("empty size string").with("input", input));
    }

    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (mantissa, suffix) = text.split_at(split);
    let suffix = suffix.trim();

    let value: f64 = mantissa
        .parse()
        .map_err(|_| WorkerError::malformed("unparseable size mantissa").with("input", input))?;
    if value < 0.0 || !value.is_finite() {
        return Err(WorkerError::malformed("size out of range").with("input", input));
    }

    let scale = if suffix.is_empty() {
        1
    } else {
        lookup_suffix(suffix)
            .ok_or_else(|| WorkerError::malformed("unknown size suffix").with("input", input))?
    };

    Ok((value * scale as f64).round() as u64)
}

fn lookup_suffix(suffix: &str) -> Option<u64> {
    BINARY
        .iter()
        .chain(DECIMAL.iter())
        .find(|(name, _)| *name == suffix)
        .map(|(_, scale)| *scale)
}

/// Parse a lifetime/duration string such as `"24h"` or `"90m 30s"`
pub fn parse_duration(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|e| WorkerError::malformed("unparseable duration").with("input", input).with_source(e))
}

/// Render a byte count with its largest decimal suffix, for log lines
pub fn format_size(bytes: u64) -> String {
    for (name, scale) in DECIMAL.iter() {
        if *scale > 1 && bytes >= *scale {
            return format!("{:.1}{}", bytes as f64 / *scale as f64, name);
        }
    }
    format!("{}b", bytes)
}
