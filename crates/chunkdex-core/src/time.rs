//! NTP wall-clock timestamp helpers.
//!
//! Chunks carry their wall-clock boundaries as RFC 3339 strings
//! (`2024-05-30T01:41:25.000Z`). Range filters need a numeric form, so each
//! string is paired with epoch seconds as `f64`. Resolution is one
//! millisecond: finer digits are truncated on conversion.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{ChunkdexError, Result};

/// Convert an RFC 3339 timestamp to epoch seconds at millisecond resolution.
pub fn ntp_to_epoch_secs(ntp: &str) -> Result<f64> {
    let parsed = DateTime::parse_from_rfc3339(ntp.trim()).map_err(|e| {
        ChunkdexError::InvalidMetadata(format!("Invalid NTP timestamp '{}': {}", ntp, e))
    })?;
    Ok(parsed.timestamp_millis() as f64 / 1000.0)
}

/// Format epoch seconds as a UTC RFC 3339 string with millisecond precision.
pub fn epoch_secs_to_ntp(secs: f64) -> Result<String> {
    if !secs.is_finite() {
        return Err(ChunkdexError::InvalidMetadata(format!(
            "Epoch seconds not finite: {}",
            secs
        )));
    }
    let millis = (secs * 1000.0).round() as i64;
    let dt = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        ChunkdexError::InvalidMetadata(format!("Epoch seconds out of range: {}", secs))
    })?;
    Ok(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Reject an interval that ends before it starts. Equal bounds are allowed.
pub fn check_interval<T: PartialOrd + fmt::Display>(what: &str, start: T, end: T) -> Result<()> {
    if end < start {
        return Err(ChunkdexError::InvalidMetadata(format!(
            "{} interval ends before it starts ({} > {})",
            what, start, end
        )));
    }
    Ok(())
}
