//! Timestamp helpers shared by the registry, workflow state and rendering.
//!
//! Submission timestamps are stored as naive UTC strings in the form
//! `YYYY-MM-DD HH:MM:SS.ffffff`. The fractional part is optional on read.

use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::{AppError, Result};

const SUBMIT_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");
const SUBMIT_TIME_FORMAT_WHOLE_SECONDS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DISPLAY_FULL: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DISPLAY_TIME_ONLY: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a submission timestamp in the registry's fixed format.
///
/// # Errors
/// Returns [`AppError::Timestamp`] when formatting fails.
pub fn format_submit_time(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(SUBMIT_TIME_FORMAT)
        .map_err(|err| AppError::Timestamp(format!("failed to format submit time: {err}")))
}

/// Parses a submission timestamp, interpreting it as UTC.
///
/// # Errors
/// Returns [`AppError::Timestamp`] when the value matches neither the
/// fractional nor the whole-second form.
pub fn parse_submit_time(value: &str) -> Result<OffsetDateTime> {
    let parsed = PrimitiveDateTime::parse(value, SUBMIT_TIME_FORMAT)
        .or_else(|_| PrimitiveDateTime::parse(value, SUBMIT_TIME_FORMAT_WHOLE_SECONDS))
        .map_err(|err| AppError::Timestamp(format!("invalid submit time {value:?}: {err}")))?;
    Ok(parsed.assume_utc())
}

/// Parses an RFC 3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`AppError::Timestamp`] on malformed input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| AppError::Timestamp(format!("invalid RFC3339 timestamp: {err}")))
}

/// # Errors
/// Returns [`AppError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| AppError::Timestamp(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Offset of the local time zone, or UTC when it cannot be determined.
#[must_use]
pub fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

#[must_use]
pub fn to_local(value: OffsetDateTime) -> OffsetDateTime {
    value.to_offset(local_offset())
}

/// `YYYY-MM-DD HH:MM:SS` in the local offset.
#[must_use]
pub fn display_full(value: OffsetDateTime) -> String {
    to_local(value)
        .format(DISPLAY_FULL)
        .unwrap_or_else(|_| value.to_string())
}

/// Like [`display_full`], but drops the date when it matches `reference`.
#[must_use]
pub fn display_relative(value: OffsetDateTime, reference: Option<OffsetDateTime>) -> String {
    let local = to_local(value);
    match reference.map(to_local) {
        Some(reference) if reference.date() == local.date() => local
            .format(DISPLAY_TIME_ONLY)
            .unwrap_or_else(|_| display_full(value)),
        _ => display_full(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn submit_time_accepts_fractional_and_whole_seconds() {
        let whole = must(parse_submit_time("2024-01-01 10:00:00"));
        let fractional = must(parse_submit_time("2024-01-01 10:00:00.000000"));
        assert_eq!(whole, fractional);
        assert_eq!(whole.offset(), UtcOffset::UTC);
    }

    #[test]
    fn submit_time_format_is_stable() {
        let value = must(parse_submit_time("2024-01-02 09:00:00.250000"));
        assert_eq!(must(format_submit_time(value)), "2024-01-02 09:00:00.250000");
    }

    #[test]
    fn submit_time_rejects_rfc3339() {
        assert!(parse_submit_time("2024-01-02T09:00:00Z").is_err());
    }

    #[test]
    fn rfc3339_is_normalized_to_utc() {
        let value = must(parse_rfc3339_utc("2024-01-02T11:00:00+02:00"));
        assert_eq!(must(format_rfc3339(value)), "2024-01-02T09:00:00Z");
    }

    #[test]
    fn relative_display_drops_date_only_on_same_day() {
        let start = must(parse_rfc3339_utc("2024-01-02T12:00:00Z"));
        let same_day = start + time::Duration::minutes(5);
        let next_week = start + time::Duration::days(7);
        assert_eq!(display_relative(same_day, Some(start)).len(), 8);
        assert_eq!(display_relative(next_week, Some(start)).len(), 19);
        assert_eq!(display_relative(start, None).len(), 19);
    }
}
