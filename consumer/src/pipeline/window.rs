//! Validation and retention-window classification

use crate::config::RetentionConfig;
use crate::message::{Classification, RawMessage, TIMESTAMP_FORMAT};
use chrono::{NaiveDate, NaiveDateTime};
use tracing::warn;

/// Classify a raw message against the retention window around `today` (UTC)
///
/// Only calendar dates are compared:
/// - same day is always in the window
/// - `1..=past_days_ok` days in the past is in the window
/// - `1..=future_days_ok` days in the future is in the window
///
/// Missing mandatory fields and unparseable timestamps are `Malformed`.
pub fn classify(raw: &RawMessage, retention: &RetentionConfig, today: NaiveDate) -> Classification {
    let missing = raw.missing_fields();
    if !missing.is_empty() {
        warn!(
            message_id = raw.message_id(),
            missing = ?missing,
            fields = ?raw.fields(),
            "Message has no mandatory fields"
        );
        return Classification::Malformed;
    }

    let timestamp = raw.get_non_empty("timestamp").unwrap_or_default();
    let Some(date) = parse_date(timestamp) else {
        warn!(
            message_id = raw.message_id(),
            timestamp,
            fields = ?raw.fields(),
            "Message timestamp does not match {TIMESTAMP_FORMAT}"
        );
        return Classification::Malformed;
    };

    if in_window(date, retention, today) {
        Classification::InWindow
    } else {
        Classification::OutOfWindow
    }
}

/// UTC calendar date of a `YYYY-MM-DDThh:mm:ssZ` timestamp
pub fn parse_date(timestamp: &str) -> Option<NaiveDate> {
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.date())
}

pub fn in_window(date: NaiveDate, retention: &RetentionConfig, today: NaiveDate) -> bool {
    let diff = (today - date).num_days();
    match diff {
        0 => true,
        d if d > 0 => d <= i64::from(retention.past_days_ok),
        d => -d <= i64::from(retention.future_days_ok),
    }
}
