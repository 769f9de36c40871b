//! Staleness detection: decides whether an artifact must be created, updated or left alone.
//!
//! All timestamps are normalised to UTC before comparison. A source timestamp
//! that cannot be parsed counts as "changed" only when it is the sole signal;
//! when a size was also supplied the unparseable timestamp is ignored.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::contract::DestinationMetadata;

/// Outcome of comparing a prospective artifact with what the destination holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    Create,
    Update,
    Skip,
}

impl ChangeDecision {
    /// Whether this decision requires an upsert.
    pub fn needs_write(self) -> bool {
        !matches!(self, ChangeDecision::Skip)
    }

    /// Word used in the summary for a written artifact.
    pub fn action(self) -> &'static str {
        match self {
            ChangeDecision::Create => "created",
            ChangeDecision::Update => "updated",
            ChangeDecision::Skip => "skipped",
        }
    }
}

/// Parse an ISO-8601 timestamp (`Z`, offset, or naive) into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Decide for a single source record.
///
/// Rules, in order: absent → Create; size differs → Update; source timestamp
/// later than the artifact → Update; otherwise Skip.
pub fn decide(
    existing: Option<&DestinationMetadata>,
    source_size: Option<u64>,
    source_updated_at: Option<&str>,
) -> ChangeDecision {
    let Some(existing) = existing else {
        return ChangeDecision::Create;
    };
    if let Some(size) = source_size {
        if size != existing.size {
            return ChangeDecision::Update;
        }
    }
    if let Some(raw) = source_updated_at {
        match parse_timestamp(raw) {
            Some(source_time) => {
                if let Some(existing_time) = existing.modified_time {
                    if source_time > existing_time {
                        return ChangeDecision::Update;
                    }
                }
            }
            None if source_size.is_none() => return ChangeDecision::Update,
            None => {}
        }
    }
    ChangeDecision::Skip
}

/// Decide for an artifact built from many records, given their latest parseable timestamp.
///
/// A missing `latest` forces regeneration.
pub fn decide_aggregate(
    existing: Option<&DestinationMetadata>,
    source_size: Option<u64>,
    latest: Option<DateTime<Utc>>,
) -> ChangeDecision {
    let Some(existing) = existing else {
        return ChangeDecision::Create;
    };
    if let Some(size) = source_size {
        if size != existing.size {
            return ChangeDecision::Update;
        }
    }
    match (latest, existing.modified_time) {
        (Some(newest), Some(existing_time)) if newest <= existing_time => ChangeDecision::Skip,
        _ => ChangeDecision::Update,
    }
}

/// Apply the force-regeneration override: an existing artifact is rewritten regardless.
pub fn with_override(decision: ChangeDecision, force: bool) -> ChangeDecision {
    match decision {
        ChangeDecision::Skip if force => ChangeDecision::Update,
        other => other,
    }
}

/// Latest parseable timestamp among the given raw values.
pub fn latest_timestamp<'a, I>(values: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = &'a str>,
{
    values.into_iter().filter_map(parse_timestamp).max()
}

/// Timestamp fields scanned on auxiliary JSON records.
pub const RECORD_TIMESTAMP_FIELDS: &[&str] = &[
    "updated_at",
    "last_reply_at",
    "posted_at",
    "last_message_at",
    "created_at",
];

/// Latest timestamp found in any of [`RECORD_TIMESTAMP_FIELDS`] across `records`.
pub fn latest_record_timestamp(records: &[Value]) -> Option<DateTime<Utc>> {
    latest_timestamp(records.iter().flat_map(|record| {
        RECORD_TIMESTAMP_FIELDS
            .iter()
            .filter_map(move |field| record.get(*field).and_then(Value::as_str))
    }))
}
