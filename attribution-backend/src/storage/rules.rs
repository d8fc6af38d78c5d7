//! Attribution rules applied by the resolver: source windows, event-level
//! report timing and aggregatable contributions.

use attribution_types::{
    AggregatableContribution, KeyPiece, SourceRegistration, SourceType, StoredSource,
    TriggerRegistration,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

const MIN_EXPIRY: i64 = 86400;
const MAX_EXPIRY: i64 = 30 * 86400;
const MIN_REPORT_WINDOW: i64 = 3600;

/// Early reporting windows of navigation sources, relative to source time.
const NAVIGATION_EARLY_WINDOWS_DAYS: [i64; 2] = [2, 7];

pub struct SourceTimes {
    pub expiry_time: DateTime<Utc>,
    pub event_report_window_time: DateTime<Utc>,
    pub aggregatable_report_window_time: DateTime<Utc>,
}

pub fn source_times(registration: &SourceRegistration, source_time: DateTime<Utc>) -> SourceTimes {
    let expiry_secs = registration.expiry_secs.clamp(MIN_EXPIRY, MAX_EXPIRY);
    let window = |secs: Option<i64>| {
        let secs = secs
            .map(|s| s.clamp(MIN_REPORT_WINDOW, expiry_secs))
            .unwrap_or(expiry_secs);
        source_time + Duration::seconds(secs)
    };
    SourceTimes {
        expiry_time: source_time + Duration::seconds(expiry_secs),
        event_report_window_time: window(registration.event_report_window_secs),
        aggregatable_report_window_time: window(registration.aggregatable_report_window_secs),
    }
}

pub fn max_event_level_reports(source_type: SourceType) -> u32 {
    match source_type {
        SourceType::Navigation => 3,
        SourceType::Event => 1,
    }
}

/// Trigger data is reduced modulo this before it is reported.
pub fn trigger_data_cardinality(source_type: SourceType) -> u64 {
    match source_type {
        SourceType::Navigation => 8,
        SourceType::Event => 2,
    }
}

/// End of the first reporting window that has not closed at `trigger_time`.
pub fn event_level_report_time(source: &StoredSource, trigger_time: DateTime<Utc>) -> DateTime<Utc> {
    let window_end = source.event_report_window_time;
    if source.source_type == SourceType::Event {
        return window_end;
    }
    NAVIGATION_EARLY_WINDOWS_DAYS
        .iter()
        .map(|days| source.source_time + Duration::days(*days))
        .filter(|end| *end < window_end)
        .find(|end| trigger_time <= *end)
        .unwrap_or(window_end)
}

/// One contribution per source key that has a value, keyed by the source
/// key piece OR-ed with every trigger key piece targeting it.
pub fn aggregatable_contributions(
    source_keys: &BTreeMap<String, KeyPiece>,
    trigger: &TriggerRegistration,
) -> Vec<AggregatableContribution> {
    source_keys
        .iter()
        .filter_map(|(name, source_piece)| {
            let value = *trigger.aggregatable_values.get(name)?;
            if value == 0 {
                return None;
            }
            let key = trigger
                .aggregatable_trigger_data
                .iter()
                .filter(|data| data.source_keys.iter().any(|k| k == name))
                .fold(*source_piece, |key, data| key | data.key_piece);
            Some(AggregatableContribution { key, value })
        })
        .collect()
}

pub fn total_value(contributions: &[AggregatableContribution]) -> i64 {
    contributions.iter().map(|c| c.value as i64).sum()
}
