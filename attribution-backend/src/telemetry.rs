//! Counted telemetry signals and in-memory pending report timings.

use attribution_types::{
    AggregatableResult, EventLevelResult, ReportId, ReportType, SendResult, StoreSourceStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};

pub const EVENT_QUEUE_OVERFLOW: &str = "event_queue.overflow";
pub const OS_QUEUE_OVERFLOW: &str = "os_registration_queue.overflow";

/// Pending aggregatable timings never hold more than this many reports.
pub const MAX_PENDING_REPORT_TIMINGS: usize = 50;

/// Named monotonically increasing counters.
#[derive(Default)]
pub struct AttributionMetrics {
    counters: DashMap<String, u64>,
}

impl AttributionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, n: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += n;
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn record_store_source(&self, status: StoreSourceStatus) {
        self.incr(&format!("store_source.{}", status.as_str()));
    }

    pub fn record_create_report(&self, event_level: EventLevelResult, aggregatable: AggregatableResult) {
        self.incr(&format!("create_report.event_level.{}", event_level.as_str()));
        self.incr(&format!("create_report.aggregatable.{}", aggregatable.as_str()));
    }

    pub fn record_send(&self, report_type: ReportType, is_debug_report: bool, result: &SendResult) {
        let kind = if is_debug_report { "debug_send" } else { "send" };
        self.incr(&format!("{}.{}.{}", kind, report_type.as_str(), result.label()));
    }

    pub fn record_retries_until_success(&self, report_type: ReportType, retries: u32) {
        self.incr(&format!(
            "send.{}.retries_until_success.{}",
            report_type.as_str(),
            retries
        ));
    }

    pub fn record_final_failure(&self, report_type: ReportType) {
        self.incr(&format!("send.{}.final_failure", report_type.as_str()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReportTiming {
    pub creation_time: DateTime<Utc>,
    pub report_time: DateTime<Utc>,
}

/// Creation and due times of aggregatable reports not yet handed to the
/// sender. Only used to count reports caught pending by an offline or
/// paused transition.
#[derive(Debug, Default)]
pub struct PendingReportTimings {
    timings: HashMap<ReportId, PendingReportTiming>,
}

impl PendingReportTimings {
    /// Returns false when full; the timing is not recorded then.
    pub fn insert(&mut self, id: ReportId, timing: PendingReportTiming) -> bool {
        if self.timings.len() >= MAX_PENDING_REPORT_TIMINGS && !self.timings.contains_key(&id) {
            return false;
        }
        self.timings.insert(id, timing);
        true
    }

    pub fn remove(&mut self, id: ReportId) -> Option<PendingReportTiming> {
        self.timings.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.timings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }

    /// Counts every pending report under `reason` and forgets them all.
    pub fn flush(&mut self, metrics: &AttributionMetrics, reason: &str) -> usize {
        let flushed = self.timings.len();
        if flushed > 0 {
            metrics.add(
                &format!("pending_aggregatable_reports.{}", reason),
                flushed as u64,
            );
        }
        self.timings.clear();
        flushed
    }
}
