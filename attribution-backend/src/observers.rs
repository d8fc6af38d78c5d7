//! Observer registry for engine notifications.

use attribution_types::{
    AggregatableDebugBudgetStatus, AggregatableDebugReport, AttributionReport,
    CreateReportResult, OsRegistrationItem, OsRegistrationResult, SendResult, StorableSource,
    StoreSourceStatus, SuitableOrigin, VerboseDebugReport,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// Engine notifications. Every method defaults to a no-op so observers
/// implement only what they care about.
pub trait AttributionObserver: Send + Sync {
    fn on_sources_changed(&self) {}

    fn on_reports_changed(&self) {}

    fn on_source_handled(
        &self,
        _source: &StorableSource,
        _source_time: DateTime<Utc>,
        _cleared_debug_key: Option<u64>,
        _status: StoreSourceStatus,
    ) {
    }

    fn on_trigger_handled(&self, _cleared_debug_key: Option<u64>, _result: &CreateReportResult) {}

    fn on_report_sent(
        &self,
        _report: &AttributionReport,
        _is_debug_report: bool,
        _result: &SendResult,
    ) {
    }

    fn on_debug_report_sent(
        &self,
        _report: &VerboseDebugReport,
        _http_status: Option<u16>,
        _time: DateTime<Utc>,
    ) {
    }

    fn on_aggregatable_debug_report_sent(
        &self,
        _report: &AggregatableDebugReport,
        _status: AggregatableDebugBudgetStatus,
        _http_status: Option<u16>,
    ) {
    }

    fn on_os_registration(
        &self,
        _time: DateTime<Utc>,
        _item: &OsRegistrationItem,
        _top_level_origin: &SuitableOrigin,
        _is_debug_key_allowed: bool,
        _result: OsRegistrationResult,
    ) {
    }

    fn on_debug_mode_changed(&self, _enabled: bool) {}
}

/// Ordered list of subscribers. Notification iterates a snapshot, so an
/// observer may add or remove observers from inside a callback.
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<(String, Arc<dyn AttributionObserver>)>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn AttributionObserver>) -> String {
        let id = Uuid::new_v4().to_string();
        self.observers.write().push((id.clone(), observer));
        id
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, f: impl Fn(&dyn AttributionObserver)) {
        let snapshot: Vec<Arc<dyn AttributionObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in snapshot {
            f(observer.as_ref());
        }
    }
}

/// Logs every notification at debug level.
pub struct LogObserver;

impl AttributionObserver for LogObserver {
    fn on_source_handled(
        &self,
        source: &StorableSource,
        _source_time: DateTime<Utc>,
        cleared_debug_key: Option<u64>,
        status: StoreSourceStatus,
    ) {
        log::debug!(
            "[ATTRIBUTION] Source {} from {} handled: {} (debug key cleared: {})",
            source.registration.source_event_id,
            source.reporting_origin,
            status.as_str(),
            cleared_debug_key.is_some()
        );
    }

    fn on_trigger_handled(&self, _cleared_debug_key: Option<u64>, result: &CreateReportResult) {
        log::debug!(
            "[ATTRIBUTION] Trigger from {} handled: event_level={} aggregatable={}",
            result.trigger.reporting_origin,
            result.event_level_status.as_str(),
            result.aggregatable_status.as_str()
        );
    }

    fn on_report_sent(&self, report: &AttributionReport, is_debug_report: bool, result: &SendResult) {
        log::debug!(
            "[REPORTS] {} report {} to {}: {} (debug: {})",
            report.report_type().as_str(),
            report.id,
            report.reporting_origin,
            result.label(),
            is_debug_report
        );
    }

    fn on_os_registration(
        &self,
        _time: DateTime<Utc>,
        item: &OsRegistrationItem,
        _top_level_origin: &SuitableOrigin,
        _is_debug_key_allowed: bool,
        result: OsRegistrationResult,
    ) {
        log::debug!("[OS_REGISTRATION] {} -> {:?}", item.url, result);
    }

    fn on_debug_mode_changed(&self, enabled: bool) {
        log::info!("[ATTRIBUTION] Debug mode {}", if enabled { "on" } else { "off" });
    }
}
