//! End-to-end tests for the engine: queueing, admission, report sending,
//! retries and the debug side channels.
//!
//! Storage is a real in-memory SQLite resolver; every other collaborator is
//! a scripted fake. Time only moves when a test advances the manual clock,
//! and observer notifications arrive on a channel in the order they fired.

use super::*;
use crate::clock::ManualClock;
use crate::collaborators::ClearTextAggregationService;
use crate::error::AssemblyError;
use crate::policy::{AttributionOperation, PolicyDecision, PolicyRequest};
use crate::storage::{Db, SqliteResolver};
use crate::telemetry::PendingReportTiming;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::timeout;

const WAIT: std::time::Duration = std::time::Duration::from_secs(5);
const CONTEXT: ContextId = ContextId(1);
const REPORTER: &str = "https://reporter.test";

fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn origin(s: &str) -> SuitableOrigin {
    SuitableOrigin::parse(s).unwrap()
}

fn transient() -> SendResult {
    SendResult::Sent {
        outcome: SentOutcome::TransientFailure,
        http_status: None,
    }
}

async fn pass_gate(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.expect("gate closed").forget();
    }
}

// =====================================================
// Fakes
// =====================================================

#[derive(Default)]
struct FakeReportSender {
    /// Results for non-debug sends, in order; afterwards every send succeeds.
    script: Mutex<VecDeque<SendResult>>,
    sent: Mutex<Vec<(AttributionReport, bool)>>,
    verbose: Mutex<Vec<VerboseDebugReport>>,
    aggregatable_debug: Mutex<Vec<AggregatableDebugReport>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeReportSender {
    fn sends(&self, is_debug_report: bool) -> Vec<AttributionReport> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, is_debug)| *is_debug == is_debug_report)
            .map(|(report, _)| report.clone())
            .collect()
    }
}

#[async_trait]
impl ReportSender for FakeReportSender {
    async fn send_report(&self, report: &AttributionReport, is_debug_report: bool) -> SendResult {
        if is_debug_report {
            self.sent.lock().push((report.clone(), true));
            return SendResult::sent(200);
        }
        pass_gate(&self.gate).await;
        self.sent.lock().push((report.clone(), false));
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or(SendResult::sent(200))
    }

    async fn send_verbose_debug_report(&self, report: &VerboseDebugReport) -> Option<u16> {
        self.verbose.lock().push(report.clone());
        Some(200)
    }

    async fn send_aggregatable_debug_report(
        &self,
        report: &AggregatableDebugReport,
        _assembled: &AssembledReport,
    ) -> Option<u16> {
        self.aggregatable_debug.lock().push(report.clone());
        Some(200)
    }
}

struct FakeCookieChecker {
    origins: HashSet<SuitableOrigin>,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl CookieChecker for FakeCookieChecker {
    async fn is_debug_cookie_set(&self, origin: &SuitableOrigin) -> bool {
        pass_gate(&self.gate).await;
        self.origins.contains(origin)
    }
}

/// Rejects every item whose URL mentions "reject".
#[derive(Default)]
struct FakeOsLevelManager {
    registrations: Mutex<Vec<OsRegistration>>,
    cleared: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl OsLevelManager for FakeOsLevelManager {
    async fn register(
        &self,
        registration: &OsRegistration,
        _debug_key_allowed: &[bool],
    ) -> Vec<bool> {
        pass_gate(&self.gate).await;
        self.registrations.lock().push(registration.clone());
        registration
            .items
            .iter()
            .map(|item| !item.url.contains("reject"))
            .collect()
    }

    async fn clear_data(
        &self,
        _begin: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
        _filter: &DataFilter,
        _delete_rate_limit_data: bool,
    ) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn os_support(&self) -> OsSupport {
        OsSupport::Enabled
    }
}

/// Allows everything except denied operations and blocked reporting origins.
#[derive(Default)]
struct FakePolicy {
    denied: Mutex<HashSet<AttributionOperation>>,
    blocked: HashSet<SuitableOrigin>,
}

impl FakePolicy {
    fn deny(&self, operation: AttributionOperation) {
        self.denied.lock().insert(operation);
    }
}

impl PolicyOracle for FakePolicy {
    fn is_operation_allowed(&self, request: &PolicyRequest<'_>) -> PolicyDecision {
        if self.denied.lock().contains(&request.operation)
            || self.blocked.contains(request.reporting_origin)
        {
            PolicyDecision::deny()
        } else {
            PolicyDecision::allow()
        }
    }
}

struct FailingAggregationService;

#[async_trait]
impl AggregationService for FailingAggregationService {
    async fn assemble_report(
        &self,
        _request: crate::collaborators::AggregatableReportRequest,
    ) -> Result<AssembledReport, AssemblyError> {
        Err(AssemblyError::AssemblyFailed("coordinator unreachable".into()))
    }
}

// =====================================================
// Observer
// =====================================================

#[derive(Debug, Clone, PartialEq)]
enum Observed {
    SourceHandled {
        source_event_id: u64,
        status: StoreSourceStatus,
        cleared_debug_key: Option<u64>,
    },
    TriggerHandled {
        event_level: EventLevelResult,
        aggregatable: AggregatableResult,
        cleared_debug_key: Option<u64>,
    },
    ReportSent {
        id: ReportId,
        report_type: ReportType,
        is_debug: bool,
        failed_send_attempts: u32,
        result: SendResult,
    },
    DebugReportSent {
        data_types: Vec<DebugDataType>,
        http_status: Option<u16>,
    },
    AggregatableDebugReportSent {
        status: AggregatableDebugBudgetStatus,
        http_status: Option<u16>,
    },
    OsRegistration {
        url: String,
        result: OsRegistrationResult,
        debug_allowed: bool,
    },
    DebugModeChanged(bool),
}

struct RecordingObserver {
    tx: mpsc::UnboundedSender<Observed>,
    sources_changed: AtomicUsize,
    reports_changed: AtomicUsize,
}

impl RecordingObserver {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Observed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(Self {
            tx,
            sources_changed: AtomicUsize::new(0),
            reports_changed: AtomicUsize::new(0),
        });
        (observer, rx)
    }

    fn record(&self, observed: Observed) {
        let _ = self.tx.send(observed);
    }
}

impl AttributionObserver for RecordingObserver {
    fn on_sources_changed(&self) {
        self.sources_changed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reports_changed(&self) {
        self.reports_changed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_source_handled(
        &self,
        source: &StorableSource,
        _source_time: DateTime<Utc>,
        cleared_debug_key: Option<u64>,
        status: StoreSourceStatus,
    ) {
        self.record(Observed::SourceHandled {
            source_event_id: source.registration.source_event_id,
            status,
            cleared_debug_key,
        });
    }

    fn on_trigger_handled(&self, cleared_debug_key: Option<u64>, result: &CreateReportResult) {
        self.record(Observed::TriggerHandled {
            event_level: result.event_level_status,
            aggregatable: result.aggregatable_status,
            cleared_debug_key,
        });
    }

    fn on_report_sent(&self, report: &AttributionReport, is_debug_report: bool, result: &SendResult) {
        self.record(Observed::ReportSent {
            id: report.id,
            report_type: report.report_type(),
            is_debug: is_debug_report,
            failed_send_attempts: report.failed_send_attempts,
            result: *result,
        });
    }

    fn on_debug_report_sent(
        &self,
        report: &VerboseDebugReport,
        http_status: Option<u16>,
        _time: DateTime<Utc>,
    ) {
        self.record(Observed::DebugReportSent {
            data_types: report.data.iter().map(|d| d.data_type).collect(),
            http_status,
        });
    }

    fn on_aggregatable_debug_report_sent(
        &self,
        _report: &AggregatableDebugReport,
        status: AggregatableDebugBudgetStatus,
        http_status: Option<u16>,
    ) {
        self.record(Observed::AggregatableDebugReportSent {
            status,
            http_status,
        });
    }

    fn on_os_registration(
        &self,
        _time: DateTime<Utc>,
        item: &OsRegistrationItem,
        _top_level_origin: &SuitableOrigin,
        is_debug_key_allowed: bool,
        result: OsRegistrationResult,
    ) {
        self.record(Observed::OsRegistration {
            url: item.url.clone(),
            result,
            debug_allowed: is_debug_key_allowed,
        });
    }

    fn on_debug_mode_changed(&self, enabled: bool) {
        self.record(Observed::DebugModeChanged(enabled));
    }
}

// =====================================================
// Harness
// =====================================================

#[derive(Default)]
struct HarnessOptions {
    config: EngineConfig,
    aggregation_service: Option<Arc<dyn AggregationService>>,
    cookie_origins: Vec<&'static str>,
    blocked_origins: Vec<&'static str>,
    send_script: Vec<SendResult>,
    gate_cookies: bool,
    gate_sends: bool,
    gate_os: bool,
}

/// Engine wired to an in-memory resolver, a manual clock and fakes for
/// everything else. Gated fakes block until the test hands out permits.
struct TestHarness {
    manager: AttributionManager,
    clock: Arc<ManualClock>,
    resolver: Arc<SqliteResolver>,
    sender: Arc<FakeReportSender>,
    os: Arc<FakeOsLevelManager>,
    policy: Arc<FakePolicy>,
    observer: Arc<RecordingObserver>,
    events: mpsc::UnboundedReceiver<Observed>,
    cookie_gate: Arc<Semaphore>,
    send_gate: Arc<Semaphore>,
    os_gate: Arc<Semaphore>,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with(HarnessOptions::default()).await
    }

    async fn with(options: HarnessOptions) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let resolver = Arc::new(SqliteResolver::new(db, clock.clone()));

        let cookie_gate = Arc::new(Semaphore::new(0));
        let send_gate = Arc::new(Semaphore::new(0));
        let os_gate = Arc::new(Semaphore::new(0));
        let gate = |enabled: bool, gate: &Arc<Semaphore>| enabled.then(|| gate.clone());

        let sender = Arc::new(FakeReportSender {
            script: Mutex::new(options.send_script.into_iter().collect()),
            gate: gate(options.gate_sends, &send_gate),
            ..Default::default()
        });
        let cookies = Arc::new(FakeCookieChecker {
            origins: options.cookie_origins.iter().map(|o| origin(o)).collect(),
            gate: gate(options.gate_cookies, &cookie_gate),
        });
        let os = Arc::new(FakeOsLevelManager {
            gate: gate(options.gate_os, &os_gate),
            ..Default::default()
        });
        let policy = Arc::new(FakePolicy {
            blocked: options.blocked_origins.iter().map(|o| origin(o)).collect(),
            ..Default::default()
        });

        let collab = Collaborators {
            resolver: resolver.clone(),
            cookie_checker: cookies,
            report_sender: sender.clone(),
            os_level_manager: os.clone(),
            aggregation_service: options.aggregation_service,
            policy: policy.clone(),
            clock: clock.clone(),
        };
        let manager = AttributionManager::start(options.config, collab).await;
        let (observer, events) = RecordingObserver::new();
        manager.add_observer(observer.clone());

        TestHarness {
            manager,
            clock,
            resolver,
            sender,
            os,
            policy,
            observer,
            events,
            cookie_gate,
            send_gate,
            os_gate,
        }
    }

    async fn next_event(&mut self) -> Observed {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an observer notification")
            .expect("observer channel closed")
    }

    /// Skips notifications until one matches.
    async fn next_matching(&mut self, pred: impl Fn(&Observed) -> bool) -> Observed {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn next_report_sent(&mut self) -> Observed {
        self.next_matching(|e| matches!(e, Observed::ReportSent { .. }))
            .await
    }

    async fn pending_reports(&self) -> Vec<AttributionReport> {
        self.manager.get_pending_reports_for_internal_use(None).await
    }

    /// Registers an event source and a matching event trigger; the report
    /// becomes due one hour after start.
    async fn store_event_report(&mut self) -> AttributionReport {
        assert!(self.manager.handle_source(event_source(1), CONTEXT));
        self.next_matching(|e| matches!(e, Observed::SourceHandled { .. }))
            .await;
        assert!(self.manager.handle_trigger(event_trigger(), CONTEXT));
        let handled = self
            .next_matching(|e| matches!(e, Observed::TriggerHandled { .. }))
            .await;
        assert!(matches!(
            handled,
            Observed::TriggerHandled {
                event_level: EventLevelResult::Success,
                ..
            }
        ));
        let mut reports = self.pending_reports().await;
        assert_eq!(reports.len(), 1);
        reports.remove(0)
    }
}

// =====================================================
// Registrations
// =====================================================

/// Event source on news.test for shop.test, reported one hour after it
/// is stored.
fn event_source(source_event_id: u64) -> StorableSource {
    let mut aggregation_keys = BTreeMap::new();
    aggregation_keys.insert("campaign".to_string(), KeyPiece(0x100));
    StorableSource {
        reporting_origin: origin(REPORTER),
        source_origin: origin("https://news.test"),
        source_type: SourceType::Event,
        registration: SourceRegistration {
            source_event_id,
            destinations: vec![origin("https://shop.test")],
            expiry_secs: 30 * 86400,
            event_report_window_secs: Some(3600),
            aggregatable_report_window_secs: None,
            priority: 0,
            debug_key: None,
            debug_reporting: false,
            aggregation_keys,
            aggregatable_debug_reporting: None,
        },
        is_within_fenced_frame: false,
        debug_cookie_set: false,
    }
}

fn event_trigger() -> AttributionTrigger {
    AttributionTrigger {
        reporting_origin: origin(REPORTER),
        destination_origin: origin("https://shop.test"),
        registration: TriggerRegistration {
            event_triggers: vec![EventTriggerData {
                data: 1,
                priority: 0,
                dedup_key: None,
            }],
            ..Default::default()
        },
        is_within_fenced_frame: false,
    }
}

fn aggregatable_trigger(value: u32) -> AttributionTrigger {
    let mut trigger = event_trigger();
    trigger.registration.event_triggers.clear();
    trigger
        .registration
        .aggregatable_values
        .insert("campaign".to_string(), value);
    trigger
}

fn os_registration(urls: &[&str]) -> OsRegistration {
    OsRegistration {
        top_level_origin: origin("https://news.test"),
        registration_type: OsRegistrationType::Source,
        items: urls
            .iter()
            .map(|url| OsRegistrationItem {
                url: url.to_string(),
                debug_reporting: false,
            })
            .collect(),
        context_id: Some(CONTEXT),
        is_within_fenced_frame: false,
    }
}

fn debug_mode_options() -> HarnessOptions {
    HarnessOptions {
        config: EngineConfig {
            debug_mode: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

// =====================================================
// Event pipeline
// =====================================================

#[tokio::test]
async fn test_events_are_handled_in_arrival_order() {
    let mut h = TestHarness::new().await;
    for id in 1..=3 {
        assert!(h.manager.handle_source(event_source(id), CONTEXT));
    }
    assert!(h.manager.handle_trigger(event_trigger(), CONTEXT));

    for id in 1..=3 {
        assert_eq!(
            h.next_event().await,
            Observed::SourceHandled {
                source_event_id: id,
                status: StoreSourceStatus::Success,
                cleared_debug_key: None,
            }
        );
    }
    assert!(matches!(
        h.next_event().await,
        Observed::TriggerHandled {
            event_level: EventLevelResult::Success,
            aggregatable: AggregatableResult::NotRegistered,
            ..
        }
    ));
    assert_eq!(h.manager.metrics().get("store_source.success"), 3);
}

#[tokio::test]
async fn test_full_event_queue_drops_new_events() {
    let mut h = TestHarness::with(HarnessOptions {
        config: EngineConfig {
            max_pending_events: 2,
            ..Default::default()
        },
        gate_cookies: true,
        ..Default::default()
    })
    .await;

    // Debug keys force a cookie lookup, which holds the first event in flight
    let with_debug_key = |id| {
        let mut source = event_source(id);
        source.registration.debug_key = Some(id);
        source
    };
    assert!(h.manager.handle_source(with_debug_key(1), CONTEXT));
    assert!(h.manager.handle_source(with_debug_key(2), CONTEXT));
    assert!(!h.manager.handle_source(with_debug_key(3), CONTEXT));
    assert_eq!(h.manager.metrics().get(crate::telemetry::EVENT_QUEUE_OVERFLOW), 1);

    h.cookie_gate.add_permits(2);
    for id in 1..=2 {
        assert!(matches!(
            h.next_event().await,
            Observed::SourceHandled { source_event_id, .. } if source_event_id == id
        ));
    }

    // The rejected event never shows up; the next one does
    h.cookie_gate.add_permits(1);
    assert!(h.manager.handle_source(with_debug_key(4), CONTEXT));
    assert!(matches!(
        h.next_event().await,
        Observed::SourceHandled {
            source_event_id: 4,
            ..
        }
    ));
}

#[tokio::test]
async fn test_prohibited_registrations_are_not_stored() {
    let mut h = TestHarness::new().await;
    h.policy.deny(AttributionOperation::Source);
    h.policy.deny(AttributionOperation::Trigger);

    h.manager.handle_source(event_source(1), CONTEXT);
    assert_eq!(
        h.next_event().await,
        Observed::SourceHandled {
            source_event_id: 1,
            status: StoreSourceStatus::ProhibitedByBrowserPolicy,
            cleared_debug_key: None,
        }
    );
    h.manager.handle_trigger(event_trigger(), CONTEXT);
    assert!(matches!(
        h.next_event().await,
        Observed::TriggerHandled {
            event_level: EventLevelResult::ProhibitedByBrowserPolicy,
            aggregatable: AggregatableResult::ProhibitedByBrowserPolicy,
            ..
        }
    ));

    assert!(h.manager.get_active_sources_for_web_ui().await.is_empty());
    assert!(h.pending_reports().await.is_empty());
    assert_eq!(
        h.manager
            .metrics()
            .get("store_source.prohibited_by_browser_policy"),
        1
    );
}

#[tokio::test]
async fn test_debug_keys_cleared_without_cookie() {
    let mut h = TestHarness::new().await;
    let mut source = event_source(1);
    source.registration.debug_key = Some(11);
    let mut trigger = event_trigger();
    trigger.registration.debug_key = Some(22);

    h.manager.handle_source(source, CONTEXT);
    assert_eq!(
        h.next_event().await,
        Observed::SourceHandled {
            source_event_id: 1,
            status: StoreSourceStatus::Success,
            cleared_debug_key: Some(11),
        }
    );
    let stored = h.manager.get_active_sources_for_web_ui().await;
    assert_eq!(stored[0].debug_key(), None);
    assert!(!stored[0].debug_cookie_set);

    h.manager.handle_trigger(trigger, CONTEXT);
    assert!(matches!(
        h.next_event().await,
        Observed::TriggerHandled {
            cleared_debug_key: Some(22),
            ..
        }
    ));

    // No debug copy: the only send is the scheduled one
    h.clock.advance(Duration::hours(1));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { is_debug: false, .. }
    ));
    assert!(h.sender.sends(true).is_empty());
}

// =====================================================
// Sending
// =====================================================

#[tokio::test]
async fn test_report_sent_at_report_time() {
    let mut h = TestHarness::new().await;
    let report = h.store_event_report().await;
    assert_eq!(report.report_time, start_time() + Duration::hours(1));
    assert_eq!(h.manager.next_report_time(), Some(report.report_time));

    h.clock.advance(Duration::hours(1));
    assert_eq!(
        h.next_report_sent().await,
        Observed::ReportSent {
            id: report.id,
            report_type: ReportType::EventLevel,
            is_debug: false,
            failed_send_attempts: 0,
            result: SendResult::sent(200),
        }
    );
    assert!(h.pending_reports().await.is_empty());
    assert_eq!(h.manager.reports_being_sent_count(), 0);
    assert_eq!(h.manager.metrics().get("send.event_level.sent"), 1);
    assert_eq!(
        h.manager
            .metrics()
            .get("send.event_level.retries_until_success.0"),
        1
    );
}

#[tokio::test]
async fn test_report_in_flight_is_sent_once() {
    let mut h = TestHarness::with(HarnessOptions {
        gate_sends: true,
        ..Default::default()
    })
    .await;
    let report = h.store_event_report().await;

    // Two pulls for the same due time while the first send is still out
    let due = report.report_time;
    assert_eq!(h.manager.on_reporting_time_reached(due).await, None);
    assert_eq!(h.manager.on_reporting_time_reached(due).await, None);
    assert_eq!(h.manager.reports_being_sent_count(), 1);
    assert!(h.manager.send_report_for_web_ui(report.id).await.is_none());

    h.send_gate.add_permits(1);
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { id, .. } if id == report.id
    ));
    assert_eq!(h.sender.sends(false).len(), 1);
    assert_eq!(h.manager.reports_being_sent_count(), 0);
    assert!(h.pending_reports().await.is_empty());
}

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let mut h = TestHarness::with(HarnessOptions {
        send_script: vec![transient(), transient()],
        ..Default::default()
    })
    .await;
    let report = h.store_event_report().await;

    h.clock.advance(Duration::hours(1));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { failed_send_attempts: 1, result, .. } if result == transient()
    ));
    let pending = h.pending_reports().await;
    assert_eq!(pending[0].failed_send_attempts, 1);
    assert_eq!(
        pending[0].report_time,
        report.report_time + Duration::minutes(5)
    );

    h.clock.advance(Duration::minutes(5));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { failed_send_attempts: 2, result, .. } if result == transient()
    ));

    h.clock.advance(Duration::minutes(15));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { failed_send_attempts: 2, result, .. } if result.is_success()
    ));
    assert!(h.pending_reports().await.is_empty());
    assert_eq!(h.sender.sends(false).len(), 3);
    assert_eq!(
        h.manager
            .metrics()
            .get("send.event_level.retries_until_success.2"),
        1
    );
}

#[tokio::test]
async fn test_retry_budget_exhausted_deletes_report() {
    let mut h = TestHarness::with(HarnessOptions {
        send_script: vec![transient(), transient(), transient()],
        ..Default::default()
    })
    .await;
    h.store_event_report().await;

    h.clock.advance(Duration::hours(1));
    h.next_report_sent().await;
    h.clock.advance(Duration::minutes(5));
    h.next_report_sent().await;
    h.clock.advance(Duration::minutes(15));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { failed_send_attempts: 2, result, .. } if result == transient()
    ));

    assert!(h.pending_reports().await.is_empty());
    assert_eq!(h.manager.metrics().get("send.event_level.final_failure"), 1);
}

#[tokio::test]
async fn test_report_denied_at_send_time_is_dropped() {
    let mut h = TestHarness::new().await;
    let report = h.store_event_report().await;
    h.policy.deny(AttributionOperation::Report);

    h.clock.advance(Duration::hours(1));
    assert_eq!(
        h.next_report_sent().await,
        Observed::ReportSent {
            id: report.id,
            report_type: ReportType::EventLevel,
            is_debug: false,
            failed_send_attempts: 0,
            result: SendResult::Dropped,
        }
    );
    assert!(h.sender.sends(false).is_empty());
    assert!(h.pending_reports().await.is_empty());
}

#[tokio::test]
async fn test_send_report_for_web_ui_sends_now() {
    let mut h = TestHarness::new().await;
    let report = h.store_event_report().await;

    let result = h.manager.send_report_for_web_ui(report.id).await;
    assert_eq!(result, Some(SendResult::sent(200)));
    let sent = h.sender.sends(false);
    assert_eq!(sent[0].report_time, h.clock.now());
    assert!(matches!(h.next_report_sent().await, Observed::ReportSent { .. }));

    assert!(h.pending_reports().await.is_empty());
    assert!(h.manager.send_report_for_web_ui(report.id).await.is_none());
}

#[tokio::test]
async fn test_debug_copy_sent_immediately() {
    let mut h = TestHarness::with(HarnessOptions {
        cookie_origins: vec![REPORTER],
        ..Default::default()
    })
    .await;
    let mut source = event_source(1);
    source.registration.debug_key = Some(11);
    let mut trigger = event_trigger();
    trigger.registration.debug_key = Some(22);

    h.manager.handle_source(source, CONTEXT);
    assert!(matches!(
        h.next_event().await,
        Observed::SourceHandled {
            cleared_debug_key: None,
            ..
        }
    ));
    h.manager.handle_trigger(trigger, CONTEXT);
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { is_debug: true, result, .. } if result.is_success()
    ));

    // The stored report is untouched by the debug copy
    let pending = h.pending_reports().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].failed_send_attempts, 0);
    assert_eq!(h.manager.metrics().get("debug_send.event_level.sent"), 1);

    h.clock.advance(Duration::hours(1));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { is_debug: false, .. }
    ));
    assert_eq!(h.sender.sends(true).len(), 1);
    assert_eq!(h.sender.sends(false).len(), 1);
}

// =====================================================
// Assembly
// =====================================================

#[tokio::test]
async fn test_assembly_without_service_fails_permanently() {
    let mut h = TestHarness::with(debug_mode_options()).await;
    h.manager.handle_source(event_source(1), CONTEXT);
    h.manager.handle_trigger(aggregatable_trigger(10), CONTEXT);

    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent {
            report_type: ReportType::AggregatableAttribution,
            result: SendResult::AssemblyFailure { transient: false },
            ..
        }
    ));
    assert!(h.sender.sends(false).is_empty());
    assert!(h.pending_reports().await.is_empty());
    assert_eq!(
        h.manager
            .metrics()
            .get("assembly_failure.aggregatable_attribution"),
        1
    );
}

#[tokio::test]
async fn test_transient_assembly_failure_is_rescheduled() {
    let mut h = TestHarness::with(HarnessOptions {
        aggregation_service: Some(Arc::new(FailingAggregationService)),
        ..debug_mode_options()
    })
    .await;
    h.manager.handle_source(event_source(1), CONTEXT);
    h.manager.handle_trigger(aggregatable_trigger(10), CONTEXT);

    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent {
            failed_send_attempts: 1,
            result: SendResult::AssemblyFailure { transient: true },
            ..
        }
    ));
    let pending = h.pending_reports().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].report_time, start_time() + Duration::minutes(5));
    assert!(h.sender.sends(false).is_empty());
}

#[tokio::test]
async fn test_aggregatable_report_assembled_before_sending() {
    let mut h = TestHarness::with(HarnessOptions {
        aggregation_service: Some(Arc::new(ClearTextAggregationService)),
        ..debug_mode_options()
    })
    .await;
    h.manager.handle_source(event_source(1), CONTEXT);
    h.manager.handle_trigger(aggregatable_trigger(10), CONTEXT);

    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent {
            report_type: ReportType::AggregatableAttribution,
            result,
            ..
        } if result.is_success()
    ));
    let sent = h.sender.sends(false);
    let assembled = sent[0].assembled_report().expect("assembled payload");
    assert_eq!(assembled.payloads[0]["payload"]["data"][0]["value"], 10);
}

#[tokio::test]
async fn test_unmatched_trigger_sends_null_report() {
    let mut h = TestHarness::with(HarnessOptions {
        aggregation_service: Some(Arc::new(ClearTextAggregationService)),
        ..debug_mode_options()
    })
    .await;
    h.manager.handle_trigger(aggregatable_trigger(10), CONTEXT);

    assert!(matches!(
        h.next_event().await,
        Observed::TriggerHandled {
            aggregatable: AggregatableResult::NoMatchingImpressions,
            ..
        }
    ));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent {
            report_type: ReportType::NullAggregatable,
            result,
            ..
        } if result.is_success()
    ));
    assert!(h.sender.sends(false)[0].assembled_report().is_some());
}

// =====================================================
// Debug side channels
// =====================================================

#[tokio::test]
async fn test_verbose_source_debug_report() {
    let mut h = TestHarness::with(HarnessOptions {
        cookie_origins: vec![REPORTER],
        ..Default::default()
    })
    .await;
    let mut source = event_source(1);
    source.registration.debug_key = Some(11);
    source.registration.debug_reporting = true;

    h.manager.handle_source(source, CONTEXT);
    assert!(matches!(h.next_event().await, Observed::SourceHandled { .. }));
    assert_eq!(
        h.next_event().await,
        Observed::DebugReportSent {
            data_types: vec![DebugDataType::SourceSuccess],
            http_status: Some(200),
        }
    );

    let verbose = h.sender.verbose.lock()[0].clone();
    assert_eq!(verbose.reporting_origin, origin(REPORTER));
    assert_eq!(verbose.data[0].body["source_event_id"], "1");
    assert_eq!(verbose.data[0].body["source_debug_key"], "11");
    assert_eq!(verbose.data[0].body["attribution_destination"], "https://shop.test");
    assert_eq!(h.manager.metrics().get("verbose_debug_report.sent"), 1);
}

#[tokio::test]
async fn test_verbose_trigger_debug_report_for_unmatched_trigger() {
    let mut h = TestHarness::with(HarnessOptions {
        cookie_origins: vec![REPORTER],
        ..Default::default()
    })
    .await;
    let mut trigger = event_trigger();
    trigger.registration.debug_reporting = true;

    h.manager.handle_trigger(trigger, CONTEXT);
    assert!(matches!(
        h.next_event().await,
        Observed::TriggerHandled {
            event_level: EventLevelResult::NoMatchingImpressions,
            aggregatable: AggregatableResult::NotRegistered,
            ..
        }
    ));
    assert_eq!(
        h.next_event().await,
        Observed::DebugReportSent {
            data_types: vec![DebugDataType::TriggerNoMatchingSource],
            http_status: Some(200),
        }
    );
}

#[tokio::test]
async fn test_aggregatable_source_debug_report_charges_budget() {
    let mut h = TestHarness::with(HarnessOptions {
        aggregation_service: Some(Arc::new(ClearTextAggregationService)),
        ..Default::default()
    })
    .await;
    let debug_config = |value| AggregatableDebugReportingConfig {
        budget: 100,
        key_piece: KeyPiece(0x1),
        debug_data: vec![AggregatableDebugData {
            types: vec![DebugDataType::SourceSuccess],
            key_piece: KeyPiece(0x2),
            value,
        }],
        aggregation_coordinator_origin: None,
    };

    let mut source = event_source(1);
    source.registration.aggregatable_debug_reporting = Some(debug_config(5));
    h.manager.handle_source(source, CONTEXT);
    assert_eq!(
        h.next_matching(|e| matches!(e, Observed::AggregatableDebugReportSent { .. }))
            .await,
        Observed::AggregatableDebugReportSent {
            status: AggregatableDebugBudgetStatus::Success,
            http_status: Some(200),
        }
    );
    let sent = h.sender.aggregatable_debug.lock()[0].clone();
    assert_eq!(
        sent.contributions,
        vec![AggregatableContribution {
            key: KeyPiece(0x3),
            value: 5,
        }]
    );
    assert_eq!(sent.context_site, origin("https://news.test"));
    let stored = h.manager.get_active_sources_for_web_ui().await;
    assert_eq!(stored[0].remaining_aggregatable_debug_budget, 95);

    // Over the source's own budget: processed, never sent
    let mut greedy = event_source(2);
    greedy.registration.aggregatable_debug_reporting = Some(debug_config(200));
    h.manager.handle_source(greedy, CONTEXT);
    assert_eq!(
        h.next_matching(|e| matches!(e, Observed::AggregatableDebugReportSent { .. }))
            .await,
        Observed::AggregatableDebugReportSent {
            status: AggregatableDebugBudgetStatus::InsufficientBudget,
            http_status: None,
        }
    );
    assert_eq!(h.sender.aggregatable_debug.lock().len(), 1);
}

#[tokio::test]
async fn test_aggregatable_trigger_debug_report_for_unmatched_trigger() {
    let mut h = TestHarness::with(HarnessOptions {
        aggregation_service: Some(Arc::new(ClearTextAggregationService)),
        ..Default::default()
    })
    .await;
    let mut trigger = event_trigger();
    trigger.registration.aggregation_coordinator_origin = Some(origin("https://coordinator.test"));
    trigger.registration.aggregatable_debug_reporting = Some(AggregatableDebugReportingConfig {
        budget: 0,
        key_piece: KeyPiece(0x1),
        debug_data: vec![AggregatableDebugData {
            types: vec![DebugDataType::TriggerNoMatchingSource],
            key_piece: KeyPiece(0x2),
            value: 7,
        }],
        aggregation_coordinator_origin: None,
    });

    h.manager.handle_trigger(trigger, CONTEXT);
    assert_eq!(
        h.next_matching(|e| matches!(e, Observed::AggregatableDebugReportSent { .. }))
            .await,
        Observed::AggregatableDebugReportSent {
            status: AggregatableDebugBudgetStatus::Success,
            http_status: Some(200),
        }
    );
    let sent = h.sender.aggregatable_debug.lock()[0].clone();
    assert_eq!(
        sent.contributions,
        vec![AggregatableContribution {
            key: KeyPiece(0x3),
            value: 7,
        }]
    );
    assert_eq!(sent.context_site, origin("https://shop.test"));
    // Falls back to the trigger's own coordinator
    assert_eq!(
        sent.aggregation_coordinator_origin,
        Some(origin("https://coordinator.test"))
    );
}

#[tokio::test]
async fn test_aggregatable_trigger_debug_report_charges_matched_source() {
    let mut h = TestHarness::with(HarnessOptions {
        aggregation_service: Some(Arc::new(ClearTextAggregationService)),
        ..Default::default()
    })
    .await;
    // The source registers no debug reporting, so it has no debug budget
    h.manager.handle_source(event_source(1), CONTEXT);
    h.next_matching(|e| matches!(e, Observed::SourceHandled { .. }))
        .await;

    let mut trigger = event_trigger();
    trigger.registration.event_triggers.clear();
    trigger
        .registration
        .aggregatable_values
        .insert("unknown".to_string(), 5);
    trigger.registration.aggregatable_debug_reporting = Some(AggregatableDebugReportingConfig {
        budget: 0,
        key_piece: KeyPiece(0x1),
        debug_data: vec![AggregatableDebugData {
            types: vec![DebugDataType::TriggerAggregateNoContributions],
            key_piece: KeyPiece(0x2),
            value: 7,
        }],
        aggregation_coordinator_origin: None,
    });

    h.manager.handle_trigger(trigger, CONTEXT);
    assert!(matches!(
        h.next_matching(|e| matches!(e, Observed::TriggerHandled { .. }))
            .await,
        Observed::TriggerHandled {
            aggregatable: AggregatableResult::NoHistograms,
            ..
        }
    ));
    assert_eq!(
        h.next_matching(|e| matches!(e, Observed::AggregatableDebugReportSent { .. }))
            .await,
        Observed::AggregatableDebugReportSent {
            status: AggregatableDebugBudgetStatus::InsufficientBudget,
            http_status: None,
        }
    );
    assert!(h.sender.aggregatable_debug.lock().is_empty());
}

// =====================================================
// OS registrations
// =====================================================

#[tokio::test]
async fn test_os_registration_items_filtered_then_registered() {
    let mut h = TestHarness::with(HarnessOptions {
        blocked_origins: vec!["https://blocked.test"],
        ..Default::default()
    })
    .await;
    let registration = os_registration(&[
        "https://a.test/register",
        "http://insecure.test/register",
        "https://blocked.test/register",
        "https://reject.test/register",
    ]);
    assert!(h.manager.handle_os_registration(registration));

    let mut results = Vec::new();
    for _ in 0..4 {
        match h.next_event().await {
            Observed::OsRegistration { url, result, .. } => results.push((url, result)),
            other => panic!("unexpected notification {:?}", other),
        }
    }
    assert_eq!(
        results,
        vec![
            (
                "http://insecure.test/register".to_string(),
                OsRegistrationResult::InvalidRegistrationUrl
            ),
            (
                "https://blocked.test/register".to_string(),
                OsRegistrationResult::ProhibitedByBrowserPolicy
            ),
            (
                "https://a.test/register".to_string(),
                OsRegistrationResult::PassedToOs
            ),
            (
                "https://reject.test/register".to_string(),
                OsRegistrationResult::RejectedByOs
            ),
        ]
    );

    // One OS call carrying only the admitted items
    let registered = h.os.registrations.lock().clone();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].items.len(), 2);
}

#[tokio::test]
async fn test_full_os_queue_rejects_every_item() {
    let mut h = TestHarness::with(HarnessOptions {
        config: EngineConfig {
            max_pending_os_registrations: 1,
            ..Default::default()
        },
        gate_os: true,
        ..Default::default()
    })
    .await;

    assert!(h
        .manager
        .handle_os_registration(os_registration(&["https://a.test/1"])));
    assert!(!h.manager.handle_os_registration(os_registration(&[
        "https://a.test/2",
        "https://a.test/3",
    ])));
    for url in ["https://a.test/2", "https://a.test/3"] {
        assert_eq!(
            h.next_event().await,
            Observed::OsRegistration {
                url: url.to_string(),
                result: OsRegistrationResult::ExcessiveQueueSize,
                debug_allowed: false,
            }
        );
    }
    assert_eq!(h.manager.metrics().get(crate::telemetry::OS_QUEUE_OVERFLOW), 1);

    h.os_gate.add_permits(1);
    assert_eq!(
        h.next_event().await,
        Observed::OsRegistration {
            url: "https://a.test/1".to_string(),
            result: OsRegistrationResult::PassedToOs,
            debug_allowed: false,
        }
    );
}

// =====================================================
// Data management, modes and connectivity
// =====================================================

#[tokio::test]
async fn test_clear_data_reaches_storage_and_os() {
    let mut h = TestHarness::new().await;
    h.store_event_report().await;
    let sources_changed = h.observer.sources_changed.load(Ordering::SeqCst);
    let reports_changed = h.observer.reports_changed.load(Ordering::SeqCst);

    h.manager
        .clear_data(None, None, DataFilter::All, true)
        .await;

    assert!(h.manager.get_active_sources_for_web_ui().await.is_empty());
    assert!(h.pending_reports().await.is_empty());
    assert!(h.manager.get_all_data_keys().await.is_empty());
    assert_eq!(h.os.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.observer.sources_changed.load(Ordering::SeqCst),
        sources_changed + 1
    );
    assert_eq!(
        h.observer.reports_changed.load(Ordering::SeqCst),
        reports_changed + 1
    );
}

#[tokio::test]
async fn test_remove_data_by_key() {
    let mut h = TestHarness::new().await;
    h.store_event_report().await;

    let keys = h.manager.get_all_data_keys().await;
    assert_eq!(
        keys,
        vec![AttributionDataKey {
            reporting_origin: origin(REPORTER),
        }]
    );
    h.manager
        .remove_attribution_data_by_data_key(keys[0].clone())
        .await;
    assert!(h.manager.get_all_data_keys().await.is_empty());
    assert!(h.pending_reports().await.is_empty());
}

#[tokio::test]
async fn test_debug_mode_toggle_updates_delegate() {
    let mut h = TestHarness::new().await;
    assert!(!h.manager.debug_mode());

    h.manager.set_debug_mode(Some(true)).await;
    assert_eq!(h.next_event().await, Observed::DebugModeChanged(true));
    assert!(h.manager.debug_mode());
    let delegate = h.resolver.delegate();
    assert!(delegate.debug_mode);
    assert_eq!(delegate.offline_report_delay, None);

    h.manager.set_debug_mode(None).await;
    assert_eq!(h.next_event().await, Observed::DebugModeChanged(false));
    assert!(!h.manager.debug_mode());
    assert_eq!(
        h.resolver.delegate().offline_report_delay,
        Some((Duration::zero(), Duration::seconds(60)))
    );
}

#[tokio::test]
async fn test_offline_holds_reports_until_back_online() {
    let mut h = TestHarness::new().await;
    h.store_event_report().await;

    h.manager.on_connection_changed(false).await;
    assert!(!h.manager.is_online());
    assert_eq!(h.manager.next_report_time(), None);

    h.clock.advance(Duration::hours(2));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(h.sender.sends(false).is_empty());
    assert_eq!(h.pending_reports().await.len(), 1);

    // Overdue reports are pushed into the next minute
    h.manager.on_connection_changed(true).await;
    let now = h.clock.now();
    let next = h.manager.next_report_time().expect("re-armed");
    assert!(next >= now && next <= now + Duration::seconds(60));

    h.clock.advance(Duration::minutes(1));
    assert!(matches!(
        h.next_report_sent().await,
        Observed::ReportSent { result, .. } if result.is_success()
    ));
}

#[tokio::test]
async fn test_restarted_engine_sends_overdue_reports() {
    let mut h = TestHarness::new().await;
    let report = h.store_event_report().await;

    // Take the first engine out of the picture, then let the report fall due
    h.manager.on_connection_changed(false).await;
    h.clock.advance(Duration::hours(3));

    let collab = Collaborators {
        resolver: h.resolver.clone(),
        cookie_checker: Arc::new(FakeCookieChecker {
            origins: HashSet::new(),
            gate: None,
        }),
        report_sender: h.sender.clone(),
        os_level_manager: h.os.clone(),
        aggregation_service: None,
        policy: h.policy.clone(),
        clock: h.clock.clone(),
    };
    let restarted = AttributionManager::start(EngineConfig::default(), collab).await;
    let (observer, mut events) = RecordingObserver::new();
    restarted.add_observer(observer);

    let sent = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(Observed::ReportSent { id, result, .. }) => return (id, result),
                Some(_) => continue,
                None => panic!("observer channel closed"),
            }
        }
    })
    .await
    .expect("overdue report should be sent after restart");
    assert_eq!(sent, (report.id, SendResult::sent(200)));
    assert!(h.pending_reports().await.is_empty());
}

#[tokio::test]
async fn test_reporting_paused_flushes_pending_aggregatable_timings() {
    let mut h = TestHarness::new().await;
    h.manager.handle_source(event_source(1), CONTEXT);
    h.manager.handle_trigger(aggregatable_trigger(10), CONTEXT);
    h.next_matching(|e| matches!(e, Observed::TriggerHandled { .. }))
        .await;
    assert_eq!(h.manager.inner.pending_timings.lock().len(), 1);

    h.manager.on_reporting_paused();
    assert_eq!(
        h.manager
            .metrics()
            .get("pending_aggregatable_reports.paused"),
        1
    );
    assert!(h.manager.inner.pending_timings.lock().is_empty());

    h.manager.on_reporting_paused();
    assert_eq!(
        h.manager
            .metrics()
            .get("pending_aggregatable_reports.paused"),
        1
    );
}

#[tokio::test]
async fn test_timing_not_tracked_for_report_already_being_sent() {
    let h = TestHarness::new().await;
    let now = h.clock.now();
    let timing = PendingReportTiming {
        creation_time: now,
        report_time: now,
    };

    h.manager.inner.reports_being_sent.lock().insert(ReportId(7));
    assert!(!h.manager.track_pending_timing(ReportId(7), timing));
    assert!(h.manager.inner.pending_timings.lock().is_empty());

    assert!(h.manager.track_pending_timing(ReportId(8), timing));
    assert_eq!(h.manager.inner.pending_timings.lock().len(), 1);
}

#[tokio::test]
async fn test_deleting_sent_report_rearms_for_next_report() {
    let mut h = TestHarness::new().await;
    let first = h.store_event_report().await;
    h.manager.handle_source(event_source(2), CONTEXT);
    h.next_matching(|e| matches!(e, Observed::SourceHandled { .. }))
        .await;
    h.manager.handle_trigger(event_trigger(), CONTEXT);
    h.next_matching(|e| matches!(e, Observed::TriggerHandled { .. }))
        .await;
    let pending = h.pending_reports().await;
    assert_eq!(pending.len(), 2);
    let second = pending
        .into_iter()
        .find(|report| report.id != first.id)
        .expect("second report");

    // Leave the timer idle, as after it has fired
    h.manager.inner.scheduler.set_offline(true);
    h.manager.inner.scheduler.set_offline(false);
    assert_eq!(h.manager.next_report_time(), None);

    assert_eq!(
        h.manager.send_report_for_web_ui(first.id).await,
        Some(SendResult::sent(200))
    );
    assert_eq!(h.manager.next_report_time(), Some(second.report_time));
}

#[tokio::test]
async fn test_going_offline_flushes_pending_aggregatable_timings() {
    let mut h = TestHarness::new().await;
    h.manager.handle_source(event_source(1), CONTEXT);
    h.manager.handle_trigger(aggregatable_trigger(10), CONTEXT);
    h.next_matching(|e| matches!(e, Observed::TriggerHandled { .. }))
        .await;

    h.manager.on_connection_changed(false).await;
    h.manager.on_connection_changed(false).await;
    assert_eq!(
        h.manager
            .metrics()
            .get("pending_aggregatable_reports.offline"),
        1
    );
}

#[tokio::test]
async fn test_user_visible_tasks_raise_priority() {
    let h = TestHarness::new().await;
    assert_eq!(h.resolver.priority(), TaskPriority::BestEffort);

    let first = h.manager.user_visible_task();
    let second = h.manager.user_visible_task();
    assert_eq!(h.resolver.priority(), TaskPriority::UserVisible);
    drop(first);
    assert_eq!(h.resolver.priority(), TaskPriority::UserVisible);
    drop(second);
    assert_eq!(h.resolver.priority(), TaskPriority::BestEffort);

    h.manager.get_active_sources_for_web_ui().await;
    assert_eq!(h.resolver.priority(), TaskPriority::BestEffort);
}

#[tokio::test]
async fn test_removed_observer_stops_receiving() {
    let mut h = TestHarness::new().await;
    let (other, mut other_events) = RecordingObserver::new();
    let id = h.manager.add_observer(other);
    assert!(h.manager.remove_observer(&id));
    assert!(!h.manager.remove_observer(&id));

    h.manager.set_debug_mode(Some(true)).await;
    assert_eq!(h.next_event().await, Observed::DebugModeChanged(true));
    assert!(other_events.try_recv().is_err());
    assert_eq!(h.manager.os_support(), OsSupport::Enabled);
}
