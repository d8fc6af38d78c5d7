//! The attribution engine.
//!
//! `AttributionManager` owns the two registration queues, the report
//! scheduler and the set of reports in flight. It is a cheap handle around
//! shared state; spawned pipeline tasks hold a clone while they run and the
//! timer task only holds a weak reference, so dropping the last handle stops
//! the timer.
//!
//! The pipeline stages live in submodules:
//! - `admission`: source/trigger queue, policy and cookie gating, storage
//! - `reports`: pulling due reports, assembly, sending and retries
//! - `debug_reports`: verbose and aggregatable debug side channels
//! - `os_registrations`: OS-level registration queue

mod admission;
mod debug_reports;
mod os_registrations;
mod reports;
pub mod retry;

#[cfg(test)]
mod manager_tests;

use crate::clock::Clock;
use crate::collaborators::{
    AggregationService, CookieChecker, OsLevelManager, ReportSender, Resolver, ResolverDelegate,
    StorageLimits, TaskPriority,
};
use crate::config::EngineConfig;
use crate::observers::{AttributionObserver, ObserverList};
use crate::policy::PolicyOracle;
use crate::queue::GatedQueue;
use crate::scheduler::{self, ReportScheduler};
use crate::telemetry::{AttributionMetrics, PendingReportTimings};
use attribution_types::*;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Active sources shown to the internals UI are capped at this many.
const MAX_WEB_UI_SOURCES: usize = 1000;

/// External collaborators the engine talks to.
pub struct Collaborators {
    pub resolver: Arc<dyn Resolver>,
    pub cookie_checker: Arc<dyn CookieChecker>,
    pub report_sender: Arc<dyn ReportSender>,
    pub os_level_manager: Arc<dyn OsLevelManager>,
    /// `None` makes every aggregatable report fail assembly.
    pub aggregation_service: Option<Arc<dyn AggregationService>>,
    pub policy: Arc<dyn PolicyOracle>,
    pub clock: Arc<dyn Clock>,
}

struct ManagerInner {
    config: EngineConfig,
    collab: Collaborators,
    observers: ObserverList,
    metrics: Arc<AttributionMetrics>,
    scheduler: Arc<ReportScheduler>,
    events: GatedQueue<PendingEvent>,
    os_registrations: GatedQueue<OsRegistration>,
    /// Ids handed to the send path and not yet settled in storage.
    reports_being_sent: Mutex<HashSet<ReportId>>,
    pending_timings: Mutex<PendingReportTimings>,
    debug_mode: Mutex<bool>,
    user_visible_tasks: Mutex<usize>,
    shutdown: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let flushed = self
            .pending_timings
            .get_mut()
            .flush(&self.metrics, "shutdown");
        log::debug!(
            "[ATTRIBUTION] Engine stopped ({} pending aggregatable report timing(s) flushed)",
            flushed
        );
    }
}

#[derive(Clone)]
pub struct AttributionManager {
    inner: Arc<ManagerInner>,
}

/// Raises storage priority while alive; the last one dropped restores it.
struct UserVisibleTask {
    inner: Arc<ManagerInner>,
}

impl UserVisibleTask {
    fn new(inner: &Arc<ManagerInner>) -> Self {
        let mut active = inner.user_visible_tasks.lock();
        *active += 1;
        if *active == 1 {
            inner.collab.resolver.set_priority(TaskPriority::UserVisible);
        }
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for UserVisibleTask {
    fn drop(&mut self) {
        let mut active = self.inner.user_visible_tasks.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.inner
                .collab
                .resolver
                .set_priority(TaskPriority::BestEffort);
        }
    }
}

impl AttributionManager {
    /// Builds the engine, installs the resolver delegate, starts the timer
    /// task and arms it for the earliest stored report.
    pub async fn start(config: EngineConfig, collab: Collaborators) -> Self {
        let debug_mode = config.debug_mode;
        let inner = Arc::new(ManagerInner {
            events: GatedQueue::new(config.max_pending_events),
            os_registrations: GatedQueue::new(config.max_pending_os_registrations),
            config,
            collab,
            observers: ObserverList::new(),
            metrics: Arc::new(AttributionMetrics::new()),
            scheduler: Arc::new(ReportScheduler::new()),
            reports_being_sent: Mutex::new(HashSet::new()),
            pending_timings: Mutex::new(PendingReportTimings::default()),
            debug_mode: Mutex::new(debug_mode),
            user_visible_tasks: Mutex::new(0),
            shutdown: CancellationToken::new(),
        });
        let manager = Self { inner };

        manager
            .inner
            .collab
            .resolver
            .set_delegate(manager.resolver_delegate(debug_mode))
            .await;

        let weak = Arc::downgrade(&manager.inner);
        tokio::spawn(scheduler::run_timer(
            manager.inner.scheduler.clone(),
            manager.inner.collab.clock.clone(),
            manager.inner.shutdown.clone(),
            move |now| {
                let inner = weak.upgrade()?;
                let manager = AttributionManager { inner };
                Some(async move { manager.on_reporting_time_reached(now).await })
            },
        ));

        // Reports that fell due while the engine was down fire right away
        let next = manager
            .inner
            .collab
            .resolver
            .get_next_report_time(DateTime::<Utc>::MIN_UTC)
            .await;
        manager.inner.scheduler.maybe_set(next);

        log::info!(
            "[ATTRIBUTION] Engine started (debug mode: {}, next report: {:?})",
            debug_mode,
            next
        );
        manager
    }

    fn resolver_delegate(&self, debug_mode: bool) -> ResolverDelegate {
        ResolverDelegate {
            debug_mode,
            offline_report_delay: (!debug_mode)
                .then_some((Duration::zero(), self.inner.config.offline_report_delay_max)),
            limits: StorageLimits::default(),
        }
    }

    fn user_visible_task(&self) -> UserVisibleTask {
        UserVisibleTask::new(&self.inner)
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.collab.clock.now()
    }

    // =====================================================
    // Observers
    // =====================================================

    pub fn add_observer(&self, observer: Arc<dyn AttributionObserver>) -> String {
        self.inner.observers.add(observer)
    }

    pub fn remove_observer(&self, id: &str) -> bool {
        self.inner.observers.remove(id)
    }

    fn notify_sources_changed(&self) {
        self.inner.observers.notify(|o| o.on_sources_changed());
    }

    fn notify_reports_changed(&self) {
        self.inner.observers.notify(|o| o.on_reports_changed());
    }

    // =====================================================
    // Internals UI
    // =====================================================

    pub async fn get_active_sources_for_web_ui(&self) -> Vec<StoredSource> {
        let _task = self.user_visible_task();
        self.inner
            .collab
            .resolver
            .get_active_sources(Some(MAX_WEB_UI_SOURCES))
            .await
    }

    /// Every stored report regardless of due time, earliest first.
    pub async fn get_pending_reports_for_internal_use(
        &self,
        limit: Option<usize>,
    ) -> Vec<AttributionReport> {
        let _task = self.user_visible_task();
        self.inner
            .collab
            .resolver
            .get_attribution_reports(DateTime::<Utc>::MAX_UTC, limit)
            .await
    }

    pub async fn clear_data(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        filter: DataFilter,
        delete_rate_limit_data: bool,
    ) {
        let _task = self.user_visible_task();
        log::info!(
            "[ATTRIBUTION] Clearing data between {:?} and {:?} ({:?}, rate limits: {})",
            begin,
            end,
            filter,
            delete_rate_limit_data
        );
        let collab = &self.inner.collab;
        tokio::join!(
            collab
                .resolver
                .clear_data(begin, end, filter.clone(), delete_rate_limit_data),
            collab
                .os_level_manager
                .clear_data(begin, end, &filter, delete_rate_limit_data),
        );
        self.notify_sources_changed();
        self.notify_reports_changed();
    }

    /// `None` restores the configured default.
    pub async fn set_debug_mode(&self, enabled: Option<bool>) {
        let enabled = enabled.unwrap_or(self.inner.config.debug_mode);
        *self.inner.debug_mode.lock() = enabled;
        self.inner
            .collab
            .resolver
            .set_delegate(self.resolver_delegate(enabled))
            .await;
        log::info!("[ATTRIBUTION] Debug mode {}", if enabled { "enabled" } else { "disabled" });
        self.inner
            .observers
            .notify(|o| o.on_debug_mode_changed(enabled));
    }

    pub async fn get_all_data_keys(&self) -> Vec<AttributionDataKey> {
        let _task = self.user_visible_task();
        self.inner.collab.resolver.get_all_data_keys().await
    }

    pub async fn remove_attribution_data_by_data_key(&self, key: AttributionDataKey) {
        let _task = self.user_visible_task();
        log::info!(
            "[ATTRIBUTION] Removing data for {}",
            key.reporting_origin
        );
        self.inner.collab.resolver.delete_by_data_key(key).await;
        self.notify_sources_changed();
        self.notify_reports_changed();
    }

    // =====================================================
    // Connectivity
    // =====================================================

    /// Going offline disarms the timer. Coming back online pushes out
    /// reports that became due in the meantime and re-arms for the result.
    pub async fn on_connection_changed(&self, online: bool) {
        let was_offline = self.inner.scheduler.set_offline(!online);
        if !online {
            if !was_offline {
                let flushed = self
                    .inner
                    .pending_timings
                    .lock()
                    .flush(&self.inner.metrics, "offline");
                log::info!(
                    "[SCHEDULER] Offline, {} aggregatable report(s) were pending",
                    flushed
                );
            }
            return;
        }
        if was_offline {
            let next = self
                .inner
                .collab
                .resolver
                .adjust_offline_report_times()
                .await;
            log::info!("[SCHEDULER] Back online, next report at {:?}", next);
            self.inner.scheduler.maybe_set(next);
        }
    }

    pub fn on_reporting_paused(&self) {
        let flushed = self
            .inner
            .pending_timings
            .lock()
            .flush(&self.inner.metrics, "paused");
        log::debug!(
            "[SCHEDULER] Reporting paused, {} pending timing(s) flushed",
            flushed
        );
    }

    // =====================================================
    // Status
    // =====================================================

    pub fn os_support(&self) -> OsSupport {
        self.inner.collab.os_level_manager.os_support()
    }

    pub fn debug_mode(&self) -> bool {
        *self.inner.debug_mode.lock()
    }

    pub fn is_online(&self) -> bool {
        !self.inner.scheduler.is_offline()
    }

    /// Time the report timer is armed for.
    pub fn next_report_time(&self) -> Option<DateTime<Utc>> {
        self.inner.scheduler.armed_time()
    }

    pub fn reports_being_sent_count(&self) -> usize {
        self.inner.reports_being_sent.lock().len()
    }

    pub fn pending_event_count(&self) -> usize {
        self.inner.events.len()
    }

    pub fn metrics(&self) -> Arc<AttributionMetrics> {
        self.inner.metrics.clone()
    }
}
