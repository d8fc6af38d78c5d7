//! SQLite-backed resolver.
//!
//! All storage work runs on the blocking pool, one transaction per call.
//! Failures are logged and folded into `InternalError` statuses or empty
//! answers; writes are never retried.

use super::db::{self, Db, SCOPE_ATTRIBUTION, SCOPE_SOURCE};
use super::rules;
use crate::clock::Clock;
use crate::collaborators::{Resolver, ResolverDelegate, StorageLimits, TaskPriority};
use crate::error::StorageError;
use async_trait::async_trait;
use attribution_types::*;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct SqliteResolver {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
    delegate: RwLock<ResolverDelegate>,
    priority: Mutex<TaskPriority>,
}

impl SqliteResolver {
    pub fn new(db: Arc<Db>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            delegate: RwLock::new(ResolverDelegate::default()),
            priority: Mutex::new(TaskPriority::BestEffort),
        }
    }

    pub fn priority(&self) -> TaskPriority {
        *self.priority.lock()
    }

    pub fn delegate(&self) -> ResolverDelegate {
        self.delegate.read().clone()
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.transaction(|tx| f(tx)))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

// =====================================================
// Sources
// =====================================================

struct StoreOutcome {
    status: StoreSourceStatus,
    source_id: Option<StoredSourceId>,
    limit: Option<i64>,
}

impl StoreOutcome {
    fn limited(status: StoreSourceStatus, limit: i64) -> Self {
        Self {
            status,
            source_id: None,
            limit: Some(limit),
        }
    }
}

fn store_source_tx(
    conn: &Connection,
    source: &StorableSource,
    now: DateTime<Utc>,
    limits: &StorageLimits,
) -> Result<StoreOutcome, StorageError> {
    let registration = &source.registration;

    if db::count_active_sources(conn, &source.source_origin, now)? >= limits.max_sources_per_origin {
        return Ok(StoreOutcome::limited(
            StoreSourceStatus::InsufficientSourceCapacity,
            limits.max_sources_per_origin,
        ));
    }

    let mut destinations: HashSet<String> =
        db::active_destinations(conn, &source.source_origin, &source.reporting_origin, now)?
            .into_iter()
            .collect();
    destinations.extend(registration.destinations.iter().map(|d| d.as_str().to_string()));
    if destinations.len() as i64 > limits.max_destinations_per_source_site_reporting_site {
        return Ok(StoreOutcome::limited(
            StoreSourceStatus::InsufficientUniqueDestinationCapacity,
            limits.max_destinations_per_source_site_reporting_site,
        ));
    }

    let since = now - limits.rate_limit_window;
    for destination in &registration.destinations {
        let others = db::count_other_reporting_origins(
            conn,
            SCOPE_SOURCE,
            &source.source_origin,
            destination,
            &source.reporting_origin,
            since,
        )?;
        if others >= limits.max_source_reporting_origins_per_window {
            return Ok(StoreOutcome::limited(
                StoreSourceStatus::ExcessiveReportingOrigins,
                limits.max_source_reporting_origins_per_window,
            ));
        }
    }

    let times = rules::source_times(registration, now);
    let debug_budget = registration
        .aggregatable_debug_reporting
        .as_ref()
        .map(|config| (config.budget as i64).min(limits.max_aggregatable_debug_budget))
        .unwrap_or(0);

    let stored = StoredSource {
        source_id: StoredSourceId(0),
        reporting_origin: source.reporting_origin.clone(),
        source_origin: source.source_origin.clone(),
        source_type: source.source_type,
        registration: registration.clone(),
        source_time: now,
        expiry_time: times.expiry_time,
        event_report_window_time: times.event_report_window_time,
        aggregatable_report_window_time: times.aggregatable_report_window_time,
        debug_cookie_set: source.debug_cookie_set,
        num_event_reports: 0,
        remaining_aggregatable_budget: limits.max_aggregatable_budget_per_source,
        remaining_aggregatable_debug_budget: debug_budget,
        dedup_keys: Vec::new(),
        aggregatable_dedup_keys: Vec::new(),
    };
    let source_id = db::insert_source(conn, &stored)?;
    for destination in &registration.destinations {
        db::insert_rate_limit(
            conn,
            SCOPE_SOURCE,
            &source.source_origin,
            destination,
            &source.reporting_origin,
            now,
        )?;
    }

    Ok(StoreOutcome {
        status: StoreSourceStatus::Success,
        source_id: Some(source_id),
        limit: None,
    })
}

// =====================================================
// Triggers
// =====================================================

struct AttributionOutcome {
    event_level_status: EventLevelResult,
    aggregatable_status: AggregatableResult,
    source: Option<StoredSource>,
    event_level_report: Option<AttributionReport>,
    aggregatable_report: Option<AttributionReport>,
    null_report_time: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

fn report_source(source: &StoredSource) -> ReportSource {
    ReportSource {
        source_id: source.source_id,
        source_event_id: source.registration.source_event_id,
        source_origin: source.source_origin.clone(),
        destinations: source.registration.destinations.clone(),
        source_type: source.source_type,
        source_time: source.source_time,
        debug_key: source.debug_key(),
    }
}

fn new_report(
    trigger: &AttributionTrigger,
    now: DateTime<Utc>,
    report_time: DateTime<Utc>,
    data: ReportData,
) -> AttributionReport {
    AttributionReport {
        id: ReportId(0),
        external_report_id: Uuid::new_v4(),
        reporting_origin: trigger.reporting_origin.clone(),
        report_time,
        initial_report_time: report_time,
        failed_send_attempts: 0,
        attribution_info: AttributionInfo {
            time: now,
            debug_key: trigger.registration.debug_key,
            context_origin: trigger.destination_origin.clone(),
        },
        data,
    }
}

fn aggregatable_report_time(now: DateTime<Utc>, delegate: &ResolverDelegate) -> DateTime<Utc> {
    if delegate.debug_mode {
        return now;
    }
    let limits = &delegate.limits;
    let span = limits.aggregatable_report_delay_span.num_seconds().max(0);
    let jitter = rand::thread_rng().gen_range(0..=span);
    now + limits.min_aggregatable_report_delay + Duration::seconds(jitter)
}

fn event_level_report(
    source: &mut StoredSource,
    trigger: &AttributionTrigger,
    now: DateTime<Utc>,
    delegate: &ResolverDelegate,
) -> Result<AttributionReport, (EventLevelResult, Option<i64>)> {
    let Some(event_trigger) = trigger.registration.event_triggers.first() else {
        return Err((EventLevelResult::NotRegistered, None));
    };
    if now > source.event_report_window_time {
        return Err((EventLevelResult::ReportWindowPassed, None));
    }
    if event_trigger
        .dedup_key
        .is_some_and(|key| source.dedup_keys.contains(&key))
    {
        return Err((EventLevelResult::Deduplicated, None));
    }
    let max_reports = rules::max_event_level_reports(source.source_type);
    if source.num_event_reports >= max_reports {
        return Err((EventLevelResult::ExcessiveReports, Some(max_reports as i64)));
    }

    let report_time = if delegate.debug_mode {
        now
    } else {
        rules::event_level_report_time(source, now)
    };
    source.num_event_reports += 1;
    if let Some(key) = event_trigger.dedup_key {
        source.dedup_keys.push(key);
    }

    Ok(new_report(
        trigger,
        now,
        report_time,
        ReportData::EventLevel(EventLevelData {
            trigger_data: event_trigger.data % rules::trigger_data_cardinality(source.source_type),
            priority: event_trigger.priority,
            source: report_source(source),
            randomized_response_rate: 0.0,
        }),
    ))
}

fn aggregatable_report(
    source: &mut StoredSource,
    trigger: &AttributionTrigger,
    now: DateTime<Utc>,
    delegate: &ResolverDelegate,
) -> Result<AttributionReport, (AggregatableResult, Option<i64>)> {
    let registration = &trigger.registration;
    if now > source.aggregatable_report_window_time {
        return Err((AggregatableResult::ReportWindowPassed, None));
    }
    if registration
        .aggregatable_dedup_key
        .is_some_and(|key| source.aggregatable_dedup_keys.contains(&key))
    {
        return Err((AggregatableResult::Deduplicated, None));
    }
    let contributions =
        rules::aggregatable_contributions(&source.registration.aggregation_keys, registration);
    if contributions.is_empty() {
        return Err((AggregatableResult::NoHistograms, None));
    }
    let total = rules::total_value(&contributions);
    if total > source.remaining_aggregatable_budget {
        return Err((
            AggregatableResult::InsufficientBudget,
            Some(delegate.limits.max_aggregatable_budget_per_source),
        ));
    }

    source.remaining_aggregatable_budget -= total;
    if let Some(key) = registration.aggregatable_dedup_key {
        source.aggregatable_dedup_keys.push(key);
    }

    Ok(new_report(
        trigger,
        now,
        aggregatable_report_time(now, delegate),
        ReportData::AggregatableAttribution(AggregatableAttributionData {
            source: report_source(source),
            contributions,
            aggregation_coordinator_origin: registration.aggregation_coordinator_origin.clone(),
            assembled_report: None,
        }),
    ))
}

fn create_report_tx(
    conn: &Connection,
    trigger: &AttributionTrigger,
    now: DateTime<Utc>,
    delegate: &ResolverDelegate,
) -> Result<AttributionOutcome, StorageError> {
    let registration = &trigger.registration;
    let has_event_level = !registration.event_triggers.is_empty();
    let has_aggregatable = !registration.aggregatable_values.is_empty()
        || !registration.aggregatable_trigger_data.is_empty();

    let mut outcome = AttributionOutcome {
        event_level_status: if has_event_level {
            EventLevelResult::NoMatchingImpressions
        } else {
            EventLevelResult::NotRegistered
        },
        aggregatable_status: if has_aggregatable {
            AggregatableResult::NoMatchingImpressions
        } else {
            AggregatableResult::NotRegistered
        },
        source: None,
        event_level_report: None,
        aggregatable_report: None,
        null_report_time: None,
        limit: None,
    };

    let matched = db::matching_sources(
        conn,
        &trigger.destination_origin,
        &trigger.reporting_origin,
        now,
    )?
    .into_iter()
    .next();

    let Some(mut source) = matched else {
        if !registration.aggregatable_values.is_empty() {
            let report_time = aggregatable_report_time(now, delegate);
            let report = new_report(
                trigger,
                now,
                report_time,
                ReportData::NullAggregatable(NullAggregatableData {
                    fake_source_time: now,
                    aggregation_coordinator_origin: registration
                        .aggregation_coordinator_origin
                        .clone(),
                    assembled_report: None,
                }),
            );
            db::insert_report(conn, &report)?;
            outcome.null_report_time = Some(report_time);
        }
        return Ok(outcome);
    };

    let limits = &delegate.limits;
    let others = db::count_other_reporting_origins(
        conn,
        SCOPE_ATTRIBUTION,
        &source.source_origin,
        &trigger.destination_origin,
        &trigger.reporting_origin,
        now - limits.rate_limit_window,
    )?;
    if others >= limits.max_attribution_reporting_origins_per_window {
        if has_event_level {
            outcome.event_level_status = EventLevelResult::ExcessiveReportingOrigins;
        }
        if has_aggregatable {
            outcome.aggregatable_status = AggregatableResult::ExcessiveReportingOrigins;
        }
        outcome.limit = Some(limits.max_attribution_reporting_origins_per_window);
        outcome.source = Some(source);
        return Ok(outcome);
    }

    if has_event_level {
        match event_level_report(&mut source, trigger, now, delegate) {
            Ok(mut report) => {
                report.id = db::insert_report(conn, &report)?;
                outcome.event_level_status = EventLevelResult::Success;
                outcome.event_level_report = Some(report);
            }
            Err((status, limit)) => {
                outcome.event_level_status = status;
                outcome.limit = outcome.limit.or(limit);
            }
        }
    }

    if has_aggregatable {
        match aggregatable_report(&mut source, trigger, now, delegate) {
            Ok(mut report) => {
                report.id = db::insert_report(conn, &report)?;
                outcome.aggregatable_status = AggregatableResult::Success;
                outcome.aggregatable_report = Some(report);
            }
            Err((status, limit)) => {
                outcome.aggregatable_status = status;
                outcome.limit = outcome.limit.or(limit);
            }
        }
    }

    if outcome.event_level_report.is_some() || outcome.aggregatable_report.is_some() {
        db::update_source_attribution_state(conn, &source)?;
        db::insert_rate_limit(
            conn,
            SCOPE_ATTRIBUTION,
            &source.source_origin,
            &trigger.destination_origin,
            &trigger.reporting_origin,
            now,
        )?;
    }
    outcome.source = Some(source);
    Ok(outcome)
}

// =====================================================
// Data Management
// =====================================================

fn in_range(ms: i64, begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    begin.is_none_or(|b| ms >= db::to_millis(b)) && end.is_none_or(|e| ms <= db::to_millis(e))
}

fn filter_matches(filter: &DataFilter, raw: &str) -> bool {
    SuitableOrigin::parse(raw).is_some_and(|origin| filter.matches(&origin))
}

fn clear_data_tx(
    conn: &Connection,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    filter: &DataFilter,
    delete_rate_limit_data: bool,
) -> Result<(usize, usize), StorageError> {
    let mut sources = 0;
    for (id, reporting_origin, source_origin, source_time) in db::source_index(conn)? {
        if in_range(source_time, begin, end)
            && (filter_matches(filter, &reporting_origin) || filter_matches(filter, &source_origin))
        {
            db::delete_source(conn, id)?;
            sources += 1;
        }
    }

    let mut reports = 0;
    for (id, reporting_origin, trigger_time, info_json) in db::report_index(conn)? {
        let info: AttributionInfo = serde_json::from_str(&info_json)?;
        if in_range(trigger_time, begin, end)
            && (filter_matches(filter, &reporting_origin) || filter.matches(&info.context_origin))
            && db::delete_report(conn, ReportId(id))?
        {
            reports += 1;
        }
    }

    if delete_rate_limit_data {
        for (id, reporting_origin, source_origin, destination, time) in db::rate_limit_index(conn)? {
            if in_range(time, begin, end)
                && (filter_matches(filter, &reporting_origin)
                    || filter_matches(filter, &source_origin)
                    || filter_matches(filter, &destination))
            {
                db::delete_rate_limit(conn, id)?;
            }
        }
    }
    Ok((sources, reports))
}

fn process_debug_budget_tx(
    conn: &Connection,
    total: i64,
    remaining_budget: Option<i64>,
    source_id: Option<StoredSourceId>,
    max_budget: i64,
) -> Result<AggregatableDebugBudgetStatus, StorageError> {
    if total > max_budget {
        return Ok(AggregatableDebugBudgetStatus::InsufficientBudget);
    }
    match source_id {
        Some(id) => {
            let Some(budget) = db::source_debug_budget(conn, id)? else {
                return Ok(AggregatableDebugBudgetStatus::InsufficientBudget);
            };
            if total > budget {
                return Ok(AggregatableDebugBudgetStatus::InsufficientBudget);
            }
            db::set_source_debug_budget(conn, id, budget - total)?;
            Ok(AggregatableDebugBudgetStatus::Success)
        }
        None if remaining_budget.is_some_and(|budget| total > budget) => {
            Ok(AggregatableDebugBudgetStatus::InsufficientBudget)
        }
        None => Ok(AggregatableDebugBudgetStatus::Success),
    }
}

#[async_trait]
impl Resolver for SqliteResolver {
    async fn store_source(&self, source: StorableSource) -> StoreSourceResult {
        let now = self.clock.now();
        let limits = self.delegate.read().limits.clone();
        let input = source.clone();
        let outcome = self
            .run(move |conn| store_source_tx(conn, &input, now, &limits))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to store source: {}", e);
                StoreOutcome {
                    status: StoreSourceStatus::InternalError,
                    source_id: None,
                    limit: None,
                }
            });
        log::debug!(
            "[RESOLVER] Source {} from {}: {}",
            source.registration.source_event_id,
            source.reporting_origin,
            outcome.status.as_str()
        );
        StoreSourceResult {
            source,
            status: outcome.status,
            source_id: outcome.source_id,
            source_time: now,
            min_fake_report_time: None,
            limit: outcome.limit,
        }
    }

    async fn maybe_create_and_store_report(
        &self,
        trigger: AttributionTrigger,
    ) -> CreateReportResult {
        let now = self.clock.now();
        let delegate = self.delegate();
        let input = trigger.clone();
        match self
            .run(move |conn| create_report_tx(conn, &input, now, &delegate))
            .await
        {
            Ok(outcome) => CreateReportResult {
                trigger,
                trigger_time: now,
                event_level_status: outcome.event_level_status,
                aggregatable_status: outcome.aggregatable_status,
                source: outcome.source,
                new_event_level_report: outcome.event_level_report,
                new_aggregatable_report: outcome.aggregatable_report,
                min_null_aggregatable_report_time: outcome.null_report_time,
                limit: outcome.limit,
            },
            Err(e) => {
                log::error!("[RESOLVER] Failed to attribute trigger: {}", e);
                CreateReportResult {
                    trigger,
                    trigger_time: now,
                    event_level_status: EventLevelResult::InternalError,
                    aggregatable_status: AggregatableResult::InternalError,
                    source: None,
                    new_event_level_report: None,
                    new_aggregatable_report: None,
                    min_null_aggregatable_report_time: None,
                    limit: None,
                }
            }
        }
    }

    async fn get_attribution_reports(
        &self,
        max_report_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Vec<AttributionReport> {
        self.run(move |conn| db::reports_due(conn, max_report_time, limit))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to load reports: {}", e);
                Vec::new()
            })
    }

    async fn get_report(&self, id: ReportId) -> Option<AttributionReport> {
        self.run(move |conn| db::report_by_id(conn, id))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to load report {}: {}", id, e);
                None
            })
    }

    async fn update_report_for_send_failure(
        &self,
        id: ReportId,
        new_report_time: DateTime<Utc>,
    ) -> bool {
        self.run(move |conn| db::update_report_for_send_failure(conn, id, new_report_time))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to reschedule report {}: {}", id, e);
                false
            })
    }

    async fn delete_report(&self, id: ReportId) -> bool {
        self.run(move |conn| db::delete_report(conn, id))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to delete report {}: {}", id, e);
                false
            })
    }

    async fn get_next_report_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.run(move |conn| db::next_report_time(conn, after))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to read next report time: {}", e);
                None
            })
    }

    async fn adjust_offline_report_times(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let delay = self.delegate.read().offline_report_delay;
        self.run(move |conn| {
            if let Some((min, max)) = delay {
                let mut rng = rand::thread_rng();
                let (min_ms, max_ms) = (min.num_milliseconds(), max.num_milliseconds().max(min.num_milliseconds()));
                for id in db::overdue_report_ids(conn, now)? {
                    let offset = Duration::milliseconds(rng.gen_range(min_ms..=max_ms));
                    db::set_report_time(conn, id, now + offset)?;
                }
            }
            db::min_report_time(conn)
        })
        .await
        .unwrap_or_else(|e| {
            log::error!("[RESOLVER] Failed to adjust offline report times: {}", e);
            None
        })
    }

    async fn get_active_sources(&self, limit: Option<usize>) -> Vec<StoredSource> {
        let now = self.clock.now();
        self.run(move |conn| db::active_sources(conn, now, limit))
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to load active sources: {}", e);
                Vec::new()
            })
    }

    async fn get_all_data_keys(&self) -> Vec<AttributionDataKey> {
        let origins = self
            .run(db::reporting_origins)
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to load data keys: {}", e);
                Vec::new()
            });
        origins
            .iter()
            .filter_map(|raw| SuitableOrigin::parse(raw))
            .map(|reporting_origin| AttributionDataKey { reporting_origin })
            .collect()
    }

    async fn clear_data(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        filter: DataFilter,
        delete_rate_limit_data: bool,
    ) {
        match self
            .run(move |conn| clear_data_tx(conn, begin, end, &filter, delete_rate_limit_data))
            .await
        {
            Ok((sources, reports)) => log::info!(
                "[RESOLVER] Cleared {} source(s) and {} report(s)",
                sources,
                reports
            ),
            Err(e) => log::error!("[RESOLVER] Failed to clear data: {}", e),
        }
    }

    async fn delete_by_data_key(&self, key: AttributionDataKey) {
        let origin = key.reporting_origin.clone();
        if let Err(e) = self
            .run(move |conn| db::delete_by_reporting_origin(conn, &origin))
            .await
        {
            log::error!(
                "[RESOLVER] Failed to delete data for {}: {}",
                key.reporting_origin,
                e
            );
        }
    }

    async fn process_aggregatable_debug_report(
        &self,
        report: AggregatableDebugReport,
        remaining_budget: Option<i64>,
        source_id: Option<StoredSourceId>,
    ) -> ProcessAggregatableDebugReportResult {
        let total = report.total_value();
        let max_budget = self.delegate.read().limits.max_aggregatable_debug_budget;
        let status = self
            .run(move |conn| {
                process_debug_budget_tx(conn, total, remaining_budget, source_id, max_budget)
            })
            .await
            .unwrap_or_else(|e| {
                log::error!("[RESOLVER] Failed to process aggregatable debug report: {}", e);
                AggregatableDebugBudgetStatus::InternalError
            });
        ProcessAggregatableDebugReportResult { report, status }
    }

    async fn set_delegate(&self, delegate: ResolverDelegate) {
        log::debug!("[RESOLVER] Delegate updated (debug mode: {})", delegate.debug_mode);
        *self.delegate.write() = delegate;
    }

    fn set_priority(&self, priority: TaskPriority) {
        log::debug!("[RESOLVER] Priority set to {:?}", priority);
        *self.priority.lock() = priority;
    }
}
