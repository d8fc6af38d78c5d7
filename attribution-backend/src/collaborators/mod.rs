//! Interfaces of the engine's external collaborators.
//!
//! Storage, transport, cookies, OS-level registration and aggregation all
//! sit behind these traits so the engine can run against the shipped
//! implementations or scripted fakes.

pub mod aggregation;
pub mod cookies;
pub mod os_level;

use crate::error::AssemblyError;
use async_trait::async_trait;
use attribution_types::*;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub use aggregation::ClearTextAggregationService;
pub use cookies::StaticCookieChecker;
pub use os_level::UnsupportedOsLevelManager;

/// Scheduling priority of storage work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    BestEffort,
    UserVisible,
}

/// Per-origin storage limits enforced by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLimits {
    pub max_sources_per_origin: i64,
    pub max_destinations_per_source_site_reporting_site: i64,
    pub max_source_reporting_origins_per_window: i64,
    pub max_attribution_reporting_origins_per_window: i64,
    pub rate_limit_window: Duration,
    pub max_aggregatable_budget_per_source: i64,
    pub max_aggregatable_debug_budget: i64,
    pub min_aggregatable_report_delay: Duration,
    pub aggregatable_report_delay_span: Duration,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_sources_per_origin: 1024,
            max_destinations_per_source_site_reporting_site: 100,
            max_source_reporting_origins_per_window: 100,
            max_attribution_reporting_origins_per_window: 10,
            rate_limit_window: Duration::days(30),
            max_aggregatable_budget_per_source: 65536,
            max_aggregatable_debug_budget: 65536,
            min_aggregatable_report_delay: Duration::minutes(10),
            aggregatable_report_delay_span: Duration::minutes(50),
        }
    }
}

/// Behaviour the engine hands to the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverDelegate {
    /// Reports become due at trigger time.
    pub debug_mode: bool,
    /// Range for pushing out reports that became due while offline.
    pub offline_report_delay: Option<(Duration, Duration)>,
    pub limits: StorageLimits,
}

impl Default for ResolverDelegate {
    fn default() -> Self {
        Self {
            debug_mode: false,
            offline_report_delay: Some((Duration::zero(), Duration::minutes(1))),
            limits: StorageLimits::default(),
        }
    }
}

/// The durable storage/query engine.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn store_source(&self, source: StorableSource) -> StoreSourceResult;

    async fn maybe_create_and_store_report(&self, trigger: AttributionTrigger)
    -> CreateReportResult;

    /// Reports with `report_time <= max_report_time`, earliest first.
    async fn get_attribution_reports(
        &self,
        max_report_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Vec<AttributionReport>;

    async fn get_report(&self, id: ReportId) -> Option<AttributionReport>;

    /// Moves the report to `new_report_time` and bumps its failure count.
    async fn update_report_for_send_failure(
        &self,
        id: ReportId,
        new_report_time: DateTime<Utc>,
    ) -> bool;

    async fn delete_report(&self, id: ReportId) -> bool;

    /// Earliest report time strictly after `after`.
    async fn get_next_report_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Pushes out reports that became due while offline; returns the
    /// earliest report time afterwards.
    async fn adjust_offline_report_times(&self) -> Option<DateTime<Utc>>;

    async fn get_active_sources(&self, limit: Option<usize>) -> Vec<StoredSource>;

    async fn get_all_data_keys(&self) -> Vec<AttributionDataKey>;

    async fn clear_data(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        filter: DataFilter,
        delete_rate_limit_data: bool,
    );

    async fn delete_by_data_key(&self, key: AttributionDataKey);

    async fn process_aggregatable_debug_report(
        &self,
        report: AggregatableDebugReport,
        remaining_budget: Option<i64>,
        source_id: Option<StoredSourceId>,
    ) -> ProcessAggregatableDebugReportResult;

    async fn set_delegate(&self, delegate: ResolverDelegate);

    fn set_priority(&self, priority: TaskPriority);
}

#[async_trait]
pub trait CookieChecker: Send + Sync {
    async fn is_debug_cookie_set(&self, origin: &SuitableOrigin) -> bool;
}

/// Network transport for reports.
#[async_trait]
pub trait ReportSender: Send + Sync {
    async fn send_report(&self, report: &AttributionReport, is_debug_report: bool) -> SendResult;

    /// Returns the HTTP status, or `None` when no response arrived.
    async fn send_verbose_debug_report(&self, report: &VerboseDebugReport) -> Option<u16>;

    async fn send_aggregatable_debug_report(
        &self,
        report: &AggregatableDebugReport,
        assembled: &AssembledReport,
    ) -> Option<u16>;
}

/// Platform-level registration.
#[async_trait]
pub trait OsLevelManager: Send + Sync {
    /// One success flag per item, in item order.
    async fn register(&self, registration: &OsRegistration, debug_key_allowed: &[bool])
    -> Vec<bool>;

    async fn clear_data(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        filter: &DataFilter,
        delete_rate_limit_data: bool,
    );

    fn os_support(&self) -> OsSupport;
}

pub const ATTRIBUTION_API: &str = "attribution-reporting";
pub const ATTRIBUTION_DEBUG_API: &str = "attribution-reporting-debug";

/// Everything the aggregation service needs to assemble one report.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatableReportRequest {
    pub api: &'static str,
    pub external_report_id: Uuid,
    pub reporting_origin: SuitableOrigin,
    pub context_origin: SuitableOrigin,
    pub scheduled_report_time: DateTime<Utc>,
    pub contributions: Vec<AggregatableContribution>,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
    pub debug_mode: bool,
}

/// Upper bound on the summed contribution values of one report.
pub const MAX_CONTRIBUTION_TOTAL: i64 = 65536;

impl AggregatableReportRequest {
    pub fn from_report(report: &AttributionReport) -> Result<Self, AssemblyError> {
        let (contributions, coordinator, debug_mode) = match &report.data {
            ReportData::EventLevel(_) => {
                return Err(AssemblyError::InvalidRequest(
                    "event-level reports are not assembled".to_string(),
                ));
            }
            ReportData::AggregatableAttribution(data) => (
                data.contributions.clone(),
                data.aggregation_coordinator_origin.clone(),
                report.attribution_info.debug_key.is_some() && data.source.debug_key.is_some(),
            ),
            // A null report carries a single zero contribution
            ReportData::NullAggregatable(data) => (
                vec![AggregatableContribution {
                    key: KeyPiece(0),
                    value: 0,
                }],
                data.aggregation_coordinator_origin.clone(),
                false,
            ),
        };
        Self::build(
            ATTRIBUTION_API,
            report.external_report_id,
            report.reporting_origin.clone(),
            report.attribution_info.context_origin.clone(),
            report.initial_report_time,
            contributions,
            coordinator,
            debug_mode,
        )
    }

    pub fn from_debug_report(report: &AggregatableDebugReport) -> Result<Self, AssemblyError> {
        Self::build(
            ATTRIBUTION_DEBUG_API,
            report.external_report_id,
            report.reporting_origin.clone(),
            report.context_site.clone(),
            report.scheduled_report_time,
            report.contributions.clone(),
            report.aggregation_coordinator_origin.clone(),
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        api: &'static str,
        external_report_id: Uuid,
        reporting_origin: SuitableOrigin,
        context_origin: SuitableOrigin,
        scheduled_report_time: DateTime<Utc>,
        contributions: Vec<AggregatableContribution>,
        aggregation_coordinator_origin: Option<SuitableOrigin>,
        debug_mode: bool,
    ) -> Result<Self, AssemblyError> {
        if contributions.is_empty() {
            return Err(AssemblyError::InvalidRequest("no contributions".to_string()));
        }
        let total: i64 = contributions.iter().map(|c| c.value as i64).sum();
        if total > MAX_CONTRIBUTION_TOTAL {
            return Err(AssemblyError::InvalidRequest(format!(
                "contribution total {} exceeds {}",
                total, MAX_CONTRIBUTION_TOTAL
            )));
        }
        Ok(Self {
            api,
            external_report_id,
            reporting_origin,
            context_origin,
            scheduled_report_time,
            contributions,
            aggregation_coordinator_origin,
            debug_mode,
        })
    }
}

/// Turns assembly requests into assembled (possibly encrypted) payloads.
#[async_trait]
pub trait AggregationService: Send + Sync {
    async fn assemble_report(
        &self,
        request: AggregatableReportRequest,
    ) -> Result<AssembledReport, AssemblyError>;
}
