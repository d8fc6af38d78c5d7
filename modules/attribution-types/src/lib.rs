//! Shared types for the attribution engine and its RPC clients.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;
use uuid::Uuid;

// =====================================================
// Origins & Identifiers
// =====================================================

/// A potentially trustworthy tuple origin (`https://…`, or `http://localhost`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SuitableOrigin(String);

impl SuitableOrigin {
    pub fn parse(input: &str) -> Option<Self> {
        let url = Url::parse(input).ok()?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        let origin = url.origin();
        if !origin.is_tuple() {
            return None;
        }
        let trustworthy = match url.scheme() {
            "https" => true,
            "http" => matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]")),
            _ => false,
        };
        if !trustworthy {
            return None;
        }
        Some(Self(origin.ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds an absolute URL string for `path` on this origin.
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.0, path)
    }
}

impl fmt::Display for SuitableOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SuitableOrigin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SuitableOrigin::parse(&raw)
            .ok_or_else(|| D::Error::custom(format!("not a suitable origin: {}", raw)))
    }
}

/// Identifies the frame/page context an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

/// Storage identity of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub i64);

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage identity of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredSourceId(pub i64);

/// A 128-bit aggregation key piece, serialized as a `0x`-prefixed hex string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPiece(pub u128);

impl KeyPiece {
    pub fn parse(input: &str) -> Option<Self> {
        let hex = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))?;
        u128::from_str_radix(hex, 16).ok().map(KeyPiece)
    }
}

impl std::ops::BitOr for KeyPiece {
    type Output = KeyPiece;

    fn bitor(self, rhs: KeyPiece) -> KeyPiece {
        KeyPiece(self.0 | rhs.0)
    }
}

impl fmt::Display for KeyPiece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for KeyPiece {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyPiece {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        KeyPiece::parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid key piece: {}", raw)))
    }
}

// =====================================================
// Debug Reporting Types
// =====================================================

/// Verbose and aggregatable debug data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugDataType {
    SourceSuccess,
    SourceNoised,
    SourceStorageLimit,
    SourceDestinationLimit,
    SourceReportingOriginLimit,
    SourceUnknownError,
    TriggerNoMatchingSource,
    TriggerEventDeduplicated,
    TriggerEventExcessiveReports,
    TriggerEventReportWindowPassed,
    TriggerEventNoMatchingConfigurations,
    TriggerAggregateDeduplicated,
    TriggerAggregateInsufficientBudget,
    TriggerAggregateNoContributions,
    TriggerAggregateReportWindowPassed,
    TriggerReportingOriginLimit,
    TriggerUnknownError,
    OsSourceDelegated,
    OsTriggerDelegated,
}

impl DebugDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugDataType::SourceSuccess => "source-success",
            DebugDataType::SourceNoised => "source-noised",
            DebugDataType::SourceStorageLimit => "source-storage-limit",
            DebugDataType::SourceDestinationLimit => "source-destination-limit",
            DebugDataType::SourceReportingOriginLimit => "source-reporting-origin-limit",
            DebugDataType::SourceUnknownError => "source-unknown-error",
            DebugDataType::TriggerNoMatchingSource => "trigger-no-matching-source",
            DebugDataType::TriggerEventDeduplicated => "trigger-event-deduplicated",
            DebugDataType::TriggerEventExcessiveReports => "trigger-event-excessive-reports",
            DebugDataType::TriggerEventReportWindowPassed => "trigger-event-report-window-passed",
            DebugDataType::TriggerEventNoMatchingConfigurations => {
                "trigger-event-no-matching-configurations"
            }
            DebugDataType::TriggerAggregateDeduplicated => "trigger-aggregate-deduplicated",
            DebugDataType::TriggerAggregateInsufficientBudget => {
                "trigger-aggregate-insufficient-budget"
            }
            DebugDataType::TriggerAggregateNoContributions => "trigger-aggregate-no-contributions",
            DebugDataType::TriggerAggregateReportWindowPassed => {
                "trigger-aggregate-report-window-passed"
            }
            DebugDataType::TriggerReportingOriginLimit => "trigger-reporting-origin-limit",
            DebugDataType::TriggerUnknownError => "trigger-unknown-error",
            DebugDataType::OsSourceDelegated => "os-source-delegated",
            DebugDataType::OsTriggerDelegated => "os-trigger-delegated",
        }
    }
}

/// One entry of an aggregatable debug reporting config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatableDebugData {
    pub types: Vec<DebugDataType>,
    pub key_piece: KeyPiece,
    pub value: u32,
}

/// `aggregatable_debug_reporting` registration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatableDebugReportingConfig {
    /// Only meaningful on sources; the debug budget the source starts with.
    #[serde(default)]
    pub budget: u32,
    pub key_piece: KeyPiece,
    #[serde(default)]
    pub debug_data: Vec<AggregatableDebugData>,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
}

// =====================================================
// Sources
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Navigation,
    Event,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Navigation => "navigation",
            SourceType::Event => "event",
        }
    }
}

/// Parsed `Attribution-Reporting-Register-Source` data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistration {
    pub source_event_id: u64,
    pub destinations: Vec<SuitableOrigin>,
    pub expiry_secs: i64,
    pub event_report_window_secs: Option<i64>,
    pub aggregatable_report_window_secs: Option<i64>,
    #[serde(default)]
    pub priority: i64,
    pub debug_key: Option<u64>,
    #[serde(default)]
    pub debug_reporting: bool,
    #[serde(default)]
    pub aggregation_keys: BTreeMap<String, KeyPiece>,
    pub aggregatable_debug_reporting: Option<AggregatableDebugReportingConfig>,
}

/// A source registration on its way to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorableSource {
    pub reporting_origin: SuitableOrigin,
    pub source_origin: SuitableOrigin,
    pub source_type: SourceType,
    pub registration: SourceRegistration,
    #[serde(default)]
    pub is_within_fenced_frame: bool,
    /// Set during admission, before the source reaches storage.
    #[serde(default)]
    pub debug_cookie_set: bool,
}

/// A source as persisted by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSource {
    pub source_id: StoredSourceId,
    pub reporting_origin: SuitableOrigin,
    pub source_origin: SuitableOrigin,
    pub source_type: SourceType,
    pub registration: SourceRegistration,
    pub source_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub event_report_window_time: DateTime<Utc>,
    pub aggregatable_report_window_time: DateTime<Utc>,
    pub debug_cookie_set: bool,
    pub num_event_reports: u32,
    pub remaining_aggregatable_budget: i64,
    pub remaining_aggregatable_debug_budget: i64,
    pub dedup_keys: Vec<u64>,
    pub aggregatable_dedup_keys: Vec<u64>,
}

impl StoredSource {
    pub fn debug_key(&self) -> Option<u64> {
        self.registration.debug_key
    }
}

// =====================================================
// Triggers
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTriggerData {
    pub data: u64,
    #[serde(default)]
    pub priority: i64,
    pub dedup_key: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatableTriggerData {
    pub key_piece: KeyPiece,
    pub source_keys: Vec<String>,
}

/// Parsed `Attribution-Reporting-Register-Trigger` data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistration {
    #[serde(default)]
    pub event_triggers: Vec<EventTriggerData>,
    #[serde(default)]
    pub aggregatable_trigger_data: Vec<AggregatableTriggerData>,
    #[serde(default)]
    pub aggregatable_values: BTreeMap<String, u32>,
    pub aggregatable_dedup_key: Option<u64>,
    pub debug_key: Option<u64>,
    #[serde(default)]
    pub debug_reporting: bool,
    pub aggregatable_debug_reporting: Option<AggregatableDebugReportingConfig>,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionTrigger {
    pub reporting_origin: SuitableOrigin,
    pub destination_origin: SuitableOrigin,
    pub registration: TriggerRegistration,
    #[serde(default)]
    pub is_within_fenced_frame: bool,
}

/// A source or trigger waiting for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOrTrigger {
    Source(StorableSource),
    Trigger(AttributionTrigger),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub event: SourceOrTrigger,
    pub context_id: ContextId,
}

// =====================================================
// Reports
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    EventLevel,
    AggregatableAttribution,
    NullAggregatable,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::EventLevel => "event_level",
            ReportType::AggregatableAttribution => "aggregatable_attribution",
            ReportType::NullAggregatable => "null_aggregatable",
        }
    }
}

/// Trigger-side information shared by every report variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionInfo {
    pub time: DateTime<Utc>,
    pub debug_key: Option<u64>,
    pub context_origin: SuitableOrigin,
}

/// The attributed source, as captured on a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSource {
    pub source_id: StoredSourceId,
    pub source_event_id: u64,
    pub source_origin: SuitableOrigin,
    pub destinations: Vec<SuitableOrigin>,
    pub source_type: SourceType,
    pub source_time: DateTime<Utc>,
    pub debug_key: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLevelData {
    pub trigger_data: u64,
    pub priority: i64,
    pub source: ReportSource,
    #[serde(default)]
    pub randomized_response_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatableContribution {
    pub key: KeyPiece,
    pub value: u32,
}

/// The aggregation service's output, attached to a report before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledReport {
    pub shared_info: String,
    pub payloads: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatableAttributionData {
    pub source: ReportSource,
    pub contributions: Vec<AggregatableContribution>,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
    pub assembled_report: Option<AssembledReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullAggregatableData {
    pub fake_source_time: DateTime<Utc>,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
    pub assembled_report: Option<AssembledReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportData {
    EventLevel(EventLevelData),
    AggregatableAttribution(AggregatableAttributionData),
    NullAggregatable(NullAggregatableData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub id: ReportId,
    pub external_report_id: Uuid,
    pub reporting_origin: SuitableOrigin,
    pub report_time: DateTime<Utc>,
    pub initial_report_time: DateTime<Utc>,
    pub failed_send_attempts: u32,
    pub attribution_info: AttributionInfo,
    pub data: ReportData,
}

impl AttributionReport {
    pub fn report_type(&self) -> ReportType {
        match &self.data {
            ReportData::EventLevel(_) => ReportType::EventLevel,
            ReportData::AggregatableAttribution(_) => ReportType::AggregatableAttribution,
            ReportData::NullAggregatable(_) => ReportType::NullAggregatable,
        }
    }

    pub fn source_debug_key(&self) -> Option<u64> {
        match &self.data {
            ReportData::EventLevel(data) => data.source.debug_key,
            ReportData::AggregatableAttribution(data) => data.source.debug_key,
            ReportData::NullAggregatable(_) => None,
        }
    }

    /// Source origin of the attributed source; null reports have none.
    pub fn source_origin(&self) -> Option<&SuitableOrigin> {
        match &self.data {
            ReportData::EventLevel(data) => Some(&data.source.source_origin),
            ReportData::AggregatableAttribution(data) => Some(&data.source.source_origin),
            ReportData::NullAggregatable(_) => None,
        }
    }

    pub fn aggregation_coordinator_origin(&self) -> Option<&SuitableOrigin> {
        match &self.data {
            ReportData::EventLevel(_) => None,
            ReportData::AggregatableAttribution(data) => data.aggregation_coordinator_origin.as_ref(),
            ReportData::NullAggregatable(data) => data.aggregation_coordinator_origin.as_ref(),
        }
    }

    pub fn assembled_report(&self) -> Option<&AssembledReport> {
        match &self.data {
            ReportData::EventLevel(_) => None,
            ReportData::AggregatableAttribution(data) => data.assembled_report.as_ref(),
            ReportData::NullAggregatable(data) => data.assembled_report.as_ref(),
        }
    }

    /// Attaches an assembled payload. Event-level reports are left untouched.
    pub fn set_assembled_report(&mut self, assembled: AssembledReport) {
        match &mut self.data {
            ReportData::EventLevel(_) => {}
            ReportData::AggregatableAttribution(data) => data.assembled_report = Some(assembled),
            ReportData::NullAggregatable(data) => data.assembled_report = Some(assembled),
        }
    }
}

// =====================================================
// Storage Results
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSourceStatus {
    Success,
    SuccessNoised,
    InternalError,
    InsufficientSourceCapacity,
    InsufficientUniqueDestinationCapacity,
    ExcessiveReportingOrigins,
    ProhibitedByBrowserPolicy,
}

impl StoreSourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreSourceStatus::Success => "success",
            StoreSourceStatus::SuccessNoised => "success_noised",
            StoreSourceStatus::InternalError => "internal_error",
            StoreSourceStatus::InsufficientSourceCapacity => "insufficient_source_capacity",
            StoreSourceStatus::InsufficientUniqueDestinationCapacity => {
                "insufficient_unique_destination_capacity"
            }
            StoreSourceStatus::ExcessiveReportingOrigins => "excessive_reporting_origins",
            StoreSourceStatus::ProhibitedByBrowserPolicy => "prohibited_by_browser_policy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSourceResult {
    pub source: StorableSource,
    pub status: StoreSourceStatus,
    pub source_id: Option<StoredSourceId>,
    pub source_time: DateTime<Utc>,
    pub min_fake_report_time: Option<DateTime<Utc>>,
    /// The limit that was hit, for statuses caused by a limit.
    pub limit: Option<i64>,
}

impl StoreSourceResult {
    /// Terminal result for a source the policy refused to admit.
    pub fn prohibited(source: StorableSource, now: DateTime<Utc>) -> Self {
        Self {
            source,
            status: StoreSourceStatus::ProhibitedByBrowserPolicy,
            source_id: None,
            source_time: now,
            min_fake_report_time: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevelResult {
    Success,
    InternalError,
    NoMatchingImpressions,
    Deduplicated,
    ExcessiveReports,
    ExcessiveReportingOrigins,
    NoMatchingConfigurations,
    ReportWindowPassed,
    NotRegistered,
    ProhibitedByBrowserPolicy,
}

impl EventLevelResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevelResult::Success => "success",
            EventLevelResult::InternalError => "internal_error",
            EventLevelResult::NoMatchingImpressions => "no_matching_impressions",
            EventLevelResult::Deduplicated => "deduplicated",
            EventLevelResult::ExcessiveReports => "excessive_reports",
            EventLevelResult::ExcessiveReportingOrigins => "excessive_reporting_origins",
            EventLevelResult::NoMatchingConfigurations => "no_matching_configurations",
            EventLevelResult::ReportWindowPassed => "report_window_passed",
            EventLevelResult::NotRegistered => "not_registered",
            EventLevelResult::ProhibitedByBrowserPolicy => "prohibited_by_browser_policy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatableResult {
    Success,
    InternalError,
    NoMatchingImpressions,
    Deduplicated,
    InsufficientBudget,
    NoHistograms,
    ExcessiveReportingOrigins,
    ReportWindowPassed,
    NotRegistered,
    ProhibitedByBrowserPolicy,
}

impl AggregatableResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregatableResult::Success => "success",
            AggregatableResult::InternalError => "internal_error",
            AggregatableResult::NoMatchingImpressions => "no_matching_impressions",
            AggregatableResult::Deduplicated => "deduplicated",
            AggregatableResult::InsufficientBudget => "insufficient_budget",
            AggregatableResult::NoHistograms => "no_histograms",
            AggregatableResult::ExcessiveReportingOrigins => "excessive_reporting_origins",
            AggregatableResult::ReportWindowPassed => "report_window_passed",
            AggregatableResult::NotRegistered => "not_registered",
            AggregatableResult::ProhibitedByBrowserPolicy => "prohibited_by_browser_policy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReportResult {
    pub trigger: AttributionTrigger,
    pub trigger_time: DateTime<Utc>,
    pub event_level_status: EventLevelResult,
    pub aggregatable_status: AggregatableResult,
    pub source: Option<StoredSource>,
    pub new_event_level_report: Option<AttributionReport>,
    pub new_aggregatable_report: Option<AttributionReport>,
    pub min_null_aggregatable_report_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl CreateReportResult {
    /// Terminal result for a trigger the policy refused to admit.
    pub fn prohibited(trigger: AttributionTrigger, now: DateTime<Utc>) -> Self {
        Self {
            trigger,
            trigger_time: now,
            event_level_status: EventLevelResult::ProhibitedByBrowserPolicy,
            aggregatable_status: AggregatableResult::ProhibitedByBrowserPolicy,
            source: None,
            new_event_level_report: None,
            new_aggregatable_report: None,
            min_null_aggregatable_report_time: None,
            limit: None,
        }
    }
}

// =====================================================
// Sending
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentOutcome {
    Sent,
    TransientFailure,
    Failure,
}

/// Outcome of trying to deliver a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendResult {
    Sent {
        outcome: SentOutcome,
        http_status: Option<u16>,
    },
    /// The report was not allowed to be sent at send time.
    Dropped,
    AssemblyFailure {
        transient: bool,
    },
}

impl SendResult {
    pub fn sent(http_status: u16) -> Self {
        SendResult::Sent {
            outcome: SentOutcome::Sent,
            http_status: Some(http_status),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SendResult::Sent {
                outcome: SentOutcome::Sent,
                ..
            }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SendResult::Sent {
                outcome: SentOutcome::TransientFailure,
                ..
            } | SendResult::AssemblyFailure { transient: true }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendResult::Sent { outcome, .. } => match outcome {
                SentOutcome::Sent => "sent",
                SentOutcome::TransientFailure => "transient_failure",
                SentOutcome::Failure => "failure",
            },
            SendResult::Dropped => "dropped",
            SendResult::AssemblyFailure { transient: true } => "transient_assembly_failure",
            SendResult::AssemblyFailure { transient: false } => "assembly_failure",
        }
    }
}

// =====================================================
// OS Registrations
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsRegistrationType {
    Source,
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsRegistrationItem {
    pub url: String,
    #[serde(default)]
    pub debug_reporting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsRegistration {
    pub top_level_origin: SuitableOrigin,
    pub registration_type: OsRegistrationType,
    pub items: Vec<OsRegistrationItem>,
    pub context_id: Option<ContextId>,
    #[serde(default)]
    pub is_within_fenced_frame: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsRegistrationResult {
    PassedToOs,
    InvalidRegistrationUrl,
    ProhibitedByBrowserPolicy,
    ExcessiveQueueSize,
    RejectedByOs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsSupport {
    Disabled,
    Enabled,
}

// =====================================================
// Debug Reports
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerboseDebugData {
    #[serde(rename = "type")]
    pub data_type: DebugDataType,
    pub body: serde_json::Value,
}

/// A verbose debug report; fire and forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerboseDebugReport {
    pub reporting_origin: SuitableOrigin,
    pub data: Vec<VerboseDebugData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatableDebugReport {
    pub external_report_id: Uuid,
    pub reporting_origin: SuitableOrigin,
    pub context_site: SuitableOrigin,
    pub scheduled_report_time: DateTime<Utc>,
    pub contributions: Vec<AggregatableContribution>,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
}

impl AggregatableDebugReport {
    pub fn total_value(&self) -> i64 {
        self.contributions.iter().map(|c| c.value as i64).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatableDebugBudgetStatus {
    Success,
    InsufficientBudget,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessAggregatableDebugReportResult {
    pub report: AggregatableDebugReport,
    pub status: AggregatableDebugBudgetStatus,
}

// =====================================================
// Data Management
// =====================================================

/// Key identifying all data stored for one reporting origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributionDataKey {
    pub reporting_origin: SuitableOrigin,
}

/// Which origins a clear-data request applies to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "origins", rename_all = "snake_case")]
pub enum DataFilter {
    #[default]
    All,
    Origins(Vec<SuitableOrigin>),
}

impl DataFilter {
    pub fn matches(&self, origin: &SuitableOrigin) -> bool {
        match self {
            DataFilter::All => true,
            DataFilter::Origins(origins) => origins.contains(origin),
        }
    }
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterSourceRequest {
    pub source: StorableSource,
    pub context_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterTriggerRequest {
    pub trigger: AttributionTrigger,
    pub context_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterOsRequest {
    pub registration: OsRegistration,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PendingReportsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendReportRequest {
    pub report_id: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClearDataRequest {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filter: DataFilter,
    #[serde(default)]
    pub delete_rate_limit_data: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DebugModeRequest {
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveDataKeyRequest {
    pub reporting_origin: SuitableOrigin,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub debug_mode: bool,
    pub online: bool,
    pub os_support: OsSupport,
    pub next_report_time: Option<DateTime<Utc>>,
    pub reports_being_sent: usize,
    pub counters: BTreeMap<String, u64>,
}
