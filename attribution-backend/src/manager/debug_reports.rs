//! Debug side channels. Nothing here touches report storage; results only
//! reach telemetry and observers.

use super::AttributionManager;
use crate::collaborators::AggregatableReportRequest;
use crate::network::bodies::destination_value;
use crate::policy::{AttributionOperation, PolicyRequest};
use attribution_types::*;
use serde_json::{Map, Value, json};
use uuid::Uuid;

fn source_data_type(status: StoreSourceStatus) -> Option<DebugDataType> {
    match status {
        StoreSourceStatus::Success => Some(DebugDataType::SourceSuccess),
        StoreSourceStatus::SuccessNoised => Some(DebugDataType::SourceNoised),
        StoreSourceStatus::InternalError => Some(DebugDataType::SourceUnknownError),
        StoreSourceStatus::InsufficientSourceCapacity => Some(DebugDataType::SourceStorageLimit),
        StoreSourceStatus::InsufficientUniqueDestinationCapacity => {
            Some(DebugDataType::SourceDestinationLimit)
        }
        StoreSourceStatus::ExcessiveReportingOrigins => {
            Some(DebugDataType::SourceReportingOriginLimit)
        }
        StoreSourceStatus::ProhibitedByBrowserPolicy => None,
    }
}

fn event_level_data_type(status: EventLevelResult) -> Option<DebugDataType> {
    match status {
        EventLevelResult::Success
        | EventLevelResult::NotRegistered
        | EventLevelResult::ProhibitedByBrowserPolicy => None,
        EventLevelResult::InternalError => Some(DebugDataType::TriggerUnknownError),
        EventLevelResult::NoMatchingImpressions => Some(DebugDataType::TriggerNoMatchingSource),
        EventLevelResult::Deduplicated => Some(DebugDataType::TriggerEventDeduplicated),
        EventLevelResult::ExcessiveReports => Some(DebugDataType::TriggerEventExcessiveReports),
        EventLevelResult::ExcessiveReportingOrigins => {
            Some(DebugDataType::TriggerReportingOriginLimit)
        }
        EventLevelResult::NoMatchingConfigurations => {
            Some(DebugDataType::TriggerEventNoMatchingConfigurations)
        }
        EventLevelResult::ReportWindowPassed => Some(DebugDataType::TriggerEventReportWindowPassed),
    }
}

fn aggregatable_data_type(status: AggregatableResult) -> Option<DebugDataType> {
    match status {
        AggregatableResult::Success
        | AggregatableResult::NotRegistered
        | AggregatableResult::ProhibitedByBrowserPolicy => None,
        AggregatableResult::InternalError => Some(DebugDataType::TriggerUnknownError),
        AggregatableResult::NoMatchingImpressions => Some(DebugDataType::TriggerNoMatchingSource),
        AggregatableResult::Deduplicated => Some(DebugDataType::TriggerAggregateDeduplicated),
        AggregatableResult::InsufficientBudget => {
            Some(DebugDataType::TriggerAggregateInsufficientBudget)
        }
        AggregatableResult::NoHistograms => Some(DebugDataType::TriggerAggregateNoContributions),
        AggregatableResult::ExcessiveReportingOrigins => {
            Some(DebugDataType::TriggerReportingOriginLimit)
        }
        AggregatableResult::ReportWindowPassed => {
            Some(DebugDataType::TriggerAggregateReportWindowPassed)
        }
    }
}

/// Data types of a trigger result, event-level first, without repeats.
fn trigger_data_types(result: &CreateReportResult) -> Vec<DebugDataType> {
    let mut types = Vec::new();
    let candidates = [
        event_level_data_type(result.event_level_status),
        aggregatable_data_type(result.aggregatable_status),
    ];
    for data_type in candidates.into_iter().flatten() {
        if !types.contains(&data_type) {
            types.push(data_type);
        }
    }
    types
}

fn source_body(source: &StorableSource, limit: Option<i64>) -> Value {
    let mut body = Map::new();
    body.insert(
        "attribution_destination".into(),
        destination_value(&source.registration.destinations),
    );
    body.insert(
        "source_event_id".into(),
        json!(source.registration.source_event_id.to_string()),
    );
    body.insert("source_site".into(), json!(source.source_origin.as_str()));
    if let Some(key) = source.registration.debug_key {
        body.insert("source_debug_key".into(), json!(key.to_string()));
    }
    if let Some(limit) = limit {
        body.insert("limit".into(), json!(limit.to_string()));
    }
    Value::Object(body)
}

fn trigger_body(result: &CreateReportResult) -> Value {
    let mut body = Map::new();
    body.insert(
        "attribution_destination".into(),
        json!(result.trigger.destination_origin.as_str()),
    );
    if let Some(key) = result.trigger.registration.debug_key {
        body.insert("trigger_debug_key".into(), json!(key.to_string()));
    }
    if let Some(source) = &result.source {
        body.insert(
            "source_event_id".into(),
            json!(source.registration.source_event_id.to_string()),
        );
        body.insert("source_site".into(), json!(source.source_origin.as_str()));
        if let Some(key) = source.debug_key() {
            body.insert("source_debug_key".into(), json!(key.to_string()));
        }
    }
    if let Some(limit) = result.limit {
        body.insert("limit".into(), json!(limit.to_string()));
    }
    Value::Object(body)
}

/// Contributions of every debug data entry matching one of `types`.
fn debug_contributions(
    config: &AggregatableDebugReportingConfig,
    types: &[DebugDataType],
) -> Vec<AggregatableContribution> {
    config
        .debug_data
        .iter()
        .filter(|data| data.types.iter().any(|t| types.contains(t)))
        .map(|data| AggregatableContribution {
            key: config.key_piece | data.key_piece,
            value: data.value,
        })
        .collect()
}

impl AttributionManager {
    fn is_allowed(
        &self,
        operation: AttributionOperation,
        context_id: Option<ContextId>,
        source_origin: Option<&SuitableOrigin>,
        destination_origin: Option<&SuitableOrigin>,
        reporting_origin: &SuitableOrigin,
    ) -> bool {
        self.inner
            .collab
            .policy
            .is_operation_allowed(&PolicyRequest {
                operation,
                context_id,
                source_origin,
                destination_origin,
                reporting_origin,
            })
            .allowed
    }

    // =====================================================
    // Immediate debug copies of new reports
    // =====================================================

    /// Sends a debug copy of a freshly stored report when both the trigger
    /// and its source carried a debug key. The stored report is untouched.
    pub(super) fn maybe_send_debug_report(&self, mut report: AttributionReport) {
        if report.attribution_info.debug_key.is_none()
            || report.source_debug_key().is_none()
            || !self.is_report_allowed(&report)
        {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.assemble_and_send(&mut report, true).await;
            log::debug!(
                "[DEBUG_REPORTS] Debug copy of report {}: {}",
                report.id,
                result.label()
            );
            manager
                .inner
                .metrics
                .record_send(report.report_type(), true, &result);
            manager
                .inner
                .observers
                .notify(|o| o.on_report_sent(&report, true, &result));
        });
    }

    // =====================================================
    // Verbose debug reports
    // =====================================================

    pub(super) fn maybe_send_verbose_source_debug_report(
        &self,
        result: &StoreSourceResult,
        context_id: ContextId,
    ) {
        let source = &result.source;
        if !self.inner.config.verbose_debug_reporting
            || !source.registration.debug_reporting
            || !source.debug_cookie_set
        {
            return;
        }
        let Some(data_type) = source_data_type(result.status) else {
            return;
        };
        if !self.is_allowed(
            AttributionOperation::SourceVerboseDebugReport,
            Some(context_id),
            Some(&source.source_origin),
            None,
            &source.reporting_origin,
        ) {
            return;
        }
        self.send_verbose_debug_report(VerboseDebugReport {
            reporting_origin: source.reporting_origin.clone(),
            data: vec![VerboseDebugData {
                data_type,
                body: source_body(source, result.limit),
            }],
        });
    }

    pub(super) fn maybe_send_verbose_trigger_debug_report(
        &self,
        result: &CreateReportResult,
        debug_cookie_set: bool,
        context_id: ContextId,
    ) {
        let trigger = &result.trigger;
        if !self.inner.config.verbose_debug_reporting
            || !trigger.registration.debug_reporting
            || !debug_cookie_set
        {
            return;
        }
        let data_types = trigger_data_types(result);
        if data_types.is_empty() {
            return;
        }
        if !self.is_allowed(
            AttributionOperation::TriggerVerboseDebugReport,
            Some(context_id),
            None,
            Some(&trigger.destination_origin),
            &trigger.reporting_origin,
        ) {
            return;
        }
        let body = trigger_body(result);
        self.send_verbose_debug_report(VerboseDebugReport {
            reporting_origin: trigger.reporting_origin.clone(),
            data: data_types
                .into_iter()
                .map(|data_type| VerboseDebugData {
                    data_type,
                    body: body.clone(),
                })
                .collect(),
        });
    }

    pub(super) fn send_verbose_debug_report(&self, report: VerboseDebugReport) {
        let manager = self.clone();
        tokio::spawn(async move {
            let status = manager
                .inner
                .collab
                .report_sender
                .send_verbose_debug_report(&report)
                .await;
            log::debug!(
                "[DEBUG_REPORTS] Verbose debug report to {}: {:?}",
                report.reporting_origin,
                status
            );
            manager.inner.metrics.incr(if status.is_some() {
                "verbose_debug_report.sent"
            } else {
                "verbose_debug_report.network_error"
            });
            let now = manager.now();
            manager
                .inner
                .observers
                .notify(|o| o.on_debug_report_sent(&report, status, now));
        });
    }

    // =====================================================
    // Aggregatable debug reports
    // =====================================================

    pub(super) fn maybe_send_aggregatable_source_debug_report(
        &self,
        result: &StoreSourceResult,
        context_id: ContextId,
    ) {
        let source = &result.source;
        if !self.inner.config.aggregatable_debug_reporting {
            return;
        }
        let Some(config) = &source.registration.aggregatable_debug_reporting else {
            return;
        };
        let Some(data_type) = source_data_type(result.status) else {
            return;
        };
        if !self.is_allowed(
            AttributionOperation::SourceAggregatableDebugReport,
            Some(context_id),
            Some(&source.source_origin),
            None,
            &source.reporting_origin,
        ) {
            return;
        }
        let contributions = debug_contributions(config, &[data_type]);
        if contributions.is_empty() {
            return;
        }
        let report = AggregatableDebugReport {
            external_report_id: Uuid::new_v4(),
            reporting_origin: source.reporting_origin.clone(),
            context_site: source.source_origin.clone(),
            scheduled_report_time: self.now(),
            contributions,
            aggregation_coordinator_origin: config.aggregation_coordinator_origin.clone(),
        };
        self.process_aggregatable_debug_report(report, Some(config.budget as i64), result.source_id);
    }

    pub(super) fn maybe_send_aggregatable_trigger_debug_report(
        &self,
        result: &CreateReportResult,
        context_id: ContextId,
    ) {
        let trigger = &result.trigger;
        if !self.inner.config.aggregatable_debug_reporting {
            return;
        }
        let Some(config) = &trigger.registration.aggregatable_debug_reporting else {
            return;
        };
        if !self.is_allowed(
            AttributionOperation::TriggerAggregatableDebugReport,
            Some(context_id),
            None,
            Some(&trigger.destination_origin),
            &trigger.reporting_origin,
        ) {
            return;
        }
        let contributions = debug_contributions(config, &trigger_data_types(result));
        if contributions.is_empty() {
            return;
        }
        let report = AggregatableDebugReport {
            external_report_id: Uuid::new_v4(),
            reporting_origin: trigger.reporting_origin.clone(),
            context_site: trigger.destination_origin.clone(),
            scheduled_report_time: self.now(),
            contributions,
            aggregation_coordinator_origin: config
                .aggregation_coordinator_origin
                .clone()
                .or_else(|| trigger.registration.aggregation_coordinator_origin.clone()),
        };
        let source = result.source.as_ref();
        self.process_aggregatable_debug_report(
            report,
            source.map(|s| s.remaining_aggregatable_debug_budget),
            source.map(|s| s.source_id),
        );
    }

    /// Charges the debug budget, then assembles and sends on success.
    /// Observers hear about every attempt, sent or not.
    fn process_aggregatable_debug_report(
        &self,
        report: AggregatableDebugReport,
        remaining_budget: Option<i64>,
        source_id: Option<StoredSourceId>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let processed = manager
                .inner
                .collab
                .resolver
                .process_aggregatable_debug_report(report, remaining_budget, source_id)
                .await;
            let http_status = match processed.status {
                AggregatableDebugBudgetStatus::Success => {
                    manager.assemble_and_send_debug_report(&processed.report).await
                }
                status => {
                    log::debug!(
                        "[DEBUG_REPORTS] Aggregatable debug report for {} not sent: {:?}",
                        processed.report.reporting_origin,
                        status
                    );
                    None
                }
            };
            manager.inner.observers.notify(|o| {
                o.on_aggregatable_debug_report_sent(&processed.report, processed.status, http_status)
            });
        });
    }

    async fn assemble_and_send_debug_report(&self, report: &AggregatableDebugReport) -> Option<u16> {
        let Some(service) = &self.inner.collab.aggregation_service else {
            log::debug!("[DEBUG_REPORTS] No aggregation service, aggregatable debug report skipped");
            return None;
        };
        let assembled = match AggregatableReportRequest::from_debug_report(report) {
            Ok(request) => service.assemble_report(request).await,
            Err(e) => Err(e),
        };
        match assembled {
            Ok(assembled) => {
                self.inner
                    .collab
                    .report_sender
                    .send_aggregatable_debug_report(report, &assembled)
                    .await
            }
            Err(e) => {
                log::warn!(
                    "[DEBUG_REPORTS] Aggregatable debug report for {} not assembled: {}",
                    report.reporting_origin,
                    e
                );
                None
            }
        }
    }
}
