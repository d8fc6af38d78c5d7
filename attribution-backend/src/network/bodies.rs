//! Report URLs and JSON bodies.

use attribution_types::{
    AggregatableDebugReport, AssembledReport, AttributionReport, ReportData, SuitableOrigin,
    VerboseDebugReport,
};
use serde_json::{Map, Value, json};

const WELL_KNOWN: &str = "/.well-known/attribution-reporting";

pub fn report_url(report: &AttributionReport, is_debug_report: bool) -> String {
    let endpoint = match &report.data {
        ReportData::EventLevel(_) => "report-event-attribution",
        ReportData::AggregatableAttribution(_) | ReportData::NullAggregatable(_) => {
            "report-aggregate-attribution"
        }
    };
    let path = if is_debug_report {
        format!("{}/debug/{}", WELL_KNOWN, endpoint)
    } else {
        format!("{}/{}", WELL_KNOWN, endpoint)
    };
    report.reporting_origin.join(&path)
}

pub fn verbose_debug_url(report: &VerboseDebugReport) -> String {
    report
        .reporting_origin
        .join(&format!("{}/debug/verbose", WELL_KNOWN))
}

pub fn aggregatable_debug_url(report: &AggregatableDebugReport) -> String {
    report
        .reporting_origin
        .join(&format!("{}/debug/report-aggregate-debug", WELL_KNOWN))
}

pub(crate) fn destination_value(destinations: &[SuitableOrigin]) -> Value {
    match destinations {
        [single] => json!(single.as_str()),
        many => {
            let mut sorted: Vec<&str> = many.iter().map(|d| d.as_str()).collect();
            sorted.sort_unstable();
            json!(sorted)
        }
    }
}

fn insert_debug_keys(body: &mut Map<String, Value>, report: &AttributionReport) {
    if let Some(key) = report.source_debug_key() {
        body.insert("source_debug_key".into(), json!(key.to_string()));
    }
    if let Some(key) = report.attribution_info.debug_key {
        body.insert("trigger_debug_key".into(), json!(key.to_string()));
    }
}

fn assembled_body(
    body: &mut Map<String, Value>,
    assembled: &AssembledReport,
    coordinator: Option<&SuitableOrigin>,
) {
    body.insert("shared_info".into(), json!(assembled.shared_info));
    body.insert(
        "aggregation_service_payloads".into(),
        json!(assembled.payloads),
    );
    if let Some(coordinator) = coordinator {
        body.insert(
            "aggregation_coordinator_origin".into(),
            json!(coordinator.as_str()),
        );
    }
}

/// JSON body of a report. `None` for an aggregatable report that has not
/// been assembled.
pub fn report_body(report: &AttributionReport) -> Option<Value> {
    let mut body = Map::new();
    match &report.data {
        ReportData::EventLevel(data) => {
            body.insert(
                "attribution_destination".into(),
                destination_value(&data.source.destinations),
            );
            body.insert(
                "source_event_id".into(),
                json!(data.source.source_event_id.to_string()),
            );
            body.insert("trigger_data".into(), json!(data.trigger_data.to_string()));
            body.insert(
                "report_id".into(),
                json!(report.external_report_id.to_string()),
            );
            body.insert("source_type".into(), json!(data.source.source_type.as_str()));
            body.insert(
                "randomized_trigger_rate".into(),
                json!(data.randomized_response_rate),
            );
            body.insert(
                "scheduled_report_time".into(),
                json!(report.initial_report_time.timestamp().to_string()),
            );
        }
        ReportData::AggregatableAttribution(_) | ReportData::NullAggregatable(_) => {
            let assembled = report.assembled_report()?;
            assembled_body(&mut body, assembled, report.aggregation_coordinator_origin());
        }
    }
    insert_debug_keys(&mut body, report);
    Some(Value::Object(body))
}

pub fn verbose_debug_body(report: &VerboseDebugReport) -> Value {
    json!(report.data)
}

pub fn aggregatable_debug_body(
    report: &AggregatableDebugReport,
    assembled: &AssembledReport,
) -> Value {
    let mut body = Map::new();
    assembled_body(
        &mut body,
        assembled,
        report.aggregation_coordinator_origin.as_ref(),
    );
    Value::Object(body)
}
