//! Aggregation service that assembles unencrypted payloads.
//!
//! Only suitable for debug deployments: the histogram contributions are
//! sent in the clear instead of being encrypted for a coordinator.

use super::{AggregatableReportRequest, AggregationService};
use crate::error::AssemblyError;
use async_trait::async_trait;
use attribution_types::AssembledReport;
use serde_json::json;

pub const DEFAULT_COORDINATOR_ORIGIN: &str = "https://publickeyservice.aws.privacysandboxservices.com";

pub struct ClearTextAggregationService;

impl ClearTextAggregationService {
    fn shared_info(request: &AggregatableReportRequest) -> String {
        json!({
            "api": request.api,
            "attribution_destination": request.context_origin.as_str(),
            "debug_mode": if request.debug_mode { "enabled" } else { "disabled" },
            "report_id": request.external_report_id.to_string(),
            "reporting_origin": request.reporting_origin.as_str(),
            "scheduled_report_time": request.scheduled_report_time.timestamp().to_string(),
            "version": "0.1",
        })
        .to_string()
    }
}

#[async_trait]
impl AggregationService for ClearTextAggregationService {
    async fn assemble_report(
        &self,
        request: AggregatableReportRequest,
    ) -> Result<AssembledReport, AssemblyError> {
        let coordinator = request
            .aggregation_coordinator_origin
            .as_ref()
            .map(|o| o.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_COORDINATOR_ORIGIN.to_string());

        let data: Vec<_> = request
            .contributions
            .iter()
            .map(|c| json!({ "bucket": c.key.to_string(), "value": c.value }))
            .collect();

        Ok(AssembledReport {
            shared_info: Self::shared_info(&request),
            payloads: vec![json!({
                "aggregation_coordinator_origin": coordinator,
                "payload": { "operation": "histogram", "data": data },
                "key_id": "cleartext",
            })],
        })
    }
}
