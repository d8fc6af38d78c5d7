use super::bodies;
use crate::collaborators::ReportSender;
use async_trait::async_trait;
use attribution_types::{
    AggregatableDebugReport, AssembledReport, AttributionReport, SendResult, SentOutcome,
    VerboseDebugReport,
};
use serde_json::Value;
use std::time::Duration;

/// POSTs report bodies to the reporting origin's well-known endpoints.
pub struct HttpReportSender {
    client: reqwest::Client,
}

impl HttpReportSender {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post(&self, url: &str, body: &Value) -> Result<u16, reqwest::Error> {
        let response = self.client.post(url).json(body).send().await?;
        Ok(response.status().as_u16())
    }
}

/// 2xx is delivered, 5xx is worth retrying, anything else is final.
pub fn outcome_for_status(status: u16) -> SentOutcome {
    match status {
        200..=299 => SentOutcome::Sent,
        500..=599 => SentOutcome::TransientFailure,
        _ => SentOutcome::Failure,
    }
}

fn outcome_for_error(err: &reqwest::Error) -> SentOutcome {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SentOutcome::TransientFailure
    } else {
        SentOutcome::Failure
    }
}

#[async_trait]
impl ReportSender for HttpReportSender {
    async fn send_report(&self, report: &AttributionReport, is_debug_report: bool) -> SendResult {
        let Some(body) = bodies::report_body(report) else {
            log::warn!(
                "[REPORT_SENDER] Report {} reached the sender unassembled",
                report.id
            );
            return SendResult::AssemblyFailure { transient: false };
        };
        let url = bodies::report_url(report, is_debug_report);

        match self.post(&url, &body).await {
            Ok(status) => {
                log::debug!("[REPORT_SENDER] {} -> HTTP {}", url, status);
                SendResult::Sent {
                    outcome: outcome_for_status(status),
                    http_status: Some(status),
                }
            }
            Err(e) => {
                log::debug!("[REPORT_SENDER] {} failed: {}", url, e);
                SendResult::Sent {
                    outcome: outcome_for_error(&e),
                    http_status: None,
                }
            }
        }
    }

    async fn send_verbose_debug_report(&self, report: &VerboseDebugReport) -> Option<u16> {
        let url = bodies::verbose_debug_url(report);
        match self.post(&url, &bodies::verbose_debug_body(report)).await {
            Ok(status) => Some(status),
            Err(e) => {
                log::debug!("[REPORT_SENDER] Verbose debug report to {} failed: {}", url, e);
                None
            }
        }
    }

    async fn send_aggregatable_debug_report(
        &self,
        report: &AggregatableDebugReport,
        assembled: &AssembledReport,
    ) -> Option<u16> {
        let url = bodies::aggregatable_debug_url(report);
        let body = bodies::aggregatable_debug_body(report, assembled);
        match self.post(&url, &body).await {
            Ok(status) => Some(status),
            Err(e) => {
                log::debug!(
                    "[REPORT_SENDER] Aggregatable debug report to {} failed: {}",
                    url,
                    e
                );
                None
            }
        }
    }
}
