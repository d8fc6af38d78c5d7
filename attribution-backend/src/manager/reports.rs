//! Report dispatch: pulling due reports, assembly, sending and completion.

use super::AttributionManager;
use crate::collaborators::AggregatableReportRequest;
use crate::error::AssemblyError;
use crate::policy::{AttributionOperation, PolicyRequest};
use attribution_types::*;
use chrono::{DateTime, Utc};

impl AttributionManager {
    /// Timer callback: hands every due report to the send path and returns
    /// the next stored report time.
    pub(super) async fn on_reporting_time_reached(
        &self,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let resolver = &self.inner.collab.resolver;
        let reports = resolver.get_attribution_reports(now, None).await;
        log::debug!("[REPORTS] {} report(s) due at {}", reports.len(), now);
        self.dispatch_reports(reports, now);
        resolver.get_next_report_time(now).await
    }

    fn dispatch_reports(&self, reports: Vec<AttributionReport>, now: DateTime<Utc>) {
        for report in reports {
            if !self.prepare_to_send(&report) {
                log::debug!("[REPORTS] Report {} is already being sent", report.id);
                continue;
            }
            let manager = self.clone();
            tokio::spawn(async move {
                manager.send_and_complete(report, now).await;
            });
        }
    }

    /// Sends one stored report now, regardless of its report time. `None`
    /// when the report does not exist or is already being sent.
    pub async fn send_report_for_web_ui(&self, id: ReportId) -> Option<SendResult> {
        let Some(mut report) = self.inner.collab.resolver.get_report(id).await else {
            log::debug!("[REPORTS] Report {} not found for manual send", id);
            return None;
        };
        let now = self.now();
        report.report_time = now;
        if !self.prepare_to_send(&report) {
            log::debug!("[REPORTS] Report {} is already being sent", id);
            return None;
        }
        Some(self.send_and_complete(report, now).await)
    }

    /// Claims the report for sending. False if it is already in flight.
    fn prepare_to_send(&self, report: &AttributionReport) -> bool {
        let mut being_sent = self.inner.reports_being_sent.lock();
        if !being_sent.insert(report.id) {
            return false;
        }
        self.inner.pending_timings.lock().remove(report.id);
        true
    }

    pub(super) fn is_report_allowed(&self, report: &AttributionReport) -> bool {
        self.inner
            .collab
            .policy
            .is_operation_allowed(&PolicyRequest {
                operation: AttributionOperation::Report,
                context_id: None,
                source_origin: report.source_origin(),
                destination_origin: Some(&report.attribution_info.context_origin),
                reporting_origin: &report.reporting_origin,
            })
            .allowed
    }

    async fn send_and_complete(&self, mut report: AttributionReport, now: DateTime<Utc>) -> SendResult {
        let result = if self.is_report_allowed(&report) {
            log::debug!(
                "[REPORTS] Sending {} report {} ({}s after its report time)",
                report.report_type().as_str(),
                report.id,
                (now - report.report_time).num_seconds()
            );
            self.assemble_and_send(&mut report, false).await
        } else {
            log::debug!("[REPORTS] Report {} dropped by policy", report.id);
            SendResult::Dropped
        };
        self.on_report_sent(report, result).await;
        result
    }

    /// Sends event-level reports as they are; aggregatable and null reports
    /// are assembled first and never reach the network if that fails.
    pub(super) async fn assemble_and_send(
        &self,
        report: &mut AttributionReport,
        is_debug_report: bool,
    ) -> SendResult {
        if report.report_type() != ReportType::EventLevel {
            match self.assemble(report).await {
                Ok(assembled) => report.set_assembled_report(assembled),
                Err(e) => {
                    log::warn!(
                        "[REPORTS] Assembly of report {} failed: {}",
                        report.id,
                        e
                    );
                    self.inner.metrics.incr(&format!(
                        "assembly_failure.{}",
                        report.report_type().as_str()
                    ));
                    return SendResult::AssemblyFailure {
                        transient: e.is_transient(),
                    };
                }
            }
        }
        self.inner
            .collab
            .report_sender
            .send_report(report, is_debug_report)
            .await
    }

    async fn assemble(&self, report: &AttributionReport) -> Result<AssembledReport, AssemblyError> {
        let Some(service) = &self.inner.collab.aggregation_service else {
            return Err(AssemblyError::ServiceUnavailable);
        };
        let request = AggregatableReportRequest::from_report(report)?;
        service.assemble_report(request).await
    }

    // =====================================================
    // Completion
    // =====================================================

    /// Settles a send in storage (reschedule or delete), then releases the
    /// id and tells observers.
    async fn on_report_sent(&self, mut report: AttributionReport, result: SendResult) {
        let report_type = report.report_type();
        let metrics = &self.inner.metrics;
        metrics.record_send(report_type, false, &result);

        let retry_time = if result.is_success() {
            metrics.record_retries_until_success(report_type, report.failed_send_attempts);
            None
        } else if result.is_transient() {
            match self
                .inner
                .config
                .retry
                .delay_for(report.failed_send_attempts + 1)
            {
                Some(delay) => Some(self.now() + delay),
                None => {
                    log::warn!(
                        "[REPORTS] Report {} failed {} times, giving up",
                        report.id,
                        report.failed_send_attempts + 1
                    );
                    metrics.record_final_failure(report_type);
                    None
                }
            }
        } else {
            None
        };

        let resolver = &self.inner.collab.resolver;
        match retry_time {
            Some(next) => {
                if resolver.update_report_for_send_failure(report.id, next).await {
                    report.failed_send_attempts += 1;
                    report.report_time = next;
                    log::debug!(
                        "[REPORTS] Report {} rescheduled for {} ({})",
                        report.id,
                        next,
                        result.label()
                    );
                    self.inner.scheduler.maybe_set(Some(next));
                }
            }
            None => {
                if !resolver.delete_report(report.id).await {
                    log::debug!("[REPORTS] Report {} was already gone", report.id);
                }
                let next = resolver.get_next_report_time(self.now()).await;
                self.inner.scheduler.maybe_set(next);
            }
        }

        self.inner.reports_being_sent.lock().remove(&report.id);
        self.inner
            .observers
            .notify(|o| o.on_report_sent(&report, false, &result));
        self.notify_reports_changed();
    }
}
