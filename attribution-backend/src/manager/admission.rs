//! Source/trigger pipeline: queueing, admission, storage and result handling.
//!
//! Exactly one event is between `take_next` calls at any time, so events
//! reach storage, and observers hear about them, in arrival order.

use super::AttributionManager;
use crate::policy::{AttributionOperation, PolicyRequest};
use crate::queue::Enqueue;
use crate::telemetry::{EVENT_QUEUE_OVERFLOW, PendingReportTiming};
use attribution_types::*;

/// Outcome of the admission check for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Admission {
    pub allowed: bool,
    pub debug_cookie_set: bool,
}

impl AttributionManager {
    pub fn handle_source(&self, source: StorableSource, context_id: ContextId) -> bool {
        self.enqueue_event(PendingEvent {
            event: SourceOrTrigger::Source(source),
            context_id,
        })
    }

    pub fn handle_trigger(&self, trigger: AttributionTrigger, context_id: ContextId) -> bool {
        self.enqueue_event(PendingEvent {
            event: SourceOrTrigger::Trigger(trigger),
            context_id,
        })
    }

    /// Returns false when the queue is full; the event is dropped without
    /// any observer notification.
    fn enqueue_event(&self, event: PendingEvent) -> bool {
        match self.inner.events.enqueue(event) {
            Enqueue::Rejected(_) => {
                log::warn!(
                    "[ATTRIBUTION] Event queue full ({} pending), dropping event",
                    self.inner.events.len()
                );
                self.inner.metrics.incr(EVENT_QUEUE_OVERFLOW);
                false
            }
            Enqueue::Queued => true,
            Enqueue::StartDrain => {
                let manager = self.clone();
                tokio::spawn(async move { manager.drain_events().await });
                true
            }
        }
    }

    async fn drain_events(&self) {
        while let Some(pending) = self.inner.events.take_next() {
            match pending.event {
                SourceOrTrigger::Source(source) => {
                    self.process_source(source, pending.context_id).await
                }
                SourceOrTrigger::Trigger(trigger) => {
                    self.process_trigger(trigger, pending.context_id).await
                }
            }
        }
    }

    // =====================================================
    // Admission
    // =====================================================

    /// Policy decision for the registration, plus the debug cookie check
    /// when the registration is allowed and carries debug data.
    async fn check_admission(
        &self,
        request: PolicyRequest<'_>,
        has_debug_data: bool,
    ) -> Admission {
        let allowed = self
            .inner
            .collab
            .policy
            .is_operation_allowed(&request)
            .allowed;
        let debug_cookie_set = allowed && has_debug_data && self.is_debug_cookie_set(request).await;
        Admission {
            allowed,
            debug_cookie_set,
        }
    }

    /// Checks the debug cookie under the transitional debug variant of
    /// `request.operation`. A policy bypass skips the cookie lookup.
    pub(super) async fn is_debug_cookie_set(&self, request: PolicyRequest<'_>) -> bool {
        let Some(operation) = request.operation.transitional_debug_variant() else {
            return false;
        };
        let decision = self
            .inner
            .collab
            .policy
            .is_operation_allowed(&PolicyRequest {
                operation,
                ..request
            });
        if !decision.allowed {
            return false;
        }
        if decision.can_bypass {
            return true;
        }
        self.inner
            .collab
            .cookie_checker
            .is_debug_cookie_set(request.reporting_origin)
            .await
    }

    // =====================================================
    // Sources
    // =====================================================

    async fn process_source(&self, mut source: StorableSource, context_id: ContextId) {
        let has_debug_data =
            source.registration.debug_key.is_some() || source.registration.debug_reporting;
        let admission = self
            .check_admission(
                PolicyRequest {
                    operation: AttributionOperation::Source,
                    context_id: Some(context_id),
                    source_origin: Some(&source.source_origin),
                    destination_origin: None,
                    reporting_origin: &source.reporting_origin,
                },
                has_debug_data,
            )
            .await;

        source.debug_cookie_set = admission.debug_cookie_set;
        let (result, cleared_debug_key) = if admission.allowed {
            let cleared = if admission.debug_cookie_set {
                None
            } else {
                source.registration.debug_key.take()
            };
            (self.inner.collab.resolver.store_source(source).await, cleared)
        } else {
            (StoreSourceResult::prohibited(source, self.now()), None)
        };

        self.on_source_stored(result, cleared_debug_key, context_id);
    }

    fn on_source_stored(
        &self,
        result: StoreSourceResult,
        cleared_debug_key: Option<u64>,
        context_id: ContextId,
    ) {
        self.inner.metrics.record_store_source(result.status);
        log::debug!(
            "[ATTRIBUTION] Source {} from {} stored: {}",
            result.source.registration.source_event_id,
            result.source.reporting_origin,
            result.status.as_str()
        );

        self.inner.observers.notify(|o| {
            o.on_source_handled(
                &result.source,
                result.source_time,
                cleared_debug_key,
                result.status,
            )
        });
        self.inner.scheduler.maybe_set(result.min_fake_report_time);
        self.notify_sources_changed();

        self.maybe_send_verbose_source_debug_report(&result, context_id);
        self.maybe_send_aggregatable_source_debug_report(&result, context_id);
    }

    // =====================================================
    // Triggers
    // =====================================================

    async fn process_trigger(&self, mut trigger: AttributionTrigger, context_id: ContextId) {
        let has_debug_data =
            trigger.registration.debug_key.is_some() || trigger.registration.debug_reporting;
        let admission = self
            .check_admission(
                PolicyRequest {
                    operation: AttributionOperation::Trigger,
                    context_id: Some(context_id),
                    source_origin: None,
                    destination_origin: Some(&trigger.destination_origin),
                    reporting_origin: &trigger.reporting_origin,
                },
                has_debug_data,
            )
            .await;

        let (result, cleared_debug_key) = if admission.allowed {
            let cleared = if admission.debug_cookie_set {
                None
            } else {
                trigger.registration.debug_key.take()
            };
            (
                self.inner
                    .collab
                    .resolver
                    .maybe_create_and_store_report(trigger)
                    .await,
                cleared,
            )
        } else {
            (CreateReportResult::prohibited(trigger, self.now()), None)
        };

        self.on_report_stored(result, cleared_debug_key, admission.debug_cookie_set, context_id);
    }

    /// Records the timing of a new aggregatable report unless the report is
    /// already being sent; the send path has then cleared its slot already.
    pub(super) fn track_pending_timing(&self, id: ReportId, timing: PendingReportTiming) -> bool {
        // Lock order: reports_being_sent, then pending_timings
        let being_sent = self.inner.reports_being_sent.lock();
        if being_sent.contains(&id) {
            log::debug!("[ATTRIBUTION] Report {} already being sent, not tracking its timing", id);
            return false;
        }
        let tracked = self.inner.pending_timings.lock().insert(id, timing);
        if !tracked {
            log::debug!(
                "[ATTRIBUTION] Pending timing table full, not tracking report {}",
                id
            );
        }
        tracked
    }

    fn on_report_stored(
        &self,
        result: CreateReportResult,
        cleared_debug_key: Option<u64>,
        debug_cookie_set: bool,
        context_id: ContextId,
    ) {
        self.inner
            .metrics
            .record_create_report(result.event_level_status, result.aggregatable_status);
        log::debug!(
            "[ATTRIBUTION] Trigger from {} on {}: event-level {}, aggregatable {}",
            result.trigger.reporting_origin,
            result.trigger.destination_origin,
            result.event_level_status.as_str(),
            result.aggregatable_status.as_str()
        );

        let new_reports = [
            &result.new_event_level_report,
            &result.new_aggregatable_report,
        ];
        for report in new_reports.into_iter().flatten() {
            self.maybe_send_debug_report(report.clone());
            if report.report_type() == ReportType::AggregatableAttribution {
                self.track_pending_timing(
                    report.id,
                    PendingReportTiming {
                        creation_time: result.trigger_time,
                        report_time: report.report_time,
                    },
                );
            }
        }

        let min_new_time = new_reports
            .into_iter()
            .flatten()
            .map(|report| report.report_time)
            .chain(result.min_null_aggregatable_report_time)
            .min();
        self.inner.scheduler.maybe_set(min_new_time);

        if result.event_level_status != EventLevelResult::InternalError {
            self.notify_sources_changed();
        }
        if min_new_time.is_some() {
            self.notify_reports_changed();
        }
        self.inner
            .observers
            .notify(|o| o.on_trigger_handled(cleared_debug_key, &result));

        self.maybe_send_verbose_trigger_debug_report(&result, debug_cookie_set, context_id);
        self.maybe_send_aggregatable_trigger_debug_report(&result, context_id);
    }
}
