//! OS-level registration pipeline.
//!
//! Same queue discipline as sources and triggers, but admission runs per
//! item: items with an unusable URL or a denied policy are reported and
//! removed, the rest get their debug cookie checked concurrently and are
//! handed to the OS manager in one call.

use super::AttributionManager;
use crate::policy::{AttributionOperation, PolicyRequest};
use crate::queue::Enqueue;
use crate::telemetry::OS_QUEUE_OVERFLOW;
use attribution_types::*;
use futures_util::future::join_all;
use serde_json::json;

/// The top-level origin is the source origin of an OS source and the
/// destination of an OS trigger.
fn os_policy_request<'a>(
    operation: AttributionOperation,
    context_id: Option<ContextId>,
    top_level_origin: &'a SuitableOrigin,
    reporting_origin: &'a SuitableOrigin,
) -> PolicyRequest<'a> {
    let is_source = operation == AttributionOperation::OsSource;
    PolicyRequest {
        operation,
        context_id,
        source_origin: is_source.then_some(top_level_origin),
        destination_origin: (!is_source).then_some(top_level_origin),
        reporting_origin,
    }
}

impl AttributionManager {
    /// Returns false when the queue is full; every item is then reported
    /// as `ExcessiveQueueSize`.
    pub fn handle_os_registration(&self, registration: OsRegistration) -> bool {
        match self.inner.os_registrations.enqueue(registration) {
            Enqueue::Rejected(registration) => {
                log::warn!(
                    "[OS_REGISTRATION] Queue full, rejecting {} item(s) from {}",
                    registration.items.len(),
                    registration.top_level_origin
                );
                self.inner.metrics.incr(OS_QUEUE_OVERFLOW);
                let now = self.now();
                for item in &registration.items {
                    self.inner.observers.notify(|o| {
                        o.on_os_registration(
                            now,
                            item,
                            &registration.top_level_origin,
                            false,
                            OsRegistrationResult::ExcessiveQueueSize,
                        )
                    });
                }
                false
            }
            Enqueue::Queued => true,
            Enqueue::StartDrain => {
                let manager = self.clone();
                tokio::spawn(async move { manager.drain_os_registrations().await });
                true
            }
        }
    }

    async fn drain_os_registrations(&self) {
        while let Some(registration) = self.inner.os_registrations.take_next() {
            self.process_os_registration(registration).await;
        }
    }

    fn notify_os_registration(
        &self,
        registration: &OsRegistration,
        item: &OsRegistrationItem,
        is_debug_key_allowed: bool,
        result: OsRegistrationResult,
    ) {
        log::debug!(
            "[OS_REGISTRATION] {} from {}: {:?}",
            item.url,
            registration.top_level_origin,
            result
        );
        let now = self.now();
        self.inner.observers.notify(|o| {
            o.on_os_registration(
                now,
                item,
                &registration.top_level_origin,
                is_debug_key_allowed,
                result,
            )
        });
    }

    async fn process_os_registration(&self, mut registration: OsRegistration) {
        let operation = match registration.registration_type {
            OsRegistrationType::Source => AttributionOperation::OsSource,
            OsRegistrationType::Trigger => AttributionOperation::OsTrigger,
        };
        let top_level_origin = registration.top_level_origin.clone();
        let context_id = registration.context_id;

        let mut admitted = Vec::new();
        for item in std::mem::take(&mut registration.items) {
            let Some(reporting_origin) = SuitableOrigin::parse(&item.url) else {
                self.notify_os_registration(
                    &registration,
                    &item,
                    false,
                    OsRegistrationResult::InvalidRegistrationUrl,
                );
                continue;
            };
            let allowed = self
                .inner
                .collab
                .policy
                .is_operation_allowed(&os_policy_request(
                    operation,
                    context_id,
                    &top_level_origin,
                    &reporting_origin,
                ))
                .allowed;
            if !allowed {
                self.notify_os_registration(
                    &registration,
                    &item,
                    false,
                    OsRegistrationResult::ProhibitedByBrowserPolicy,
                );
                continue;
            }
            admitted.push((item, reporting_origin));
        }
        if admitted.is_empty() {
            return;
        }

        let debug_key_allowed: Vec<bool> = join_all(
            admitted
                .iter()
                .map(|(_, origin)| {
                    self.is_debug_cookie_set(os_policy_request(
                        operation,
                        context_id,
                        &top_level_origin,
                        origin,
                    ))
                }),
        )
        .await;

        registration.items = admitted.iter().map(|(item, _)| item.clone()).collect();
        let passed = self
            .inner
            .collab
            .os_level_manager
            .register(&registration, &debug_key_allowed)
            .await;

        for (index, (item, reporting_origin)) in admitted.iter().enumerate() {
            let is_debug_key_allowed = debug_key_allowed[index];
            let result = if passed.get(index).copied().unwrap_or(false) {
                OsRegistrationResult::PassedToOs
            } else {
                OsRegistrationResult::RejectedByOs
            };
            self.notify_os_registration(&registration, item, is_debug_key_allowed, result);
            self.maybe_send_os_verbose_debug_report(
                &registration,
                item,
                reporting_origin,
                is_debug_key_allowed,
            );
        }
    }

    fn maybe_send_os_verbose_debug_report(
        &self,
        registration: &OsRegistration,
        item: &OsRegistrationItem,
        reporting_origin: &SuitableOrigin,
        is_debug_key_allowed: bool,
    ) {
        if !self.inner.config.verbose_debug_reporting
            || !item.debug_reporting
            || !is_debug_key_allowed
        {
            return;
        }
        let (operation, data_type) = match registration.registration_type {
            OsRegistrationType::Source => (
                AttributionOperation::SourceVerboseDebugReport,
                DebugDataType::OsSourceDelegated,
            ),
            OsRegistrationType::Trigger => (
                AttributionOperation::TriggerVerboseDebugReport,
                DebugDataType::OsTriggerDelegated,
            ),
        };
        let allowed = self
            .inner
            .collab
            .policy
            .is_operation_allowed(&PolicyRequest {
                operation,
                context_id: registration.context_id,
                source_origin: None,
                destination_origin: None,
                reporting_origin,
            })
            .allowed;
        if !allowed {
            return;
        }
        self.send_verbose_debug_report(VerboseDebugReport {
            reporting_origin: reporting_origin.clone(),
            data: vec![VerboseDebugData {
                data_type,
                body: json!({
                    "context_site": registration.top_level_origin.as_str(),
                    "registration_url": item.url,
                }),
            }],
        });
    }
}
