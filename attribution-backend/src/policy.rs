//! Policy oracle consulted before registrations, sends and debug reports.

use attribution_types::{ContextId, SuitableOrigin};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributionOperation {
    Source,
    Trigger,
    Report,
    SourceVerboseDebugReport,
    TriggerVerboseDebugReport,
    SourceAggregatableDebugReport,
    TriggerAggregatableDebugReport,
    SourceTransitionalDebugReporting,
    TriggerTransitionalDebugReporting,
    OsSource,
    OsTrigger,
    OsSourceTransitionalDebugReporting,
    OsTriggerTransitionalDebugReporting,
}

impl AttributionOperation {
    /// The debug-cookie variant guarding debug keys of a registration.
    pub fn transitional_debug_variant(&self) -> Option<AttributionOperation> {
        match self {
            AttributionOperation::Source => Some(AttributionOperation::SourceTransitionalDebugReporting),
            AttributionOperation::Trigger => {
                Some(AttributionOperation::TriggerTransitionalDebugReporting)
            }
            AttributionOperation::OsSource => {
                Some(AttributionOperation::OsSourceTransitionalDebugReporting)
            }
            AttributionOperation::OsTrigger => {
                Some(AttributionOperation::OsTriggerTransitionalDebugReporting)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub operation: AttributionOperation,
    pub context_id: Option<ContextId>,
    pub source_origin: Option<&'a SuitableOrigin>,
    pub destination_origin: Option<&'a SuitableOrigin>,
    pub reporting_origin: &'a SuitableOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// Debug operations only: the debug cookie check may be skipped.
    pub can_bypass: bool,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            can_bypass: false,
        }
    }

    pub fn deny() -> Self {
        Self {
            allowed: false,
            can_bypass: false,
        }
    }
}

pub trait PolicyOracle: Send + Sync {
    fn is_operation_allowed(&self, request: &PolicyRequest<'_>) -> PolicyDecision;
}

/// Allows every operation unless one of its origins is blocked.
pub struct OriginPolicy {
    blocked: HashSet<SuitableOrigin>,
}

impl OriginPolicy {
    pub fn new(blocked: impl IntoIterator<Item = SuitableOrigin>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }

    fn is_blocked(&self, origin: Option<&SuitableOrigin>) -> bool {
        origin.is_some_and(|o| self.blocked.contains(o))
    }
}

impl PolicyOracle for OriginPolicy {
    fn is_operation_allowed(&self, request: &PolicyRequest<'_>) -> PolicyDecision {
        let blocked = self.is_blocked(Some(request.reporting_origin))
            || self.is_blocked(request.source_origin)
            || self.is_blocked(request.destination_origin);
        if blocked {
            log::debug!(
                "[ATTRIBUTION] {:?} denied for {}",
                request.operation,
                request.reporting_origin
            );
            PolicyDecision::deny()
        } else {
            PolicyDecision::allow()
        }
    }
}
