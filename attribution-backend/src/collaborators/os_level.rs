//! OS-level registration for hosts without platform attribution support.

use super::OsLevelManager;
use async_trait::async_trait;
use attribution_types::{DataFilter, OsRegistration, OsSupport};
use chrono::{DateTime, Utc};

pub struct UnsupportedOsLevelManager;

#[async_trait]
impl OsLevelManager for UnsupportedOsLevelManager {
    async fn register(
        &self,
        registration: &OsRegistration,
        _debug_key_allowed: &[bool],
    ) -> Vec<bool> {
        log::debug!(
            "[OS_REGISTRATION] OS attribution unsupported, rejecting {} item(s)",
            registration.items.len()
        );
        vec![false; registration.items.len()]
    }

    async fn clear_data(
        &self,
        _begin: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
        _filter: &DataFilter,
        _delete_rate_limit_data: bool,
    ) {
    }

    fn os_support(&self) -> OsSupport {
        OsSupport::Disabled
    }
}
