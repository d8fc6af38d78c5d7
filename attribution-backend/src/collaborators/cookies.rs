//! Debug cookie lookup against a configured set of origins.

use super::CookieChecker;
use async_trait::async_trait;
use attribution_types::SuitableOrigin;
use std::collections::HashSet;

pub struct StaticCookieChecker {
    origins: HashSet<SuitableOrigin>,
}

impl StaticCookieChecker {
    pub fn new(origins: impl IntoIterator<Item = SuitableOrigin>) -> Self {
        Self {
            origins: origins.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CookieChecker for StaticCookieChecker {
    async fn is_debug_cookie_set(&self, origin: &SuitableOrigin) -> bool {
        self.origins.contains(origin)
    }
}
