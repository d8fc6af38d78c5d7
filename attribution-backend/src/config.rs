use crate::error::ConfigError;
use crate::manager::retry::RetryPolicy;
use attribution_types::SuitableOrigin;
use chrono::Duration;
use std::env;
use std::str::FromStr;

/// Settings the engine itself consumes. Built once and threaded through
/// construction; nothing here is global.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_pending_events: usize,
    pub max_pending_os_registrations: usize,
    pub retry: RetryPolicy,
    /// Default debug mode, also restored by `set_debug_mode(None)`.
    pub debug_mode: bool,
    pub verbose_debug_reporting: bool,
    pub aggregatable_debug_reporting: bool,
    pub offline_report_delay_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_events: 1000,
            max_pending_os_registrations: 1000,
            retry: RetryPolicy::default(),
            debug_mode: false,
            verbose_debug_reporting: true,
            aggregatable_debug_reporting: true,
            offline_report_delay_max: Duration::seconds(60),
        }
    }
}

/// Service configuration read from `ATTRIBUTION_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub engine: EngineConfig,
    pub debug_cookie_origins: Vec<SuitableOrigin>,
    pub blocked_origins: Vec<SuitableOrigin>,
    pub cleartext_aggregation: bool,
    pub report_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let first_retry_secs: i64 = parse_var(&lookup, "ATTRIBUTION_FIRST_RETRY_DELAY_SECS", 300)?;
        let second_retry_secs: i64 =
            parse_var(&lookup, "ATTRIBUTION_SECOND_RETRY_DELAY_SECS", 900)?;
        let offline_delay_secs: i64 =
            parse_var(&lookup, "ATTRIBUTION_OFFLINE_REPORT_DELAY_MAX_SECS", 60)?;

        let engine = EngineConfig {
            max_pending_events: parse_var(
                &lookup,
                "ATTRIBUTION_MAX_PENDING_EVENTS",
                defaults.max_pending_events,
            )?,
            max_pending_os_registrations: parse_var(
                &lookup,
                "ATTRIBUTION_MAX_PENDING_OS_REGISTRATIONS",
                defaults.max_pending_os_registrations,
            )?,
            retry: RetryPolicy::new(
                Duration::seconds(first_retry_secs),
                Duration::seconds(second_retry_secs),
            ),
            debug_mode: parse_var(&lookup, "ATTRIBUTION_DEBUG_MODE", defaults.debug_mode)?,
            verbose_debug_reporting: parse_var(
                &lookup,
                "ATTRIBUTION_VERBOSE_DEBUG_REPORTING",
                defaults.verbose_debug_reporting,
            )?,
            aggregatable_debug_reporting: parse_var(
                &lookup,
                "ATTRIBUTION_AGGREGATABLE_DEBUG_REPORTING",
                defaults.aggregatable_debug_reporting,
            )?,
            offline_report_delay_max: Duration::seconds(offline_delay_secs),
        };

        Ok(Self {
            port: parse_var(&lookup, "ATTRIBUTION_PORT", 9110)?,
            db_path: lookup("ATTRIBUTION_DB_PATH").unwrap_or_else(|| "./attribution.db".to_string()),
            engine,
            debug_cookie_origins: parse_origins(&lookup, "ATTRIBUTION_DEBUG_COOKIE_ORIGINS")?,
            blocked_origins: parse_origins(&lookup, "ATTRIBUTION_BLOCKED_ORIGINS")?,
            cleartext_aggregation: parse_var(&lookup, "ATTRIBUTION_CLEARTEXT_AGGREGATION", false)?,
            report_timeout_secs: parse_var(&lookup, "ATTRIBUTION_REPORT_TIMEOUT_SECS", 30)?,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

fn parse_origins(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Vec<SuitableOrigin>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            SuitableOrigin::parse(s).ok_or_else(|| ConfigError::InvalidOrigin {
                name,
                value: s.to_string(),
            })
        })
        .collect()
}
