//! Engine configuration from environment variables.

use std::time::Duration;

use chrono_tz::Tz;

use cadence_billing::RoundingMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var} value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub const ROUNDING_VAR: &str = "CADENCE_PRORATION_ROUNDING";
pub const DRAFT_INVOICES_VAR: &str = "CADENCE_DRAFT_INVOICES";
pub const POLL_INTERVAL_VAR: &str = "CADENCE_POLL_INTERVAL_MS";
pub const DEFAULT_TIME_ZONE_VAR: &str = "CADENCE_DEFAULT_TIME_ZONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rounding of prorated partial periods (default: banker's rounding).
    pub rounding: RoundingMode,
    /// Create invoices as `Draft` instead of `Committed` (default: false).
    pub draft_invoices: bool,
    /// How often the notification poller looks for due triggers (default: 1s).
    pub poll_interval: Duration,
    /// Zone for accounts created without one (default: UTC).
    pub default_time_zone: Tz,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rounding: RoundingMode::default(),
            draft_invoices: false,
            poll_interval: Duration::from_millis(1000),
            default_time_zone: Tz::UTC,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup(ROUNDING_VAR) {
            config.rounding = v.parse().map_err(|err: cadence_core::DomainError| ConfigError::Invalid {
                var: ROUNDING_VAR,
                value: v.clone(),
                reason: err.to_string(),
            })?;
        }
        if let Some(v) = lookup(DRAFT_INVOICES_VAR) {
            config.draft_invoices = v.parse::<bool>().map_err(|_| ConfigError::Invalid {
                var: DRAFT_INVOICES_VAR,
                value: v.clone(),
                reason: "expected true or false".into(),
            })?;
        }
        if let Some(v) = lookup(POLL_INTERVAL_VAR) {
            let ms = v.parse::<u64>().ok().filter(|ms| *ms > 0).ok_or_else(|| ConfigError::Invalid {
                var: POLL_INTERVAL_VAR,
                value: v.clone(),
                reason: "expected a positive number of milliseconds".into(),
            })?;
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = lookup(DEFAULT_TIME_ZONE_VAR) {
            config.default_time_zone = v.parse::<Tz>().map_err(|_| ConfigError::Invalid {
                var: DEFAULT_TIME_ZONE_VAR,
                value: v.clone(),
                reason: "expected an IANA time zone name".into(),
            })?;
        }

        Ok(config)
    }
}
