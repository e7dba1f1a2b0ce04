//! Engine Configuration
//!
//! Round timing, curve and betting limits. Defaults match the production
//! round; every value can be overridden from `CRASH_*` environment variables.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::amount::{Amount, Multiplier, SCALE};

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Variable present but not parseable.
    #[error("invalid value for {key}: {value:?}")]
    Unparseable {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
    /// Parsed value violates a constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Crash round engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Betting window before each round.
    pub countdown_duration: Duration,
    /// Countdown broadcast granularity.
    pub countdown_step: Duration,
    /// Multiplier clock cadence while running.
    pub tick_interval: Duration,
    /// Exponential growth rate k (per second).
    pub growth_rate: f64,
    /// Cap applied to generated crash points.
    pub max_multiplier: Multiplier,
    /// Smallest accepted stake.
    pub min_stake: Amount,
    /// Smallest accepted auto cash-out target.
    pub min_auto_cash_out: Multiplier,
    /// Look-ahead length kept in the upcoming queue.
    pub upcoming_target: usize,
    /// Max entries sent in the privileged preview.
    pub upcoming_preview_len: usize,
    /// Crash points retained in history.
    pub history_len: usize,
    /// Pause between crash and next countdown.
    pub post_crash_delay: Duration,
    /// Bound on every account store call.
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown_duration: Duration::from_secs(5),
            countdown_step: Duration::from_millis(100),
            tick_interval: Duration::from_millis(50),
            growth_rate: 0.18,
            max_multiplier: Multiplier::from_hundredths(20_000),
            min_stake: Amount::from_units(10),
            min_auto_cash_out: Multiplier::from_hundredths(200),
            upcoming_target: 10,
            upcoming_preview_len: 10,
            history_len: 20,
            post_crash_delay: Duration::from_secs(5),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "CRASH_COUNTDOWN_MS")? {
            config.countdown_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "CRASH_COUNTDOWN_STEP_MS")? {
            config.countdown_step = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "CRASH_TICK_MS")? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(k) = parse::<f64, _>(&lookup, "CRASH_GROWTH_RATE")? {
            config.growth_rate = k;
        }
        // MAX_MULTIPLIER is the name existing deployments already set.
        let max = match parse::<f64, _>(&lookup, "CRASH_MAX_MULTIPLIER")? {
            Some(v) => Some(v),
            None => parse::<f64, _>(&lookup, "MAX_MULTIPLIER")?,
        };
        if let Some(max) = max {
            config.max_multiplier = Multiplier::from_f64_rounded(max);
        }
        if let Some(units) = parse::<f64, _>(&lookup, "CRASH_MIN_STAKE")? {
            config.min_stake = units_to_amount(units, "CRASH_MIN_STAKE")?;
        }
        if let Some(target) = parse::<f64, _>(&lookup, "CRASH_MIN_AUTO_CASHOUT")? {
            config.min_auto_cash_out = Multiplier::from_f64_rounded(target);
        }
        if let Some(n) = parse::<usize, _>(&lookup, "CRASH_UPCOMING_TARGET")? {
            config.upcoming_target = n;
        }
        if let Some(n) = parse::<usize, _>(&lookup, "CRASH_PREVIEW_LEN")? {
            config.upcoming_preview_len = n;
        }
        if let Some(n) = parse::<usize, _>(&lookup, "CRASH_HISTORY_LEN")? {
            config.history_len = n;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "CRASH_POST_CRASH_DELAY_MS")? {
            config.post_crash_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "CRASH_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.growth_rate.is_finite() && self.growth_rate > 0.0) {
            return Err(ConfigError::Invalid("growth rate must be positive".into()));
        }
        if self.countdown_step.is_zero() || self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick cadences must be non-zero".into()));
        }
        if self.max_multiplier < Multiplier::ONE {
            return Err(ConfigError::Invalid("max multiplier must be at least 1.00".into()));
        }
        if self.min_auto_cash_out <= Multiplier::ONE {
            return Err(ConfigError::Invalid("auto cash-out minimum must exceed 1.00".into()));
        }
        if self.min_stake == Amount::ZERO {
            return Err(ConfigError::Invalid("minimum stake must be positive".into()));
        }
        if self.upcoming_target == 0 || self.history_len == 0 {
            return Err(ConfigError::Invalid("queue and history lengths must be positive".into()));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Invalid("store timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Parse an optional variable.
pub(crate) fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Unparseable {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Convert decimal units (e.g. `12.5`) to an exact amount.
pub(crate) fn units_to_amount(units: f64, key: &str) -> Result<Amount, ConfigError> {
    if !units.is_finite() || units < 0.0 {
        return Err(ConfigError::Unparseable {
            key: key.to_string(),
            value: units.to_string(),
        });
    }
    Ok(Amount::from_hundredths((units * SCALE as f64).round() as u64))
}
