//! Retry backoff policies for delay-event consumers
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

use crate::error::SdkError;

/// Successive retry intervals.  `None` means give up.
pub trait BackoffPolicy: Send {
    fn next_backoff(&mut self) -> Option<Duration>;
    fn reset(&mut self);
}

const fn default_initial_interval_ms() -> u64 { 3_000 }
const fn default_multiplier() -> f64 { 1.5 }
const fn default_randomization_factor() -> f64 { 0.5 }
const fn default_max_interval_ms() -> u64 { 60_000 }
const fn default_max_retries() -> u32 { 3 }

/// Backoff parameters, readable from a `[backoff]` config section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
            max_interval_ms: default_max_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffConfig {
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// No jitter - intervals are exactly initial * multiplier^n
    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    /// Reject values the interval arithmetic can't use
    pub fn validate(&self) -> Result<(), SdkError> {
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(SdkError::InvalidConfig(
                format!("backoff multiplier {} must be finite and positive", self.multiplier)));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(SdkError::InvalidConfig(
                format!("backoff randomization factor {} must be within 0..=1",
                        self.randomization_factor)));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<ExponentialBackoff, SdkError> {
        self.validate()?;
        Ok(ExponentialBackoff::new(self.clone()))
    }
}

/// Exponential backoff with jitter and a retry cap
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    retries: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = Duration::from_millis(config.initial_interval_ms);
        Self { config, current, retries: 0 }
    }

    /// Retries handed out since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn randomize(&self, interval: Duration) -> Duration {
        let factor = self.config.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = factor * secs;
        let secs = rand::rng().random_range((secs - delta)..=(secs + delta));
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(interval)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        self.retries += 1;

        let interval = self.randomize(self.current);

        let max = Duration::from_millis(self.config.max_interval_ms);
        let next = self.current.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current = Duration::try_from_secs_f64(next).map_or(max, |next| next.min(max));

        Some(interval)
    }

    fn reset(&mut self) {
        self.current = Duration::from_millis(self.config.initial_interval_ms);
        self.retries = 0;
    }
}
