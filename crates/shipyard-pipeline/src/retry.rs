//! Per-stage retry policy with capped exponential backoff.

use std::time::Duration;

use serde::Deserialize;

use crate::types::Stage;

/// Calculate the backoff to wait after a failed attempt.
///
/// `attempt` is the 1-based number of the attempt that just failed. The delay
/// doubles with each attempt (`base * 2^(attempt - 1)`), capped at `max`.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let multiplier = 2u64.saturating_pow(exponent);
    let delay = base.saturating_mul(multiplier.min(u64::from(u32::MAX)) as u32);
    delay.min(max)
}

/// Retry behaviour for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Backoff after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any single backoff.
    pub max_delay: Duration,
    /// Timeout applied to each attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            timeout,
        }
    }

    /// Effective attempt limit.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff after the given 1-based failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }

    /// Sum of every backoff the policy can wait before giving up.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (1..self.attempts()).map(|a| self.delay_after(a)).sum()
    }
}

/// Serialisable form of [`RetryPolicy`], used in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Backoff after the first failure in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_timeout_secs() -> u64 {
    120
}

impl RetryPolicyConfig {
    const fn with_attempts(max_attempts: u32, timeout_secs: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs,
        }
    }

    /// Convert into a runtime policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Retry policies for every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StagePolicies {
    /// Validation stage.
    #[serde(default = "default_validate")]
    pub validate: RetryPolicyConfig,
    /// Sandbox provisioning.
    #[serde(default = "default_provision")]
    pub provision: RetryPolicyConfig,
    /// File sync.
    #[serde(default = "default_sync")]
    pub sync: RetryPolicyConfig,
    /// Build. Defaults to a single attempt.
    #[serde(default = "default_build")]
    pub build: RetryPolicyConfig,
    /// Publish.
    #[serde(default = "default_publish")]
    pub publish: RetryPolicyConfig,
    /// Each cleanup action in finalize.
    #[serde(default = "default_finalize")]
    pub finalize: RetryPolicyConfig,
}

const fn default_validate() -> RetryPolicyConfig {
    RetryPolicyConfig::with_attempts(2, 30)
}

const fn default_provision() -> RetryPolicyConfig {
    RetryPolicyConfig::with_attempts(3, 120)
}

const fn default_sync() -> RetryPolicyConfig {
    RetryPolicyConfig::with_attempts(3, 300)
}

const fn default_build() -> RetryPolicyConfig {
    RetryPolicyConfig::with_attempts(1, 900)
}

const fn default_publish() -> RetryPolicyConfig {
    RetryPolicyConfig::with_attempts(3, 120)
}

const fn default_finalize() -> RetryPolicyConfig {
    RetryPolicyConfig::with_attempts(2, 60)
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            validate: default_validate(),
            provision: default_provision(),
            sync: default_sync(),
            build: default_build(),
            publish: default_publish(),
            finalize: default_finalize(),
        }
    }
}

impl StagePolicies {
    /// Runtime policy for a stage.
    #[must_use]
    pub const fn for_stage(&self, stage: Stage) -> RetryPolicy {
        match stage {
            Stage::Validate => self.validate.policy(),
            Stage::Provision => self.provision.policy(),
            Stage::Sync => self.sync.policy(),
            Stage::Build => self.build.policy(),
            Stage::Publish => self.publish.policy(),
            Stage::Finalize => self.finalize.policy(),
        }
    }

    /// Replace the policy of one stage.
    #[must_use]
    pub fn with(mut self, stage: Stage, policy: RetryPolicyConfig) -> Self {
        match stage {
            Stage::Validate => self.validate = policy,
            Stage::Provision => self.provision = policy,
            Stage::Sync => self.sync = policy,
            Stage::Build => self.build = policy,
            Stage::Publish => self.publish = policy,
            Stage::Finalize => self.finalize = policy,
        }
        self
    }
}
