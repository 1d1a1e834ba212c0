//! Configuration surface for an embedded outbox instance.
//!
//! A single `OutboxConfig` is the whole configuration story: callers build
//! one (or take the defaults), hand it to [`crate::lifecycle::LifecycleManager::start`],
//! and every background task reads its schedule from it. `validate()` runs
//! once at startup so a bad value fails fast instead of surfacing as a
//! confusing runtime symptom hours later.

use std::time::Duration;

use outbox_core::OutboxError;
use serde::{Deserialize, Serialize};

/// Retry policy selection and parameters for the configuration-derived
/// default policy (handlers may still register their own per-handler
/// override; see [`crate::handler::HandlerRegistry`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryPolicyConfig {
    Fixed { delay_ms: u64, max_retries: u32 },
    Exponential { initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64, max_retries: u32 },
    Jittered { base: Box<RetryPolicyConfig>, jitter_ms: u64 },
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::Exponential { initial_delay_ms: 1000, max_delay_ms: 60_000, multiplier: 2.0, max_retries: 5 }
    }
}

impl RetryPolicyConfig {
    /// Builds the boxed [`outbox_core::RetryPolicy`] this config describes.
    pub fn build(&self) -> Result<Box<dyn outbox_core::RetryPolicy>, OutboxError> {
        match self {
            Self::Fixed { delay_ms, max_retries } => Ok(Box::new(outbox_core::FixedRetryPolicy {
                delay: Duration::from_millis(*delay_ms),
                max_retries: *max_retries,
            })),
            Self::Exponential { initial_delay_ms, max_delay_ms, multiplier, max_retries } => {
                if *multiplier <= 0.0 {
                    return Err(OutboxError::Configuration(format!(
                        "exponential retry multiplier must be positive, got {multiplier}"
                    )));
                }
                Ok(Box::new(outbox_core::ExponentialBackoffRetryPolicy {
                    initial_delay: Duration::from_millis(*initial_delay_ms),
                    max_delay: Duration::from_millis(*max_delay_ms),
                    multiplier: *multiplier,
                    max_retries: *max_retries,
                }))
            }
            Self::Jittered { base, jitter_ms } => Ok(Box::new(outbox_core::JitteredRetryPolicy {
                base: base.build()?,
                jitter: Duration::from_millis(*jitter_ms),
            })),
        }
    }
}

/// Processing scheduler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    /// Max distinct keys returned per scheduler tick.
    pub batch_size: u32,
    /// When `true`, a key halts after one failure in a tick and
    /// `find_ready_record_keys` excludes keys with prior incomplete records.
    pub stop_on_first_failure: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self { batch_size: 100, stop_on_first_failure: true }
    }
}

/// Instance lifecycle and membership options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub heartbeat_interval: Duration,
    pub stale_instance_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub rebalance_interval: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_instance_timeout: Duration::from_secs(30),
            graceful_shutdown_timeout: Duration::from_secs(10),
            rebalance_interval: Duration::from_secs(10),
        }
    }
}

/// The whole configuration surface for a single embedded outbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxConfig {
    /// Processing scheduler tick period.
    pub poll_interval: Duration,
    pub processing: ProcessingConfig,
    pub instance: InstanceConfig,
    pub retry: RetryPolicyConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            processing: ProcessingConfig::default(),
            instance: InstanceConfig::default(),
            retry: RetryPolicyConfig::default(),
        }
    }
}

impl OutboxConfig {
    /// Validates the configuration, raising [`OutboxError::Configuration`]
    /// for anything that would make the background tasks misbehave:
    /// zero/negative durations, a malformed retry policy. Run once at
    /// startup, before any task is spawned.
    pub fn validate(&self) -> Result<(), OutboxError> {
        for (name, duration) in [
            ("pollInterval", self.poll_interval),
            ("instance.heartbeatInterval", self.instance.heartbeat_interval),
            ("instance.staleInstanceTimeout", self.instance.stale_instance_timeout),
            ("instance.gracefulShutdownTimeout", self.instance.graceful_shutdown_timeout),
            ("instance.rebalanceInterval", self.instance.rebalance_interval),
        ] {
            if duration.is_zero() {
                return Err(OutboxError::Configuration(format!("{name} must be greater than zero")));
            }
        }
        // Constructing the policy tree validates nested parameters (e.g. a
        // non-positive exponential multiplier) without keeping it around.
        self.retry.build()?;
        Ok(())
    }
}
