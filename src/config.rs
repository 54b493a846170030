//! Run configuration
//!
//! Defaults mirror the tool's fixed constants; the CLI overrides them.

use std::time::Duration;

use crate::types::ConflictPolicy;

/// Default role name created in the operator's account
pub const DEFAULT_ROLE_NAME: &str = "s3-account-finder-role";

/// Default region for all clients
pub const DEFAULT_REGION: &str = "us-east-1";

/// STS session name used when assuming the ephemeral role
pub const SESSION_NAME: &str = "s3-account-finder-session";

/// Retry and self-throttling settings for the resilient executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay
    pub max_delay: Duration,
    /// Minimum gap between the end of one call and the start of the next
    pub min_call_spacing: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            min_call_spacing: Duration::from_millis(100),
        }
    }
}

impl RetrySettings {
    /// Backoff before retry `k` (k >= 1): `min(base * 2^(k-1), cap)`
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Settings for one probe run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Name of the ephemeral role
    pub identity_name: String,
    pub on_conflict: ConflictPolicy,
    /// Abort after this many inconclusive results in a row; 0 never aborts
    pub max_consecutive_inconclusive: usize,
    /// Pause after IAM mutations so they propagate before they are relied on
    pub settle_delay: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            identity_name: DEFAULT_ROLE_NAME.to_string(),
            on_conflict: ConflictPolicy::Fail,
            max_consecutive_inconclusive: 3,
            settle_delay: Duration::from_secs(10),
        }
    }
}

impl ProbeSettings {
    pub fn new(identity_name: impl Into<String>) -> Self {
        Self {
            identity_name: identity_name.into(),
            ..Self::default()
        }
    }

    pub fn on_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn max_consecutive_inconclusive(mut self, limit: usize) -> Self {
        self.max_consecutive_inconclusive = limit;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// AWS context resolved once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub profile: Option<String>,
    pub region: String,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            profile: None,
            region: DEFAULT_REGION.to_string(),
        }
    }
}

/// Full configuration assembled by the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderConfig {
    pub aws: AwsSettings,
    pub retry: RetrySettings,
    pub probe: ProbeSettings,
}
