//! Core types for a probe run
//!
//! The identity under management, the probe target, and what a run records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{FinderError, TeardownFailure};

/// What to do when a role with the requested name already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Keep the existing role. Always rejected: it may carry stale policies.
    Reuse,
    /// Delete the existing role (and its inline policies) first
    Replace,
    /// Surface `AlreadyExists` without touching anything
    #[default]
    Fail,
}

/// The throwaway role a run provisions, probes with, and deletes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralIdentity {
    pub name: String,
    pub arn: String,
    /// The only principal allowed to assume this role
    pub trusted_principal: String,
    /// Sid of the condition policy currently attached, if any
    pub attached_statement_name: Option<String>,
    pub(crate) released: bool,
}

impl EphemeralIdentity {
    pub(crate) fn new(name: String, arn: String, trusted_principal: String) -> Self {
        Self {
            name,
            arn,
            trusted_principal,
            attached_statement_name: None,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Bucket and optional key prefix to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeTarget {
    pub bucket: String,
    pub prefix: String,
}

impl ProbeTarget {
    /// Parse `bucket`, `bucket/prefix` or `s3://bucket/prefix`
    pub fn parse(path: &str) -> Result<Self, FinderError> {
        let trimmed = path.trim();
        let without_scheme = trimmed.strip_prefix("s3://").unwrap_or(trimmed);

        let (bucket, prefix) = match without_scheme.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (without_scheme, ""),
        };

        if bucket.is_empty() {
            return Err(FinderError::invalid_target(format!(
                "bucket name cannot be empty in '{path}'"
            )));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

/// Result of probing one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The listing was authorized: the candidate owns the bucket
    Granted { keys: Vec<String> },
    /// Access denied: the candidate is not the owner
    Denied,
    /// Something other than the ownership condition failed
    Inconclusive { error: String },
}

/// One recorded (candidate, outcome) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeAttempt {
    pub candidate_account_id: String,
    pub outcome: ProbeOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ProbeAttempt {
    pub fn new(candidate_account_id: impl Into<String>, outcome: ProbeOutcome) -> Self {
        Self {
            candidate_account_id: candidate_account_id.into(),
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// How a completed run answered the ownership question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Target ownership confirmed
    Confirmed { account_id: String },
    /// Every supplied candidate was denied
    Excluded,
    /// Aborted or finished without a clean answer
    Inconclusive { inconclusive_attempts: usize },
}

/// States of the probe protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    Idle,
    Provisioned,
    PolicyAttached,
    Exchanged,
    ProbeIssued,
    Evaluated,
    TornDown,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Provisioned => "provisioned",
            Self::PolicyAttached => "policy_attached",
            Self::Exchanged => "exchanged",
            Self::ProbeIssued => "probe_issued",
            Self::Evaluated => "evaluated",
            Self::TornDown => "torn_down",
        };
        f.write_str(name)
    }
}

/// Everything a run hands back to its caller
#[derive(Debug)]
pub struct ProbeReport {
    pub target: ProbeTarget,
    pub result: Result<Verdict, FinderError>,
    /// In probe order
    pub attempts: Vec<ProbeAttempt>,
    pub teardown_warning: Option<TeardownFailure>,
}

impl ProbeReport {
    /// True for a confirmed owner or a clean exhaustive exclusion
    pub fn is_success(&self) -> bool {
        matches!(
            self.result,
            Ok(Verdict::Confirmed { .. }) | Ok(Verdict::Excluded)
        )
    }

    pub fn confirmed_account(&self) -> Option<&str> {
        match &self.result {
            Ok(Verdict::Confirmed { account_id }) => Some(account_id),
            _ => None,
        }
    }

    /// JSON rendering for `--output json`
    pub fn to_json(&self) -> serde_json::Value {
        let (verdict, error) = match &self.result {
            Ok(verdict) => (serde_json::to_value(verdict).ok(), None),
            Err(e) => (
                None,
                Some(serde_json::json!({ "kind": e.kind(), "message": e.to_string() })),
            ),
        };

        serde_json::json!({
            "target": self.target,
            "verdict": verdict,
            "error": error,
            "attempts": self.attempts,
            "teardown_warning": self.teardown_warning,
        })
    }
}
