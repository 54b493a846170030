//! Error types for the account finder
//!
//! `FinderError` is what a probe run can fail with. A failed teardown is not
//! part of it: `TeardownFailure` travels next to the primary result so it can
//! never replace it.

use serde::Serialize;
use thiserror::Error;

use crate::aws::ServiceError;

/// Errors surfaced by the identity lifecycle and the probe protocol
#[derive(Debug, Error)]
pub enum FinderError {
    /// The candidate set was empty
    #[error("No candidate account IDs supplied")]
    NoCandidates,

    /// The target path could not be parsed
    #[error("Invalid target path: {0}")]
    InvalidTarget(String),

    /// Reusing an existing identity was requested
    #[error("Reusing existing role {0} is not allowed: it may carry stale policies")]
    ReuseRejected(String),

    /// An identity with the requested name already exists
    #[error("Role {0} already exists. Use --delete-existing-role to remove it first")]
    AlreadyExists(String),

    /// The caller lacks IAM permissions for a lifecycle operation
    #[error("Permission denied during {operation}: {message}")]
    PermissionDenied { operation: String, message: String },

    /// Creating or cleaning up the identity failed
    #[error("Failed to provision role {name}: {source}")]
    ProvisionFailure {
        name: String,
        #[source]
        source: ServiceError,
    },

    /// Exchanging the identity for temporary credentials failed
    #[error("Failed to assume role {arn}: {message}")]
    AssumeFailure { arn: String, message: String },

    /// A non-retryable failure unrelated to the ownership hypothesis
    #[error("Probe aborted: {0}")]
    ProbeFatal(ServiceError),

    /// All attempts of a retryable operation failed
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: ServiceError,
    },

    /// A policy document could not be rendered
    #[error("Failed to render policy document: {0}")]
    PolicyDocument(#[from] serde_json::Error),

    /// The run was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// The protocol instance already tore down its identity
    #[error("Probe protocol already torn down; create a new instance")]
    ProtocolTornDown,
}

/// Result type alias
pub type FinderResult<T> = Result<T, FinderError>;

impl FinderError {
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Short machine-friendly label, used in JSON reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCandidates => "no_candidates",
            Self::InvalidTarget(_) => "invalid_target",
            Self::ReuseRejected(_) => "reuse_rejected",
            Self::AlreadyExists(_) => "already_exists",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::ProvisionFailure { .. } => "provision_failure",
            Self::AssumeFailure { .. } => "assume_failure",
            Self::ProbeFatal(_) => "probe_fatal",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::PolicyDocument(_) => "policy_document",
            Self::Cancelled => "cancelled",
            Self::ProtocolTornDown => "protocol_torn_down",
        }
    }
}

/// Non-fatal failure to remove the ephemeral identity
///
/// Always reported, never allowed to mask the run's result.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Error)]
#[error("Failed to delete role {identity}: {message}")]
pub struct TeardownFailure {
    pub identity: String,
    pub message: String,
}
