//! Cloud collaborator seams
//!
//! The lifecycle manager and the probe protocol only talk to AWS through the
//! three traits below. [`sdk`] binds them to the official SDK; tests use an
//! in-memory fake that evaluates the attached condition policy itself.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod fake;
pub mod sdk;

/// Error codes that signal throttling or a transient service fault
const TRANSIENT_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeoutException",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
    "RequestLimitExceeded",
    "SlowDown",
    "RequestTimeTooSkewed",
    "ProvisionedThroughputExceededException",
    "InternalError",
    "ServiceFailure",
];

/// Error codes that mean the caller was not authorized
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AllAccessDisabled",
    "UnauthorizedOperation",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchEntity", "NoSuchBucket", "NotFound"];

const ALREADY_EXISTS_CODES: &[&str] = &["EntityAlreadyExists"];

/// Coarse classification of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    AccessDenied,
    NotFound,
    AlreadyExists,
    Transient,
    Other,
}

impl ServiceErrorKind {
    /// Map an AWS error code onto a kind
    pub fn from_code(code: &str) -> Self {
        if TRANSIENT_CODES.contains(&code) {
            Self::Transient
        } else if ACCESS_DENIED_CODES.contains(&code) {
            Self::AccessDenied
        } else if NOT_FOUND_CODES.contains(&code) {
            Self::NotFound
        } else if ALREADY_EXISTS_CODES.contains(&code) {
            Self::AlreadyExists
        } else {
            Self::Other
        }
    }
}

/// A failed remote call, with enough context to classify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{operation} failed ({}): {message}", .code.as_deref().unwrap_or("no error code"))]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub operation: String,
    pub code: Option<String>,
    pub message: String,
}

impl ServiceError {
    pub fn new(
        kind: ServiceErrorKind,
        operation: impl Into<String>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Build from an AWS error code, deriving the kind from it
    pub fn from_code(operation: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::from_code(code), operation, Some(code), message)
    }

    pub fn is_access_denied(&self) -> bool {
        self.kind == ServiceErrorKind::AccessDenied
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ServiceErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ServiceErrorKind::Transient
    }
}

/// An IAM role as returned by create/get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub name: String,
    pub arn: String,
}

/// Short-lived credentials issued by STS
#[derive(Clone)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: Option<DateTime<Utc>>,
}

// Never print the secret half of the credentials.
impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// A caller acting as the assumed ephemeral identity
#[derive(Debug, Clone)]
pub struct TemporaryCaller {
    /// ARN of the assumed-role session
    pub arn: String,
    pub credentials: TemporaryCredentials,
}

/// IAM operations needed to manage the ephemeral role
#[async_trait]
pub trait IamApi: Send + Sync {
    async fn create_identity(
        &self,
        name: &str,
        trust_policy: &str,
    ) -> Result<IdentityRecord, ServiceError>;

    async fn delete_identity(&self, name: &str) -> Result<(), ServiceError>;

    async fn put_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ServiceError>;

    async fn delete_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
    ) -> Result<(), ServiceError>;

    async fn list_inline_authorization_names(
        &self,
        identity: &str,
    ) -> Result<Vec<String>, ServiceError>;

    /// `Ok(None)` when the role does not exist
    async fn get_identity(&self, name: &str) -> Result<Option<IdentityRecord>, ServiceError>;
}

/// STS operations: who am I, and become someone else
#[async_trait]
pub trait StsApi: Send + Sync {
    async fn get_caller_identity(&self) -> Result<String, ServiceError>;

    async fn assume_identity(
        &self,
        arn: &str,
        session_name: &str,
    ) -> Result<TemporaryCaller, ServiceError>;
}

/// The single storage call the probe relies on
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        caller: &TemporaryCaller,
    ) -> Result<Vec<String>, ServiceError>;
}
