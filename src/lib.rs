//! S3 Account Finder
//!
//! Finds the AWS account that owns a publicly reachable S3 bucket by probing
//! `s3:ResourceAccount` conditions through a short-lived IAM role.

pub mod aws;
pub mod candidates;
pub mod config;
pub mod error;
pub mod executor;
pub mod policy;
pub mod probe;
pub mod provisioner;
pub mod session;
pub mod types;

pub use candidates::{collect_candidates, CandidateSource, FileCandidates, StaticCandidates};
pub use config::FinderConfig;
pub use error::{FinderError, FinderResult, TeardownFailure};
pub use executor::ResilientExecutor;
pub use probe::ProbeProtocol;
pub use types::{ConflictPolicy, ProbeOutcome, ProbeReport, ProbeTarget, Verdict};
