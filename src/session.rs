//! Session Exchanger
//!
//! Looks up who the operator is and trades the ephemeral role for temporary
//! credentials. Policies are evaluated per call, so one exchange serves every
//! candidate of a run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aws::{ServiceError, StsApi, TemporaryCaller};
use crate::error::{FinderError, FinderResult};
use crate::executor::{retry_transient, Classification, ExecutionError, ResilientExecutor};
use crate::types::EphemeralIdentity;

/// A freshly created role may not be assumable yet, so access denied is
/// retried along with the usual transient faults.
fn retry_until_propagated(err: &ServiceError) -> Classification {
    if err.is_transient() || err.is_access_denied() {
        Classification::Retryable
    } else {
        Classification::Fatal
    }
}

#[derive(Clone)]
pub struct SessionExchanger {
    sts: Arc<dyn StsApi>,
    executor: Arc<ResilientExecutor>,
    session_name: String,
}

impl SessionExchanger {
    pub fn new(
        sts: Arc<dyn StsApi>,
        executor: Arc<ResilientExecutor>,
        session_name: impl Into<String>,
    ) -> Self {
        Self {
            sts,
            executor,
            session_name: session_name.into(),
        }
    }

    /// ARN of the operator running the tool
    pub async fn caller_arn(&self, cancel: &CancellationToken) -> FinderResult<String> {
        let arn = self
            .executor
            .execute("GetCallerIdentity", cancel, retry_transient, || {
                self.sts.get_caller_identity()
            })
            .await
            .map_err(|e| {
                e.into_finder_error("GetCallerIdentity", |e| {
                    if e.is_access_denied() {
                        FinderError::PermissionDenied {
                            operation: "GetCallerIdentity".to_string(),
                            message: e.message,
                        }
                    } else {
                        FinderError::ProbeFatal(e)
                    }
                })
            })?;

        debug!(caller = %arn, "Resolved caller identity");
        Ok(arn)
    }

    /// Assume `identity` and return a caller acting as it
    pub async fn assume(
        &self,
        identity: &EphemeralIdentity,
        cancel: &CancellationToken,
    ) -> FinderResult<TemporaryCaller> {
        let result = self
            .executor
            .execute("AssumeRole", cancel, retry_until_propagated, || {
                self.sts.assume_identity(&identity.arn, &self.session_name)
            })
            .await;

        let caller = match result {
            Ok(caller) => caller,
            Err(ExecutionError::Cancelled) => return Err(FinderError::Cancelled),
            Err(ExecutionError::Fatal(e)) => {
                return Err(FinderError::AssumeFailure {
                    arn: identity.arn.clone(),
                    message: e.to_string(),
                })
            }
            Err(ExecutionError::RetriesExhausted { attempts, last }) => {
                return Err(FinderError::AssumeFailure {
                    arn: identity.arn.clone(),
                    message: format!("gave up after {attempts} attempts: {last}"),
                })
            }
        };

        info!(
            identity = %identity.name,
            session = %caller.arn,
            "Assumed ephemeral role"
        );
        Ok(caller)
    }
}
