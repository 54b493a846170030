//! Identity Provisioner
//!
//! Creates and destroys the ephemeral role and manages its single condition
//! policy slot. Every IAM call goes through the shared executor.
//!
//! Release is idempotent and never fails the run: anything other than
//! "already gone" comes back as a [`TeardownFailure`] for the caller to report.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aws::{IamApi, ServiceError, ServiceErrorKind};
use crate::error::{FinderError, FinderResult, TeardownFailure};
use crate::executor::{retry_transient, ExecutionError, ResilientExecutor};
use crate::policy::{trust_policy, ConditionPolicy};
use crate::types::{ConflictPolicy, EphemeralIdentity};

/// Fixed inline policy name, so re-attaching overwrites instead of piling up
pub const CONDITION_POLICY_NAME: &str = "S3AccountProbeCondition";

/// Access denied means the operator lacks IAM rights, anything else is a
/// provisioning failure for `name`.
fn provision_error(name: &str, operation: &str, err: ExecutionError<ServiceError>) -> FinderError {
    err.into_finder_error(operation, |e| {
        if e.is_access_denied() {
            FinderError::PermissionDenied {
                operation: operation.to_string(),
                message: e.message,
            }
        } else if e.kind == ServiceErrorKind::AlreadyExists {
            FinderError::AlreadyExists(name.to_string())
        } else {
            FinderError::ProvisionFailure {
                name: name.to_string(),
                source: e,
            }
        }
    })
}

fn teardown_error(name: &str, err: ExecutionError<ServiceError>) -> TeardownFailure {
    let message = match err {
        ExecutionError::Fatal(e) => e.to_string(),
        ExecutionError::RetriesExhausted { attempts, last } => {
            format!("gave up after {attempts} attempts: {last}")
        }
        ExecutionError::Cancelled => "cancelled".to_string(),
    };
    TeardownFailure {
        identity: name.to_string(),
        message,
    }
}

/// Treat "already gone" as success
fn ignore_not_found(
    result: Result<(), ExecutionError<ServiceError>>,
) -> Result<(), ExecutionError<ServiceError>> {
    match result {
        Err(ExecutionError::Fatal(e)) if e.is_not_found() => {
            debug!(operation = %e.operation, "Already gone");
            Ok(())
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct IdentityProvisioner {
    iam: Arc<dyn IamApi>,
    executor: Arc<ResilientExecutor>,
}

impl IdentityProvisioner {
    pub fn new(iam: Arc<dyn IamApi>, executor: Arc<ResilientExecutor>) -> Self {
        Self { iam, executor }
    }

    /// Create the ephemeral role, resolving a name clash per `on_conflict`
    pub async fn acquire(
        &self,
        name: &str,
        trusted_principal_arn: &str,
        on_conflict: ConflictPolicy,
        cancel: &CancellationToken,
    ) -> FinderResult<EphemeralIdentity> {
        if on_conflict == ConflictPolicy::Reuse {
            return Err(FinderError::ReuseRejected(name.to_string()));
        }

        let existing = self
            .executor
            .execute("GetRole", cancel, retry_transient, || self.iam.get_identity(name))
            .await
            .map_err(|e| provision_error(name, "GetRole", e))?;

        if let Some(existing) = existing {
            info!(identity = %name, arn = %existing.arn, "Role already exists");
            if on_conflict == ConflictPolicy::Fail {
                return Err(FinderError::AlreadyExists(name.to_string()));
            }
            info!(identity = %name, "Deleting existing role");
            self.purge(name, cancel)
                .await
                .map_err(|(op, e)| provision_error(name, op, e))?;
        }

        let trust = trust_policy(trusted_principal_arn).to_json()?;
        let create_attempts = AtomicU32::new(0);
        let created = self
            .executor
            .execute("CreateRole", cancel, retry_transient, || {
                create_attempts.fetch_add(1, Ordering::Relaxed);
                self.iam.create_identity(name, &trust)
            })
            .await;

        let record = match created {
            Ok(record) => record,
            // An earlier attempt created the role but its response was lost
            Err(ExecutionError::Fatal(e))
                if e.kind == ServiceErrorKind::AlreadyExists
                    && create_attempts.load(Ordering::Relaxed) > 1 =>
            {
                warn!(identity = %name, "Role appeared during CreateRole retries, adopting it");
                self.executor
                    .execute("GetRole", cancel, retry_transient, || self.iam.get_identity(name))
                    .await
                    .map_err(|e| provision_error(name, "GetRole", e))?
                    .ok_or_else(|| FinderError::ProvisionFailure {
                        name: name.to_string(),
                        source: e,
                    })?
            }
            Err(e) => return Err(provision_error(name, "CreateRole", e)),
        };

        info!(identity = %record.name, arn = %record.arn, "Created ephemeral role");
        Ok(EphemeralIdentity::new(
            record.name,
            record.arn,
            trusted_principal_arn.to_string(),
        ))
    }

    /// Put `policy` into the single condition slot, replacing whatever was there
    pub async fn attach_condition(
        &self,
        identity: &mut EphemeralIdentity,
        policy: &ConditionPolicy,
        cancel: &CancellationToken,
    ) -> FinderResult<()> {
        let document = policy.to_document().to_json()?;
        let name = identity.name.clone();

        self.executor
            .execute("PutRolePolicy", cancel, retry_transient, || {
                self.iam
                    .put_inline_authorization(&name, CONDITION_POLICY_NAME, &document)
            })
            .await
            .map_err(|e| {
                e.into_finder_error("PutRolePolicy", |e| {
                    if e.is_access_denied() {
                        FinderError::PermissionDenied {
                            operation: "PutRolePolicy".to_string(),
                            message: e.message,
                        }
                    } else {
                        FinderError::ProbeFatal(e)
                    }
                })
            })?;

        debug!(identity = %name, sid = %policy.sid, "Attached condition policy");
        identity.attached_statement_name = Some(policy.sid.clone());
        Ok(())
    }

    /// Remove the condition policy; no-op when the slot is empty
    pub async fn detach_condition(
        &self,
        identity: &mut EphemeralIdentity,
        cancel: &CancellationToken,
    ) -> FinderResult<()> {
        if identity.attached_statement_name.is_none() {
            return Ok(());
        }
        let name = identity.name.clone();

        let result = self
            .executor
            .execute("DeleteRolePolicy", cancel, retry_transient, || {
                self.iam.delete_inline_authorization(&name, CONDITION_POLICY_NAME)
            })
            .await;
        ignore_not_found(result).map_err(|e| provision_error(&name, "DeleteRolePolicy", e))?;

        debug!(identity = %name, "Detached condition policy");
        identity.attached_statement_name = None;
        Ok(())
    }

    /// Detach everything and delete the role
    ///
    /// Runs to completion even after the run was cancelled.
    pub async fn release(&self, identity: &mut EphemeralIdentity) -> Result<(), TeardownFailure> {
        if identity.released {
            debug!(identity = %identity.name, "Role already released");
            return Ok(());
        }

        let teardown = CancellationToken::new();
        self.purge(&identity.name, &teardown)
            .await
            .map_err(|(_, e)| teardown_error(&identity.name, e))?;

        info!(identity = %identity.name, "Deleted ephemeral role");
        identity.attached_statement_name = None;
        identity.released = true;
        Ok(())
    }

    /// Delete every inline policy, then the role. Missing pieces are skipped.
    async fn purge(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), (&'static str, ExecutionError<ServiceError>)> {
        let listed = self
            .executor
            .execute("ListRolePolicies", cancel, retry_transient, || {
                self.iam.list_inline_authorization_names(name)
            })
            .await;

        let policies = match listed {
            Ok(policies) => policies,
            Err(ExecutionError::Fatal(e)) if e.is_not_found() => {
                debug!(identity = %name, "Role already gone");
                return Ok(());
            }
            Err(e) => return Err(("ListRolePolicies", e)),
        };

        for policy_name in &policies {
            let result = self
                .executor
                .execute("DeleteRolePolicy", cancel, retry_transient, || {
                    self.iam.delete_inline_authorization(name, policy_name)
                })
                .await;
            ignore_not_found(result).map_err(|e| ("DeleteRolePolicy", e))?;
            debug!(identity = %name, policy = %policy_name, "Deleted inline policy");
        }

        let result = self
            .executor
            .execute("DeleteRole", cancel, retry_transient, || {
                self.iam.delete_identity(name)
            })
            .await;
        ignore_not_found(result).map_err(|e| ("DeleteRole", e))
    }
}

/// Releases the identity if the owner never did
///
/// Dropping an armed guard spawns a best-effort release on the current tokio
/// runtime. Calling [`IdentityGuard::release`] disarms it.
pub struct IdentityGuard {
    provisioner: IdentityProvisioner,
    identity: EphemeralIdentity,
    armed: bool,
}

impl IdentityGuard {
    pub fn new(provisioner: IdentityProvisioner, identity: EphemeralIdentity) -> Self {
        Self {
            provisioner,
            identity,
            armed: true,
        }
    }

    pub fn identity(&self) -> &EphemeralIdentity {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut EphemeralIdentity {
        &mut self.identity
    }

    /// Release now. The guard does nothing on drop afterwards, whatever the
    /// result.
    pub async fn release(mut self) -> Result<(), TeardownFailure> {
        self.armed = false;
        self.provisioner.release(&mut self.identity).await
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if !self.armed || self.identity.released {
            return;
        }

        let name = self.identity.name.clone();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(identity = %name, "Role dropped without release, deleting in background");
                let provisioner = self.provisioner.clone();
                let mut identity = self.identity.clone();
                handle.spawn(async move {
                    if let Err(e) = provisioner.release(&mut identity).await {
                        warn!(
                            identity = %e.identity,
                            error = %e.message,
                            "Background role deletion failed"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(identity = %name, "No async runtime left, role must be deleted manually");
            }
        }
    }
}
