//! Probe Protocol
//!
//! Drives one run: provision the role, then for each candidate attach a
//! condition policy that only allows listing when the bucket belongs to that
//! account, list the bucket as the role, and read the answer off the result.
//!
//! The role is released on every way out of [`ProbeProtocol::run`], including
//! cancellation and panics. A protocol instance runs once.

use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aws::{IamApi, StorageApi, StsApi, TemporaryCaller};
use crate::config::{ProbeSettings, SESSION_NAME};
use crate::error::{FinderError, FinderResult};
use crate::executor::{retry_transient, ExecutionError, ResilientExecutor};
use crate::policy::ConditionPolicy;
use crate::provisioner::{IdentityGuard, IdentityProvisioner};
use crate::session::SessionExchanger;
use crate::types::{ProbeAttempt, ProbeOutcome, ProbeReport, ProbeState, ProbeTarget, Verdict};

pub struct ProbeProtocol {
    provisioner: IdentityProvisioner,
    exchanger: SessionExchanger,
    storage: Arc<dyn StorageApi>,
    executor: Arc<ResilientExecutor>,
    settings: ProbeSettings,
    state: ProbeState,
}

impl ProbeProtocol {
    pub fn new(
        iam: Arc<dyn IamApi>,
        sts: Arc<dyn StsApi>,
        storage: Arc<dyn StorageApi>,
        executor: Arc<ResilientExecutor>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            provisioner: IdentityProvisioner::new(iam, executor.clone()),
            exchanger: SessionExchanger::new(sts, executor.clone(), SESSION_NAME),
            storage,
            executor,
            settings,
            state: ProbeState::Idle,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    fn transition(&mut self, next: ProbeState) {
        debug!(from = %self.state, to = %next, "Probe state");
        self.state = next;
    }

    /// Probe `candidates` in order against `target`
    ///
    /// Always returns a report. Failures land in `result`; a role that could
    /// not be deleted lands in `teardown_warning` without touching `result`.
    pub async fn run(
        &mut self,
        target: &ProbeTarget,
        candidates: &[String],
        cancel: &CancellationToken,
    ) -> ProbeReport {
        let mut report = ProbeReport {
            target: target.clone(),
            result: Err(FinderError::ProtocolTornDown),
            attempts: Vec::new(),
            teardown_warning: None,
        };

        if self.state == ProbeState::TornDown {
            return report;
        }
        if candidates.is_empty() {
            report.result = Err(FinderError::NoCandidates);
            return report;
        }

        let mut guard = match self.provision(cancel).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(error = %e, "Could not provision role");
                self.transition(ProbeState::TornDown);
                report.result = Err(e);
                return report;
            }
        };
        self.transition(ProbeState::Provisioned);

        let outcome = AssertUnwindSafe(self.probe_candidates(
            &mut guard,
            target,
            candidates,
            &mut report.attempts,
            cancel,
        ))
        .catch_unwind()
        .await;

        if let Err(failure) = guard.release().await {
            warn!(identity = %failure.identity, error = %failure.message, "Role teardown failed");
            report.teardown_warning = Some(failure);
        }
        self.transition(ProbeState::TornDown);

        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    error!(error = %e, "Probe run aborted");
                }
                report.result = result;
                report
            }
            Err(panic) => resume_unwind(panic),
        }
    }

    async fn provision(&self, cancel: &CancellationToken) -> FinderResult<IdentityGuard> {
        let caller = self.exchanger.caller_arn(cancel).await?;
        let identity = self
            .provisioner
            .acquire(
                &self.settings.identity_name,
                &caller,
                self.settings.on_conflict,
                cancel,
            )
            .await?;
        Ok(IdentityGuard::new(self.provisioner.clone(), identity))
    }

    async fn probe_candidates(
        &mut self,
        guard: &mut IdentityGuard,
        target: &ProbeTarget,
        candidates: &[String],
        attempts: &mut Vec<ProbeAttempt>,
        cancel: &CancellationToken,
    ) -> FinderResult<Verdict> {
        self.settle(cancel).await?;

        let mut cached_session: Option<TemporaryCaller> = None;
        let mut consecutive_inconclusive = 0;
        let mut inconclusive_attempts = 0;

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(FinderError::Cancelled);
            }

            let policy = ConditionPolicy::resource_owner(&target.bucket, candidate);
            self.provisioner
                .attach_condition(guard.identity_mut(), &policy, cancel)
                .await?;
            self.transition(ProbeState::PolicyAttached);
            self.settle(cancel).await?;

            let session = match cached_session.take() {
                Some(session) => session,
                None => self.exchanger.assume(guard.identity(), cancel).await?,
            };
            self.transition(ProbeState::Exchanged);

            self.transition(ProbeState::ProbeIssued);
            let outcome = self.issue_probe(target, &session, cancel).await?;
            self.transition(ProbeState::Evaluated);

            attempts.push(ProbeAttempt::new(candidate.as_str(), outcome.clone()));

            match outcome {
                ProbeOutcome::Granted { keys } => {
                    info!(
                        candidate = %candidate,
                        objects = keys.len(),
                        "Access granted: bucket owner found"
                    );
                    return Ok(Verdict::Confirmed {
                        account_id: candidate.clone(),
                    });
                }
                ProbeOutcome::Denied => {
                    info!(candidate = %candidate, "Access denied: not the owner");
                    consecutive_inconclusive = 0;
                }
                ProbeOutcome::Inconclusive { error } => {
                    warn!(candidate = %candidate, error = %error, "Probe inconclusive");
                    consecutive_inconclusive += 1;
                    inconclusive_attempts += 1;

                    let limit = self.settings.max_consecutive_inconclusive;
                    if limit > 0 && consecutive_inconclusive >= limit {
                        error!(
                            consecutive = consecutive_inconclusive,
                            "Too many inconclusive probes in a row, aborting"
                        );
                        return Ok(Verdict::Inconclusive {
                            inconclusive_attempts,
                        });
                    }
                }
            }

            self.provisioner
                .detach_condition(guard.identity_mut(), cancel)
                .await?;
            cached_session = Some(session);
        }

        if inconclusive_attempts > 0 {
            Ok(Verdict::Inconclusive {
                inconclusive_attempts,
            })
        } else {
            Ok(Verdict::Excluded)
        }
    }

    /// One resilient list call as the assumed role
    ///
    /// Only cancellation is an error here; every other failure is an outcome.
    async fn issue_probe(
        &self,
        target: &ProbeTarget,
        caller: &TemporaryCaller,
        cancel: &CancellationToken,
    ) -> FinderResult<ProbeOutcome> {
        let result = self
            .executor
            .execute("ListObjectsV2", cancel, retry_transient, || {
                self.storage
                    .list_objects(&target.bucket, &target.prefix, caller)
            })
            .await;

        Ok(match result {
            Ok(keys) => ProbeOutcome::Granted { keys },
            Err(ExecutionError::Fatal(e)) if e.is_access_denied() => ProbeOutcome::Denied,
            Err(ExecutionError::Fatal(e)) => ProbeOutcome::Inconclusive {
                error: e.to_string(),
            },
            Err(ExecutionError::RetriesExhausted { attempts, last }) => {
                ProbeOutcome::Inconclusive {
                    error: format!("gave up after {attempts} attempts: {last}"),
                }
            }
            Err(ExecutionError::Cancelled) => return Err(FinderError::Cancelled),
        })
    }

    /// Give IAM time to propagate the last change
    async fn settle(&self, cancel: &CancellationToken) -> FinderResult<()> {
        let delay = self.settings.settle_delay;
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for IAM propagation");
        }
        self.executor.pause(delay, cancel).await
    }
}
