//! In-memory AWS for tests
//!
//! One `FakeAws` plays IAM, STS and S3 at once. S3 decides grant/deny by
//! reading the condition policies attached to the role behind the caller's
//! credentials, the same way the real condition-key oracle behaves.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    IamApi, IdentityRecord, ServiceError, ServiceErrorKind, StorageApi, StsApi, TemporaryCaller,
    TemporaryCredentials,
};
use crate::policy::{Effect, PolicyDocument, RESOURCE_ACCOUNT_KEY};

pub(crate) const FAKE_ACCOUNT: &str = "999999999999";
pub(crate) const FAKE_CALLER_ARN: &str = "arn:aws:iam::999999999999:user/operator";

#[derive(Debug, Clone)]
pub(crate) struct FakeRole {
    pub arn: String,
    pub trust_policy: String,
    pub policies: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    bucket_owner: String,
    objects: Vec<String>,
    roles: BTreeMap<String, FakeRole>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<ServiceError>>,
    panic_on: Option<String>,
    /// access key id -> role name
    sessions: HashMap<String, String>,
    /// Candidate each ListObjectsV2 call was evaluated against
    probed: Vec<String>,
    /// Access key used by each ListObjectsV2 call
    storage_callers: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeAws {
    state: Mutex<FakeState>,
}

impl FakeAws {
    /// A bucket owned by `bucket_owner` holding `objects`
    pub fn new(bucket_owner: &str, objects: &[&str]) -> Self {
        Self {
            state: Mutex::new(FakeState {
                bucket_owner: bucket_owner.to_string(),
                objects: objects.iter().map(|o| o.to_string()).collect(),
                ..FakeState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-create a role, optionally with inline policies
    pub fn with_role(self, name: &str, policies: &[(&str, &str)]) -> Self {
        self.state().roles.insert(
            name.to_string(),
            FakeRole {
                arn: role_arn(name),
                trust_policy: "{}".to_string(),
                policies: policies
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        self
    }

    /// Queue a failure for the next call of `operation`
    pub fn fail_next(&self, operation: &str, error: ServiceError) {
        self.state()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn fail_times(&self, operation: &str, times: usize, error: ServiceError) {
        for _ in 0..times {
            self.fail_next(operation, error.clone());
        }
    }

    /// Panic on the next call of `operation`
    pub fn panic_on(&self, operation: &str) {
        self.state().panic_on = Some(operation.to_string());
    }

    /// Delete a role behind the tool's back
    pub fn remove_role_out_of_band(&self, name: &str) {
        self.state().roles.remove(name);
    }

    pub fn role(&self, name: &str) -> Option<FakeRole> {
        self.state().roles.get(name).cloned()
    }

    pub fn role_count(&self) -> usize {
        self.state().roles.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn probed(&self) -> Vec<String> {
        self.state().probed.clone()
    }

    pub fn storage_callers(&self) -> Vec<String> {
        self.state().storage_callers.clone()
    }

    /// Record the call, then fire any scripted panic or failure
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, FakeState>, ServiceError> {
        let mut state = self.state();
        state.calls.push(operation.to_string());

        if state.panic_on.as_deref() == Some(operation) {
            state.panic_on = None;
            drop(state);
            panic!("injected panic in {operation}");
        }

        if let Some(err) = state
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(state)
    }
}

pub(crate) fn role_arn(name: &str) -> String {
    format!("arn:aws:iam::{FAKE_ACCOUNT}:role/{name}")
}

pub(crate) fn access_denied(operation: &str) -> ServiceError {
    ServiceError::from_code(operation, "AccessDenied", "Access Denied")
}

pub(crate) fn throttled(operation: &str) -> ServiceError {
    ServiceError::from_code(operation, "Throttling", "Rate exceeded")
}

fn missing_role(operation: &str, name: &str) -> ServiceError {
    ServiceError::from_code(operation, "NoSuchEntity", format!("role {name} not found"))
}

/// Candidate account an inline policy grants ListBucket for, if any
fn granted_account(document: &str) -> Option<String> {
    let doc = PolicyDocument::from_json(document).ok()?;
    doc.statement
        .iter()
        .filter(|s| s.effect == Effect::Allow && s.action.contains("s3:ListBucket"))
        .find_map(|s| {
            s.condition
                .as_ref()?
                .get("StringEquals")?
                .get(RESOURCE_ACCOUNT_KEY)
                .map(|v| v.values().join(","))
        })
}

#[async_trait]
impl IamApi for FakeAws {
    async fn create_identity(
        &self,
        name: &str,
        trust_policy: &str,
    ) -> Result<IdentityRecord, ServiceError> {
        let mut state = self.enter("CreateRole")?;
        if state.roles.contains_key(name) {
            return Err(ServiceError::from_code(
                "CreateRole",
                "EntityAlreadyExists",
                format!("Role with name {name} already exists."),
            ));
        }
        let arn = role_arn(name);
        state.roles.insert(
            name.to_string(),
            FakeRole {
                arn: arn.clone(),
                trust_policy: trust_policy.to_string(),
                policies: BTreeMap::new(),
            },
        );
        Ok(IdentityRecord {
            name: name.to_string(),
            arn,
        })
    }

    async fn delete_identity(&self, name: &str) -> Result<(), ServiceError> {
        let mut state = self.enter("DeleteRole")?;
        let has_policies = match state.roles.get(name) {
            None => return Err(missing_role("DeleteRole", name)),
            Some(role) => !role.policies.is_empty(),
        };
        if has_policies {
            return Err(ServiceError::from_code(
                "DeleteRole",
                "DeleteConflict",
                "Cannot delete entity, must delete policies first.",
            ));
        }
        state.roles.remove(name);
        Ok(())
    }

    async fn put_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ServiceError> {
        let mut state = self.enter("PutRolePolicy")?;
        let role = state
            .roles
            .get_mut(identity)
            .ok_or_else(|| missing_role("PutRolePolicy", identity))?;
        role.policies
            .insert(policy_name.to_string(), document.to_string());
        Ok(())
    }

    async fn delete_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
    ) -> Result<(), ServiceError> {
        let mut state = self.enter("DeleteRolePolicy")?;
        let role = state
            .roles
            .get_mut(identity)
            .ok_or_else(|| missing_role("DeleteRolePolicy", identity))?;
        role.policies.remove(policy_name).map(|_| ()).ok_or_else(|| {
            ServiceError::from_code(
                "DeleteRolePolicy",
                "NoSuchEntity",
                format!("policy {policy_name} not found"),
            )
        })
    }

    async fn list_inline_authorization_names(
        &self,
        identity: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let state = self.enter("ListRolePolicies")?;
        let role = state
            .roles
            .get(identity)
            .ok_or_else(|| missing_role("ListRolePolicies", identity))?;
        Ok(role.policies.keys().cloned().collect())
    }

    async fn get_identity(&self, name: &str) -> Result<Option<IdentityRecord>, ServiceError> {
        let state = self.enter("GetRole")?;
        Ok(state.roles.get(name).map(|role| IdentityRecord {
            name: name.to_string(),
            arn: role.arn.clone(),
        }))
    }
}

/// IAM whose first CreateRole succeeds remotely but reports a timeout
pub(crate) struct LostCreateResponse {
    inner: Arc<FakeAws>,
    lost: AtomicBool,
}

impl LostCreateResponse {
    pub fn new(inner: Arc<FakeAws>) -> Self {
        Self {
            inner,
            lost: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl IamApi for LostCreateResponse {
    async fn create_identity(
        &self,
        name: &str,
        trust_policy: &str,
    ) -> Result<IdentityRecord, ServiceError> {
        let record = self.inner.create_identity(name, trust_policy).await?;
        if self.lost.swap(true, Ordering::SeqCst) {
            Ok(record)
        } else {
            Err(ServiceError::new(
                ServiceErrorKind::Transient,
                "CreateRole",
                None,
                "request timed out",
            ))
        }
    }

    async fn delete_identity(&self, name: &str) -> Result<(), ServiceError> {
        self.inner.delete_identity(name).await
    }

    async fn put_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ServiceError> {
        self.inner
            .put_inline_authorization(identity, policy_name, document)
            .await
    }

    async fn delete_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
    ) -> Result<(), ServiceError> {
        self.inner
            .delete_inline_authorization(identity, policy_name)
            .await
    }

    async fn list_inline_authorization_names(
        &self,
        identity: &str,
    ) -> Result<Vec<String>, ServiceError> {
        self.inner.list_inline_authorization_names(identity).await
    }

    async fn get_identity(&self, name: &str) -> Result<Option<IdentityRecord>, ServiceError> {
        self.inner.get_identity(name).await
    }
}

#[async_trait]
impl StsApi for FakeAws {
    async fn get_caller_identity(&self) -> Result<String, ServiceError> {
        self.enter("GetCallerIdentity")?;
        Ok(FAKE_CALLER_ARN.to_string())
    }

    async fn assume_identity(
        &self,
        arn: &str,
        session_name: &str,
    ) -> Result<TemporaryCaller, ServiceError> {
        let mut state = self.enter("AssumeRole")?;
        let name = state
            .roles
            .iter()
            .find(|(_, role)| role.arn == arn)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| access_denied("AssumeRole"))?;

        let access_key_id = format!("ASIA{}", state.sessions.len() + 1);
        state.sessions.insert(access_key_id.clone(), name.clone());

        Ok(TemporaryCaller {
            arn: format!("arn:aws:sts::{FAKE_ACCOUNT}:assumed-role/{name}/{session_name}"),
            credentials: TemporaryCredentials {
                access_key_id,
                secret_access_key: "fake-secret".to_string(),
                session_token: "fake-token".to_string(),
                expiration: None,
            },
        })
    }
}

#[async_trait]
impl StorageApi for FakeAws {
    async fn list_objects(
        &self,
        _bucket: &str,
        prefix: &str,
        caller: &TemporaryCaller,
    ) -> Result<Vec<String>, ServiceError> {
        let mut state = self.enter("ListObjectsV2")?;
        let key = caller.credentials.access_key_id.clone();
        state.storage_callers.push(key.clone());

        let role = state
            .sessions
            .get(&key)
            .and_then(|name| state.roles.get(name))
            .cloned()
            .ok_or_else(|| {
                ServiceError::new(
                    ServiceErrorKind::Other,
                    "ListObjectsV2",
                    Some("InvalidAccessKeyId"),
                    "session no longer valid",
                )
            })?;

        let tested: Vec<String> = role
            .policies
            .values()
            .filter_map(|d| granted_account(d))
            .collect();
        state.probed.push(tested.join("|"));

        if tested.iter().any(|account| *account == state.bucket_owner) {
            Ok(state
                .objects
                .iter()
                .filter(|o| o.starts_with(prefix))
                .cloned()
                .collect())
        } else {
            Err(access_denied("ListObjectsV2"))
        }
    }
}
