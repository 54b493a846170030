//! AWS SDK bindings
//!
//! Binds the collaborator traits to `aws-sdk-iam`, `aws-sdk-sts` and
//! `aws-sdk-s3`. All three clients come from one resolved `SdkConfig` with
//! SDK-internal retries disabled; retry policy belongs to the executor.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::config::Credentials;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    IamApi, IdentityRecord, ServiceError, ServiceErrorKind, StorageApi, StsApi, TemporaryCaller,
    TemporaryCredentials,
};
use crate::config::AwsSettings;

/// Provider name attached to the assumed-role credentials
const CREDENTIALS_PROVIDER: &str = "s3-account-finder";

/// Resolve the AWS context once for the whole run
pub async fn load_sdk_config(settings: &AwsSettings) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.region.clone()))
        .retry_config(RetryConfig::disabled());

    if let Some(profile) = &settings.profile {
        loader = loader.profile_name(profile);
    }

    loader.load().await
}

/// Flatten an SDK failure into a classified `ServiceError`
fn service_error<E, R>(operation: &str, err: SdkError<E, R>) -> ServiceError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ServiceError::new(ServiceErrorKind::Transient, operation, None, message)
        }
        SdkError::ServiceError(context) => {
            let source = context.err();
            let detail = source.message().unwrap_or_default();
            match source.code() {
                Some(code) => ServiceError::from_code(operation, code, detail),
                None => ServiceError::new(ServiceErrorKind::Other, operation, None, message),
            }
        }
        _ => ServiceError::new(ServiceErrorKind::Other, operation, None, message),
    }
}

fn missing_field(operation: &str, field: &str) -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::Other,
        operation,
        None,
        format!("response missing {field}"),
    )
}

/// IAM role management
#[derive(Debug, Clone)]
pub struct SdkIam {
    client: aws_sdk_iam::Client,
}

impl SdkIam {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_iam::Client::new(config),
        }
    }
}

#[async_trait]
impl IamApi for SdkIam {
    async fn create_identity(
        &self,
        name: &str,
        trust_policy: &str,
    ) -> Result<IdentityRecord, ServiceError> {
        let out = self
            .client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .send()
            .await
            .map_err(|e| service_error("CreateRole", e))?;

        let role = out.role().ok_or_else(|| missing_field("CreateRole", "Role"))?;
        Ok(IdentityRecord {
            name: role.role_name().to_string(),
            arn: role.arn().to_string(),
        })
    }

    async fn delete_identity(&self, name: &str) -> Result<(), ServiceError> {
        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| service_error("DeleteRole", e))?;
        Ok(())
    }

    async fn put_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ServiceError> {
        self.client
            .put_role_policy()
            .role_name(identity)
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(|e| service_error("PutRolePolicy", e))?;
        Ok(())
    }

    async fn delete_inline_authorization(
        &self,
        identity: &str,
        policy_name: &str,
    ) -> Result<(), ServiceError> {
        self.client
            .delete_role_policy()
            .role_name(identity)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| service_error("DeleteRolePolicy", e))?;
        Ok(())
    }

    async fn list_inline_authorization_names(
        &self,
        identity: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let out = self
                .client
                .list_role_policies()
                .role_name(identity)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| service_error("ListRolePolicies", e))?;

            names.extend(out.policy_names().iter().cloned());

            match out.marker() {
                Some(next) if out.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn get_identity(&self, name: &str) -> Result<Option<IdentityRecord>, ServiceError> {
        match self.client.get_role().role_name(name).send().await {
            Ok(out) => Ok(out.role().map(|role| IdentityRecord {
                name: role.role_name().to_string(),
                arn: role.arn().to_string(),
            })),
            Err(e) => {
                let err = service_error("GetRole", e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Caller lookup and role assumption
#[derive(Debug, Clone)]
pub struct SdkSts {
    client: aws_sdk_sts::Client,
}

impl SdkSts {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_sts::Client::new(config),
        }
    }
}

#[async_trait]
impl StsApi for SdkSts {
    async fn get_caller_identity(&self) -> Result<String, ServiceError> {
        let out = self
            .client
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| service_error("GetCallerIdentity", e))?;

        out.arn()
            .map(str::to_string)
            .ok_or_else(|| missing_field("GetCallerIdentity", "Arn"))
    }

    async fn assume_identity(
        &self,
        arn: &str,
        session_name: &str,
    ) -> Result<TemporaryCaller, ServiceError> {
        let out = self
            .client
            .assume_role()
            .role_arn(arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(|e| service_error("AssumeRole", e))?;

        let creds = out
            .credentials()
            .ok_or_else(|| missing_field("AssumeRole", "Credentials"))?;
        let assumed_arn = out
            .assumed_role_user()
            .map(|user| user.arn().to_string())
            .unwrap_or_else(|| arn.to_string());
        let expiration = DateTime::<Utc>::from_timestamp(creds.expiration().secs(), 0);

        Ok(TemporaryCaller {
            arn: assumed_arn,
            credentials: TemporaryCredentials {
                access_key_id: creds.access_key_id().to_string(),
                secret_access_key: creds.secret_access_key().to_string(),
                session_token: creds.session_token().to_string(),
                expiration,
            },
        })
    }
}

/// S3 listing as an assumed caller
///
/// One client per access key, built on first use from the shared config.
#[derive(Debug)]
pub struct SdkStorage {
    base: SdkConfig,
    clients: Mutex<HashMap<String, aws_sdk_s3::Client>>,
}

impl SdkStorage {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            base: config.clone(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, caller: &TemporaryCaller) -> aws_sdk_s3::Client {
        let creds = &caller.credentials;
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        clients
            .entry(creds.access_key_id.clone())
            .or_insert_with(|| {
                debug!(caller = %caller.arn, "Building S3 client for assumed caller");
                let credentials = Credentials::new(
                    &creds.access_key_id,
                    &creds.secret_access_key,
                    Some(creds.session_token.clone()),
                    creds.expiration.map(Into::into),
                    CREDENTIALS_PROVIDER,
                );
                let config = aws_sdk_s3::config::Builder::from(&self.base)
                    .credentials_provider(credentials)
                    .build();
                aws_sdk_s3::Client::from_conf(config)
            })
            .clone()
    }
}

#[async_trait]
impl StorageApi for SdkStorage {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        caller: &TemporaryCaller,
    ) -> Result<Vec<String>, ServiceError> {
        let client = self.client_for(caller);
        let mut request = client.list_objects_v2().bucket(bucket);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }

        let out = request
            .send()
            .await
            .map_err(|e| service_error("ListObjectsV2", e))?;

        Ok(out
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect())
    }
}
