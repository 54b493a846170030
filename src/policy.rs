//! IAM policy documents
//!
//! Builders for the two documents the finder writes into the operator's
//! account: the role trust policy and the per-candidate condition policy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// IAM policy language version
pub const POLICY_VERSION: &str = "2012-10-17";

/// Condition key holding the account that owns the S3 resource
pub const RESOURCE_ACCOUNT_KEY: &str = "s3:ResourceAccount";

/// Sid of the probe statement
pub const PROBE_SID: &str = "S3AccountProbe";

/// Actions the probe statement grants when its condition holds
pub const PROBE_ACTIONS: &[&str] = &["s3:ListBucket", "s3:GetObject"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// A policy field that may hold one string or a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn from_vec(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            Self::One(values.remove(0))
        } else {
            Self::Many(values)
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::One(v) => v == value,
            Self::Many(values) => values.iter().any(|v| v == value),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Condition block: operator -> condition key -> value(s)
pub type Condition = BTreeMap<String, BTreeMap<String, OneOrMany>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<BTreeMap<String, String>>,
    pub action: OneOrMany,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }
}

/// Trust policy letting exactly one principal assume the role
#[must_use]
pub fn trust_policy(trusted_principal_arn: &str) -> PolicyDocument {
    let principal = BTreeMap::from([("AWS".to_string(), trusted_principal_arn.to_string())]);

    PolicyDocument {
        version: POLICY_VERSION.to_string(),
        statement: vec![Statement {
            sid: None,
            effect: Effect::Allow,
            principal: Some(principal),
            action: OneOrMany::One("sts:AssumeRole".to_string()),
            resource: None,
            condition: None,
        }],
    }
}

/// A single authorization statement guarded by a condition
///
/// Built independently of attachment so the protocol can swap candidates
/// without touching the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionPolicy {
    pub sid: String,
    pub effect: Effect,
    pub actions: BTreeSet<String>,
    pub resources: Vec<String>,
    pub condition: Condition,
}

impl ConditionPolicy {
    /// Start an `Allow` statement with no actions, resources or conditions
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            effect: Effect::Allow,
            actions: BTreeSet::new(),
            resources: Vec::new(),
            condition: Condition::new(),
        }
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.insert(action.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
        self
    }

    /// Add `operator { key: value }`; a repeated key replaces its value
    pub fn condition(
        mut self,
        operator: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.condition
            .entry(operator.into())
            .or_default()
            .insert(key.into(), OneOrMany::One(value.into()));
        self
    }

    /// Grants list/get on `bucket` only if the bucket is owned by `account_id`
    pub fn resource_owner(bucket: &str, account_id: &str) -> Self {
        PROBE_ACTIONS
            .iter()
            .fold(Self::new(PROBE_SID), |policy, action| policy.action(*action))
            .resource(format!("arn:aws:s3:::{bucket}"))
            .resource(format!("arn:aws:s3:::{bucket}/*"))
            .condition("StringEquals", RESOURCE_ACCOUNT_KEY, account_id)
    }

    pub fn to_statement(&self) -> Statement {
        Statement {
            sid: Some(self.sid.clone()),
            effect: self.effect,
            principal: None,
            action: OneOrMany::from_vec(self.actions.iter().cloned().collect()),
            resource: Some(OneOrMany::from_vec(self.resources.clone())),
            condition: (!self.condition.is_empty()).then(|| self.condition.clone()),
        }
    }

    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            version: POLICY_VERSION.to_string(),
            statement: vec![self.to_statement()],
        }
    }
}
