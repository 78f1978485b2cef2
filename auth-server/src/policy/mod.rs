use crate::config::{PolicyConfig, PolicyEngine};
use crate::resolver::{DirectPermissions, RolePermissions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod builtin;
pub mod opa;

/// Reason reported when the policy produced no `allow` value at all
pub const NO_BINDING: &str = "no binding";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy evaluation failed: {0}")]
    Evaluation(String),
    #[error("Policy engine unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to build policy client: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySubject {
    pub id: String,
    pub role: String,
    pub account_type: String,
    #[serde(rename = "franchiseID")]
    pub franchise_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPermissions {
    pub role_grants: RolePermissions,
    pub direct: DirectPermissions,
}

/// Decision context handed to the evaluator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyInput {
    pub subject: PolicySubject,
    pub request: PolicyRequest,
    pub perms: PolicyPermissions,
    /// Unix seconds
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: String,
    pub policy_version: String,
}

#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError>;

    async fn health_check(&self) -> Result<(), String>;
}

/// Evaluator selected at boot
#[derive(Clone)]
pub enum Policy {
    Builtin(builtin::BuiltinPolicy),
    Opa(opa::OpaPolicy),
}

impl Policy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        match config.engine {
            PolicyEngine::Builtin => Ok(Self::Builtin(builtin::BuiltinPolicy::new(&config.version))),
            PolicyEngine::Opa => Ok(Self::Opa(opa::OpaPolicy::new(config)?)),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        match self {
            Self::Builtin(_) => "builtin",
            Self::Opa(_) => "opa",
        }
    }
}

#[async_trait]
impl PolicyEvaluator for Policy {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        match self {
            Self::Builtin(policy) => policy.evaluate(input).await,
            Self::Opa(policy) => policy.evaluate(input).await,
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        match self {
            Self::Builtin(policy) => policy.health_check().await,
            Self::Opa(policy) => policy.health_check().await,
        }
    }
}
