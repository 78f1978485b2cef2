use super::{PolicyDecision, PolicyError, PolicyEvaluator, PolicyInput, NO_BINDING};
use crate::config::PolicyConfig;
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Wraps the decision context in OPA's `input` document.
/// https://www.openpolicyagent.org/docs/latest/integration/#named-policy-decisions
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OpaRequest<T> {
    pub input: T,
}

/// OPA omits `result` when the queried rule is undefined
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct OpaResponse<T> {
    #[serde(default)]
    pub result: Option<T>,
}

#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("Failed to send request to OPA: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("OPA request failed with status: {0}")]
    InvalidStatus(StatusCode),
    #[error("Failed to parse OPA response: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl From<ForwardingError> for PolicyError {
    fn from(err: ForwardingError) -> Self {
        match err {
            ForwardingError::ParseError(err) => Self::Evaluation(err.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Prepared query against a remote Open Policy Agent
#[derive(Clone)]
pub struct OpaPolicy {
    client: Client,
    base_url: String,
    path: String,
    version: String,
}

impl OpaPolicy {
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.query_timeout)
            .connect_timeout(config.query_timeout.min(Duration::from_secs(2)))
            .default_headers(headers)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|err| PolicyError::Config(err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.opa_url.trim_end_matches('/').to_string(),
            path: config.opa_path.trim_matches('/').to_string(),
            version: config.version.clone(),
        })
    }

    fn decision_url(&self) -> String {
        format!("{}/v1/data/{}", self.base_url, self.path)
    }

    async fn send_raw_request_to_opa<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &OpaRequest<B>,
    ) -> Result<OpaResponse<R>, ForwardingError> {
        debug!("Querying OPA at: {}", url);
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(ForwardingError::InvalidStatus(response.status()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn decision_from(&self, result: Option<Value>) -> Result<PolicyDecision, PolicyError> {
        let Some(Value::Object(result)) = result else {
            return Ok(self.no_binding());
        };
        let allow = match result.get("allow") {
            None | Some(Value::Null) => return Ok(self.no_binding()),
            Some(Value::Bool(allow)) => *allow,
            Some(other) => {
                return Err(PolicyError::Evaluation(format!(
                    "allow must be a boolean, got {}",
                    other
                )))
            }
        };
        let reason = result
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                let fallback = if allow { "allowed by policy" } else { "denied by policy" };
                fallback.to_string()
            });
        let policy_version = result
            .get("policyVersion")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.version.clone());

        Ok(PolicyDecision {
            allow,
            reason,
            policy_version,
        })
    }

    fn no_binding(&self) -> PolicyDecision {
        PolicyDecision {
            allow: false,
            reason: NO_BINDING.to_string(),
            policy_version: self.version.clone(),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for OpaPolicy {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        let request = OpaRequest { input };
        let response: OpaResponse<Value> = self
            .send_raw_request_to_opa(&self.decision_url(), &request)
            .await?;
        self.decision_from(response.result)
    }

    async fn health_check(&self) -> Result<(), String> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("OPA unreachable: {}", err))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("OPA health returned {}", response.status()))
        }
    }
}
