use crate::config::DecisionConfig;
use crate::decision_cache::{postfix, tenant_prefix, CacheError, DecisionCache};
use crate::policy::{
    Policy, PolicyDecision, PolicyError, PolicyEvaluator, PolicyInput, PolicyPermissions,
    PolicyRequest, PolicySubject,
};
use crate::resolver::{AccountRole, Resolver, ResolverError, SubjectResolver};
use crate::validation;
use futures::future::try_join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

pub const INVALID_ASSOCIATION: &str = "invalid association between account and franchise";

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("{0} is required")]
    InputMissing(&'static str),
    #[error("Permission lookup failed: {0}")]
    Dependency(#[from] ResolverError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome of one access check, as cached and as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    /// Unix seconds
    pub issued_at: i64,
    /// Unix seconds
    pub expires_at: i64,
    pub policy_version: String,
}

/// The account a decision is made for, scoped to one franchise. Everything
/// else about it is read from the subject store, so a decision never depends
/// on who asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub franchise_id: String,
    pub account_id: String,
}

impl Subject {
    fn validate(&self) -> Result<(), AuthzError> {
        require(&self.franchise_id, "franchiseID")?;
        require(&self.account_id, "accountID")
    }
}

/// Everything the evaluator needs about a subject, resolved once per call
struct Resolved {
    role: AccountRole,
    perms: PolicyPermissions,
}

/// Single and batch access decisions over the subject store, the policy
/// evaluator and the decision cache.
#[derive(Clone)]
pub struct AuthzService {
    resolver: Arc<Resolver>,
    policy: Arc<Policy>,
    cache: Option<DecisionCache>,
    ttl: Duration,
    policy_version: String,
}

impl AuthzService {
    pub fn new(
        resolver: Arc<Resolver>,
        policy: Arc<Policy>,
        cache: DecisionCache,
        config: &DecisionConfig,
        policy_version: &str,
    ) -> Self {
        Self {
            resolver,
            policy,
            cache: config.cache_enabled.then_some(cache),
            ttl: config.ttl,
            policy_version: policy_version.to_string(),
        }
    }

    pub async fn is_authorized(
        &self,
        subject: &Subject,
        resource: &str,
        action: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Decision, AuthzError> {
        subject.validate()?;
        require(resource, "resource")?;
        require(action, "action")?;

        let tenant = tenant_prefix(&subject.franchise_id, &subject.account_id);
        let key = postfix(resource, action, context);
        if let Some(decision) = self.cached(&tenant, &key).await {
            return Ok(decision);
        }

        let decision = match self.resolve(subject).await? {
            Some(resolved) => {
                self.evaluate(subject, &resolved, resource, action, context)
                    .await?
            }
            None => self.association_denied(),
        };
        self.remember(&tenant, &key, &decision).await;
        Ok(decision)
    }

    /// One decision per input pair, in input order. Duplicate pairs are
    /// evaluated once and share the answer.
    pub async fn is_authorized_batch(
        &self,
        subject: &Subject,
        pairs: &[(String, String)],
        context: &BTreeMap<String, String>,
    ) -> Result<Vec<Decision>, AuthzError> {
        subject.validate()?;
        if pairs.is_empty() {
            return Err(AuthzError::InputMissing("checks"));
        }
        for (resource, action) in pairs {
            require(resource, "resource")?;
            require(action, "action")?;
        }

        let mut unique: Vec<(&str, &str)> = Vec::new();
        let mut positions: HashMap<(&str, &str), usize> = HashMap::new();
        for (resource, action) in pairs {
            let pair = (resource.as_str(), action.as_str());
            if !positions.contains_key(&pair) {
                positions.insert(pair, unique.len());
                unique.push(pair);
            }
        }

        let tenant = tenant_prefix(&subject.franchise_id, &subject.account_id);
        let keys: Vec<String> = unique
            .iter()
            .map(|(resource, action)| postfix(resource, action, context))
            .collect();
        let mut answers: Vec<Option<Decision>> = Vec::with_capacity(unique.len());
        for key in &keys {
            answers.push(self.cached(&tenant, key).await);
        }

        if answers.iter().any(Option::is_none) {
            let resolved = self.resolve(subject).await?;
            let tenant = tenant.as_str();
            let pending = unique
                .iter()
                .zip(&keys)
                .zip(&answers)
                .filter(|(_, answer)| answer.is_none())
                .map(|(((resource, action), key), _)| {
                    let resolved = resolved.as_ref();
                    async move {
                        let decision = match resolved {
                            Some(resolved) => {
                                self.evaluate(subject, resolved, resource, action, context)
                                    .await?
                            }
                            None => self.association_denied(),
                        };
                        self.remember(tenant, key, &decision).await;
                        Ok::<_, AuthzError>(decision)
                    }
                });
            let mut fresh = try_join_all(pending).await?.into_iter();
            for answer in answers.iter_mut().filter(|answer| answer.is_none()) {
                *answer = fresh.next();
            }
        }

        let results: Vec<Decision> = pairs
            .iter()
            .filter_map(|(resource, action)| {
                positions
                    .get(&(resource.as_str(), action.as_str()))
                    .and_then(|&index| answers[index].clone())
            })
            .collect();
        if results.len() != pairs.len() {
            return Err(AuthzError::Internal(format!(
                "batch produced {} decisions for {} checks",
                results.len(),
                pairs.len()
            )));
        }
        Ok(results)
    }

    /// `None` when the account is not bound to the franchise. Permissions are
    /// only fetched for a valid binding.
    async fn resolve(&self, subject: &Subject) -> Result<Option<Resolved>, AuthzError> {
        let role = match self
            .resolver
            .get_account_role(&subject.franchise_id, &subject.account_id)
            .await
        {
            Ok(role) => role,
            Err(ResolverError::NotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if role.account_id != subject.account_id || role.franchise_id != subject.franchise_id {
            warn!(
                "Account {} resolved to a foreign franchise binding",
                subject.account_id
            );
            return Ok(None);
        }

        let (role_grants, direct) = tokio::try_join!(
            self.resolver.get_role_permissions(&role.role_id),
            self.resolver.get_direct_permissions(&subject.account_id),
        )?;
        Ok(Some(Resolved {
            role,
            perms: PolicyPermissions {
                role_grants,
                direct,
            },
        }))
    }

    async fn evaluate(
        &self,
        subject: &Subject,
        resolved: &Resolved,
        resource: &str,
        action: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Decision, AuthzError> {
        let now = chrono::Utc::now().timestamp();
        let input = PolicyInput {
            subject: PolicySubject {
                id: subject.account_id.clone(),
                role: resolved.role.role_id.clone(),
                account_type: resolved.role.account_type.clone(),
                franchise_id: subject.franchise_id.clone(),
            },
            request: PolicyRequest {
                resource: resource.to_string(),
                action: action.to_string(),
                context: context.clone(),
            },
            perms: resolved.perms.clone(),
            now,
        };
        let PolicyDecision {
            allow,
            reason,
            policy_version,
        } = self.policy.evaluate(&input).await?;
        Ok(self.decision(now, allow, reason, policy_version))
    }

    fn association_denied(&self) -> Decision {
        let now = chrono::Utc::now().timestamp();
        self.decision(
            now,
            false,
            INVALID_ASSOCIATION.to_string(),
            self.policy_version.clone(),
        )
    }

    fn decision(&self, now: i64, allowed: bool, reason: String, policy_version: String) -> Decision {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        Decision {
            allowed,
            reason,
            issued_at: now,
            expires_at: now.saturating_add(ttl),
            policy_version,
        }
    }

    async fn cached(&self, tenant: &str, key: &str) -> Option<Decision> {
        let cache = self.cache.as_ref()?;
        match cache.get::<Decision>(tenant, key).await {
            Ok(decision) => {
                debug!("Decision cache hit for {}:{}", tenant, key);
                Some(decision)
            }
            Err(CacheError::Miss) => None,
            Err(err @ (CacheError::Serialization(_) | CacheError::Compression(_))) => {
                warn!("Dropping unreadable cached decision: {}", err);
                if let Err(err) = cache.delete(tenant, key).await {
                    warn!("Failed to drop cached decision: {}", err);
                }
                None
            }
            Err(err) => {
                warn!("Decision cache read failed, recomputing: {}", err);
                None
            }
        }
    }

    async fn remember(&self, tenant: &str, key: &str, decision: &Decision) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(err) = cache.store_with_ttl(tenant, key, decision, self.ttl).await {
            warn!("Failed to cache decision: {}", err);
        }
    }
}

fn require(value: &str, name: &'static str) -> Result<(), AuthzError> {
    validation::require(value, name)
        .map(|_| ())
        .map_err(|_| AuthzError::InputMissing(name))
}
