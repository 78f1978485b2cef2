use super::{PolicyDecision, PolicyError, PolicyEvaluator, PolicyInput};
use crate::resolver::permission_key;
use async_trait::async_trait;

pub const DENIED_BY_DIRECT: &str = "denied by direct permission";
pub const ALLOWED_BY_DIRECT: &str = "allowed by direct permission";
pub const ALLOWED_BY_ROLE: &str = "allowed by role";
pub const NOT_GRANTED: &str = "permission not granted";

/// In-process rule set: a direct deny wins, then a direct grant, then a
/// role grant; anything else is denied.
#[derive(Debug, Clone)]
pub struct BuiltinPolicy {
    version: String,
}

impl BuiltinPolicy {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
        }
    }

    fn decide(&self, input: &PolicyInput) -> (bool, &'static str) {
        let request = &input.request;
        let key = permission_key(&request.resource, &request.action);
        match input.perms.direct.get(&key) {
            Some(false) => return (false, DENIED_BY_DIRECT),
            Some(true) => return (true, ALLOWED_BY_DIRECT),
            None => {}
        }

        let granted = input
            .perms
            .role_grants
            .get(&request.resource)
            .is_some_and(|actions| actions.contains(&request.action));
        if granted {
            (true, ALLOWED_BY_ROLE)
        } else {
            (false, NOT_GRANTED)
        }
    }
}

#[async_trait]
impl PolicyEvaluator for BuiltinPolicy {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        let (allow, reason) = self.decide(input);
        Ok(PolicyDecision {
            allow,
            reason: reason.to_string(),
            policy_version: self.version.clone(),
        })
    }

    async fn health_check(&self) -> Result<(), String> {
        Ok(())
    }
}
