use crate::authz::{Decision, Subject};
use crate::errors::ApiError;
use crate::interceptor::VerifiedClaims;
use crate::openapi::AUTHZ_TAG;
use crate::state::AppState;
use axum::{
    extract::{Extension, Json, State},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use http::StatusCode;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

pub(crate) const SUPER_ADMIN_REASON: &str = "Super Admin";

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/authz/check", post(check_handler))
        .route("/v1/authz/check/batch", post(check_batch_handler))
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct CheckRequest {
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "franchiseID")]
    franchise_id: String,
    resource: String,
    action: String,
    /// Extra attributes passed to the policy and folded into the cache key
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct ResourceAction {
    resource: String,
    action: String,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct BatchCheckRequest {
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "franchiseID")]
    franchise_id: String,
    checks: Vec<ResourceAction>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, String>,
}

/// Decisions in the order of the requested checks
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub(crate) struct BatchCheckResponse {
    results: Vec<Decision>,
}

/// Lowercased with separators removed, so `super_admin`, `Super-Admin` and
/// `SUPERADMIN` all match
fn is_super_admin(account_type: &str) -> bool {
    account_type
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .eq("superadmin".chars())
}

fn super_admin_decision(state: &AppState) -> Decision {
    let issued_at = chrono::Utc::now().timestamp();
    let ttl = i64::try_from(state.config.decision.ttl.as_secs()).unwrap_or(i64::MAX);
    Decision {
        allowed: true,
        reason: SUPER_ADMIN_REASON.to_string(),
        issued_at,
        expires_at: issued_at.saturating_add(ttl),
        policy_version: state.config.policy.version.clone(),
    }
}

fn subject_for(franchise_id: &str, account_id: &str) -> Subject {
    Subject {
        franchise_id: franchise_id.to_string(),
        account_id: account_id.to_string(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/authz/check",
    tag = AUTHZ_TAG,
    request_body = CheckRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer access token"),
    ),
    responses(
        (status = 200, description = "Decision made", body = Decision),
        (status = 400, description = "A required field is missing"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Permission lookup or policy evaluation failed"),
        (status = 502, description = "Policy engine unavailable")
    )
)]
pub(crate) async fn check_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<VerifiedClaims>,
    Json(request): Json<CheckRequest>,
) -> Response {
    if is_super_admin(&claims.0.account_type) {
        info!("Super admin {} bypassed the access check", claims.0.sub);
        return (StatusCode::OK, Json(super_admin_decision(&state))).into_response();
    }

    let subject = subject_for(&request.franchise_id, &request.account_id);
    match state
        .authz
        .is_authorized(&subject, &request.resource, &request.action, &request.context)
        .await
    {
        Ok(decision) => (StatusCode::OK, Json(decision)).into_response(),
        Err(err) => {
            error!("Access check failed: {}", err);
            ApiError::from(err).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/authz/check/batch",
    tag = AUTHZ_TAG,
    request_body = BatchCheckRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer access token"),
    ),
    responses(
        (status = 200, description = "One decision per check, in request order", body = BatchCheckResponse),
        (status = 400, description = "A required field is missing"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Permission lookup or policy evaluation failed"),
        (status = 502, description = "Policy engine unavailable")
    )
)]
pub(crate) async fn check_batch_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<VerifiedClaims>,
    Json(request): Json<BatchCheckRequest>,
) -> Response {
    if is_super_admin(&claims.0.account_type) && !request.checks.is_empty() {
        info!("Super admin {} bypassed the batch access check", claims.0.sub);
        let decision = super_admin_decision(&state);
        let results = vec![decision; request.checks.len()];
        return (StatusCode::OK, Json(BatchCheckResponse { results })).into_response();
    }

    let subject = subject_for(&request.franchise_id, &request.account_id);
    let pairs: Vec<(String, String)> = request
        .checks
        .into_iter()
        .map(|check| (check.resource, check.action))
        .collect();

    match state
        .authz
        .is_authorized_batch(&subject, &pairs, &request.context)
        .await
    {
        Ok(results) => (StatusCode::OK, Json(BatchCheckResponse { results })).into_response(),
        Err(err) => {
            error!("Batch access check failed: {}", err);
            ApiError::from(err).into_response()
        }
    }
}
