use crate::authn::AuthSession;
use crate::errors::ApiError;
use crate::openapi::AUTHN_TAG;
use crate::state::AppState;
use crate::token::AuthClaims;
use axum::{
    extract::{Json, State},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use http::StatusCode;
use log::debug;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/authn/login", post(login_handler))
        .route("/v1/authn/refresh", post(refresh_handler))
        .route("/v1/authn/verify", post(verify_handler))
        .route("/v1/authn/logout", post(logout_handler))
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct LoginRequest {
    #[serde(rename = "loginID")]
    login_id: String,
    password: String,
    #[serde(rename = "accountType")]
    account_type: String,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct RefreshRequest {
    /// When present it must name the refresh token's subject
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct VerifyRequest {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub(crate) struct LogoutRequest {
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

/// Identity of the authenticated account plus a fresh token pair
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionResponse {
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "franchiseID")]
    franchise_id: String,
    #[serde(rename = "employeeID")]
    employee_id: String,
    account_type: String,
    name: String,
    mobile_no: String,
    access_token: String,
    /// Unix seconds
    access_token_expires_at: i64,
    refresh_token: String,
    /// Unix seconds
    refresh_token_expires_at: i64,
}

impl From<AuthSession> for SessionResponse {
    fn from(session: AuthSession) -> Self {
        Self {
            account_id: session.account_id,
            franchise_id: session.franchise_id,
            employee_id: session.employee_id,
            account_type: session.account_type,
            name: session.name,
            mobile_no: session.mobile_no,
            access_token: session.access.token,
            access_token_expires_at: session.access.expires_at,
            refresh_token: session.refresh.token,
            refresh_token_expires_at: session.refresh.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VerifyResponse {
    is_valid: bool,
    claims: AuthClaims,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub(crate) struct LogoutResponse {
    success: bool,
}

#[utoipa::path(
    post,
    path = "/v1/authn/login",
    tag = AUTHN_TAG,
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Credentials accepted", body = SessionResponse),
        (status = 400, description = "A required field is missing"),
        (status = 401, description = "Wrong credentials"),
        (status = 503, description = "Session or subject store unavailable")
    )
)]
pub(crate) async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state
        .authn
        .login(&request.login_id, &request.account_type, &request.password)
        .await
    {
        Ok(session) => (StatusCode::OK, Json(SessionResponse::from(session))).into_response(),
        Err(err) => {
            debug!("Login failed: {}", err);
            ApiError::from(err).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/authn/refresh",
    tag = AUTHN_TAG,
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token pair rotated", body = SessionResponse),
        (status = 400, description = "Refresh token is missing"),
        (status = 401, description = "Refresh token is invalid, expired or already used"),
        (status = 503, description = "Session or subject store unavailable")
    )
)]
pub(crate) async fn refresh_handler(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    let account_id = Some(request.account_id.trim()).filter(|id| !id.is_empty());
    match state
        .authn
        .refresh(account_id, &request.refresh_token)
        .await
    {
        Ok(session) => (StatusCode::OK, Json(SessionResponse::from(session))).into_response(),
        Err(err) => {
            debug!("Refresh failed: {}", err);
            ApiError::from(err).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/authn/verify",
    tag = AUTHN_TAG,
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Access token is valid", body = VerifyResponse),
        (status = 400, description = "Access token is missing"),
        (status = 401, description = "Access token failed verification")
    )
)]
pub(crate) async fn verify_handler(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Response {
    match state.authn.verify(&request.access_token) {
        Ok(claims) => (
            StatusCode::OK,
            Json(VerifyResponse {
                is_valid: true,
                claims,
            }),
        )
            .into_response(),
        Err(err) => {
            debug!("Verification failed: {}", err);
            ApiError::from(err).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/authn/logout",
    tag = AUTHN_TAG,
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Session ended", body = LogoutResponse),
        (status = 400, description = "Refresh token is missing"),
        (status = 401, description = "Refresh token is invalid or no longer active")
    )
)]
pub(crate) async fn logout_handler(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> Response {
    match state.authn.logout(&request.refresh_token).await {
        Ok(()) => (StatusCode::OK, Json(LogoutResponse { success: true })).into_response(),
        Err(err) => {
            debug!("Logout failed: {}", err);
            ApiError::from(err).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestFixture;
    use serde_json::json;

    fn tokens(response: &crate::test_utils::TestResponse) -> (String, String) {
        let session: SessionResponse = response.json_as();
        (session.access_token, session.refresh_token)
    }

    #[tokio::test]
    async fn test_login_returns_identity_and_tokens() {
        let fixture = TestFixture::new().await;

        let response = fixture.login("a1").await;
        response.assert_ok();
        let session: SessionResponse = response.json_as();
        assert_eq!(session.account_id, "a1");
        assert_eq!(session.franchise_id, "f1");
        assert_eq!(session.employee_id, "emp-a1");
        assert_eq!(session.account_type, "admin");
        assert!(!session.access_token.is_empty());
        assert!(session.refresh_token_expires_at > session.access_token_expires_at);
    }

    #[tokio::test]
    async fn test_login_failures() {
        let fixture = TestFixture::new().await;

        let wrong = fixture
            .post(
                "/v1/authn/login",
                &json!({"loginID": "a1", "accountType": "admin", "password": "nope"}),
            )
            .await;
        wrong.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.json, json!({"detail": "Wrong credentials"}));

        let unknown = fixture.login("ghost").await;
        unknown.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.json, wrong.json);

        let missing = fixture
            .post("/v1/authn/login", &json!({"loginID": "a1", "accountType": "admin"}))
            .await;
        missing.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(missing.json, json!({"detail": "password is required"}));
    }

    #[tokio::test]
    async fn test_refresh_rotation_over_http() {
        let fixture = TestFixture::new().await;
        let (access1, refresh1) = tokens(&fixture.login("a1").await);

        let rotated = fixture
            .post(
                "/v1/authn/refresh",
                &json!({"accountID": "a1", "refreshToken": refresh1}),
            )
            .await;
        rotated.assert_ok();
        let (_, refresh2) = tokens(&rotated);

        let replay = fixture
            .post("/v1/authn/refresh", &json!({"refreshToken": refresh1}))
            .await;
        replay.assert_status(StatusCode::UNAUTHORIZED);

        let verify = fixture
            .post("/v1/authn/verify", &json!({"accessToken": access1}))
            .await;
        verify.assert_ok();

        fixture
            .post("/v1/authn/refresh", &json!({"refreshToken": refresh2}))
            .await
            .assert_ok();
    }

    #[tokio::test]
    async fn test_refresh_requires_token() {
        let fixture = TestFixture::new().await;

        let response = fixture
            .post("/v1/authn/refresh", &json!({"accountID": "a1"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json, json!({"detail": "refreshToken is required"}));
    }

    #[tokio::test]
    async fn test_verify_returns_claims() {
        let fixture = TestFixture::new().await;
        let access = fixture.access_token("a1").await;

        let response = fixture
            .post("/v1/authn/verify", &json!({"accessToken": access}))
            .await;
        response.assert_ok();
        assert_eq!(response.json["isValid"], json!(true));
        assert_eq!(response.json["claims"]["sub"], json!("a1"));
        assert_eq!(response.json["claims"]["franchiseID"], json!("f1"));
        assert_eq!(response.json["claims"]["tokenType"], json!("access"));

        let garbage = fixture
            .post("/v1/authn/verify", &json!({"accessToken": "not-a-token"}))
            .await;
        garbage.assert_status(StatusCode::UNAUTHORIZED);

        let empty = fixture.post("/v1/authn/verify", &json!({})).await;
        empty.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logout_twice() {
        let fixture = TestFixture::new().await;
        let (_, refresh) = tokens(&fixture.login("a1").await);

        let first = fixture
            .post("/v1/authn/logout", &json!({"refreshToken": refresh}))
            .await;
        first.assert_ok();
        assert_eq!(first.json, json!({"success": true}));

        let second = fixture
            .post("/v1/authn/logout", &json!({"refreshToken": refresh}))
            .await;
        second.assert_status(StatusCode::UNAUTHORIZED);

        let rotated = fixture
            .post("/v1/authn/refresh", &json!({"refreshToken": refresh}))
            .await;
        rotated.assert_status(StatusCode::UNAUTHORIZED);
    }
}
