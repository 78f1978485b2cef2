use crate::authn::AuthnError;
use crate::authz::AuthzError;
use crate::interceptor::InterceptorError;
use crate::policy::PolicyError;
use crate::validation::ValidationError;
use axum::response::IntoResponse;
use axum::Json;
use http::StatusCode;
use log::error;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct ApiError {
    pub detail: String,
    pub status_code: StatusCode,
}

impl ApiError {
    /// Create a new ApiError with a detail message and status code
    pub fn new<S: ToString>(detail: S, status_code: StatusCode) -> Self {
        Self {
            detail: detail.to_string(),
            status_code,
        }
    }

    /// Create new Internal Server Error (500) with a detail message
    pub fn internal<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Create new Bad Request Error (400) with a detail message
    pub fn bad_request<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::BAD_REQUEST)
    }

    /// Create new Unauthorized Error (401) with a detail message
    pub fn unauthenticated<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::UNAUTHORIZED)
    }

    /// Create new Bad Gateway (502) with a detail message
    pub fn bad_gateway<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::BAD_GATEWAY)
    }

    /// Create new Service Unavailable (503) with a detail message
    pub fn unavailable<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::SERVICE_UNAVAILABLE)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code;
        let body = json!({
            "detail": self.detail,
        });
        (status_code, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<AuthnError> for ApiError {
    fn from(err: AuthnError) -> Self {
        match err {
            AuthnError::InputMissing(field) => ApiError::bad_request(format!("{} is required", field)),
            AuthnError::TokenRequired(field) => {
                ApiError::bad_request(format!("{} is required", field))
            }
            AuthnError::WrongCredentials => ApiError::unauthenticated("Wrong credentials"),
            AuthnError::InvalidToken(_) | AuthnError::TokenRotated => {
                ApiError::unauthenticated("Invalid or expired token")
            }
            AuthnError::Storage(err) => {
                error!("Session storage failed: {}", err);
                ApiError::unavailable("Session storage unavailable")
            }
            AuthnError::Dependency(err) => {
                error!("Subject store failed: {}", err);
                ApiError::unavailable("Subject store unavailable")
            }
            AuthnError::Internal(err) => {
                error!("Authentication failed internally: {}", err);
                ApiError::internal("Internal error")
            }
        }
    }
}

impl From<AuthzError> for ApiError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::InputMissing(field) => ApiError::bad_request(format!("{} is required", field)),
            AuthzError::Dependency(err) => {
                error!("Permission lookup failed: {}", err);
                ApiError::internal("Permission lookup failed")
            }
            AuthzError::Policy(PolicyError::Unavailable(err)) => {
                error!("Policy engine unavailable: {}", err);
                ApiError::bad_gateway("Policy engine unavailable")
            }
            AuthzError::Policy(err) => {
                error!("Policy evaluation failed: {}", err);
                ApiError::internal("Policy evaluation failed")
            }
            AuthzError::Internal(err) => {
                error!("Access decision failed internally: {}", err);
                ApiError::internal("Internal error")
            }
        }
    }
}

impl From<InterceptorError> for ApiError {
    fn from(err: InterceptorError) -> Self {
        match err {
            InterceptorError::MissingHeader => {
                ApiError::unauthenticated("Missing Authorization header")
            }
            InterceptorError::KeysUnavailable | InterceptorError::Fetch(_) => {
                error!("Bearer verification unavailable: {}", err);
                ApiError::unavailable("Token verification unavailable")
            }
            _ => ApiError::unauthenticated("Invalid or expired token"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverError;

    #[test]
    fn test_detail_strings_do_not_leak_internals() {
        let err = ApiError::from(AuthnError::InvalidToken("signature mismatch".to_string()));
        assert_eq!(err.status_code, StatusCode::UNAUTHORIZED);
        assert_eq!(err.detail, "Invalid or expired token");

        let err = ApiError::from(AuthzError::Dependency(ResolverError::Corrupt(
            "secret row".to_string(),
        )));
        assert_eq!(err.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.detail.contains("secret"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(AuthnError::InputMissing("loginID")).status_code,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(AuthnError::TokenRotated).status_code,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthzError::Policy(PolicyError::Unavailable("down".to_string())))
                .status_code,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(InterceptorError::KeysUnavailable).status_code,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
