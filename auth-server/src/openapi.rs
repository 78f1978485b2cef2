use crate::api::{authn, authz, health, jwks};
use utoipa::OpenApi;

pub(crate) const HEALTH_TAG: &str = "Health API";
pub(crate) const AUTHN_TAG: &str = "Authentication API";
pub(crate) const AUTHZ_TAG: &str = "Authorization API";
pub(crate) const JWKS_TAG: &str = "Key Discovery API";

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        health::ready_check,
        authn::login_handler,
        authn::refresh_handler,
        authn::verify_handler,
        authn::logout_handler,
        authz::check_handler,
        authz::check_batch_handler,
        jwks::jwks_handler,
    ),
    tags(
        (name = HEALTH_TAG, description = "Liveness and readiness endpoints"),
        (name = AUTHN_TAG, description = "Login, token rotation, verification and logout"),
        (name = AUTHZ_TAG, description = "Tenant-scoped access decisions"),
        (name = JWKS_TAG, description = "Published token verification keys"),
    ),
    info(
        title = "Franchise Auth API",
        description = "Authentication and authorization service for franchise accounts",
        version = "0.1.0"
    )
)]
pub(crate) struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_route_is_documented() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/ready",
            "/v1/authn/login",
            "/v1/authn/refresh",
            "/v1/authn/verify",
            "/v1/authn/logout",
            "/v1/authz/check",
            "/v1/authz/check/batch",
            "/.well-known/jwks.json",
        ] {
            assert!(doc.paths.paths.contains_key(path), "{} is missing", path);
        }
    }
}
