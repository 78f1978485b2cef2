use crate::errors::ApiError;
use crate::interceptor::VerifiedClaims;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::{debug, warn};

/// Verify the bearer access token and hand its claims to the handler
pub(super) async fn authentication_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // A header that is not visible ASCII cannot carry a bearer token
    let header = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .map(|value| value.to_str().unwrap_or_default());

    match state.interceptor.authenticate(header) {
        Ok(claims) => {
            debug!("Authenticated caller {}", claims.sub);
            request.extensions_mut().insert(VerifiedClaims(claims));
            next.run(request).await
        }
        Err(err) => {
            warn!("Rejected request: {}", err);
            ApiError::from(err).into_response()
        }
    }
}
