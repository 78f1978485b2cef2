use crate::keys::Jwks;
use crate::openapi::JWKS_TAG;
use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/.well-known/jwks.json", get(jwks_handler))
}

/// Public half of the signing key, for services verifying tokens offline
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = JWKS_TAG,
    responses(
        (status = 200, description = "Verification key set", body = Jwks)
    )
)]
pub(crate) async fn jwks_handler(State(state): State<AppState>) -> Json<Jwks> {
    Json(state.keys.jwks())
}
