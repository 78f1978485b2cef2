mod authn_middleware;
pub(crate) mod authn;
pub(crate) mod authz;
pub(crate) mod health;
pub(crate) mod jwks;

use crate::api::authn_middleware::authentication_middleware;
use crate::state::AppState;
use axum::{middleware, Router};

/// Combines all API routes into a single router
pub(super) fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(jwks::router())
        .merge(authn::router())
        .merge(protected_routes(state))
}

/// Routes that require a verified bearer access token
fn protected_routes(state: &AppState) -> Router<AppState> {
    authz::router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        authentication_middleware,
    ))
}
