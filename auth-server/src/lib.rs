//! # auth-server
//!
//! Token issuance and tenant-scoped access decisions for franchise services.
//!
//! ## Components
//!
//! - **Authn:** login, refresh rotation, logout and stateless verification.
//! - **Authz:** single and batch decisions over the subject store, the policy
//!   evaluator and the decision cache.
//! - **Interceptor:** bearer verification against a published key set.
//! - **Resolver:** subject store contract, its Postgres and in-memory
//!   implementations, and the allowlisted query composer account
//!   administration builds on.
//! - **Validation:** input checks shared with upstream callers.

mod api;
pub mod authn;
pub mod authz;
pub mod config;
pub mod decision_cache;
mod errors;
pub mod interceptor;
pub mod keys;
mod openapi;
pub mod policy;
pub mod resolver;
pub mod session;
pub mod state;
pub mod store;
#[cfg(test)]
mod test_utils;
pub mod token;
pub mod validation;

use crate::state::AppState;
use axum::Router;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_scalar::{Scalar, Servable};

/// Create a new application instance with a given state
pub async fn create_app(state: AppState) -> Router {
    // Create OpenAPI documentation
    let (openapi_router, api_doc) =
        OpenApiRouter::with_openapi(openapi::ApiDoc::openapi()).split_for_parts();

    Router::new()
        .merge(api::router(&state))
        .merge(openapi_router)
        .merge(Scalar::with_url("/scalar", api_doc))
        .with_state(state)
}
