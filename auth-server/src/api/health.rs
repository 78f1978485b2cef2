use crate::openapi::HEALTH_TAG;
use crate::state::AppState;
use crate::store::lightning::StoreStats;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Health {
    status: String,
    /// Per-component status, present on readiness checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    components: Option<BTreeMap<String, String>>,
    /// Counters of the in-process store, when that backend is selected
    #[serde(rename = "storeStats", skip_deserializing, skip_serializing_if = "Option::is_none")]
    store_stats: Option<StoreStats>,
    #[serde(skip)]
    status_code: StatusCode,
}

impl IntoResponse for Health {
    fn into_response(self) -> Response {
        (self.status_code, Json(self)).into_response()
    }
}

/// Liveness: the process is serving requests
#[utoipa::path(
    get,
    path = "/health",
    tag = HEALTH_TAG,
    responses(
        (status = 200, description = "Service is alive", body = Health)
    )
)]
pub(crate) async fn health_check() -> Health {
    Health {
        status: "ok".to_string(),
        components: None,
        store_stats: None,
        status_code: StatusCode::OK,
    }
}

/// Readiness: every backing component answers its health probe
#[utoipa::path(
    get,
    path = "/ready",
    tag = HEALTH_TAG,
    responses(
        (status = 200, description = "Service is ready", body = Health),
        (status = 503, description = "One or more components are not healthy", body = Health)
    )
)]
pub(crate) async fn ready_check(State(state): State<AppState>) -> Health {
    let mut ready = true;
    let mut components = BTreeMap::new();

    for (name, result) in state.component_health().await {
        let status = match result {
            Ok(()) => "healthy".to_string(),
            Err(err) => {
                warn!("Component {} is not healthy: {}", name, err);
                ready = false;
                "unhealthy".to_string()
            }
        };
        components.insert(name.to_string(), status);
    }
    let store_stats = state.store.stats().await;

    if ready {
        Health {
            status: "ok".to_string(),
            components: Some(components),
            store_stats,
            status_code: StatusCode::OK,
        }
    } else {
        Health {
            status: "error".to_string(),
            components: Some(components),
            store_stats,
            status_code: StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestFixture;
    use http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_health_endpoint() {
        let fixture = TestFixture::new().await;
        let response = fixture.get("/health").await;

        response.assert_status(StatusCode::OK);
        assert_eq!(response.json, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_ready_endpoint() {
        let fixture = TestFixture::new().await;
        let response = fixture.get("/ready").await;

        response.assert_status(StatusCode::OK);
        assert_eq!(response.json["status"], json!("ok"));
        assert_eq!(
            response.json["components"],
            json!({
                "policy": "healthy",
                "store": "healthy",
                "subjects": "healthy",
            })
        );
        assert!(response.json["storeStats"]["items"].is_u64());
    }
}
