use crate::authn::tests::{account_with_password, PASSWORD};
use crate::config::AppConfig;
use crate::create_app;
use crate::resolver::memory::MemoryResolver;
use crate::state::AppState;
use axum::body::Body;
use axum::Router;
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use log::LevelFilter;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Test fixture serving the full router over an in-memory subject store.
///
/// The default fixture knows one account, `a1` in franchise `f1`, with
/// account type `admin`, password `p` and role `r1`. Role `r1` grants
/// `menu:edit`.
///
/// # Examples
///
/// ```rust
/// #[tokio::test]
/// async fn test_endpoint() {
///     let fixture = TestFixture::new().await;
///     let access = fixture.access_token("a1").await;
///
///     let response = fixture
///         .post_with_bearer("/v1/authz/check", &body, &access)
///         .await;
///     response.assert_ok();
/// }
/// ```
pub struct TestFixture {
    /// The application router
    pub app: Router,
    /// State shared with the router
    pub state: AppState,
    /// Subject store behind the state; clones share data
    pub resolver: MemoryResolver,
}

impl TestFixture {
    pub async fn new() -> Self {
        let resolver = MemoryResolver::new();
        resolver.add_account(account_with_password("a1", "f1", "r1"));
        resolver.grant_role("r1", "menu", "edit");
        Self::with_resolver(resolver).await
    }

    /// Fixture over a caller-prepared subject store
    pub async fn with_resolver(resolver: MemoryResolver) -> Self {
        Self::with_config(resolver, AppConfig::default()).await
    }

    /// Fixture over a caller-prepared subject store and configuration
    pub async fn with_config(resolver: MemoryResolver, config: AppConfig) -> Self {
        Self::setup_logger(LevelFilter::Debug);

        let state = AppState::for_testing_with(resolver.clone(), config);
        let app = create_app(state.clone()).await;

        Self {
            app,
            state,
            resolver,
        }
    }

    /// Initializes the test logger. Later calls are no-ops.
    pub fn setup_logger(level: LevelFilter) {
        let _ = env_logger::builder()
            .filter_level(level)
            .is_test(true)
            .try_init();
    }

    /// Request builder with the JSON content type set
    pub fn request_builder(&self, method: Method, uri: impl AsRef<str>) -> http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri.as_ref())
            .header("Content-Type", "application/json")
    }

    pub async fn get(&self, uri: impl AsRef<str>) -> TestResponse {
        let request = self
            .request_builder(Method::GET, uri)
            .body(Body::empty())
            .expect("Failed to build request");

        self.send(request).await
    }

    pub async fn post<T: Serialize>(&self, uri: impl AsRef<str>, body: &T) -> TestResponse {
        self.post_with_headers(uri, body, &[]).await
    }

    /// Sends a POST request with a JSON body and custom headers.
    pub async fn post_with_headers<T: Serialize>(
        &self,
        uri: impl AsRef<str>,
        body: &T,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let json_body = serde_json::to_vec(body).expect("Failed to serialize body to JSON");
        let mut builder = self.request_builder(Method::POST, uri);

        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = builder
            .body(Body::from(json_body))
            .expect("Failed to build request");

        self.send(request).await
    }

    /// Sends a POST request authenticated with the given access token
    pub async fn post_with_bearer<T: Serialize>(
        &self,
        uri: impl AsRef<str>,
        body: &T,
        access_token: &str,
    ) -> TestResponse {
        let authorization = format!("Bearer {}", access_token);
        self.post_with_headers(uri, body, &[("Authorization", &authorization)])
            .await
    }

    /// Sends a request and returns a TestResponse.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read response body")
            .to_bytes();

        // Non-JSON and empty bodies read as an empty object
        let json = if !body.is_empty() {
            serde_json::from_slice(&body).unwrap_or_else(|_| json!({}))
        } else {
            json!({})
        };

        TestResponse { status, json }
    }

    /// Logs in through the API with the fixture password
    pub async fn login(&self, login_id: &str) -> TestResponse {
        self.post(
            "/v1/authn/login",
            &json!({
                "loginID": login_id,
                "accountType": "admin",
                "password": PASSWORD,
            }),
        )
        .await
    }

    /// Access token for a fixture account, obtained through login
    pub async fn access_token(&self, login_id: &str) -> String {
        let response = self.login(login_id).await;
        response.assert_ok();
        response.json["accessToken"]
            .as_str()
            .expect("Login response has no accessToken")
            .to_string()
    }
}

/// Response from a test request that provides convenient access to status and JSON body.
pub struct TestResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response body as JSON (if present and valid JSON)
    pub json: Value,
}

impl TestResponse {
    /// Checks if the response status is successful (2xx).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Asserts that the response has the expected status code.
    pub fn assert_status(&self, expected: StatusCode) {
        assert_eq!(
            self.status, expected,
            "Expected status {}, got {} with body {}",
            expected, self.status, self.json
        );
    }

    pub fn assert_ok(&self) {
        self.assert_status(StatusCode::OK);
    }

    /// Deserializes the response body into the given type.
    pub fn json_as<T: DeserializeOwned>(&self) -> T {
        serde_json::from_value(self.json.clone()).expect("Failed to deserialize response JSON")
    }
}
