//! Authenticated HTTP client with coordinated token refresh.
//!
//! Every request reads the current bearer token from the shared
//! `CredentialStore` at send time. A 401/403 answer triggers one refresh of the
//! credential pair; concurrent failures join the refresh already in flight
//! instead of starting their own. The original request is then replayed once.
//! If the refresh fails, one logout event is published and every waiting
//! request returns its original error.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::error::truncate_body;
use super::tokens::parse_credential;
use super::{ApiError, RefreshError};
use crate::auth::{Credential, CredentialStore, LogoutBus};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// A timed out request surfaces as a network error and is never retried here.
const REQUEST_TIMEOUT_SECS: u64 = 15;

type PendingRefresh = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

/// Where and how to renew an expired access token.
#[derive(Clone)]
struct RefreshEndpoint {
    url: String,
    logout: LogoutBus,
}

struct Inner {
    http: Client,
    base_url: String,
    credentials: CredentialStore,
    refresh: Option<RefreshEndpoint>,
    /// The refresh currently in flight; callers that find it here attach to it
    pending_refresh: Mutex<Option<PendingRefresh>>,
}

/// Bearer-token API client.
/// Clone is cheap - all clones share the connection pool and the refresh state.
#[derive(Clone)]
pub struct AuthenticatedClient {
    inner: Arc<Inner>,
}

pub struct AuthenticatedClientBuilder {
    base_url: String,
    timeout: Duration,
    refresh: Option<RefreshEndpoint>,
}

impl AuthenticatedClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable refresh-and-retry on 401/403 against `refresh_url`.
    /// `logout` is published when the refresh fails.
    pub fn refresh(mut self, refresh_url: impl Into<String>, logout: LogoutBus) -> Self {
        self.refresh = Some(RefreshEndpoint {
            url: refresh_url.into(),
            logout,
        });
        self
    }

    pub fn build(self, credentials: CredentialStore) -> Result<AuthenticatedClient, ApiError> {
        let http = Client::builder().timeout(self.timeout).build()?;

        Ok(AuthenticatedClient {
            inner: Arc::new(Inner {
                http,
                base_url: self.base_url,
                credentials,
                refresh: self.refresh,
                pending_refresh: Mutex::new(None),
            }),
        })
    }
}

/// A request as issued by the caller, replayable after a refresh.
struct PreparedRequest {
    method: Method,
    path: String,
    body: Option<Value>,
    params: Vec<(String, String)>,
    retried: bool,
}

impl AuthenticatedClient {
    pub fn builder(base_url: impl Into<String>) -> AuthenticatedClientBuilder {
        AuthenticatedClientBuilder {
            base_url: base_url.into(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            refresh: None,
        }
    }

    /// Issue a request and return the JSON body (`Null` for an empty body).
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        params: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        let request = PreparedRequest {
            method,
            path: path.to_string(),
            body,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            retried: false,
        };
        self.execute(request).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let value = self.request(Method::GET, path, None, params).await?;
        Self::decode(path, value)
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::DELETE, path, None, &[]).await
    }

    fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value).map_err(|e| {
            ApiError::InvalidResponse(format!("Unexpected response shape from {}: {}", path, e))
        })
    }

    async fn execute(&self, mut request: PreparedRequest) -> Result<Value, ApiError> {
        loop {
            let token = self.inner.credentials.access_token();
            let err = match self.send_once(&request, token.as_deref()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_auth_failure() || request.retried || self.inner.refresh.is_none() {
                return Err(err);
            }
            request.retried = true;

            // The pair may already have been rotated while this request was in flight.
            let current = self.inner.credentials.access_token();
            if current.is_some() && current != token {
                debug!(path = %request.path, "Token changed during request, retrying");
                continue;
            }

            match self.refresh_credentials().await {
                Ok(_) => {
                    debug!(path = %request.path, "Retrying request after token refresh");
                }
                Err(refresh_err) => {
                    debug!(path = %request.path, error = %refresh_err, "Giving up on request after failed refresh");
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &PreparedRequest,
        token: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = self.url(&request.path);

        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %url, retried = request.retried, "Sending request");
        let response = builder.send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            debug!(url = %url, status = %status, "Request failed");
            return Err(ApiError::from_status(status, &text));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.inner.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Renew the credential pair, joining a refresh already in flight.
    ///
    /// All concurrent callers observe the same outcome. The new pair is written
    /// to the credential store before any caller resumes.
    pub async fn refresh_credentials(&self) -> Result<Credential, RefreshError> {
        let Some(ref endpoint) = self.inner.refresh else {
            return Err(RefreshError::MissingRefreshToken);
        };

        let pending = {
            let mut slot = self
                .inner
                .pending_refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let pending = refresh_or_logout(
                        self.inner.http.clone(),
                        endpoint.clone(),
                        self.inner.credentials.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let outcome = pending.clone().await;

        let mut slot = self
            .inner
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }

        outcome
    }
}

/// Run one refresh. A failure publishes a single logout event, however many
/// callers are waiting on the outcome.
async fn refresh_or_logout(
    http: Client,
    endpoint: RefreshEndpoint,
    credentials: CredentialStore,
) -> Result<Credential, RefreshError> {
    let outcome = perform_refresh(http, endpoint.url, credentials).await;
    if let Err(ref e) = outcome {
        warn!(error = %e, "Token refresh failed, logging out");
        endpoint.logout.publish();
    }
    outcome
}

async fn perform_refresh(
    http: Client,
    url: String,
    credentials: CredentialStore,
) -> Result<Credential, RefreshError> {
    let refresh_token = credentials
        .current()
        .and_then(|c| c.refresh_token)
        .ok_or(RefreshError::MissingRefreshToken)?;

    info!("Refreshing access token");
    let response = http
        .post(&url)
        .header(header::ACCEPT, "application/json")
        .json(&json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .map_err(|e| RefreshError::Network(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| RefreshError::Network(e.to_string()))?;
    if !status.is_success() {
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: truncate_body(&body),
        });
    }

    let credential =
        parse_credential(&body, Some(refresh_token)).map_err(RefreshError::InvalidResponse)?;
    credentials.set(credential.clone());
    info!("Access token refreshed");
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(access: &str, refresh: Option<&str>) -> CredentialStore {
        CredentialStore::with_credential(Credential::new(access, refresh.map(str::to_string)))
    }

    fn client(server: &MockServer, credentials: CredentialStore, logout: &LogoutBus) -> AuthenticatedClient {
        AuthenticatedClient::builder(format!("{}/api", server.uri()))
            .refresh(format!("{}/auth/refresh", server.uri()), logout.clone())
            .build(credentials)
            .expect("client")
    }

    fn refreshed_envelope() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"accessToken": "A2", "refreshToken": "R2"}
        }))
    }

    async fn mount_data(server: &MockServer, token: &str, status: u16, times: u64) {
        Mock::given(method("GET"))
            .and(path("/api/data"))
            .and(header("authorization", format!("Bearer {}", token).as_str()))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({"token": token})))
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_attaches_current_bearer_token_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/timesheets"))
            .and(header("authorization", "Bearer A1"))
            .and(query_param("size", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let api = client(&server, store("A1", Some("R1")), &logout);
        let body = api
            .request(Method::GET, "/timesheets", None, &[("size", "50")])
            .await
            .expect("response");

        assert_eq!(body, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn test_refreshes_and_retries_once_on_401() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 401, 1).await;
        mount_data(&server, "A2", 200, 1).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(json!({"refresh_token": "R1"})))
            .respond_with(refreshed_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let credentials = store("A1", Some("R1"));
        let logout = LogoutBus::new();
        let api = client(&server, credentials.clone(), &logout);

        let body: Value = api.get("/data", &[]).await.expect("retried response");

        assert_eq!(body, json!({"token": "A2"}));
        assert_eq!(credentials.current(), Some(Credential::new("A2", Some("R2".to_string()))));
    }

    #[tokio::test]
    async fn test_403_also_triggers_refresh() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 403, 1).await;
        mount_data(&server, "A2", 200, 1).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"accessToken": "A2", "refreshToken": "R2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let api = client(&server, store("A1", Some("R1")), &logout);
        let body: Value = api.get("/data", &[]).await.expect("retried response");
        assert_eq!(body, json!({"token": "A2"}));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 401, 5).await;
        mount_data(&server, "A2", 200, 5).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(refreshed_envelope().set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = store("A1", Some("R1"));
        let logout = LogoutBus::new();
        let api = client(&server, credentials.clone(), &logout);

        let requests = (0..5).map(|_| {
            let api = api.clone();
            async move { api.get::<Value>("/data", &[]).await }
        });
        let results = futures::future::join_all(requests).await;

        for result in results {
            assert_eq!(result.expect("retried response"), json!({"token": "A2"}));
        }
        assert_eq!(credentials.access_token().as_deref(), Some("A2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_401_after_rotation_retries_without_second_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/slow"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(400)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/slow"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"slow": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/fast"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/fast"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fast": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(refreshed_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let credentials = store("A1", Some("R1"));
        let logout = LogoutBus::new();
        let api = client(&server, credentials.clone(), &logout);

        let (slow, fast) = tokio::join!(
            api.get::<Value>("/slow", &[]),
            api.get::<Value>("/fast", &[])
        );

        assert_eq!(slow.expect("slow request"), json!({"slow": true}));
        assert_eq!(fast.expect("fast request"), json!({"fast": true}));
        assert_eq!(credentials.access_token().as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_failed_shared_refresh_publishes_one_logout() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 401, 5).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string("refresh token revoked")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let mut logouts = logout.subscribe();
        let api = client(&server, store("A1", Some("R1")), &logout);

        let requests = (0..5).map(|_| {
            let api = api.clone();
            async move { api.get::<Value>("/data", &[]).await }
        });
        let results = futures::future::join_all(requests).await;

        for result in results {
            assert!(matches!(result, Err(ApiError::Unauthorized)));
        }
        assert!(logouts.try_recv().is_ok());
        assert!(matches!(logouts.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_retried_request_is_not_retried_again() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 401, 1).await;
        mount_data(&server, "A2", 401, 1).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(refreshed_envelope())
            .expect(1)
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let mut logouts = logout.subscribe();
        let api = client(&server, store("A1", Some("R1")), &logout);

        let err = api.get::<Value>("/data", &[]).await.expect_err("second 401");
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(matches!(logouts.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_failed_refresh_publishes_logout_and_returns_original_error() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 403, 1).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string("refresh token revoked"))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = store("A1", Some("R1"));
        let logout = LogoutBus::new();
        let mut logouts = logout.subscribe();
        let api = client(&server, credentials.clone(), &logout);

        let err = api.get::<Value>("/data", &[]).await.expect_err("refresh failed");
        assert!(matches!(err, ApiError::AccessDenied(_)));
        assert!(logouts.try_recv().is_ok());
        assert_eq!(credentials.access_token().as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_logs_out_without_calling_refresh() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 401, 1).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(refreshed_envelope())
            .expect(0)
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let mut logouts = logout.subscribe();
        let api = client(&server, store("A1", None), &logout);

        let err = api.get::<Value>("/data", &[]).await.expect_err("no refresh token");
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(logouts.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_server_errors_propagate_without_refresh() {
        let server = MockServer::start().await;
        mount_data(&server, "A1", 500, 1).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(refreshed_envelope())
            .expect(0)
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let api = client(&server, store("A1", Some("R1")), &logout);

        let err = api.get::<Value>("/data", &[]).await.expect_err("server error");
        assert!(matches!(err, ApiError::ServerError(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_a_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(1)
            .mount(&server)
            .await;

        let api = AuthenticatedClient::builder(format!("{}/api", server.uri()))
            .timeout(Duration::from_millis(100))
            .refresh(format!("{}/auth/refresh", server.uri()), LogoutBus::new())
            .build(store("A1", Some("R1")))
            .expect("client");

        let err = api.get::<Value>("/slow", &[]).await.expect_err("timeout");
        assert!(err.is_network());
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_client_without_refresh_returns_auth_error() {
        let server = MockServer::start().await;
        mount_data(&server, "K1", 401, 1).await;

        let api = AuthenticatedClient::builder(format!("{}/api", server.uri()))
            .build(store("K1", None))
            .expect("client");

        let err = api.get::<Value>("/data", &[]).await.expect_err("unauthorized");
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/items/3"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let logout = LogoutBus::new();
        let api = client(&server, store("A1", Some("R1")), &logout);
        assert_eq!(api.delete("/items/3").await.expect("deleted"), Value::Null);
    }
}
