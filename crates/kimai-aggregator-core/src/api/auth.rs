//! Backend login, registration and logout.
//!
//! These flows, together with the refresh inside `AuthenticatedClient`, are
//! the only writers of the credential store.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::tokens::parse_credential;
use super::ApiError;
use crate::auth::{Credential, CredentialStore, LogoutBus};

pub struct AuthApi {
    http: Client,
    auth_url: String,
    credentials: CredentialStore,
    logout: LogoutBus,
}

impl AuthApi {
    pub fn new(
        auth_url: impl Into<String>,
        credentials: CredentialStore,
        logout: LogoutBus,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            auth_url: auth_url.into(),
            credentials,
            logout,
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.auth_url.trim_end_matches('/'), name)
    }

    pub fn refresh_url(&self) -> String {
        self.endpoint("refresh")
    }

    /// Authenticate and store the returned credential pair
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, ApiError> {
        let body = json!({ "email": email, "password": password });
        let credential = self.token_request("login", &body).await?;
        info!(email, "Login successful");
        Ok(credential)
    }

    /// Create an account and store the returned credential pair
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Credential, ApiError> {
        let body = json!({ "name": name, "email": email, "password": password });
        let credential = self.token_request("register", &body).await?;
        info!(email, "Registration successful");
        Ok(credential)
    }

    /// End the session.
    ///
    /// The server call is best effort; local state is cleared and the logout
    /// event published even when the backend cannot be reached.
    pub async fn logout(&self) {
        if let Some(credential) = self.credentials.current() {
            let result = self
                .http
                .post(self.endpoint("logout"))
                .bearer_auth(&credential.access_token)
                .json(&json!({ "refresh_token": credential.refresh_token }))
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => debug!("Server session ended"),
                Ok(response) => warn!(status = %response.status(), "Server rejected logout"),
                Err(e) => warn!(error = %e, "Failed to reach server for logout"),
            }
        }

        self.credentials.clear();
        self.logout.publish();
        info!("Logged out");
    }

    async fn token_request(&self, name: &str, body: &Value) -> Result<Credential, ApiError> {
        let response = self
            .http
            .post(self.endpoint(name))
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, &text));
        }

        let credential = parse_credential(&text, None).map_err(ApiError::InvalidResponse)?;
        self.credentials.set(credential.clone());
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth_api(server: &MockServer, credentials: CredentialStore, logout: LogoutBus) -> AuthApi {
        AuthApi::new(
            format!("{}/auth", server.uri()),
            credentials,
            logout,
            Duration::from_secs(5),
        )
        .expect("auth api")
    }

    #[tokio::test]
    async fn test_login_stores_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"email": "ada@example.com", "password": "hunter2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"accessToken": "A1", "refreshToken": "R1", "user": {"id": 1}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = CredentialStore::new();
        let api = auth_api(&server, credentials.clone(), LogoutBus::new());
        api.login("ada@example.com", "hunter2").await.expect("login");

        assert_eq!(credentials.current(), Some(Credential::new("A1", Some("R1".to_string()))));
        assert_eq!(api.refresh_url(), format!("{}/auth/refresh", server.uri()));
    }

    #[tokio::test]
    async fn test_bad_password_leaves_store_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let credentials = CredentialStore::new();
        let api = auth_api(&server, credentials.clone(), LogoutBus::new());
        let err = api.login("ada@example.com", "wrong").await.expect_err("rejected");

        assert!(matches!(err, ApiError::Unauthorized));
        assert!(credentials.current().is_none());
    }

    #[tokio::test]
    async fn test_register_accepts_flat_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"accessToken": "A1", "refreshToken": "R1"})),
            )
            .mount(&server)
            .await;

        let credentials = CredentialStore::new();
        let api = auth_api(&server, credentials.clone(), LogoutBus::new());
        api.register("Ada", "ada@example.com", "hunter2").await.expect("register");
        assert_eq!(credentials.access_token().as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_logout_clears_store_even_when_server_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let credentials =
            CredentialStore::with_credential(Credential::new("A1", Some("R1".to_string())));
        let bus = LogoutBus::new();
        let mut logouts = bus.subscribe();
        let api = auth_api(&server, credentials.clone(), bus);

        api.logout().await;

        assert!(credentials.current().is_none());
        assert!(logouts.try_recv().is_ok());
    }
}
