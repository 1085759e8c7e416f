//! HTTP API client with bearer-token authentication.

use async_trait::async_trait;
use eventsub_shared::{
    ApiError, AuthResponse, Event, EventInput, ErrorCode, RefreshResponse, RefreshTokenRequest,
    Subscription, SubscriptionStatus, User, UsernameRequest,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth_session::AuthSession;
use crate::config::{ClientConfig, DEFAULT_API_URL};

/// The calls the subscription coordinator depends on.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn get_events(&self) -> Result<Vec<Event>, ApiError>;
    async fn get_user_subscriptions(&self) -> Result<Vec<Subscription>, ApiError>;
    async fn subscribe_to_event(&self, event_id: i64) -> Result<Subscription, ApiError>;
    async fn unsubscribe_from_event(&self, event_id: i64) -> Result<(), ApiError>;
    async fn get_subscription_status(&self, event_id: i64) -> Result<SubscriptionStatus, ApiError>;
}

/// HTTP client for the event subscription API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: AuthSession,
}

impl ApiClient {
    /// Create a new API client against the default base URL
    pub fn new(session: AuthSession) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_API_URL.to_string(),
            session,
        }
    }

    /// Build a client with the configured base URL and request timeout.
    pub fn from_config(config: &ClientConfig, session: AuthSession) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Unknown(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            session,
        })
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match self.session.token() {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// Send a request and return the body of a successful response.
    ///
    /// A 401 from any endpoint clears the session before the error is returned.
    async fn execute(&self, method: &str, path: &str, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = self
            .authorize(rb)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(method, path, error = %e, "request failed without response");
                ApiError::Network(e.to_string())
            })?;

        let status = resp.status().as_u16();

        if resp.status().is_success() {
            let text = resp
                .text()
                .await
                .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;
            tracing::debug!(method, path, status, "request succeeded");
            return Ok(text);
        }

        if status == 401 {
            self.session.invalidate();
        }
        tracing::debug!(method, path, status, "request returned error status");

        // The status alone is enough to classify the error.
        let body = resp.text().await.unwrap_or_else(|e| {
            tracing::debug!(method, path, status, error = %e, "failed to read error body");
            String::new()
        });
        Err(ApiError::from_response(status, &body))
    }

    fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
        let text = if text.trim().is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|e| ApiError::Unknown(format!("invalid response body: {e}")))
    }

    fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ApiError> {
        serde_json::to_vec(body).map_err(|e| ApiError::Unknown(format!("failed to encode body: {e}")))
    }

    /// Make a GET request
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let rb = self.client.get(self.url(path));
        let text = self.execute("GET", path, rb).await?;
        Self::decode(&text)
    }

    /// Make a POST request with JSON body
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .body(Self::encode(body)?);
        let text = self.execute("POST", path, rb).await?;
        Self::decode(&text)
    }

    /// Make a POST request without a body
    pub async fn post_empty<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let rb = self.client.post(self.url(path));
        let text = self.execute("POST", path, rb).await?;
        Self::decode(&text)
    }

    /// Make a PUT request with JSON body
    pub async fn put_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = self
            .client
            .put(self.url(path))
            .header("Content-Type", "application/json")
            .body(Self::encode(body)?);
        let text = self.execute("PUT", path, rb).await?;
        Self::decode(&text)
    }

    /// Make a DELETE request, ignoring any response body
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let rb = self.client.delete(self.url(path));
        self.execute("DELETE", path, rb).await?;
        Ok(())
    }

    // --- Events ---

    pub async fn get_event(&self, id: i64) -> Result<Event, ApiError> {
        self.get_json(&format!("/events/{id}")).await
    }

    pub async fn get_events_by_system(&self, system_name: &str) -> Result<Vec<Event>, ApiError> {
        self.get_json(&format!("/events/system/{}", urlencoding::encode(system_name)))
            .await
    }

    pub async fn create_event(&self, input: &EventInput) -> Result<Event, ApiError> {
        validate_input(input)?;
        self.post_json("/events", input).await
    }

    pub async fn update_event(&self, id: i64, input: &EventInput) -> Result<Event, ApiError> {
        validate_input(input)?;
        self.put_json(&format!("/events/{id}"), input).await
    }

    pub async fn delete_event(&self, id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/events/{id}")).await
    }

    // --- Auth ---

    /// Log in an existing user and store the returned tokens.
    pub async fn login(&self, username: &str) -> Result<AuthResponse, ApiError> {
        self.authenticate("/users/login", username).await
    }

    /// Register (or log in) a user by name and store the returned tokens.
    pub async fn register(&self, username: &str) -> Result<AuthResponse, ApiError> {
        self.authenticate("/users/register", username).await
    }

    async fn authenticate(&self, path: &str, username: &str) -> Result<AuthResponse, ApiError> {
        let body = UsernameRequest {
            username: username.trim().to_string(),
        };
        let resp: AuthResponse = self.post_json(path, &body).await?;
        self.session.login(&resp);
        Ok(resp)
    }

    /// Exchange the stored refresh token for a new access token.
    pub async fn refresh_token(&self) -> Result<String, ApiError> {
        let Some(refresh_token) = self.session.refresh_token() else {
            return Err(ApiError::Http {
                status: 401,
                code: ErrorCode::Unauthorized,
                message: "No refresh token stored. Please log in.".to_string(),
            });
        };
        let resp: RefreshResponse = self
            .post_json("/users/refresh", &RefreshTokenRequest { refresh_token })
            .await?;
        self.session.set_access_token(resp.access_token.clone());
        Ok(resp.access_token)
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        let user: User = self.get_json("/users/me").await?;
        self.session.set_user(user.clone());
        Ok(user)
    }
}

fn validate_input(input: &EventInput) -> Result<(), ApiError> {
    input.validate().map_err(|field| ApiError::Http {
        status: 422,
        code: ErrorCode::ValidationError,
        message: format!("{field} is required"),
    })
}

#[async_trait]
impl SubscriptionApi for ApiClient {
    async fn get_events(&self) -> Result<Vec<Event>, ApiError> {
        self.get_json("/events").await
    }

    async fn get_user_subscriptions(&self) -> Result<Vec<Subscription>, ApiError> {
        self.get_json("/subscriptions").await
    }

    async fn subscribe_to_event(&self, event_id: i64) -> Result<Subscription, ApiError> {
        self.post_empty(&format!("/subscriptions/{event_id}")).await
    }

    async fn unsubscribe_from_event(&self, event_id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/subscriptions/{event_id}")).await
    }

    async fn get_subscription_status(&self, event_id: i64) -> Result<SubscriptionStatus, ApiError> {
        self.get_json(&format!("/subscriptions/{event_id}/status")).await
    }
}
