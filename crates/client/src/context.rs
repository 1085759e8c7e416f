//! Application context wiring the session, HTTP client, cache and coordinator.

use std::sync::Arc;
use std::time::Duration;

use eventsub_shared::{ApiError, Event, EventInput, User};
use tokio::task::JoinHandle;

use crate::api_client::ApiClient;
use crate::auth_session::{AuthSession, FileCredentialStore};
use crate::config::ClientConfig;
use crate::query_cache::{QueryCache, QueryError, QueryKey, QueryOptions};
use crate::storage::{Storage, StorageError};
use crate::stores::ErrorChannel;
use crate::subscriptions::SubscriptionCoordinator;

const CURRENT_USER_STALE_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Everything a signed-in client needs, created once and shared by handle.
#[derive(Clone)]
pub struct ClientContext {
    config: ClientConfig,
    session: AuthSession,
    api: ApiClient,
    cache: QueryCache,
    errors: ErrorChannel,
    subscriptions: SubscriptionCoordinator,
}

impl ClientContext {
    /// Build a context whose credential is persisted on disk.
    pub fn from_config(config: ClientConfig) -> Result<Self, ContextError> {
        let storage = match &config.config_dir {
            Some(dir) => Storage::new(dir),
            None => Storage::platform_default()?,
        };
        let session = AuthSession::new(Arc::new(FileCredentialStore::new(storage)));
        Ok(Self::with_session(config, session)?)
    }

    pub fn with_session(config: ClientConfig, session: AuthSession) -> Result<Self, ApiError> {
        let api = ApiClient::from_config(&config, session.clone())?;
        let cache = QueryCache::new();
        let errors = ErrorChannel::new();
        let subscriptions =
            SubscriptionCoordinator::new(Arc::new(api.clone()), cache.clone(), errors.clone())
                .with_retry_policies(config.query_retry.clone(), config.mutation_retry.clone());

        let user_api = api.clone();
        cache.register(
            QueryKey::CurrentUser,
            QueryOptions::new(CURRENT_USER_STALE_TIME).with_retry(config.query_retry.clone()),
            move || {
                let api = user_api.clone();
                async move { api.current_user().await }
            },
        );

        Ok(Self {
            config,
            session,
            api,
            cache,
            errors,
            subscriptions,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn subscriptions(&self) -> &SubscriptionCoordinator {
        &self.subscriptions
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Log in and start from an empty cache.
    pub async fn login(&self, username: &str) -> Result<User, ApiError> {
        let resp = self.api.login(username).await?;
        self.cache.clear();
        self.cache.set(QueryKey::CurrentUser, resp.user.clone());
        Ok(resp.user)
    }

    /// Register a user by name and start from an empty cache.
    pub async fn register(&self, username: &str) -> Result<User, ApiError> {
        let resp = self.api.register(username).await?;
        self.cache.clear();
        self.cache.set(QueryKey::CurrentUser, resp.user.clone());
        Ok(resp.user)
    }

    /// The signed-in user, cached.
    pub async fn current_user(&self) -> Result<Arc<User>, QueryError> {
        self.cache.fetch::<User>(QueryKey::CurrentUser).await
    }

    /// Create an event and add it to the cached event list.
    pub async fn create_event(&self, input: &EventInput) -> Result<Event, ApiError> {
        let created = self.api.create_event(input).await?;
        self.update_events(|events| {
            events.push(created.clone());
        });
        self.refetch_events().await;
        Ok(created)
    }

    /// Update an event and replace it in the cached event list.
    pub async fn update_event(&self, id: i64, input: &EventInput) -> Result<Event, ApiError> {
        let updated = self.api.update_event(id, input).await?;
        self.update_events(|events| {
            for event in events.iter_mut().filter(|e| e.id == updated.id) {
                *event = updated.clone();
            }
        });
        self.refetch_events().await;
        Ok(updated)
    }

    /// Delete an event and drop it from the cached event list.
    pub async fn delete_event(&self, id: i64) -> Result<(), ApiError> {
        self.api.delete_event(id).await?;
        self.update_events(|events| events.retain(|e| e.id != id));
        self.refetch_events().await;
        Ok(())
    }

    /// Apply `edit` to the cached events, starting from an empty list if
    /// nothing is cached yet.
    fn update_events(&self, edit: impl FnOnce(&mut Vec<Event>)) {
        let mut events = self
            .cache
            .get::<Vec<Event>>(QueryKey::Events)
            .map(|e| e.as_ref().clone())
            .unwrap_or_default();
        edit(&mut events);
        self.cache.set(QueryKey::Events, events);
    }

    async fn refetch_events(&self) {
        match self.cache.invalidate(QueryKey::Events).await {
            Ok(()) | Err(QueryError::Cancelled(_)) => {}
            Err(e) => tracing::warn!(error = %e, "refetch after event change failed"),
        }
    }

    /// Clear the credential and all cached server data.
    pub fn logout(&self) {
        self.session.logout();
        self.reset();
    }

    fn reset(&self) {
        self.cache.clear();
        self.subscriptions.loading().clear();
        self.errors.clear();
    }

    /// Clear cached data whenever the session goes away, including when a
    /// request is rejected with 401.
    pub fn spawn_auth_guard(&self) -> JoinHandle<()> {
        let mut rx = self.session.watch();
        let this = self.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let signed_out = rx.borrow_and_update().is_none();
                if signed_out {
                    tracing::info!("session ended, clearing cached data");
                    this.reset();
                }
            }
        })
    }
}
