//! Authentication session with pluggable credential persistence.

use std::fmt;
use std::sync::{Arc, Mutex};

use eventsub_shared::{AuthResponse, User};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::storage::Storage;

const STORAGE_KEY: &str = "session";

/// Stored credential data
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("user", &self.user.as_ref().map(|u| &u.username))
            .finish()
    }
}

/// Where credentials live between runs.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<Credential>;
    fn save(&self, credential: &Credential);
    fn clear(&self);
}

/// Credentials kept as a JSON file via [`Storage`].
pub struct FileCredentialStore {
    storage: Storage,
}

impl FileCredentialStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<Credential> {
        self.storage.load(STORAGE_KEY)
    }

    fn save(&self, credential: &Credential) {
        if let Err(e) = self.storage.save(STORAGE_KEY, credential) {
            tracing::warn!(error = %e, "failed to persist session");
        }
    }

    fn clear(&self) {
        if let Err(e) = self.storage.remove(STORAGE_KEY) {
            tracing::warn!(error = %e, "failed to remove persisted session");
        }
    }
}

/// Process-local credential store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Option<Credential>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<Credential> {
        self.inner.lock().ok().and_then(|c| c.clone())
    }

    fn save(&self, credential: &Credential) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(credential.clone());
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }
}

/// The current user's credential, shared by everything that talks to the API.
///
/// Set on login, cleared on logout or when any request comes back 401.
/// Changes are published on a watch channel so an authenticated view can
/// react to the session going away.
#[derive(Clone)]
pub struct AuthSession {
    store: Arc<dyn CredentialStore>,
    state: Arc<watch::Sender<Option<Credential>>>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("credential", &*self.state.borrow())
            .finish()
    }
}

impl AuthSession {
    /// Create a session, restoring any persisted credential.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let initial = store.load();
        if initial.is_some() {
            tracing::debug!("restored persisted session");
        }
        let (tx, _rx) = watch::channel(initial);
        Self {
            store,
            state: Arc::new(tx),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStore::default()))
    }

    /// Session with a bearer token already set and nothing persisted.
    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::in_memory();
        session.set(Credential {
            access_token: token.into(),
            refresh_token: None,
            user: None,
        });
        session
    }

    fn set(&self, credential: Credential) {
        self.store.save(&credential);
        self.state.send_replace(Some(credential));
    }

    /// Store the tokens and user from a login or register response.
    pub fn login(&self, response: &AuthResponse) {
        tracing::info!(user = %response.user.username, "logged in");
        self.set(Credential {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            user: Some(response.user.clone()),
        });
    }

    /// Replace the access token, keeping the refresh token and user.
    pub fn set_access_token(&self, token: impl Into<String>) {
        let mut credential = self.credential().unwrap_or(Credential {
            access_token: String::new(),
            refresh_token: None,
            user: None,
        });
        credential.access_token = token.into();
        self.set(credential);
    }

    pub fn set_user(&self, user: User) {
        if let Some(mut credential) = self.credential() {
            credential.user = Some(user);
            self.set(credential);
        }
    }

    /// Logout and clear the stored credential
    pub fn logout(&self) {
        tracing::info!("logged out");
        self.clear();
    }

    /// Drop the credential after the server rejected it.
    pub fn invalidate(&self) {
        if self.is_authenticated() {
            tracing::warn!("credential rejected by server, clearing session");
        }
        self.clear();
    }

    fn clear(&self) {
        self.store.clear();
        self.state.send_replace(None);
    }

    pub fn credential(&self) -> Option<Credential> {
        self.state.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.state.borrow().as_ref().map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state
            .borrow()
            .as_ref()
            .and_then(|c| c.refresh_token.clone())
    }

    pub fn user(&self) -> Option<User> {
        self.state.borrow().as_ref().and_then(|c| c.user.clone())
    }

    /// Check if user is authenticated
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Observe credential changes (login, logout, 401 invalidation).
    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use eventsub_shared::Role;

    fn auth_response() -> AuthResponse {
        AuthResponse {
            user: User {
                id: 1,
                username: "ada".into(),
                role: Role::User,
                created_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
                updated_at: None,
            },
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
        }
    }

    #[test]
    fn login_then_logout() {
        let session = AuthSession::in_memory();
        assert!(!session.is_authenticated());

        session.login(&auth_response());
        assert_eq!(session.token().as_deref(), Some("access"));
        assert_eq!(session.refresh_token().as_deref(), Some("refresh"));
        assert_eq!(session.user().map(|u| u.username), Some("ada".to_string()));

        session.logout();
        assert!(!session.is_authenticated());
        assert_eq!(session.token(), None);
    }

    #[test]
    fn set_access_token_keeps_refresh_token() {
        let session = AuthSession::in_memory();
        session.login(&auth_response());
        session.set_access_token("rotated");
        assert_eq!(session.token().as_deref(), Some("rotated"));
        assert_eq!(session.refresh_token().as_deref(), Some("refresh"));
    }

    #[test]
    fn file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = || Arc::new(FileCredentialStore::new(Storage::new(dir.path())));

        AuthSession::new(store()).login(&auth_response());
        let restored = AuthSession::new(store());
        assert_eq!(restored.token().as_deref(), Some("access"));

        restored.invalidate();
        assert!(!AuthSession::new(store()).is_authenticated());
    }

    #[tokio::test]
    async fn watchers_see_invalidation() {
        let session = AuthSession::with_token("t");
        let mut rx = session.watch();
        assert!(rx.borrow().is_some());

        session.invalidate();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn debug_output_hides_token() {
        let session = AuthSession::with_token("super-secret");
        assert!(!format!("{session:?}").contains("super-secret"));
    }
}
