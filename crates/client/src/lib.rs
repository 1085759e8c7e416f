//! Eventsub Client - event subscription client core
//!
//! This crate talks to the event subscription REST API and keeps a local,
//! optimistically updated view of the user's subscriptions.

pub mod api_client;
pub mod auth_session;
pub mod config;
pub mod context;
pub mod query_cache;
pub mod retry;
pub mod storage;
pub mod stores;
pub mod subscriptions;

pub use api_client::{ApiClient, SubscriptionApi};
pub use auth_session::{AuthSession, Credential, CredentialStore};
pub use config::ClientConfig;
pub use context::ClientContext;
pub use query_cache::{QueryCache, QueryError, QueryKey};
pub use retry::{RetryClass, RetryPolicy};
pub use stores::{ErrorChannel, ErrorNotice, LoadingRegistry};
pub use subscriptions::{MutationHandle, SubscriptionCoordinator};
