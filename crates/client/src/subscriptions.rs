//! Optimistic subscribe/unsubscribe on top of the query cache.
//!
//! A mutation call does its local work before returning: it registers the
//! event id as loading, cancels background refetches of the event and
//! subscription caches, snapshots them and writes the optimistic result. The
//! request itself runs on the tokio runtime and is observed through the
//! returned [`MutationHandle`].
//!
//! When the request settles the loading entry is cleared. A failure restores
//! the subscription snapshot wholesale and is broadcast on the error channel.
//! Either way the subscription cache is invalidated so the server's answer
//! replaces whatever the client guessed.
//!
//! Overlapping calls for the same event id are not queued. The latest call
//! owns the loading entry and the right to roll back; an older call that
//! settles afterwards still reports its error but leaves the cache alone.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsub_shared::{
    merge_subscriptions, upsert_subscription, without_event, ApiError, Event,
    EventWithSubscription, Subscription, SubscriptionStatus,
};
use tokio::task::JoinHandle;

use crate::api_client::SubscriptionApi;
use crate::query_cache::{QueryCache, QueryError, QueryKey, QueryOptions};
use crate::retry::RetryPolicy;
use crate::stores::{ErrorChannel, LoadingRegistry};

pub const EVENTS_STALE_TIME: Duration = Duration::from_secs(5 * 60);
pub const SUBSCRIPTIONS_STALE_TIME: Duration = Duration::from_secs(60);
pub const STATUS_STALE_TIME: Duration = Duration::from_secs(30);

/// A subscribe or unsubscribe request running in the background.
pub struct MutationHandle<T> {
    event_id: i64,
    task: JoinHandle<Result<T, ApiError>>,
}

impl<T> MutationHandle<T> {
    pub fn event_id(&self) -> i64 {
        self.event_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the request has settled and the cache has been refreshed.
    pub async fn settled(self) -> Result<T, ApiError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ApiError::Unknown(format!("mutation task failed: {e}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationKind {
    Subscribe,
    Unsubscribe,
}

/// Cache state captured before an optimistic write.
struct Snapshot {
    ticket: u64,
    subscriptions: Option<Arc<Vec<Subscription>>>,
    events: Option<Arc<Vec<Event>>>,
}

/// Coordinates subscription state between the API, the cache and the UI.
#[derive(Clone)]
pub struct SubscriptionCoordinator {
    api: Arc<dyn SubscriptionApi>,
    cache: QueryCache,
    loading: LoadingRegistry,
    errors: ErrorChannel,
    query_retry: RetryPolicy,
    mutation_retry: RetryPolicy,
    /// Next provisional subscription id. Counts down from -1.
    next_temp_id: Arc<AtomicI64>,
}

impl SubscriptionCoordinator {
    /// Create a coordinator and register the event and subscription queries.
    pub fn new(api: Arc<dyn SubscriptionApi>, cache: QueryCache, errors: ErrorChannel) -> Self {
        let coordinator = Self {
            api,
            cache,
            loading: LoadingRegistry::new(),
            errors,
            query_retry: RetryPolicy::query(),
            mutation_retry: RetryPolicy::mutation(),
            next_temp_id: Arc::new(AtomicI64::new(-1)),
        };
        coordinator.register_queries();
        coordinator
    }

    pub fn with_retry_policies(mut self, query: RetryPolicy, mutation: RetryPolicy) -> Self {
        self.query_retry = query;
        self.mutation_retry = mutation;
        self.register_queries();
        self
    }

    fn register_queries(&self) {
        let api = Arc::clone(&self.api);
        self.cache.register(
            QueryKey::Events,
            QueryOptions::new(EVENTS_STALE_TIME).with_retry(self.query_retry.clone()),
            move || {
                let api = Arc::clone(&api);
                async move { api.get_events().await }
            },
        );

        let api = Arc::clone(&self.api);
        self.cache.register(
            QueryKey::UserSubscriptions,
            QueryOptions::new(SUBSCRIPTIONS_STALE_TIME).with_retry(self.query_retry.clone()),
            move || {
                let api = Arc::clone(&api);
                async move { api.get_user_subscriptions().await }
            },
        );
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn loading(&self) -> &LoadingRegistry {
        &self.loading
    }

    /// Populate the event and subscription caches, serving fresh entries as-is.
    pub async fn load(&self) -> Result<Vec<EventWithSubscription>, QueryError> {
        let (events, subscriptions) = tokio::try_join!(
            self.cache.fetch::<Vec<Event>>(QueryKey::Events),
            self.cache.fetch::<Vec<Subscription>>(QueryKey::UserSubscriptions),
        )?;
        Ok(merge_subscriptions(&events, &subscriptions))
    }

    /// Refetch both caches from the server.
    pub async fn refresh(&self) -> Result<Vec<EventWithSubscription>, QueryError> {
        let (events, subscriptions) = tokio::try_join!(
            self.cache.refetch::<Vec<Event>>(QueryKey::Events),
            self.cache.refetch::<Vec<Subscription>>(QueryKey::UserSubscriptions),
        )?;
        Ok(merge_subscriptions(&events, &subscriptions))
    }

    /// Events annotated with the current subscription state.
    ///
    /// Empty until both caches are populated.
    pub fn events_with_subscriptions(&self) -> Vec<EventWithSubscription> {
        match (
            self.cache.get::<Vec<Event>>(QueryKey::Events),
            self.cache.get::<Vec<Subscription>>(QueryKey::UserSubscriptions),
        ) {
            (Some(events), Some(subscriptions)) => merge_subscriptions(&events, &subscriptions),
            _ => Vec::new(),
        }
    }

    pub fn loading_event_ids(&self) -> BTreeSet<i64> {
        self.loading.ids()
    }

    pub fn is_loading(&self, event_id: i64) -> bool {
        self.loading.contains(event_id)
    }

    /// Server-side subscription status for one event, cached for 30 seconds.
    pub async fn subscription_status(&self, event_id: i64) -> Result<SubscriptionStatus, QueryError> {
        let key = QueryKey::SubscriptionStatus(event_id);
        if !self.cache.is_registered(key) {
            let api = Arc::clone(&self.api);
            self.cache.register(
                key,
                QueryOptions::new(STATUS_STALE_TIME).with_retry(self.query_retry.clone()),
                move || {
                    let api = Arc::clone(&api);
                    async move { api.get_subscription_status(event_id).await }
                },
            );
        }
        self.cache.fetch::<SubscriptionStatus>(key).await.map(|s| *s)
    }

    /// Subscribe to `event_id`, showing it as subscribed right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, event_id: i64) -> MutationHandle<Subscription> {
        let snapshot = self.begin(event_id, MutationKind::Subscribe);

        if let (Some(subscriptions), Some(events)) = (&snapshot.subscriptions, &snapshot.events) {
            if let Some(event) = events.iter().find(|e| e.id == event_id) {
                let provisional = Subscription::provisional(self.temp_id(), event);
                self.cache.set(
                    QueryKey::UserSubscriptions,
                    upsert_subscription(subscriptions, provisional),
                );
            }
        }

        let this = self.clone();
        let task = tokio::spawn(async move {
            let api = Arc::clone(&this.api);
            let result = this
                .mutation_retry
                .run(|| api.subscribe_to_event(event_id))
                .await;
            this.settle(event_id, MutationKind::Subscribe, snapshot, result)
                .await
        });

        MutationHandle { event_id, task }
    }

    /// Unsubscribe from `event_id`, showing it as unsubscribed right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn unsubscribe(&self, event_id: i64) -> MutationHandle<()> {
        let snapshot = self.begin(event_id, MutationKind::Unsubscribe);

        if let Some(subscriptions) = &snapshot.subscriptions {
            self.cache.set(
                QueryKey::UserSubscriptions,
                without_event(subscriptions, event_id),
            );
        }

        let this = self.clone();
        let task = tokio::spawn(async move {
            let api = Arc::clone(&this.api);
            let result = this
                .mutation_retry
                .run(|| api.unsubscribe_from_event(event_id))
                .await;
            this.settle(event_id, MutationKind::Unsubscribe, snapshot, result)
                .await
        });

        MutationHandle { event_id, task }
    }

    fn temp_id(&self) -> i64 {
        self.next_temp_id.fetch_sub(1, Ordering::Relaxed)
    }

    /// Register as loading, stop background refetches and capture the caches.
    fn begin(&self, event_id: i64, kind: MutationKind) -> Snapshot {
        let ticket = self.loading.begin(event_id);
        tracing::debug!(event_id, ?kind, ticket, "mutation started");

        self.cache.cancel(QueryKey::UserSubscriptions);
        self.cache.cancel(QueryKey::Events);

        Snapshot {
            ticket,
            subscriptions: self.cache.get(QueryKey::UserSubscriptions),
            events: self.cache.get(QueryKey::Events),
        }
    }

    async fn settle<T>(
        &self,
        event_id: i64,
        kind: MutationKind,
        snapshot: Snapshot,
        result: Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let latest = self.loading.finish(event_id, snapshot.ticket);

        match &result {
            Ok(_) => tracing::debug!(event_id, ?kind, "mutation confirmed"),
            Err(err) => {
                if !latest {
                    tracing::debug!(event_id, ?kind, "superseded mutation failed, keeping newer state");
                } else if let Some(previous) = snapshot.subscriptions {
                    tracing::warn!(event_id, ?kind, error = %err, "mutation failed, rolling back");
                    self.cache.set_arc(QueryKey::UserSubscriptions, previous);
                }
                self.errors.publish_api_error(err);
            }
        }

        for key in [QueryKey::UserSubscriptions, QueryKey::SubscriptionStatus(event_id)] {
            match self.cache.invalidate(key).await {
                Ok(()) | Err(QueryError::Cancelled(_)) => {}
                Err(e) => tracing::warn!(?key, error = %e, "refetch after mutation failed"),
            }
        }

        result
    }
}
