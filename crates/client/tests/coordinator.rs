//! Optimistic subscribe/unsubscribe against a scripted in-memory API.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use eventsub_client::{
    ErrorChannel, QueryCache, QueryError, QueryKey, RetryClass, RetryPolicy, SubscriptionApi,
    SubscriptionCoordinator,
};
use eventsub_shared::{ApiError, ErrorCode, Event, Subscription, SubscriptionStatus};

/// How one subscribe/unsubscribe call to the mock behaves.
#[derive(Clone, Default)]
struct Plan {
    delay: Duration,
    error: Option<ApiError>,
}

impl Plan {
    fn ok_after(ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            error: None,
        }
    }

    fn fail_after(ms: u64, status: u16) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            error: Some(ApiError::from_response(status, "")),
        }
    }
}

#[derive(Default)]
struct MockApi {
    events: Vec<Event>,
    server: Mutex<Vec<Subscription>>,
    plans: Mutex<HashMap<i64, VecDeque<Plan>>>,
    calls: Mutex<HashMap<i64, u32>>,
    list_delay: Duration,
    next_id: AtomicI64,
}

impl MockApi {
    fn new(event_ids: &[i64], subscribed: &[i64]) -> Self {
        let events: Vec<Event> = event_ids.iter().map(|&id| event(id)).collect();
        let server = events
            .iter()
            .filter(|e| subscribed.contains(&e.id))
            .map(|e| Subscription {
                id: 1000 + e.id,
                event_id: e.id,
                event_name: e.event_name.clone(),
                system_name: e.system_name.clone(),
                subscribed: true,
            })
            .collect();
        Self {
            events,
            server: Mutex::new(server),
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn with_list_delay(mut self, ms: u64) -> Self {
        self.list_delay = Duration::from_millis(ms);
        self
    }

    fn plan(self, event_id: i64, plan: Plan) -> Self {
        self.plans
            .lock()
            .unwrap()
            .entry(event_id)
            .or_default()
            .push_back(plan);
        self
    }

    fn calls(&self, event_id: i64) -> u32 {
        self.calls.lock().unwrap().get(&event_id).copied().unwrap_or(0)
    }

    fn server_event_ids(&self) -> BTreeSet<i64> {
        self.server.lock().unwrap().iter().map(|s| s.event_id).collect()
    }

    async fn run_plan(&self, event_id: i64) -> Result<(), ApiError> {
        *self.calls.lock().unwrap().entry(event_id).or_default() += 1;
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&event_id)
            .and_then(|q| q.pop_front())
            .unwrap_or_default();
        tokio::time::sleep(plan.delay).await;
        match plan.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SubscriptionApi for MockApi {
    async fn get_events(&self) -> Result<Vec<Event>, ApiError> {
        Ok(self.events.clone())
    }

    async fn get_user_subscriptions(&self) -> Result<Vec<Subscription>, ApiError> {
        tokio::time::sleep(self.list_delay).await;
        Ok(self.server.lock().unwrap().clone())
    }

    async fn subscribe_to_event(&self, event_id: i64) -> Result<Subscription, ApiError> {
        self.run_plan(event_id).await?;
        let event = self
            .events
            .iter()
            .find(|e| e.id == event_id)
            .ok_or_else(|| ApiError::from_response(404, ""))?;
        let sub = Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            event_id,
            event_name: event.event_name.clone(),
            system_name: event.system_name.clone(),
            subscribed: true,
        };
        let mut server = self.server.lock().unwrap();
        server.retain(|s| s.event_id != event_id);
        server.push(sub.clone());
        Ok(sub)
    }

    async fn unsubscribe_from_event(&self, event_id: i64) -> Result<(), ApiError> {
        self.run_plan(event_id).await?;
        self.server.lock().unwrap().retain(|s| s.event_id != event_id);
        Ok(())
    }

    async fn get_subscription_status(&self, event_id: i64) -> Result<SubscriptionStatus, ApiError> {
        Ok(SubscriptionStatus {
            event_id,
            subscribed: self.server_event_ids().contains(&event_id),
        })
    }
}

fn event(id: i64) -> Event {
    let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap();
    Event {
        id,
        system_name: "orders".into(),
        event_name: format!("order.{id}"),
        kafka_topic: format!("orders.{id}"),
        description: String::new(),
        created_at: ts,
        updated_at: ts,
    }
}

async fn coordinator(api: MockApi) -> (SubscriptionCoordinator, Arc<MockApi>) {
    coordinator_with(api, RetryPolicy::none(RetryClass::Mutation)).await
}

async fn coordinator_with(
    api: MockApi,
    mutation_retry: RetryPolicy,
) -> (SubscriptionCoordinator, Arc<MockApi>) {
    let api = Arc::new(api);
    let coordinator = SubscriptionCoordinator::new(api.clone(), QueryCache::new(), ErrorChannel::new())
        .with_retry_policies(RetryPolicy::none(RetryClass::Query), mutation_retry);
    coordinator.load().await.unwrap();
    (coordinator, api)
}

fn is_subscribed(coordinator: &SubscriptionCoordinator, event_id: i64) -> bool {
    coordinator
        .events_with_subscriptions()
        .iter()
        .any(|e| e.event.id == event_id && e.subscribed)
}

fn cached_event_ids(coordinator: &SubscriptionCoordinator) -> Vec<i64> {
    coordinator
        .cache()
        .get::<Vec<Subscription>>(QueryKey::UserSubscriptions)
        .map(|subs| subs.iter().map(|s| s.event_id).collect())
        .unwrap_or_default()
}

async fn wait_for_call(api: &MockApi, event_id: i64, n: u32) {
    while api.calls(event_id) < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn subscribe_shows_subscribed_before_the_request_settles() {
    let (coordinator, _api) = coordinator(MockApi::new(&[1, 2], &[]).plan(1, Plan::ok_after(100))).await;
    assert!(!is_subscribed(&coordinator, 1));

    let handle = coordinator.subscribe(1);

    assert!(is_subscribed(&coordinator, 1));
    assert!(coordinator.is_loading(1));
    assert!(!coordinator.is_loading(2));
    assert!(!handle.is_finished());

    handle.settled().await.unwrap();
    assert!(!coordinator.is_loading(1));
    assert!(is_subscribed(&coordinator, 1));
}

#[tokio::test(start_paused = true)]
async fn optimistic_subscription_is_provisional_until_confirmed() {
    let (coordinator, _api) = coordinator(MockApi::new(&[123], &[]).plan(123, Plan::ok_after(50))).await;

    let handle = coordinator.subscribe(123);
    let subs = coordinator
        .cache()
        .get::<Vec<Subscription>>(QueryKey::UserSubscriptions)
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert!(subs[0].is_provisional());

    let confirmed = handle.settled().await.unwrap();
    assert!(!confirmed.is_provisional());
    let subs = coordinator
        .cache()
        .get::<Vec<Subscription>>(QueryKey::UserSubscriptions)
        .unwrap();
    assert_eq!(*subs, vec![confirmed]);
}

#[tokio::test]
async fn successful_subscribe_scenario() {
    let (coordinator, api) = coordinator(MockApi::new(&[123], &[])).await;

    coordinator.subscribe(123).settled().await.unwrap();

    assert_eq!(cached_event_ids(&coordinator), vec![123]);
    assert!(coordinator.loading_event_ids().is_empty());
    assert_eq!(api.server_event_ids(), BTreeSet::from([123]));
    assert!(coordinator.errors().notices().is_empty());
}

#[tokio::test]
async fn failed_subscribe_reverts_and_broadcasts_once() {
    let (coordinator, _api) =
        coordinator(MockApi::new(&[123], &[]).plan(123, Plan::fail_after(0, 500))).await;
    let mut errors = coordinator.errors().subscribe();

    let err = coordinator.subscribe(123).settled().await.unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::InternalError));
    assert!(cached_event_ids(&coordinator).is_empty());
    assert!(!is_subscribed(&coordinator, 123));
    assert!(coordinator.loading_event_ids().is_empty());

    let notice = errors.try_recv().expect("error broadcast");
    assert_eq!(notice.status, Some(500));
    assert!(errors.try_recv().is_none());
    assert_eq!(coordinator.errors().notices().len(), 1);
}

fn cached_subscriptions(coordinator: &SubscriptionCoordinator) -> Arc<Vec<Subscription>> {
    coordinator
        .cache()
        .get::<Vec<Subscription>>(QueryKey::UserSubscriptions)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn failed_subscribe_restores_the_snapshot_before_refetch() {
    let api = MockApi::new(&[1, 2], &[2])
        .with_list_delay(200)
        .plan(1, Plan::fail_after(100, 503));
    let (coordinator, _api) = coordinator(api).await;
    let mut errors = coordinator.errors().subscribe();
    let before = cached_subscriptions(&coordinator);

    let handle = coordinator.subscribe(1);
    assert_eq!(cached_event_ids(&coordinator), vec![2, 1]);

    // Failure lands at 100ms; the follow-up list refetch is still running at 150ms.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(coordinator.cache().is_fetching(QueryKey::UserSubscriptions));
    assert!(!is_subscribed(&coordinator, 1));
    assert!(Arc::ptr_eq(&cached_subscriptions(&coordinator), &before));
    assert!(coordinator.loading_event_ids().is_empty());
    assert!(errors.try_recv().is_some());

    handle.settled().await.unwrap_err();
    assert_eq!(cached_subscriptions(&coordinator), before);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_shows_unsubscribed_and_confirms() {
    let (coordinator, api) =
        coordinator(MockApi::new(&[456], &[456]).plan(456, Plan::ok_after(100))).await;
    assert!(is_subscribed(&coordinator, 456));

    let handle = coordinator.unsubscribe(456);
    assert!(!is_subscribed(&coordinator, 456));
    assert!(coordinator.is_loading(456));

    handle.settled().await.unwrap();
    assert!(!is_subscribed(&coordinator, 456));
    assert!(!coordinator.is_loading(456));
    assert!(api.server_event_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_unsubscribe_reverts_to_subscribed() {
    let api = MockApi::new(&[456, 789], &[456, 789])
        .with_list_delay(200)
        .plan(456, Plan::fail_after(100, 404));
    let (coordinator, _api) = coordinator(api).await;
    let mut errors = coordinator.errors().subscribe();
    let before = cached_subscriptions(&coordinator);

    let handle = coordinator.unsubscribe(456);
    assert!(!is_subscribed(&coordinator, 456));
    assert_eq!(cached_event_ids(&coordinator), vec![789]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(coordinator.cache().is_fetching(QueryKey::UserSubscriptions));
    assert!(is_subscribed(&coordinator, 456));
    assert!(Arc::ptr_eq(&cached_subscriptions(&coordinator), &before));
    assert!(!coordinator.is_loading(456));

    let err = handle.settled().await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));
    assert!(is_subscribed(&coordinator, 456));
    assert!(errors.try_recv().is_some());
    assert!(errors.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn provisional_ids_are_unique() {
    let api = MockApi::new(&[1, 2], &[])
        .plan(1, Plan::ok_after(100))
        .plan(2, Plan::ok_after(100));
    let (coordinator, _api) = coordinator(api).await;

    let first = coordinator.subscribe(1);
    let second = coordinator.subscribe(2);

    let ids: Vec<i64> = cached_subscriptions(&coordinator).iter().map(|s| s.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|&id| id < 0));
    assert_ne!(ids[0], ids[1]);

    first.settled().await.unwrap();
    second.settled().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_mutations_clear_independently() {
    let api = MockApi::new(&[1, 2, 3], &[])
        .plan(1, Plan::ok_after(50))
        .plan(2, Plan::fail_after(30, 500))
        .plan(3, Plan::ok_after(10));
    let (coordinator, _api) = coordinator(api).await;

    let handles: Vec<_> = [1, 2, 3].into_iter().map(|id| coordinator.subscribe(id)).collect();
    assert_eq!(coordinator.loading_event_ids(), BTreeSet::from([1, 2, 3]));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.loading_event_ids(), BTreeSet::from([1, 2]));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.loading_event_ids(), BTreeSet::from([1]));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(coordinator.loading_event_ids().is_empty());

    let outcomes: Vec<bool> = futures_util::future::join_all(handles.into_iter().map(|h| h.settled()))
        .await
        .into_iter()
        .map(|r| r.is_ok())
        .collect();
    assert_eq!(outcomes, vec![true, false, true]);
    assert!(is_subscribed(&coordinator, 1));
    assert!(!is_subscribed(&coordinator, 2));
    assert!(is_subscribed(&coordinator, 3));
}

#[tokio::test(start_paused = true)]
async fn subscribe_and_unsubscribe_with_different_latencies() {
    let api = MockApi::new(&[123, 456], &[456])
        .plan(123, Plan::ok_after(100))
        .plan(456, Plan::ok_after(150));
    let (coordinator, _api) = coordinator(api).await;

    let subscribe = coordinator.subscribe(123);
    let unsubscribe = coordinator.unsubscribe(456);
    assert_eq!(coordinator.loading_event_ids(), BTreeSet::from([123, 456]));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(coordinator.loading_event_ids(), BTreeSet::from([456]));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.loading_event_ids().is_empty());

    subscribe.settled().await.unwrap();
    unsubscribe.settled().await.unwrap();
    assert!(is_subscribed(&coordinator, 123));
    assert!(!is_subscribed(&coordinator, 456));
}

#[tokio::test(start_paused = true)]
async fn superseded_failure_does_not_roll_back_newer_state() {
    let api = MockApi::new(&[7], &[])
        .plan(7, Plan::fail_after(100, 500))
        .plan(7, Plan::ok_after(50));
    let (coordinator, api) = coordinator(api).await;
    let mut errors = coordinator.errors().subscribe();

    let first = coordinator.subscribe(7);
    wait_for_call(&api, 7, 1).await;
    let second = coordinator.subscribe(7);
    wait_for_call(&api, 7, 2).await;

    second.settled().await.unwrap();
    assert!(!coordinator.is_loading(7));
    assert!(is_subscribed(&coordinator, 7));

    first.settled().await.unwrap_err();
    assert!(is_subscribed(&coordinator, 7));
    assert!(!coordinator.is_loading(7));
    assert!(errors.try_recv().is_some());
}

#[tokio::test(start_paused = true)]
async fn older_request_settling_first_keeps_newer_one_loading() {
    let api = MockApi::new(&[7], &[7])
        .plan(7, Plan::ok_after(10))
        .plan(7, Plan::ok_after(100));
    let (coordinator, api) = coordinator(api).await;

    let unsubscribe = coordinator.unsubscribe(7);
    wait_for_call(&api, 7, 1).await;
    let subscribe = coordinator.subscribe(7);

    unsubscribe.settled().await.unwrap();
    assert!(coordinator.is_loading(7));

    subscribe.settled().await.unwrap();
    assert!(!coordinator.is_loading(7));
    assert!(is_subscribed(&coordinator, 7));
}

#[tokio::test]
async fn derived_view_is_idempotent() {
    let (coordinator, _api) = coordinator(MockApi::new(&[1, 2, 3], &[2])).await;
    let first = coordinator.events_with_subscriptions();
    let second = coordinator.events_with_subscriptions();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn derived_view_is_empty_before_load() {
    let coordinator = SubscriptionCoordinator::new(
        Arc::new(MockApi::new(&[1], &[])),
        QueryCache::new(),
        ErrorChannel::new(),
    );
    assert!(coordinator.events_with_subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn mutation_cancels_background_refetch() {
    let api = MockApi::new(&[1], &[]).with_list_delay(200).plan(1, Plan::ok_after(500));
    let (coordinator, _api) = coordinator(api).await;

    let background = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh().await }
    });
    while !coordinator.cache().is_fetching(QueryKey::UserSubscriptions) {
        tokio::task::yield_now().await;
    }

    let handle = coordinator.subscribe(1);
    let refreshed = background.await.unwrap();
    assert_eq!(refreshed, Err(QueryError::Cancelled(QueryKey::UserSubscriptions)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(is_subscribed(&coordinator, 1));
    handle.settled().await.unwrap();
    assert!(is_subscribed(&coordinator, 1));
}

#[tokio::test]
async fn status_is_refetched_after_mutation() {
    let (coordinator, _api) = coordinator(MockApi::new(&[5], &[])).await;
    assert!(!coordinator.subscription_status(5).await.unwrap().subscribed);

    coordinator.subscribe(5).settled().await.unwrap();

    let status = coordinator
        .cache()
        .get::<SubscriptionStatus>(QueryKey::SubscriptionStatus(5))
        .unwrap();
    assert!(status.subscribed);
    assert!(coordinator.subscription_status(5).await.unwrap().subscribed);
}

#[tokio::test(start_paused = true)]
async fn mutation_retries_server_errors() {
    let api = MockApi::new(&[9], &[])
        .plan(9, Plan::fail_after(0, 503))
        .plan(9, Plan::ok_after(0));
    let (coordinator, api) = coordinator_with(api, RetryPolicy::mutation()).await;

    coordinator.subscribe(9).settled().await.unwrap();

    assert_eq!(api.calls(9), 2);
    assert!(is_subscribed(&coordinator, 9));
    assert!(coordinator.errors().notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn mutation_does_not_retry_client_errors() {
    let api = MockApi::new(&[9], &[]).plan(9, Plan::fail_after(0, 409));
    let (coordinator, api) = coordinator_with(api, RetryPolicy::mutation()).await;

    let err = coordinator.subscribe(9).settled().await.unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::Conflict));
    assert_eq!(api.calls(9), 1);
    assert!(!is_subscribed(&coordinator, 9));
}
