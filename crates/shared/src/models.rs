//! Shared data models for the event subscription API.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// --- Events ---

/// A server-defined occurrence type a user may subscribe to.
///
/// Timestamps come from the server without an offset, so they are kept as
/// naive date-times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub system_name: String,
    pub event_name: String,
    pub kafka_topic: String,
    pub description: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Body for creating or updating an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    pub system_name: String,
    pub event_name: String,
    pub kafka_topic: String,
    pub description: String,
}

impl EventInput {
    /// Check required fields. Returns the name of the first offending field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.system_name.trim().is_empty() {
            return Err("systemName");
        }
        if self.event_name.trim().is_empty() {
            return Err("eventName");
        }
        if self.kafka_topic.trim().is_empty() {
            return Err("kafkaTopic");
        }
        Ok(())
    }
}

// --- Subscriptions ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: i64,
    pub event_id: i64,
    pub event_name: String,
    pub system_name: String,
    pub subscribed: bool,
}

impl Subscription {
    /// Build a client-side placeholder for an event that has not been
    /// confirmed by the server yet. Placeholder ids are negative.
    pub fn provisional(temp_id: i64, event: &Event) -> Self {
        Self {
            id: temp_id,
            event_id: event.id,
            event_name: event.event_name.clone(),
            system_name: event.system_name.clone(),
            subscribed: true,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id < 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub event_id: i64,
    pub subscribed: bool,
}

/// An event annotated with whether the current user is subscribed to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventWithSubscription {
    #[serde(flatten)]
    pub event: Event,
    pub subscribed: bool,
}

/// Left-join events with the user's subscriptions on event id.
///
/// Output order follows `events`.
pub fn merge_subscriptions(
    events: &[Event],
    subscriptions: &[Subscription],
) -> Vec<EventWithSubscription> {
    let subscribed: HashSet<i64> = subscriptions.iter().map(|s| s.event_id).collect();

    events
        .iter()
        .map(|event| EventWithSubscription {
            subscribed: subscribed.contains(&event.id),
            event: event.clone(),
        })
        .collect()
}

/// Insert `sub`, replacing any existing entry for the same event.
pub fn upsert_subscription(subscriptions: &[Subscription], sub: Subscription) -> Vec<Subscription> {
    let mut out: Vec<Subscription> = subscriptions
        .iter()
        .filter(|s| s.event_id != sub.event_id)
        .cloned()
        .collect();
    out.push(sub);
    out
}

/// Copy of `subscriptions` without entries for `event_id`.
pub fn without_event(subscriptions: &[Subscription], event_id: i64) -> Vec<Subscription> {
    subscriptions
        .iter()
        .filter(|s| s.event_id != event_id)
        .cloned()
        .collect()
}

// --- Users ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub created_at: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<NaiveDateTime>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsernameRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// Response of `/users/login` and `/users/register`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: User,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
}
