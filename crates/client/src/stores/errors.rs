//! Error broadcast channel for user-facing notifications.
//!
//! Publishers push [`ErrorNotice`]s; every live [`ErrorSubscription`] receives
//! a copy. The channel also keeps the list of notices that have not been
//! dismissed yet, for whatever surface renders them. Non-critical notices
//! drop out of that list on their own after [`TRANSIENT_NOTICE_TTL`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventsub_shared::{ApiError, ErrorCode};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use uuid::Uuid;

/// How long a non-critical notice stays in the active list.
pub const TRANSIENT_NOTICE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub id: Uuid,
    pub message: String,
    pub severity: Severity,
    pub status: Option<u16>,
    pub code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorNotice {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            severity,
            status: None,
            code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_api(err: &ApiError) -> Self {
        Self {
            status: err.status(),
            code: err.code(),
            ..Self::new(err.user_message(), Severity::Error)
        }
    }

    /// Warnings, infos and errors from a 4xx response expire on their own.
    pub fn is_transient(&self) -> bool {
        self.severity != Severity::Error || self.status.is_some_and(|s| s < 500)
    }
}

struct ActiveNotice {
    notice: ErrorNotice,
    expires_at: Option<Instant>,
}

impl ActiveNotice {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct ChannelState {
    next_subscriber: u64,
    subscribers: HashMap<u64, UnboundedSender<ErrorNotice>>,
    active: Vec<ActiveNotice>,
}

fn lock(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publish/subscribe hub for error notices. Clones share subscribers.
#[derive(Clone, Default)]
pub struct ErrorChannel {
    state: Arc<Mutex<ChannelState>>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct ErrorSubscription {
    id: u64,
    channel: Weak<Mutex<ChannelState>>,
    receiver: UnboundedReceiver<ErrorNotice>,
}

impl ErrorSubscription {
    /// Wait for the next notice. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ErrorNotice> {
        self.receiver.recv().await
    }

    /// Next notice if one is already queued.
    pub fn try_recv(&mut self) -> Option<ErrorNotice> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ErrorSubscription {
    fn drop(&mut self) {
        if let Some(state) = self.channel.upgrade() {
            lock(&state).subscribers.remove(&self.id);
        }
    }
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ErrorSubscription {
        let (tx, rx) = unbounded_channel();
        let mut state = lock(&self.state);
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, tx);
        ErrorSubscription {
            id,
            channel: Arc::downgrade(&self.state),
            receiver: rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Record `notice` and deliver it to every subscriber.
    pub fn publish(&self, notice: ErrorNotice) {
        match notice.severity {
            Severity::Error => tracing::error!(code = ?notice.code, "{}", notice.message),
            Severity::Warning => tracing::warn!(code = ?notice.code, "{}", notice.message),
            Severity::Info => tracing::info!("{}", notice.message),
        }

        let now = Instant::now();
        let expires_at = notice.is_transient().then(|| now + TRANSIENT_NOTICE_TTL);

        let mut state = lock(&self.state);
        state.active.retain(|a| a.is_live(now));
        state.active.push(ActiveNotice {
            notice: notice.clone(),
            expires_at,
        });
        // Receivers that went away without dropping their handle are pruned here.
        state
            .subscribers
            .retain(|_, tx| tx.send(notice.clone()).is_ok());
    }

    /// Publish an API failure as an error notice.
    pub fn publish_api_error(&self, err: &ApiError) -> ErrorNotice {
        let notice = ErrorNotice::from_api(err);
        self.publish(notice.clone());
        notice
    }

    /// Notices not yet dismissed or expired, oldest first.
    pub fn notices(&self) -> Vec<ErrorNotice> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.active.retain(|a| a.is_live(now));
        state.active.iter().map(|a| a.notice.clone()).collect()
    }

    pub fn dismiss(&self, id: Uuid) {
        lock(&self.state).active.retain(|a| a.notice.id != id);
    }

    pub fn clear(&self) {
        lock(&self.state).active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_notice() {
        let channel = ErrorChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(ErrorNotice::new("boom", Severity::Error));

        assert_eq!(a.recv().await.map(|n| n.message), Some("boom".to_string()));
        assert_eq!(b.recv().await.map(|n| n.message), Some("boom".to_string()));
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let channel = ErrorChannel::new();
        let sub = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(channel.subscriber_count(), 0);
        channel.publish(ErrorNotice::new("nobody listening", Severity::Info));
        assert_eq!(channel.notices().len(), 1);
    }

    #[test]
    fn api_error_carries_status_and_code() {
        let channel = ErrorChannel::new();
        let mut sub = channel.subscribe();
        let err = ApiError::from_response(401, r#"{"error":"Not authenticated"}"#);

        channel.publish_api_error(&err);

        let notice = sub.try_recv().unwrap();
        assert_eq!(notice.status, Some(401));
        assert_eq!(notice.code, Some(ErrorCode::Unauthorized));
        assert_eq!(notice.message, "Not authenticated");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dismiss_and_clear() {
        let channel = ErrorChannel::new();
        let first = ErrorNotice::new("one", Severity::Warning);
        channel.publish(first.clone());
        channel.publish(ErrorNotice::new("two", Severity::Error));

        channel.dismiss(first.id);
        assert_eq!(channel.notices().len(), 1);
        channel.clear();
        assert!(channel.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_notices_expire() {
        let channel = ErrorChannel::new();
        channel.publish(ErrorNotice::new("heads up", Severity::Warning));
        channel.publish_api_error(&ApiError::from_response(409, ""));
        let sticky = channel.publish_api_error(&ApiError::from_response(500, ""));
        assert_eq!(channel.notices().len(), 3);

        tokio::time::advance(TRANSIENT_NOTICE_TTL - Duration::from_millis(1)).await;
        assert_eq!(channel.notices().len(), 3);

        tokio::time::advance(Duration::from_millis(1)).await;
        let remaining: Vec<_> = channel.notices().into_iter().map(|n| n.id).collect();
        assert_eq!(remaining, vec![sticky.id]);
    }
}
