//! Per-session log fan-out.
//!
//! Each session with at least one observer owns a broadcast channel. The
//! channel is created by the first `subscribe` and dropped as soon as the
//! last subscription goes away. Nothing is buffered for late subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Per-session channel capacity. Slow observers skip ahead past this.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// stdout, or an orchestration notice.
    Log,
    /// stderr.
    Error,
    /// Terminal event: the process has exited.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub session_id: String,
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(session_id: &str, kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

type Channels = HashMap<String, broadcast::Sender<LogEvent>>;

#[derive(Clone, Default)]
pub struct LogHub {
    channels: Arc<Mutex<Channels>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let rx = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        debug!(session_id, "Log observer subscribed");
        Subscription {
            session_id: session_id.to_string(),
            rx: Some(rx),
            hub: self.clone(),
        }
    }

    /// Deliver `event` to the current observers of `session_id`, if any.
    pub fn publish(&self, session_id: &str, event: LogEvent) {
        let Ok(channels) = self.channels.lock() else {
            return;
        };
        if let Some(tx) = channels.get(session_id) {
            // Err only means every receiver dropped in between.
            let _ = tx.send(event);
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn observer_count(&self, session_id: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(session_id).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    pub fn has_channel(&self, session_id: &str) -> bool {
        self.channels
            .lock()
            .map(|c| c.contains_key(session_id))
            .unwrap_or(false)
    }

    fn prune(&self, session_id: &str) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        if channels
            .get(session_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(session_id);
            debug!(session_id, "Last log observer left");
        }
    }
}

/// A live observer bound to one session. Dropping it unsubscribes.
pub struct Subscription {
    session_id: String,
    rx: Option<broadcast::Receiver<LogEvent>>,
    hub: LogHub,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session_id, skipped, "Log observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release the receiver first so the count seen by prune excludes us.
        drop(self.rx.take());
        self.hub.prune(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = LogHub::new();
        let mut sub = hub.subscribe("s1");

        for i in 0..50 {
            hub.publish("s1", LogEvent::new("s1", LogKind::Log, format!("line {}", i)));
        }
        for i in 0..50 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.message, format!("line {}", i));
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_backlog() {
        let hub = LogHub::new();
        let _early = hub.subscribe("s1");
        hub.publish("s1", LogEvent::new("s1", LogKind::Log, "before"));

        let mut late = hub.subscribe("s1");
        hub.publish("s1", LogEvent::new("s1", LogKind::Error, "after"));

        let event = late.recv().await.unwrap();
        assert_eq!(event.message, "after");
        assert_eq!(event.kind, LogKind::Error);
    }

    #[tokio::test]
    async fn publish_without_observers_is_noop() {
        let hub = LogHub::new();
        hub.publish("nobody", LogEvent::new("nobody", LogKind::Log, "x"));
        assert!(!hub.has_channel("nobody"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let hub = LogHub::new();
        let mut a = hub.subscribe("a");
        let _b = hub.subscribe("b");

        hub.publish("b", LogEvent::new("b", LogKind::Log, "for b"));
        hub.publish("a", LogEvent::new("a", LogKind::Log, "for a"));

        assert_eq!(a.recv().await.unwrap().message, "for a");
        assert!(timeout(Duration::from_millis(50), a.recv()).await.is_err());
    }

    #[tokio::test]
    async fn channel_removed_when_last_observer_leaves() {
        let hub = LogHub::new();
        let first = hub.subscribe("s1");
        let second = hub.subscribe("s1");
        assert_eq!(hub.observer_count("s1"), 2);

        hub.unsubscribe(first);
        assert!(hub.has_channel("s1"));
        assert_eq!(hub.observer_count("s1"), 1);

        drop(second);
        assert!(!hub.has_channel("s1"));
    }

    #[test]
    fn kind_serializes_lowercase() {
        let event = LogEvent::new("s", LogKind::Exit, "exit code 0");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "exit");
        assert_eq!(json["session_id"], "s");
    }
}
