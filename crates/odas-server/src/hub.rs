use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use odas_core::{Envelope, MessageKind};
use odas_telemetry::{names, MetricsRecorder};
use serde_json::Value;
use uuid::Uuid;

/// Unique subscriber identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub String);

impl Default for SubscriberId {
    fn default() -> Self {
        Self(format!("sub_{}", Uuid::now_v7()))
    }
}

impl SubscriberId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of handing one serialized envelope to a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Channel exists but cannot take the message right now. Not retried.
    NotReady,
    /// Channel is gone for good; the hub forgets it.
    Closed,
}

/// A downstream push channel, e.g. one WebSocket client.
///
/// Implementations must not block: `send` is called from the upstream read
/// path for every decoded frame.
pub trait PushChannel: Send + Sync {
    fn id(&self) -> &SubscriberId;

    fn is_ready(&self) -> bool;

    fn send(&self, text: Arc<str>) -> SendOutcome;

    /// Liveness for periodic cleanup. Channels without a heartbeat are
    /// alive as long as they are ready.
    fn is_alive(&self) -> bool {
        self.is_ready()
    }
}

/// Per-publish delivery counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Live set of subscribers. Fans every envelope out to all of them.
pub struct BroadcastHub {
    subscribers: DashMap<SubscriberId, Arc<dyn PushChannel>>,
    metrics: Arc<MetricsRecorder>,
}

impl BroadcastHub {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            subscribers: DashMap::new(),
            metrics,
        }
    }

    /// Add a channel. Returns false if its id is already registered.
    pub fn register(&self, channel: Arc<dyn PushChannel>) -> bool {
        match self.subscribers.entry(channel.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(channel);
                self.metrics.gauge_add(names::SUBSCRIBERS_ACTIVE, &[], 1);
                true
            }
        }
    }

    /// Remove a channel. Returns false if it was not registered.
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        if self.subscribers.remove(id).is_some() {
            self.metrics.gauge_add(names::SUBSCRIBERS_ACTIVE, &[], -1);
            true
        } else {
            false
        }
    }

    pub fn is_registered(&self, id: &SubscriberId) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Number of registered subscribers.
    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    /// Serialize `{type, data}` once and offer it to every subscriber.
    ///
    /// Channels that are not ready are skipped for this message only. A
    /// channel reporting `Closed` is unregistered. Nothing is queued for
    /// later, and one channel's failure never affects the others.
    pub fn publish(&self, kind: MessageKind, payload: &Value) -> PublishReport {
        let mut report = PublishReport::default();

        let text: Arc<str> = match Envelope::new(kind, payload).encode() {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), error = %e, "Failed to encode envelope");
                return report;
            }
        };
        self.metrics
            .counter_inc(names::MESSAGES_PUBLISHED, &[("type", kind.as_str())], 1);

        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            let channel = entry.value();
            if !channel.is_ready() {
                report.skipped += 1;
                continue;
            }
            match channel.send(Arc::clone(&text)) {
                SendOutcome::Sent => report.delivered += 1,
                SendOutcome::NotReady => report.skipped += 1,
                SendOutcome::Closed => closed.push(entry.key().clone()),
            }
        }

        for id in closed {
            if self.unregister(&id) {
                report.removed += 1;
                tracing::debug!(subscriber_id = %id, "Dropped closed subscriber");
            }
        }

        self.metrics
            .counter_inc(names::DELIVERIES_SENT, &[], report.delivered as u64);
        self.metrics
            .counter_inc(names::DELIVERIES_SKIPPED, &[], report.skipped as u64);
        report
    }

    /// Remove subscribers whose channel reports itself dead.
    pub fn cleanup_dead(&self) -> usize {
        let dead: Vec<SubscriberId> = self
            .subscribers
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id) {
                removed += 1;
                tracing::info!(subscriber_id = %id, "Cleaned up dead subscriber");
            }
        }
        removed
    }

    /// Drop every subscriber. Used on shutdown.
    pub fn reset(&self) -> usize {
        let ids: Vec<SubscriberId> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.unregister(id)).count()
    }
}
