//! Cross-instance invalidation over pub/sub.
//!
//! Whoever writes or evicts a key publishes an [`InvalidationEvent`]; every
//! other instance's subscriber drops the key from its local tier. Delivery is
//! best-effort: a lost message leaves a peer stale for at most one local TTL.
//!
//! Wire format (JSON):
//!
//! ```text
//! {"kind":"single_key","key":"vsa:v1:user::123","origin":"<uuid>","origin_timestamp":"2024-05-01T12:00:00Z"}
//! {"kind":"pattern","pattern":"vsa:v1:user:*","origin":"<uuid>","origin_timestamp":"2024-05-01T12:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::MessageBroker;
use super::key::{CacheKey, CachePattern};
use super::local::LocalTier;
use crate::config::InvalidationConfig;
use crate::error::{CacheError, ErrorCode, Result};
use crate::telemetry::metrics::CacheMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation Events
// ═══════════════════════════════════════════════════════════════════════════════

/// What an event invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationScope {
    /// One key
    SingleKey { key: String },

    /// Every key matching a glob
    Pattern { pattern: String },
}

/// A "this is stale" notice broadcast to every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    #[serde(flatten)]
    pub scope: InvalidationScope,

    /// Instance that published the event
    pub origin: Uuid,

    pub origin_timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn single_key(key: &CacheKey, origin: Uuid) -> Self {
        Self {
            scope: InvalidationScope::SingleKey {
                key: key.as_str().to_string(),
            },
            origin,
            origin_timestamp: Utc::now(),
        }
    }

    pub fn pattern(pattern: &CachePattern, origin: Uuid) -> Self {
        Self {
            scope: InvalidationScope::Pattern {
                pattern: pattern.as_str().to_string(),
            },
            origin,
            origin_timestamp: Utc::now(),
        }
    }

    /// Get the event kind name.
    pub fn kind(&self) -> &'static str {
        match self.scope {
            InvalidationScope::SingleKey { .. } => "single_key",
            InvalidationScope::Pattern { .. } => "pattern",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a wire payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| {
            CacheError::with_internal(
                ErrorCode::MalformedMessage,
                "Malformed invalidation message",
                e.to_string(),
            )
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation Bus
// ═══════════════════════════════════════════════════════════════════════════════

/// Publishes invalidations and applies peers' invalidations to a local tier.
pub struct InvalidationBus {
    broker: Arc<dyn MessageBroker>,
    channel: String,
    instance_id: Uuid,
    command_timeout: Duration,
    reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
    applied: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        config: &InvalidationConfig,
        command_timeout: Duration,
        instance_id: Uuid,
    ) -> Self {
        let (applied, _) = broadcast::channel(256);
        Self {
            broker,
            channel: config.channel.clone(),
            instance_id,
            command_timeout,
            reconnect_backoff: config.reconnect_backoff,
            max_reconnect_backoff: config.max_reconnect_backoff,
            applied,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Tell every peer to drop `key`. Failures are logged, never returned.
    pub async fn publish_single_key(&self, key: &CacheKey) -> bool {
        self.publish(InvalidationEvent::single_key(key, self.instance_id))
            .await
    }

    /// Tell every peer to drop keys matching `pattern`.
    pub async fn publish_pattern(&self, pattern: &CachePattern) -> bool {
        self.publish(InvalidationEvent::pattern(pattern, self.instance_id))
            .await
    }

    async fn publish(&self, event: InvalidationEvent) -> bool {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(error = %error, "Invalidation event could not be encoded");
                CacheMetrics::invalidation_dropped("encode");
                return false;
            }
        };

        let sent = tokio::time::timeout(
            self.command_timeout,
            self.broker.publish(&self.channel, &payload),
        )
        .await;

        match sent {
            Ok(Ok(receivers)) => {
                debug!(
                    channel = %self.channel,
                    kind = event.kind(),
                    receivers,
                    "Invalidation published"
                );
                CacheMetrics::invalidation_published(event.kind());
                true
            }
            Ok(Err(error)) => {
                warn!(
                    channel = %self.channel,
                    kind = event.kind(),
                    error = %error,
                    "Invalidation publish failed, peers stay stale until local TTL"
                );
                CacheMetrics::invalidation_dropped("publish");
                false
            }
            Err(_) => {
                warn!(
                    channel = %self.channel,
                    kind = event.kind(),
                    timeout = ?self.command_timeout,
                    "Invalidation publish timed out"
                );
                CacheMetrics::invalidation_dropped("timeout");
                false
            }
        }
    }

    /// Subscribe and decode. Malformed payloads are logged and skipped.
    pub async fn events(&self) -> Result<BoxStream<'static, InvalidationEvent>> {
        let raw = self.broker.subscribe(&self.channel).await?;
        let channel = self.channel.clone();

        let decoded = raw.filter_map(move |payload| {
            let channel = channel.clone();
            async move {
                match InvalidationEvent::from_json(&payload) {
                    Ok(event) => Some(event),
                    Err(error) => {
                        let _span = tracing::warn_span!(
                            "invalidation",
                            channel = %channel,
                            payload = %payload
                        )
                        .entered();
                        error.log();
                        CacheMetrics::invalidation_dropped("malformed");
                        None
                    }
                }
            }
        });

        Ok(decoded.boxed())
    }

    /// Events this instance has applied to its local tier.
    pub fn applied_events(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.applied.subscribe()
    }

    /// Apply a peer's event to `local`. Own events are skipped.
    pub fn apply(&self, local: &LocalTier, event: &InvalidationEvent) -> bool {
        if event.origin == self.instance_id {
            debug!(kind = event.kind(), "Skipping own invalidation event");
            return false;
        }

        match &event.scope {
            InvalidationScope::SingleKey { key } => {
                local.evict(key);
                debug!(key = %key, origin = %event.origin, "Applied single-key invalidation");
            }
            InvalidationScope::Pattern { pattern } => {
                // The local tier has no pattern index.
                let cleared = local.evict_all();
                debug!(
                    pattern = %pattern,
                    origin = %event.origin,
                    cleared,
                    "Applied pattern invalidation by clearing local tier"
                );
            }
        }

        CacheMetrics::invalidation_received(event.kind());
        let _ = self.applied.send(event.clone());
        true
    }

    /// Start the background subscriber feeding `local`.
    ///
    /// The first subscription is attempted before returning, so events
    /// published after this call are not missed. The task runs until
    /// `shutdown` is cancelled.
    pub async fn spawn_subscriber(
        self: &Arc<Self>,
        local: Arc<LocalTier>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let initial = match tokio::time::timeout(self.command_timeout, self.events()).await {
            Ok(Ok(events)) => {
                info!(channel = %self.channel, instance = %self.instance_id, "Invalidation subscriber listening");
                Some(events)
            }
            Ok(Err(error)) => {
                warn!(channel = %self.channel, error = %error, "Initial invalidation subscribe failed, retrying in background");
                None
            }
            Err(_) => {
                warn!(channel = %self.channel, "Initial invalidation subscribe timed out, retrying in background");
                None
            }
        };

        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.run_subscriber(initial, local, shutdown).await })
    }

    async fn run_subscriber(
        self: Arc<Self>,
        initial: Option<BoxStream<'static, InvalidationEvent>>,
        local: Arc<LocalTier>,
        shutdown: CancellationToken,
    ) {
        let mut pending = initial;
        let mut backoff = self.reconnect_backoff;

        loop {
            let mut events = match pending.take() {
                Some(events) => events,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_reconnect_backoff);

                    let subscribed = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.events() => result,
                    };
                    match subscribed {
                        Ok(events) => {
                            // Anything published while disconnected was missed.
                            let cleared = local.evict_all();
                            CacheMetrics::resubscribed();
                            info!(channel = %self.channel, cleared, "Invalidation subscriber re-subscribed");
                            backoff = self.reconnect_backoff;
                            events
                        }
                        Err(error) => {
                            warn!(channel = %self.channel, error = %error, retry_in = ?backoff, "Invalidation re-subscribe failed");
                            continue;
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(channel = %self.channel, "Invalidation subscriber stopped");
                        return;
                    }
                    next = events.next() => match next {
                        Some(event) => {
                            self.apply(&local, &event);
                        }
                        None => {
                            warn!(channel = %self.channel, "Invalidation subscription ended, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        info!(channel = %self.channel, "Invalidation subscriber stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
