//! Shared store backends.
//!
//! The cache needs very little from its network store: byte values with a
//! per-key TTL, conditional set and compare-and-delete for locks, glob
//! deletion, and a best-effort pub/sub channel. [`SharedStore`] and
//! [`MessageBroker`] capture exactly that.
//!
//! - [`RedisStore`]: production backend over a multiplexed, auto-reconnecting
//!   Redis connection.
//! - [`MemoryStore`]: in-process stand-in with fault injection. One instance
//!   shared through an `Arc` behaves like a store several cache instances
//!   talk to.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use super::key::glob_to_regex;
use crate::config::redact_url;
use crate::error::{CacheError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Store Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Key-value operations the shared tier and the lock client rely on.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get the raw value of a key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Set only if the key does not exist. Returns whether the value was set.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete a key only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Reset a key's TTL only while it still holds `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete every key matching a glob, a page at a time. Returns the
    /// number deleted.
    ///
    /// Each round trip is bounded by `step_timeout` rather than the whole
    /// walk. When a later page fails, the keys deleted so far are reported;
    /// only a failure on the first page is an error.
    async fn delete_pattern(&self, pattern: &str, step_timeout: Duration) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime. `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn ping(&self) -> Result<()>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

/// Best-effort broadcast to whoever is subscribed right now.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish a payload. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Subscribe to a channel. The stream ends when the subscription drops.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Keys examined per pattern-delete round trip.
const PATTERN_PAGE_SIZE: usize = 100;

/// One store round trip under its own timeout.
async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::timeout(operation, limit)),
    }
}

/// Redis-backed store and broker.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    compare_and_delete: redis::Script,
    compare_and_pexpire: redis::Script,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CacheError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let conn = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| {
                CacheError::with_internal(
                    ErrorCode::CacheConnectionFailed,
                    "Failed to connect to Redis",
                    e.to_string(),
                )
            })?;

        let store = Self {
            client,
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
            compare_and_pexpire: redis::Script::new(COMPARE_AND_PEXPIRE),
        };
        store.ping().await?;

        info!(url = %redact_url(url), "Redis shared store connected");
        Ok(store)
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let updated: i64 = self
            .compare_and_pexpire
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn delete_pattern(&self, pattern: &str, step_timeout: Duration) -> Result<u64> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut total_deleted = 0;
        let mut pages = 0u32;

        loop {
            let page = bounded("SCAN", step_timeout, async {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(PATTERN_PAGE_SIZE)
                    .query_async(&mut conn)
                    .await?;
                let deleted: i64 = if keys.is_empty() {
                    0
                } else {
                    redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?
                };
                Ok::<_, CacheError>((next, deleted as u64))
            })
            .await;

            match page {
                Ok((next, deleted)) => {
                    total_deleted += deleted;
                    pages += 1;
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(error) if pages > 0 => {
                    warn!(
                        pattern = %pattern,
                        deleted = total_deleted,
                        error = %error,
                        "Redis pattern delete interrupted, remaining keys expire by TTL"
                    );
                    break;
                }
                Err(error) => return Err(error),
            }
        }

        debug!(pattern = %pattern, deleted = total_deleted, pages, "Redis pattern delete");
        Ok(total_deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn();
        // -2: missing, -1: no expiry
        let remaining: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl MessageBroker for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.conn();
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        // Pub/sub needs a dedicated connection; the manager is multiplexed.
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| String::from_utf8_lossy(msg.get_payload_bytes()).into_owned());

        Ok(stream.boxed())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-process store and broker with fault injection.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
    latency: RwLock<Duration>,
    channel_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            channel_capacity: 1024,
        }
    }

    /// Make every subsequent call fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay every call by `latency`, to exercise client timeouts.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// End every open subscription, as a dropped broker connection would.
    pub fn disconnect_subscribers(&self) {
        self.channels.clear();
    }

    /// Raw write without expiry, for seeding corrupt or foreign values.
    pub fn insert_raw(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: bytes.into(),
                expires_at: None,
            },
        );
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_available() {
            return Err(CacheError::unavailable(format!(
                "memory store rejected {}",
                operation
            )));
        }
        Ok(())
    }

    /// Remove the key if expired; returns whether a live value remains.
    fn live(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.remove_if(key, |_, v| v.is_expired(now));
        self.entries.contains_key(key)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.enter("GET").await?;
        if !self.live(key) {
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|v| v.bytes.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.enter("SET").await?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.enter("SET NX").await?;
        let now = Instant::now();
        let fresh = StoredValue {
            bytes: value.to_vec(),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter("DEL").await?;
        let was_live = self.live(key);
        self.entries.remove(key);
        Ok(was_live)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.enter("EVAL compare-and-delete").await?;
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, v| !v.is_expired(now) && v.bytes == expected);
        Ok(removed.is_some())
    }

    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool> {
        self.enter("EVAL compare-and-pexpire").await?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut value) if !value.is_expired(now) && value.bytes == expected => {
                value.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_pattern(&self, pattern: &str, step_timeout: Duration) -> Result<u64> {
        let regex = regex::Regex::new(&glob_to_regex(pattern)).map_err(|e| {
            CacheError::with_internal(ErrorCode::InvalidPattern, "Invalid key pattern", e.to_string())
        })?;

        bounded("SCAN/DEL", step_timeout, self.enter("SCAN/DEL")).await?;

        let now = Instant::now();
        self.entries.retain(|_, value| !value.is_expired(now));
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| regex.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut deleted = 0u64;
        for (page, keys) in matching.chunks(PATTERN_PAGE_SIZE).enumerate() {
            if page > 0 {
                if let Err(error) = bounded("SCAN/DEL", step_timeout, self.enter("SCAN/DEL")).await {
                    warn!(pattern = %pattern, deleted, error = %error, "Memory pattern delete interrupted");
                    break;
                }
            }
            for key in keys {
                if self.entries.remove(key).is_some() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.enter("EXISTS").await?;
        Ok(self.live(key))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.enter("PTTL").await?;
        if !self.live(key) {
            return Ok(None);
        }
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn ping(&self) -> Result<()> {
        self.enter("PING").await
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl MessageBroker for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.enter("PUBLISH").await?;
        let receivers = self.sender(channel).send(payload.to_string()).unwrap_or(0);
        Ok(receivers as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        self.enter("SUBSCRIBE").await?;
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = BroadcastStream::new(receiver).filter_map(move |message| {
            let channel = channel.clone();
            async move {
                match message {
                    Ok(payload) => Some(payload),
                    Err(lagged) => {
                        warn!(channel = %channel, error = %lagged, "Subscriber lagged, messages lost");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
