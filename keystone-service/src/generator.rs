//! Pre-generated value pool
//!
//! Producing UUIDs, random blobs, and ephemeral keypairs ahead of demand
//! keeps key-issuance latency flat. One background producer feeds a bounded
//! FIFO queue per registered kind; a single maintenance task ticks every
//! 500 ms and enforces the two eviction controls: a maximum age for
//! unconsumed values and a maximum cumulative lifetime count per kind.
//!
//! Producer panics are caught and the worker restarted; after
//! [`MAX_CONSECUTIVE_FAILURES`] the kind is reported unhealthy through
//! [`ValuePool::health`]. Cancelling the pool's token drains producers and
//! makes `get` return promptly.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Consecutive producer failures before a kind is reported unhealthy.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Kinds of pre-generated values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Random v4 UUIDs
    Uuid,
    /// 32 bytes from the operating system RNG
    RandBytes32,
    /// Ephemeral P-256 keypairs
    EcKeypairP256,
}

impl ValueKind {
    fn generate(self) -> PooledValue {
        match self {
            Self::Uuid => PooledValue::Uuid(Uuid::new_v4()),
            Self::RandBytes32 => {
                let mut bytes = vec![0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                PooledValue::Bytes(bytes)
            }
            Self::EcKeypairP256 => {
                PooledValue::P256Key(Box::new(p256::SecretKey::random(&mut OsRng)))
            }
        }
    }
}

/// A value taken from the pool
pub enum PooledValue {
    Uuid(Uuid),
    Bytes(Vec<u8>),
    P256Key(Box<p256::SecretKey>),
}

impl PooledValue {
    /// Unwrap a UUID value.
    pub fn into_uuid(self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(u),
            _ => None,
        }
    }

    /// Unwrap a random-bytes value.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

struct Entry {
    value: PooledValue,
    generated_at: Instant,
}

struct KindState {
    kind: ValueKind,
    capacity: usize,
    queue: Mutex<VecDeque<Entry>>,
    /// Producers park here when the queue is full
    space: Notify,
    /// Consumers park here when the queue is empty
    available: Notify,
    produced: AtomicU64,
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

/// Health snapshot for one kind
#[derive(Debug, Clone)]
pub struct KindHealth {
    pub kind: ValueKind,
    pub healthy: bool,
    pub queued: usize,
    pub produced: u64,
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Queue capacity per kind
    pub capacity: usize,
    /// Maximum age of an unconsumed value
    pub max_lifetime: Duration,
    /// Maximum values a kind may produce over the pool's lifetime
    pub max_lifetime_values: u64,
    /// Deadline applied by [`ValuePool::get`]
    pub get_timeout: Duration,
    /// Maintenance tick interval
    pub tick_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            max_lifetime: Duration::from_secs(300),
            max_lifetime_values: 1_000_000,
            get_timeout: Duration::from_secs(2),
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Bounded pool of pre-generated cryptographic values
pub struct ValuePool {
    kinds: HashMap<ValueKind, Arc<KindState>>,
    config: PoolConfig,
    cancel: CancellationToken,
}

impl ValuePool {
    /// Spawn a pool with the given kinds registered.
    ///
    /// Producers and the maintenance task run until `parent` (or the pool's
    /// own [`cancel`](Self::cancel)) fires.
    pub fn spawn(kinds: &[ValueKind], config: PoolConfig, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let mut map = HashMap::new();

        for &kind in kinds {
            let state = Arc::new(KindState {
                kind,
                capacity: config.capacity,
                queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
                space: Notify::new(),
                available: Notify::new(),
                produced: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
            });
            map.insert(kind, state.clone());
            tokio::spawn(producer_loop(state, config.clone(), cancel.clone()));
        }

        let maintenance_states: Vec<Arc<KindState>> = map.values().cloned().collect();
        tokio::spawn(maintenance_loop(
            maintenance_states,
            config.clone(),
            cancel.clone(),
        ));

        Self {
            kinds: map,
            config,
            cancel,
        }
    }

    /// Take the next value of a kind, waiting up to the configured deadline.
    pub async fn get(&self, kind: ValueKind) -> Result<PooledValue> {
        let state = self
            .kinds
            .get(&kind)
            .ok_or_else(|| Error::Internal(format!("value kind {kind:?} not registered")))?;

        let deadline = tokio::time::Instant::now() + self.config.get_timeout;
        loop {
            {
                let mut queue = state.queue.lock().await;
                if let Some(entry) = queue.pop_front() {
                    state.space.notify_one();
                    return Ok(entry.value);
                }
            }
            tokio::select! {
                _ = state.available.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(format!(
                        "value pool {kind:?} empty after {:?}",
                        self.config.get_timeout
                    )));
                }
                _ = self.cancel.cancelled() => {
                    return Err(Error::Internal("value pool cancelled".into()));
                }
            }
        }
    }

    /// Take `n` values of a kind.
    pub async fn get_many(&self, kind: ValueKind, n: usize) -> Result<Vec<PooledValue>> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.get(kind).await?);
        }
        Ok(values)
    }

    /// Stop producers and drain; subsequent `get` calls fail promptly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Health snapshot across all kinds.
    pub async fn health(&self) -> Vec<KindHealth> {
        let mut out = Vec::with_capacity(self.kinds.len());
        for state in self.kinds.values() {
            out.push(KindHealth {
                kind: state.kind,
                healthy: state.healthy.load(Ordering::Relaxed),
                queued: state.queue.lock().await.len(),
                produced: state.produced.load(Ordering::Relaxed),
            });
        }
        out
    }

    /// True when every registered kind is healthy.
    pub async fn is_healthy(&self) -> bool {
        self.health().await.iter().all(|h| h.healthy)
    }
}

async fn producer_loop(state: Arc<KindState>, config: PoolConfig, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if state.produced.load(Ordering::Relaxed) >= config.max_lifetime_values {
            tracing::debug!(kind = ?state.kind, "lifetime value budget consumed, producer stopping");
            break;
        }

        // Generate off the async thread; a panic surfaces as a JoinError
        // instead of killing the worker.
        let kind = state.kind;
        let produced = match tokio::task::spawn_blocking(move || kind.generate()).await {
            Ok(value) => {
                state.consecutive_failures.store(0, Ordering::Relaxed);
                value
            }
            Err(join_err) => {
                let failures = state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    kind = ?state.kind,
                    failures,
                    "value producer panicked, restarting: {join_err}"
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    state.healthy.store(false, Ordering::Relaxed);
                }
                continue;
            }
        };

        state.produced.fetch_add(1, Ordering::Relaxed);

        // Wait for space, then enqueue.
        loop {
            {
                let mut queue = state.queue.lock().await;
                if queue.len() < state.capacity {
                    queue.push_back(Entry {
                        value: produced,
                        generated_at: Instant::now(),
                    });
                    state.available.notify_one();
                    break;
                }
            }
            tokio::select! {
                _ = state.space.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

async fn maintenance_loop(
    states: Vec<Arc<KindState>>,
    config: PoolConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.tick_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        let now = Instant::now();
        for state in &states {
            let mut queue = state.queue.lock().await;
            let before = queue.len();
            while let Some(front) = queue.front() {
                if now.duration_since(front.generated_at) > config.max_lifetime {
                    queue.pop_front();
                } else {
                    break;
                }
            }
            let evicted = before - queue.len();
            if evicted > 0 {
                tracing::debug!(kind = ?state.kind, evicted, "evicted stale pool values");
                state.space.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> PoolConfig {
        PoolConfig {
            capacity: 4,
            max_lifetime: Duration::from_secs(60),
            max_lifetime_values: 1_000,
            get_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_returns_values_of_requested_kind() {
        let root = CancellationToken::new();
        let pool = ValuePool::spawn(
            &[ValueKind::Uuid, ValueKind::RandBytes32],
            fast_config(),
            &root,
        );

        let uuid = pool.get(ValueKind::Uuid).await.unwrap();
        assert!(uuid.into_uuid().is_some());

        let bytes = pool.get(ValueKind::RandBytes32).await.unwrap();
        assert_eq!(bytes.into_bytes().unwrap().len(), 32);

        pool.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_many_returns_distinct_values() {
        let root = CancellationToken::new();
        let pool = ValuePool::spawn(&[ValueKind::Uuid], fast_config(), &root);

        let values = pool.get_many(ValueKind::Uuid, 8).await.unwrap();
        let mut uuids: Vec<Uuid> = values
            .into_iter()
            .map(|v| v.into_uuid().unwrap())
            .collect();
        let total = uuids.len();
        uuids.sort();
        uuids.dedup();
        assert_eq!(uuids.len(), total);

        pool.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifetime_value_budget_stops_production() {
        let root = CancellationToken::new();
        let mut config = fast_config();
        config.max_lifetime_values = 4;
        let pool = ValuePool::spawn(&[ValueKind::Uuid], config, &root);

        // The budgeted values drain fine.
        for _ in 0..4 {
            pool.get(ValueKind::Uuid).await.unwrap();
        }
        // Then the producer is done for the pool's lifetime.
        assert!(matches!(
            pool.get(ValueKind::Uuid).await,
            Err(Error::Timeout(_))
        ));

        pool.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_values_are_evicted_without_consumption() {
        let root = CancellationToken::new();
        let mut config = fast_config();
        config.max_lifetime = Duration::from_millis(10);
        config.max_lifetime_values = 4;
        let pool = ValuePool::spawn(&[ValueKind::Uuid], config, &root);

        // Let the producer fill, then let everything age out.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let health = pool.health().await;
        assert_eq!(health[0].queued, 0);
        assert_eq!(health[0].produced, 4);

        pool.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_pool_fails_get_promptly() {
        let root = CancellationToken::new();
        let mut config = fast_config();
        config.get_timeout = Duration::from_secs(30);
        config.max_lifetime_values = 0; // nothing will ever be produced
        let pool = ValuePool::spawn(&[ValueKind::Uuid], config, &root);

        let started = Instant::now();
        pool.cancel();
        let result = pool.get(ValueKind::Uuid).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_are_safe() {
        let root = CancellationToken::new();
        let mut config = fast_config();
        config.get_timeout = Duration::from_secs(5);
        let pool = Arc::new(ValuePool::spawn(&[ValueKind::Uuid], config, &root));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..8 {
                    got.push(
                        pool.get(ValueKind::Uuid)
                            .await
                            .unwrap()
                            .into_uuid()
                            .unwrap(),
                    );
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);

        pool.cancel();
    }
}
