// # HTTP Client Pool
//
// Reusable pool of HTTP client handles with idle eviction and hit-rate
// statistics. Clients are cheap to clone but connection state (keep-alive
// sockets, TLS sessions) lives inside each handle, so reuse matters for
// connectors issuing many requests against the same host. The pool is
// per-connector and never shared across sources.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle handles retained
    pub max_idle: usize,
    /// Idle age past which a handle is discarded on `get` and by the sweeper
    pub idle_timeout: Duration,
    /// Absolute handle age past which it is recycled
    pub max_lifetime: Duration,
    /// Per-request timeout baked into created clients
    pub request_timeout: Duration,
    /// Sweeper cadence
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 8,
            idle_timeout: Duration::from_secs(90),
            max_lifetime: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// One pooled handle with usage bookkeeping.
#[derive(Debug, Clone)]
pub struct PooledClient {
    pub client: reqwest::Client,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub usage_count: u64,
}

impl PooledClient {
    fn new(client: reqwest::Client) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
        }
    }

    fn is_stale(&self, config: &PoolConfig) -> bool {
        self.last_used_at.elapsed() > config.idle_timeout
            || self.created_at.elapsed() > config.max_lifetime
    }
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub active: usize,
    pub idle: usize,
    pub hit_rate: f64,
}

/// The pool proper.
pub struct HttpClientPool {
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledClient>>,
    created: AtomicU64,
    reused: AtomicU64,
    active: AtomicUsize,
    self_weak: Weak<Self>,
}

impl HttpClientPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            self_weak: weak.clone(),
        })
    }

    /// Pop an idle handle, discarding stale entries; create a fresh client
    /// when none survives.
    pub fn get(&self) -> Result<PooledClient> {
        {
            let mut idle = self.idle.lock();
            while let Some(mut entry) = idle.pop_front() {
                if entry.is_stale(&self.config) {
                    debug!(age_secs = entry.created_at.elapsed().as_secs(), "discarding stale pooled client");
                    continue;
                }
                entry.last_used_at = Instant::now();
                entry.usage_count += 1;
                self.reused.fetch_add(1, Ordering::Relaxed);
                self.active.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| BridgeError::Internal(format!("failed to build http client: {}", e)))?;
        self.created.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        let mut entry = PooledClient::new(client);
        entry.usage_count = 1;
        Ok(entry)
    }

    /// Return a handle; dropped when the idle queue is full.
    pub fn put(&self, mut entry: PooledClient) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        entry.last_used_at = Instant::now();
        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            debug!(max_idle = self.config.max_idle, "idle queue full, dropping returned client");
            return;
        }
        idle.push_back(entry);
    }

    /// Evict idle entries past the idle timeout. Called by the sweeper task.
    pub fn sweep(&self) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|entry| !entry.is_stale(&self.config));
        let evicted = before - idle.len();
        if evicted > 0 {
            debug!(evicted, "pool sweeper evicted idle clients");
        }
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        let created = self.created.load(Ordering::Relaxed);
        let reused = self.reused.load(Ordering::Relaxed);
        let total = created + reused;
        PoolStats {
            created,
            reused,
            active: self.active.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            hit_rate: if total == 0 { 0.0 } else { reused as f64 / total as f64 },
        }
    }

    /// Spawn the periodic sweeper. The returned handle cancels it.
    pub fn start_sweeper(&self) -> crate::connector::PeriodicTask {
        let pool = self.self_weak.clone();
        let interval = self.config.sweep_interval;
        crate::connector::PeriodicTask::spawn("pool-sweeper", interval, move || {
            let pool = pool.clone();
            async move {
                match pool.upgrade() {
                    Some(pool) => {
                        pool.sweep();
                        true
                    }
                    None => {
                        warn!("pool dropped, sweeper exiting");
                        false
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> PoolConfig {
        PoolConfig {
            max_idle: 2,
            idle_timeout: Duration::from_millis(50),
            max_lifetime: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_get_put_reuses_client() {
        let pool = HttpClientPool::new(PoolConfig::default());
        let first = pool.get().unwrap();
        pool.put(first);
        let second = pool.get().unwrap();
        assert_eq!(second.usage_count, 2);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_put_drops_when_full() {
        let pool = HttpClientPool::new(fast_config());
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        pool.put(a);
        pool.put(b);
        pool.put(c);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_stale_entries_discarded_on_get() {
        let pool = HttpClientPool::new(fast_config());
        let entry = pool.get().unwrap();
        pool.put(entry);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let fresh = pool.get().unwrap();
        assert_eq!(fresh.usage_count, 1);
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle() {
        let pool = HttpClientPool::new(fast_config());
        let entry = pool.get().unwrap();
        pool.put(entry);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.stats().idle, 0);
    }
}
