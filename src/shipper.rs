//! Event Shipper (C6): bounded ingress queue + overflow ring buffer,
//! batching, token-bucket rate limiting, retrying HTTP POST, graceful
//! shutdown.
//!
//! The ingress queue is `crossbeam_channel::bounded`, used here for
//! exactly the purpose its Cargo.toml comment names ("event
//! infrastructure, lock-free channels"). The ring buffer and token
//! bucket are hand-rolled `Mutex`-guarded structs, written the way small
//! stateful helpers like `JobFrameStore` are elsewhere in this codebase.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::block_event::{BlockEvent, EventPool};
use crate::error::{truncate_body, EdlError};
use crate::token::TokenManager;

const INGRESS_CAPACITY: usize = 1000;
const DEFAULT_RING_CAPACITY: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BUCKET_CAPACITY: u32 = 10_000;
const DEFAULT_REFILL_PER_SEC: u32 = 100;
const MAX_SHIP_ATTEMPTS: u32 = 3;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct BatchMetadata {
    pub device_id: String,
    pub ip_strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_proxies: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ShipmentBody<'a> {
    batch_metadata: &'a BatchMetadata,
    events: &'a [BlockEvent],
}

/// Ring buffer overflow, retaining events the ingress channel couldn't
/// hold, overwriting the oldest entry once full.
struct RingBuffer {
    events: VecDeque<BlockEvent>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Push, overwriting the oldest entry if full. Returns the dropped
    /// event, if any.
    fn push_overflow(&mut self, event: BlockEvent) -> Option<BlockEvent> {
        let dropped = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        dropped
    }

    fn drain_up_to(&mut self, n: usize) -> Vec<BlockEvent> {
        let take = n.min(self.events.len());
        self.events.drain(..take).collect()
    }

    fn drain_all(&mut self) -> Vec<BlockEvent> {
        self.events.drain(..).collect()
    }
}

/// Mutex-protected floating-point accounting.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token if available. Otherwise returns how long to wait
    /// before a token would become available.
    fn try_consume(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

#[derive(Default)]
pub struct ShipperStats {
    pub dropped: AtomicU64,
    pub shipped_batches: AtomicU64,
    pub shipped_events: AtomicU64,
}

pub struct ShipperConfig {
    pub ring_capacity: usize,
    pub batch_size: usize,
    pub bucket_capacity: u32,
    pub refill_per_sec: u32,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
        }
    }
}

pub struct EventShipper {
    client: reqwest::Client,
    logs_url: String,
    token_manager: Arc<TokenManager>,
    metadata: BatchMetadata,
    ingress_tx: crossbeam_channel::Sender<BlockEvent>,
    ingress_rx: crossbeam_channel::Receiver<BlockEvent>,
    notify: Notify,
    ring: Mutex<RingBuffer>,
    bucket: Mutex<TokenBucket>,
    pool: Arc<EventPool>,
    batch_size: usize,
    accepting: AtomicBool,
    pub stats: ShipperStats,
}

impl EventShipper {
    pub fn new(
        client: reqwest::Client,
        logs_url: String,
        token_manager: Arc<TokenManager>,
        metadata: BatchMetadata,
        pool: Arc<EventPool>,
        config: ShipperConfig,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(INGRESS_CAPACITY);
        Self {
            client,
            logs_url,
            token_manager,
            metadata,
            ingress_tx: tx,
            ingress_rx: rx,
            notify: Notify::new(),
            ring: Mutex::new(RingBuffer::new(config.ring_capacity)),
            bucket: Mutex::new(TokenBucket::new(config.bucket_capacity, config.refill_per_sec)),
            pool,
            batch_size: config.batch_size,
            accepting: AtomicBool::new(true),
            stats: ShipperStats::default(),
        }
    }

    /// Non-blocking enqueue from the request path. Full ingress channel
    /// spills to the overflow ring buffer.
    pub fn submit(&self, event: BlockEvent) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        match self.ingress_tx.try_send(event) {
            Ok(()) => {
                self.notify.notify_one();
                true
            }
            Err(crossbeam_channel::TrySendError::Full(ev)) => {
                self.spill_to_ring(ev);
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }

    fn spill_to_ring(&self, event: BlockEvent) {
        let dropped = self.ring.lock().unwrap().push_overflow(event);
        if let Some(dropped) = dropped {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            self.pool.release(dropped);
        }
    }

    fn drain_ingress_into(&self, batch: &mut Vec<BlockEvent>, max: usize) {
        while batch.len() < max {
            match self.ingress_rx.try_recv() {
                Ok(ev) => batch.push(ev),
                Err(_) => break,
            }
        }
    }

    /// Batcher + rate-limiter + shipment worker loop.
    pub async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("event shipper worker started");
        let mut batch: Vec<BlockEvent> = Vec::with_capacity(self.batch_size);
        let mut flush_interval = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    self.drain_ingress_into(&mut batch, self.batch_size);
                    if batch.len() >= self.batch_size {
                        self.ship_and_clear(&mut batch).await;
                    }
                }
                _ = flush_interval.tick() => {
                    self.drain_ingress_into(&mut batch, self.batch_size);
                    if !batch.is_empty() {
                        self.ship_and_clear(&mut batch).await;
                    }
                    let from_ring = self.ring.lock().unwrap().drain_up_to(self.batch_size);
                    if !from_ring.is_empty() {
                        self.ship_batch(from_ring).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        let timed_out = tokio::time::timeout(SHUTDOWN_GRACE, async {
            self.drain_ingress_into(&mut batch, usize::MAX);
            if !batch.is_empty() {
                self.ship_and_clear(&mut batch).await;
            }
            let remaining = self.ring.lock().unwrap().drain_all();
            if !remaining.is_empty() {
                self.ship_batch(remaining).await;
            }
        })
        .await
        .is_err();

        if timed_out {
            tracing::warn!("event shipper shutdown timed out after 5s, abandoning unflushed events");
        }
        tracing::info!("event shipper worker stopped");
    }

    async fn ship_and_clear(&self, batch: &mut Vec<BlockEvent>) {
        let events = std::mem::take(batch);
        self.ship_batch(events).await;
    }

    async fn ship_batch(&self, events: Vec<BlockEvent>) {
        if events.is_empty() {
            return;
        }

        let wait = self.bucket.lock().unwrap().try_consume().err();
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
            if self.bucket.lock().unwrap().try_consume().is_err() {
                self.requeue_dropping_overflow(events);
                return;
            }
        }

        let token = self.token_manager.access_token().await;
        if self.logs_url.is_empty() || token.is_empty() {
            tracing::warn!("logs URL or access token unavailable, dropping this shipment attempt");
            self.requeue_dropping_overflow(events);
            return;
        }

        match self.post_with_retry(&events, &token).await {
            Ok(()) => {
                self.stats.shipped_batches.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .shipped_events
                    .fetch_add(events.len() as u64, Ordering::Relaxed);
                for ev in events {
                    self.pool.release(ev);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "event batch shipment failed after retries, re-buffering");
                self.requeue_dropping_overflow(events);
            }
        }
    }

    fn requeue_dropping_overflow(&self, events: Vec<BlockEvent>) {
        let mut ring = self.ring.lock().unwrap();
        let mut dropped_count = 0u64;
        for ev in events {
            if let Some(dropped) = ring.push_overflow(ev) {
                self.pool.release(dropped);
                dropped_count += 1;
            }
        }
        if dropped_count > 0 {
            self.stats.dropped.fetch_add(dropped_count, Ordering::Relaxed);
        }
    }

    async fn post_with_retry(&self, events: &[BlockEvent], token: &str) -> Result<(), EdlError> {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=MAX_SHIP_ATTEMPTS {
            match self.post_once(events, token).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_SHIP_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "event shipment attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns within MAX_SHIP_ATTEMPTS")
    }

    async fn post_once(&self, events: &[BlockEvent], token: &str) -> Result<(), EdlError> {
        let body = ShipmentBody {
            batch_metadata: &self.metadata,
            events,
        };
        let resp = self
            .client
            .post(&self.logs_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = truncate_body(&resp.text().await.unwrap_or_default());
            Err(EdlError::Shipment {
                status: status.as_u16(),
                body,
            })
        }
    }
}
