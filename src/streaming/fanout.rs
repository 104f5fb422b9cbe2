//! Fan-out hub for multi-client streaming
//!
//! One producer (the supervisor's stdout pump) feeds a bounded ring of
//! byte chunks; N subscribers each hold their own cursor into the ring.
//! The producer never waits for any subscriber: when the ring exceeds its
//! byte budget the oldest chunks are evicted, and a subscriber whose
//! cursor falls off the tail is either severed (tuner clients — the media
//! server reconnects) or skipped ahead to the oldest retained chunk (web
//! previews, where a visible gap beats a disconnect).
//!
//! Chunk boundaries are exactly the producer's read sizes; subscribers see
//! the same chunking they would see on a direct pipe.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tracing::{debug, trace};
use uuid::Uuid;

/// Where a new subscriber's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Start at the current head (preview clients)
    Live,
    /// Start at the oldest buffered chunk (tuner reconnects after
    /// recovery, minimizing the visible gap)
    Replay,
}

/// What happens when a subscriber's cursor falls out of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagPolicy {
    /// Detach the subscriber; its stream ends with a lag error
    Sever,
    /// Jump the cursor forward to the oldest retained chunk
    SkipToLive,
}

/// Returned when a severed subscriber is detached.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("subscriber lagged by {missed_chunks} chunks and was detached")]
pub struct SubscriberLagged {
    pub missed_chunks: u64,
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub capacity_bytes: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: crate::config::defaults::DEFAULT_RING_BUFFER_BYTES,
        }
    }
}

struct Ring {
    chunks: VecDeque<bytes::Bytes>,
    /// Sequence number of `chunks.front()`
    oldest_seq: u64,
    /// Next sequence number to assign; `head_seq - oldest_seq == chunks.len()`
    head_seq: u64,
    bytes: usize,
    closed: bool,
}

struct SubscriberShared {
    id: Uuid,
    bytes_read: AtomicU64,
    chunks_read: AtomicU64,
    joined_at: Instant,
}

/// Per-subscriber statistics for the observability surface.
#[derive(Debug, Clone)]
pub struct SubscriberStats {
    pub id: Uuid,
    pub bytes_read: u64,
    pub chunks_read: u64,
    pub connected: Duration,
}

/// Aggregate hub statistics.
#[derive(Debug, Clone)]
pub struct FanoutStats {
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    pub total_bytes_in: u64,
    pub head_seq: u64,
    pub subscriber_count: usize,
    pub severed_subscribers: u64,
    pub subscribers: Vec<SubscriberStats>,
}

/// Multi-subscriber ring buffer decoupling one producer from N readers.
pub struct FanoutHub {
    config: FanoutConfig,
    ring: RwLock<Ring>,
    subscribers: RwLock<Vec<Arc<SubscriberShared>>>,
    version_tx: watch::Sender<u64>,
    created_at: Instant,
    total_bytes_in: AtomicU64,
    last_write_ms: AtomicU64,
    severed: AtomicU64,
    buffered_bytes: AtomicUsize,
}

impl FanoutHub {
    pub fn new(config: FanoutConfig) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            config,
            ring: RwLock::new(Ring {
                chunks: VecDeque::new(),
                oldest_seq: 0,
                head_seq: 0,
                bytes: 0,
                closed: false,
            }),
            subscribers: RwLock::new(Vec::new()),
            version_tx,
            created_at: Instant::now(),
            total_bytes_in: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            severed: AtomicU64::new(0),
            buffered_bytes: AtomicUsize::new(0),
        })
    }

    /// Append a producer chunk. Never blocks on subscribers; evicts from
    /// the tail when over budget. The byte accounting is bumped before
    /// the chunk becomes visible to any subscriber.
    pub async fn publish(&self, data: bytes::Bytes) {
        if data.is_empty() {
            return;
        }

        self.total_bytes_in.fetch_add(data.len() as u64, Ordering::Release);
        self.last_write_ms.store(
            self.created_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );

        {
            let mut ring = self.ring.write().await;
            ring.bytes += data.len();
            ring.chunks.push_back(data);
            let seq = ring.head_seq;
            ring.head_seq += 1;

            while ring.bytes > self.config.capacity_bytes && ring.chunks.len() > 1 {
                if let Some(evicted) = ring.chunks.pop_front() {
                    ring.bytes -= evicted.len();
                    ring.oldest_seq += 1;
                }
            }
            self.buffered_bytes.store(ring.bytes, Ordering::Relaxed);
            trace!(seq, buffered = ring.chunks.len(), "published chunk");
        }

        self.version_tx.send_modify(|v| *v += 1);
    }

    /// Mark the producer finished. Subscribers drain whatever remains
    /// buffered, then their streams end.
    pub async fn close(&self) {
        {
            let mut ring = self.ring.write().await;
            ring.closed = true;
        }
        self.version_tx.send_modify(|v| *v += 1);
        debug!("fanout hub closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.ring.read().await.closed
    }

    /// Attach a new subscriber.
    pub async fn subscribe(self: &Arc<Self>, join: JoinPolicy, lag: LagPolicy) -> Subscription {
        let cursor = {
            let ring = self.ring.read().await;
            match join {
                JoinPolicy::Live => ring.head_seq,
                JoinPolicy::Replay => ring.oldest_seq,
            }
        };

        let shared = Arc::new(SubscriberShared {
            id: Uuid::new_v4(),
            bytes_read: AtomicU64::new(0),
            chunks_read: AtomicU64::new(0),
            joined_at: Instant::now(),
        });
        self.subscribers.write().await.push(shared.clone());

        let total = self.subscribers.read().await.len();
        debug!(
            subscriber_id = %shared.id,
            cursor,
            ?join,
            total,
            "subscriber joined fanout hub"
        );

        Subscription {
            hub: self.clone(),
            shared,
            cursor,
            lag_policy: lag,
            version_rx: self.version_tx.subscribe(),
            detached: false,
        }
    }

    /// Total bytes the producer has ever written into the hub.
    pub fn total_bytes_in(&self) -> u64 {
        self.total_bytes_in.load(Ordering::Acquire)
    }

    /// Whether the producer wrote anything within `window`.
    pub fn wrote_within(&self, window: Duration) -> bool {
        let last = self.last_write_ms.load(Ordering::Relaxed);
        if last == 0 && self.total_bytes_in() == 0 {
            return false;
        }
        let now = self.created_at.elapsed().as_millis() as u64;
        now.saturating_sub(last) <= window.as_millis() as u64
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> FanoutStats {
        let ring = self.ring.read().await;
        let subscribers = self.subscribers.read().await;
        FanoutStats {
            buffered_chunks: ring.chunks.len(),
            buffered_bytes: ring.bytes,
            total_bytes_in: self.total_bytes_in(),
            head_seq: ring.head_seq,
            subscriber_count: subscribers.len(),
            severed_subscribers: self.severed.load(Ordering::Relaxed),
            subscribers: subscribers
                .iter()
                .map(|s| SubscriberStats {
                    id: s.id,
                    bytes_read: s.bytes_read.load(Ordering::Relaxed),
                    chunks_read: s.chunks_read.load(Ordering::Relaxed),
                    connected: s.joined_at.elapsed(),
                })
                .collect(),
        }
    }

    async fn detach(&self, id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| s.id != id);
    }
}

/// A single subscriber's cursor into the hub.
pub struct Subscription {
    hub: Arc<FanoutHub>,
    shared: Arc<SubscriberShared>,
    cursor: u64,
    lag_policy: LagPolicy,
    version_rx: watch::Receiver<u64>,
    detached: bool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Receive the next chunk in producer order.
    ///
    /// Returns `None` once the hub is closed and this subscriber has
    /// drained everything it is entitled to. Returns `Err` exactly once
    /// when a `Sever`-policy subscriber has lagged out of the ring.
    pub async fn recv(&mut self) -> Option<Result<bytes::Bytes, SubscriberLagged>> {
        loop {
            // Mark the current version seen before inspecting the ring so
            // a publish between the check and the await still wakes us.
            self.version_rx.borrow_and_update();

            {
                let ring = self.hub.ring.read().await;

                if self.cursor < ring.oldest_seq {
                    let missed = ring.oldest_seq - self.cursor;
                    match self.lag_policy {
                        LagPolicy::Sever => {
                            drop(ring);
                            self.hub.severed.fetch_add(1, Ordering::Relaxed);
                            self.detach_now().await;
                            return Some(Err(SubscriberLagged {
                                missed_chunks: missed,
                            }));
                        }
                        LagPolicy::SkipToLive => {
                            debug!(
                                subscriber_id = %self.shared.id,
                                missed,
                                "slow subscriber skipped ahead to oldest buffered chunk"
                            );
                            self.cursor = ring.oldest_seq;
                        }
                    }
                }

                if self.cursor < ring.head_seq {
                    let index = (self.cursor - ring.oldest_seq) as usize;
                    let chunk = ring.chunks[index].clone();
                    self.cursor += 1;
                    self.shared
                        .bytes_read
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    self.shared.chunks_read.fetch_add(1, Ordering::Relaxed);
                    return Some(Ok(chunk));
                }

                if ring.closed {
                    return None;
                }
            }

            if self.version_rx.changed().await.is_err() {
                // Producer side dropped without closing; treat as end of
                // stream after a final drain check.
                let ring = self.hub.ring.read().await;
                if self.cursor >= ring.head_seq {
                    return None;
                }
            }
        }
    }

    /// Adapt this subscription into a byte stream suitable for an HTTP
    /// response body. Lag severance terminates the stream with an error,
    /// which axum turns into connection teardown.
    pub fn into_byte_stream(
        mut self,
    ) -> impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                match item {
                    Ok(chunk) => yield Ok(chunk),
                    Err(lag) => {
                        yield Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            lag.to_string(),
                        ));
                        break;
                    }
                }
            }
        }
    }

    async fn detach_now(&mut self) {
        if !self.detached {
            self.detached = true;
            self.hub.detach(self.shared.id).await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            let hub = self.hub.clone();
            let id = self.shared.id;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    hub.detach(id).await;
                    debug!(subscriber_id = %id, "subscriber detached from fanout hub");
                });
            }
        }
    }
}
