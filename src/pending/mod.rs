//! Pending-request registry: matches asynchronous bus replies back to
//! their in-flight HTTP handlers.
//!
//! A waiter is either single-shot (one reply fulfils a oneshot slot) or a
//! stream (in-order chunks flow through a bounded channel). The terminal
//! transitions (reply, final chunk, deadline expiry, caller cancellation)
//! are mutually exclusive: whichever removes the map entry first wins,
//! and every later arrival for that correlation is dropped with a counter
//! bump. Ordering across stream chunks is the reassembly buffer's job,
//! sitting between arrival and the channel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::envelope::{Envelope, ReplyEnvelope, StreamChunkEnvelope};
use crate::expiry::ExpiringMap;
use crate::protocol::error::ProxyError;
use crate::sse::reassembly::{Offered, ReassemblyBuffer};

/// How often the sweeper checks for expired waiters.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period during which late redeliveries for a terminated
/// correlation are recognised (and counted) instead of logged as unknown.
const CLOSED_GRACE: Duration = Duration::from_secs(30);

const CLOSED_MAX_ENTRIES: usize = 4096;

/// Internal drop/mismatch counters, exposed for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RegistryCounters {
    late_drops: AtomicU64,
    unknown_drops: AtomicU64,
    kind_mismatches: AtomicU64,
    duplicate_drops: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
}

impl RegistryCounters {
    pub fn late_drops(&self) -> u64 {
        self.late_drops.load(Ordering::Relaxed)
    }
    pub fn unknown_drops(&self) -> u64 {
        self.unknown_drops.load(Ordering::Relaxed)
    }
    pub fn kind_mismatches(&self) -> u64 {
        self.kind_mismatches.load(Ordering::Relaxed)
    }
    pub fn duplicate_drops(&self) -> u64 {
        self.duplicate_drops.load(Ordering::Relaxed)
    }
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }
}

enum Waiter {
    Single {
        tx: oneshot::Sender<Result<ReplyEnvelope, ProxyError>>,
        deadline: Instant,
    },
    Stream {
        tx: mpsc::Sender<Result<StreamChunkEnvelope, ProxyError>>,
        reassembly: ReassemblyBuffer<StreamChunkEnvelope>,
        idle_deadline: Instant,
        idle_timeout: Duration,
    },
}

impl Waiter {
    fn deadline(&self) -> Instant {
        match self {
            Self::Single { deadline, .. } => *deadline,
            Self::Stream { idle_deadline, .. } => *idle_deadline,
        }
    }
}

/// Future half of a single-shot waiter.
pub struct SingleWaiter {
    rx: oneshot::Receiver<Result<ReplyEnvelope, ProxyError>>,
}

impl SingleWaiter {
    pub async fn await_reply(self) -> Result<ReplyEnvelope, ProxyError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Cancelled("registry shut down".into())),
        }
    }
}

/// Consumer half of a stream waiter: in-order chunks, or one terminal
/// error, then channel close.
pub struct StreamWaiter {
    pub rx: mpsc::Receiver<Result<StreamChunkEnvelope, ProxyError>>,
}

pub struct PendingRegistry {
    waiters: Mutex<HashMap<Uuid, Waiter>>,
    recently_closed: ExpiringMap<Uuid, ()>,
    counters: RegistryCounters,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            recently_closed: ExpiringMap::new(CLOSED_MAX_ENTRIES),
            counters: RegistryCounters::default(),
        }
    }

    pub fn counters(&self) -> &RegistryCounters {
        &self.counters
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn register_single(&self, correlation_id: Uuid, timeout: Duration) -> SingleWaiter {
        let (tx, rx) = oneshot::channel();
        let replaced = self.waiters.lock().insert(
            correlation_id,
            Waiter::Single {
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        if replaced.is_some() {
            warn!(correlation_id = %correlation_id, "replacing existing waiter");
        }
        SingleWaiter { rx }
    }

    pub fn register_stream(
        &self,
        correlation_id: Uuid,
        idle_timeout: Duration,
        buffer_cap: usize,
        reorder_window: usize,
    ) -> StreamWaiter {
        let (tx, rx) = mpsc::channel(buffer_cap.max(1));
        let replaced = self.waiters.lock().insert(
            correlation_id,
            Waiter::Stream {
                tx,
                reassembly: ReassemblyBuffer::new(reorder_window),
                idle_deadline: Instant::now() + idle_timeout,
                idle_timeout,
            },
        );
        if replaced.is_some() {
            warn!(correlation_id = %correlation_id, "replacing existing waiter");
        }
        StreamWaiter { rx }
    }

    /// Route an incoming envelope to its waiter. May suspend on the stream
    /// channel: the caller must not settle the bus delivery until this
    /// returns, so a slow HTTP consumer throttles the publisher.
    pub async fn complete(&self, envelope: Envelope) {
        match envelope {
            Envelope::Reply(reply) => self.complete_single(reply),
            Envelope::StreamChunk(chunk) => self.complete_stream(chunk).await,
            Envelope::Request(req) => {
                warn!(
                    correlation_id = %req.head.correlation_id,
                    "request envelope routed to registry, dropping"
                );
            }
        }
    }

    fn complete_single(&self, reply: ReplyEnvelope) {
        let correlation_id = reply.head.correlation_id;
        let waiter = {
            let mut waiters = self.waiters.lock();
            match waiters.get(&correlation_id) {
                Some(Waiter::Single { .. }) => waiters.remove(&correlation_id),
                Some(Waiter::Stream { .. }) => {
                    self.counters.kind_mismatches.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = %correlation_id, "non-stream reply for stream waiter, dropping");
                    return;
                }
                None => {
                    drop(waiters);
                    self.note_unmatched(correlation_id);
                    return;
                }
            }
        };

        if let Some(Waiter::Single { tx, .. }) = waiter {
            self.mark_closed(correlation_id);
            let _ = tx.send(Ok(reply));
        }
    }

    async fn complete_stream(&self, chunk: StreamChunkEnvelope) {
        let correlation_id = chunk.head.correlation_id;
        let sequence = chunk.sequence;

        enum Verdict {
            Unmatched,
            Mismatch,
            Duplicate,
            Quiet,
            Fail(mpsc::Sender<Result<StreamChunkEnvelope, ProxyError>>),
            Emit {
                tx: mpsc::Sender<Result<StreamChunkEnvelope, ProxyError>>,
                ready: Vec<StreamChunkEnvelope>,
                finished: bool,
            },
        }

        let verdict = {
            let mut waiters = self.waiters.lock();
            let verdict = match waiters.get_mut(&correlation_id) {
                None => Verdict::Unmatched,
                Some(Waiter::Single { .. }) => Verdict::Mismatch,
                Some(Waiter::Stream {
                    tx,
                    reassembly,
                    idle_deadline,
                    idle_timeout,
                }) => match reassembly.offer(sequence, chunk) {
                    Offered::Duplicate => Verdict::Duplicate,
                    Offered::Buffered => {
                        *idle_deadline = Instant::now() + *idle_timeout;
                        Verdict::Quiet
                    }
                    Offered::WindowExceeded => Verdict::Fail(tx.clone()),
                    Offered::Ready(ready) => {
                        *idle_deadline = Instant::now() + *idle_timeout;
                        let finished = ready.iter().any(|c| c.meta.is_final);
                        Verdict::Emit {
                            tx: tx.clone(),
                            ready,
                            finished,
                        }
                    }
                },
            };

            // The waiter terminates inside the lock so a concurrent
            // terminal transition cannot fire twice.
            match &verdict {
                Verdict::Fail(_) | Verdict::Emit { finished: true, .. } => {
                    waiters.remove(&correlation_id);
                    self.mark_closed(correlation_id);
                }
                _ => {}
            }
            verdict
        };

        match verdict {
            Verdict::Unmatched => self.note_unmatched(correlation_id),
            Verdict::Mismatch => {
                self.counters.kind_mismatches.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %correlation_id, sequence, "stream chunk for single waiter, dropping");
            }
            Verdict::Duplicate => {
                self.counters.duplicate_drops.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %correlation_id, sequence, "duplicate chunk collapsed");
            }
            Verdict::Quiet => {}
            Verdict::Fail(tx) => {
                warn!(correlation_id = %correlation_id, "stream out-of-order window exceeded");
                let _ = tx.try_send(Err(ProxyError::StreamWindowExceeded));
            }
            Verdict::Emit { tx, ready, .. } => {
                for item in ready {
                    // Bounded send: back-pressure propagates from here to
                    // bus settlement.
                    if tx.send(Ok(item)).await.is_err() {
                        self.cancel(correlation_id, "stream consumer dropped");
                        return;
                    }
                }
            }
        }
    }

    /// Remove the waiter and signal the sink. Later arrivals for this id
    /// are dropped. No-op when the waiter is already terminal.
    pub fn cancel(&self, correlation_id: Uuid, reason: &str) {
        let waiter = self.waiters.lock().remove(&correlation_id);
        let Some(waiter) = waiter else { return };

        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
        self.mark_closed(correlation_id);
        debug!(correlation_id = %correlation_id, reason, "waiter cancelled");
        match waiter {
            Waiter::Single { tx, .. } => {
                let _ = tx.send(Err(ProxyError::Cancelled(reason.into())));
            }
            Waiter::Stream { tx, .. } => {
                let _ = tx.try_send(Err(ProxyError::Cancelled(reason.into())));
            }
        }
    }

    /// Expire waiters past their deadline. The sweeper calls this on a
    /// timer; tests call it directly.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(Uuid, Waiter)> = {
            let mut waiters = self.waiters.lock();
            let ids: Vec<Uuid> = waiters
                .iter()
                .filter(|(_, w)| w.deadline() <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| waiters.remove(&id).map(|w| (id, w)))
                .collect()
        };

        for (correlation_id, waiter) in expired {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            self.mark_closed(correlation_id);
            warn!(correlation_id = %correlation_id, "waiter deadline elapsed");
            match waiter {
                Waiter::Single { tx, .. } => {
                    let _ = tx.send(Err(ProxyError::RequestTimeout));
                }
                Waiter::Stream { tx, .. } => {
                    let _ = tx.try_send(Err(ProxyError::RequestTimeout));
                }
            }
        }
    }

    /// Spawn the background task that expires waiters on a timer.
    pub fn spawn_sweeper(registry: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        })
    }

    fn mark_closed(&self, correlation_id: Uuid) {
        self.recently_closed.insert(correlation_id, CLOSED_GRACE, ());
    }

    fn note_unmatched(&self, correlation_id: Uuid) {
        if self.recently_closed.contains(&correlation_id) {
            self.counters.late_drops.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, "late arrival for terminated correlation, dropping");
        } else {
            self.counters.unknown_drops.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, "no waiter for correlation, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{ChunkBody, ChunkType, Head, StreamMeta};
    use serde_json::json;

    fn reply(corr: Uuid) -> Envelope {
        Envelope::Reply(ReplyEnvelope {
            head: Head::new("g", "proxy", "critic", corr),
            to_proxy: "p1".into(),
            status: 200,
            payload: json!({"jsonrpc": "2.0", "result": {}, "id": "r1"}),
        })
    }

    fn chunk(corr: Uuid, sequence: u64, data: &str, is_final: bool) -> Envelope {
        Envelope::StreamChunk(StreamChunkEnvelope {
            head: Head::new("g", "proxy", "critic", corr),
            to_proxy: "p1".into(),
            sequence,
            chunk: ChunkBody {
                data: data.into(),
                event: None,
                id: None,
                retry: None,
            },
            meta: StreamMeta {
                stream_id: Uuid::new_v4(),
                chunk_type: if is_final {
                    ChunkType::End
                } else {
                    ChunkType::Data
                },
                event_name: None,
                retry: None,
                last_event_id: None,
                is_final,
            },
        })
    }

    #[tokio::test]
    async fn single_waiter_resolves_on_reply() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let waiter = registry.register_single(corr, Duration::from_secs(5));

        registry.complete(reply(corr)).await;

        let reply = waiter.await_reply().await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_correlation_bumps_unknown_drops() {
        let registry = PendingRegistry::new();
        registry.complete(reply(Uuid::new_v4())).await;
        assert_eq!(registry.counters().unknown_drops(), 1);
    }

    #[tokio::test]
    async fn late_reply_after_completion_bumps_late_drops() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let waiter = registry.register_single(corr, Duration::from_secs(5));

        registry.complete(reply(corr)).await;
        waiter.await_reply().await.unwrap();

        // Redelivered reply arrives after the waiter is gone.
        registry.complete(reply(corr)).await;
        assert_eq!(registry.counters().late_drops(), 1);
        assert_eq!(registry.counters().unknown_drops(), 0);
    }

    #[tokio::test]
    async fn cancel_signals_waiter_and_drops_later_reply() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let waiter = registry.register_single(corr, Duration::from_secs(5));

        registry.cancel(corr, "client disconnected");
        let err = waiter.await_reply().await.unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled(_)));

        registry.complete(reply(corr)).await;
        assert_eq!(registry.counters().late_drops(), 1);
    }

    #[tokio::test]
    async fn kind_mismatch_leaves_waiter_open() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let waiter = registry.register_single(corr, Duration::from_secs(5));

        registry.complete(chunk(corr, 0, "A", false)).await;
        assert_eq!(registry.counters().kind_mismatches(), 1);
        assert_eq!(registry.pending_count(), 1);

        // The real reply still gets through.
        registry.complete(reply(corr)).await;
        assert!(waiter.await_reply().await.is_ok());
    }

    #[tokio::test]
    async fn stream_chunks_flow_in_order_and_final_closes() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let mut waiter = registry.register_stream(corr, Duration::from_secs(5), 8, 8);

        registry.complete(chunk(corr, 0, "A", false)).await;
        registry.complete(chunk(corr, 1, "B", false)).await;
        registry.complete(chunk(corr, 2, "", true)).await;

        let a = waiter.rx.recv().await.unwrap().unwrap();
        assert_eq!(a.chunk.data, "A");
        let b = waiter.rx.recv().await.unwrap().unwrap();
        assert_eq!(b.chunk.data, "B");
        let end = waiter.rx.recv().await.unwrap().unwrap();
        assert!(end.meta.is_final);

        // Final chunk terminated the waiter; channel closes after drain.
        assert_eq!(registry.pending_count(), 0);
        assert!(waiter.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn out_of_order_chunks_are_reassembled() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let mut waiter = registry.register_stream(corr, Duration::from_secs(5), 8, 8);

        registry.complete(chunk(corr, 1, "B", false)).await;
        registry.complete(chunk(corr, 0, "A", false)).await;

        assert_eq!(waiter.rx.recv().await.unwrap().unwrap().chunk.data, "A");
        assert_eq!(waiter.rx.recv().await.unwrap().unwrap().chunk.data, "B");
    }

    #[tokio::test]
    async fn duplicate_chunk_collapses() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let mut waiter = registry.register_stream(corr, Duration::from_secs(5), 8, 8);

        registry.complete(chunk(corr, 0, "A", false)).await;
        registry.complete(chunk(corr, 0, "A", false)).await;
        registry.complete(chunk(corr, 1, "B", false)).await;

        assert_eq!(waiter.rx.recv().await.unwrap().unwrap().chunk.data, "A");
        assert_eq!(waiter.rx.recv().await.unwrap().unwrap().chunk.data, "B");
        assert_eq!(registry.counters().duplicate_drops(), 1);
    }

    #[tokio::test]
    async fn window_overflow_fails_stream() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let mut waiter = registry.register_stream(corr, Duration::from_secs(5), 8, 2);

        // Sequence 0 never arrives; the window fills with early chunks.
        registry.complete(chunk(corr, 1, "B", false)).await;
        registry.complete(chunk(corr, 2, "C", false)).await;
        registry.complete(chunk(corr, 3, "D", false)).await;

        let err = waiter.rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::StreamWindowExceeded));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn sweep_times_out_expired_single_waiter() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let waiter = registry.register_single(corr, Duration::from_millis(0));

        registry.sweep_expired();
        let err = waiter.await_reply().await.unwrap_err();
        assert!(matches!(err, ProxyError::RequestTimeout));
        assert_eq!(registry.counters().timeouts(), 1);

        // A reply arriving after expiry is a late drop.
        registry.complete(reply(corr)).await;
        assert_eq!(registry.counters().late_drops(), 1);
    }

    #[tokio::test]
    async fn sweep_times_out_idle_stream() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let mut waiter = registry.register_stream(corr, Duration::from_millis(0), 8, 8);

        registry.sweep_expired();
        let err = waiter.rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::RequestTimeout));
    }

    #[tokio::test]
    async fn idle_deadline_resets_on_chunk_arrival() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let mut waiter = registry.register_stream(corr, Duration::from_secs(5), 8, 8);

        registry.complete(chunk(corr, 0, "A", false)).await;
        registry.sweep_expired();

        // Still alive: the chunk refreshed the idle deadline.
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(waiter.rx.recv().await.unwrap().unwrap().chunk.data, "A");
    }

    #[tokio::test]
    async fn at_most_one_waiter_per_correlation() {
        let registry = PendingRegistry::new();
        let corr = Uuid::new_v4();
        let _first = registry.register_single(corr, Duration::from_secs(5));
        let second = registry.register_single(corr, Duration::from_secs(5));
        assert_eq!(registry.pending_count(), 1);

        registry.complete(reply(corr)).await;
        assert!(second.await_reply().await.is_ok());
    }
}
