//! Fan-out engine: a worker pool multiplexing broadcasts to sessions.
//!
//! Each worker owns a disjoint set of sessions and a bounded inbound
//! channel. Broadcasting never blocks the producer: a full worker channel
//! drops the message for that worker and counts it. Within a worker,
//! inbound frames are batched and try-enqueued onto each session's bounded
//! write queue; a full session queue marks that session a slow consumer
//! and disconnects it, keeping total memory bounded.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::{now_ns, Session, SessionId};

/// Configuration for the fan-out engine.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Worker task count.
    pub workers: usize,
    /// Session cap per worker; beyond it new sockets are refused.
    pub max_sessions_per_worker: usize,
    /// Capacity of each worker's inbound broadcast channel.
    pub worker_queue: usize,
    /// Capacity of each session's write queue.
    pub session_queue: usize,
    /// Max frames per delivery batch.
    pub batch_size: usize,
    /// Flush timer, armed when a batch becomes non-empty.
    pub batch_timeout: Duration,
    /// Deadline for one socket write.
    pub write_timeout: Duration,
    /// PING cadence per session.
    pub ping_interval: Duration,
    /// Idle threshold past which a session is presumed dead.
    pub liveness_timeout: Duration,
    /// Cadence of the per-worker liveness sweep.
    pub cleanup_interval: Duration,
    /// Read size limit; clients send no application payload.
    pub read_limit: usize,
    /// Bounded wait for workers to wind down on shutdown.
    pub shutdown_wait: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            workers: cpus * 2,
            max_sessions_per_worker: 1000,
            worker_queue: 10_000,
            session_queue: 256,
            batch_size: 500,
            batch_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(60),
            read_limit: 512,
            shutdown_wait: Duration::from_secs(1),
        }
    }
}

struct Worker {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    inbound: mpsc::Sender<Bytes>,
    done: watch::Sender<bool>,
}

/// A freshly added session plus the halves its socket pumps consume.
pub struct SessionHandle {
    pub session: Arc<Session>,
    pub queue: mpsc::Receiver<Bytes>,
    pub done: watch::Receiver<bool>,
}

/// The worker pool. `add`, `broadcast` and `remove` are the whole surface.
pub struct FanoutEngine {
    workers: Vec<Arc<Worker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes admission; the per-worker cap holds only if no two
    /// upgrades run the pick-and-insert concurrently.
    admission: Mutex<()>,
    dropped: AtomicU64,
    config: FanoutConfig,
}

impl FanoutEngine {
    pub fn new(config: FanoutConfig) -> Arc<Self> {
        let mut workers = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for index in 0..config.workers {
            let (inbound, inbound_rx) = mpsc::channel(config.worker_queue);
            let (done, done_rx) = watch::channel(false);
            let worker = Arc::new(Worker {
                sessions: RwLock::new(HashMap::new()),
                inbound,
                done,
            });
            handles.push(tokio::spawn(worker_loop(
                index,
                worker.clone(),
                inbound_rx,
                done_rx,
                config.clone(),
            )));
            workers.push(worker);
        }

        info!("Fan-out engine started with {} workers", config.workers);

        Arc::new(Self {
            workers,
            handles: Mutex::new(handles),
            admission: Mutex::new(()),
            dropped: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Install a new session on the least-loaded worker with capacity.
    /// `None` means every worker is full and the socket must be closed.
    pub fn add(&self) -> Option<SessionHandle> {
        // Both the capacity check and the insert below happen under the
        // admission lock; removal never needs it.
        let _admission = self.admission.lock().unwrap();

        let mut best: Option<(usize, usize)> = None;
        for (index, worker) in self.workers.iter().enumerate() {
            let len = worker.sessions.read().unwrap().len();
            if len < self.config.max_sessions_per_worker
                && best.map_or(true, |(_, best_len)| len < best_len)
            {
                best = Some((index, len));
            }
        }

        let Some((index, _)) = best else {
            counter!("gateway_sessions_refused_total").increment(1);
            return None;
        };

        let (session, queue, done) = Session::new(index, self.config.session_queue);
        self.workers[index]
            .sessions
            .write()
            .unwrap()
            .insert(session.id, session.clone());

        gauge!("gateway_active_sessions").set(self.session_count() as f64);
        debug!("Session {} assigned to worker {}", session.id, index);

        Some(SessionHandle { session, queue, done })
    }

    /// Drop a session from its worker and ask its write pump to close.
    /// Safe under concurrent calls from both pumps.
    pub fn remove(&self, session: &Session) {
        let existed = self.workers[session.worker]
            .sessions
            .write()
            .unwrap()
            .remove(&session.id)
            .is_some();
        session.signal_done();
        if existed {
            gauge!("gateway_active_sessions").set(self.session_count() as f64);
            debug!("Session {} removed", session.id);
        }
    }

    /// Hand one prepared frame to every worker without ever blocking.
    pub fn broadcast(&self, frame: Bytes) {
        for worker in &self.workers {
            match worker.inbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("gateway_broadcast_dropped_total").increment(1);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Messages dropped because a worker channel was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.workers
            .iter()
            .map(|worker| worker.sessions.read().unwrap().len())
            .sum()
    }

    /// Stop every worker, closing all sessions, with a bounded wait.
    pub async fn shutdown(&self) {
        info!("Fan-out engine shutting down");
        for worker in &self.workers {
            worker.done.send_replace(true);
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        if tokio::time::timeout(
            self.config.shutdown_wait,
            futures::future::join_all(handles),
        )
        .await
        .is_err()
        {
            warn!("Fan-out workers did not stop within the shutdown window");
        }
    }
}

async fn worker_loop(
    index: usize,
    worker: Arc<Worker>,
    mut inbound: mpsc::Receiver<Bytes>,
    mut done: watch::Receiver<bool>,
    config: FanoutConfig,
) {
    let mut batch: Vec<Bytes> = Vec::with_capacity(config.batch_size);
    let flush = tokio::time::sleep(config.batch_timeout);
    tokio::pin!(flush);
    let mut cleanup = tokio::time::interval(config.cleanup_interval);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = done.changed() => break,

            _ = cleanup.tick() => {
                sweep_stale_sessions(&worker, config.liveness_timeout);
            }

            _ = &mut flush, if !batch.is_empty() => {
                flush_batch(&worker, &mut batch);
            }

            maybe = inbound.recv() => match maybe {
                Some(frame) => {
                    if batch.is_empty() {
                        flush.as_mut().reset(Instant::now() + config.batch_timeout);
                    }
                    batch.push(frame);
                    if batch.len() >= config.batch_size {
                        flush_batch(&worker, &mut batch);
                    }
                }
                None => break,
            },
        }
    }

    // Deliver whatever is still queued, then close every session.
    while let Ok(frame) = inbound.try_recv() {
        batch.push(frame);
    }
    if !batch.is_empty() {
        flush_batch(&worker, &mut batch);
    }

    let sessions: Vec<Arc<Session>> = worker
        .sessions
        .write()
        .unwrap()
        .drain()
        .map(|(_, session)| session)
        .collect();
    for session in sessions {
        session.signal_done();
    }

    debug!("Worker {} stopped", index);
}

/// Deliver a batch to every live session of this worker. The session list
/// is snapshotted under the read lock, which is released before any
/// enqueueing happens.
fn flush_batch(worker: &Worker, batch: &mut Vec<Bytes>) {
    let sessions: Vec<Arc<Session>> = {
        let map = worker.sessions.read().unwrap();
        map.values().cloned().collect()
    };
    if sessions.is_empty() {
        batch.clear();
        return;
    }

    for frame in batch.drain(..) {
        for session in &sessions {
            if !session.is_ready() || session.is_done() {
                continue;
            }
            match session.try_enqueue(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Session {} write queue full, evicting slow consumer", session.id);
                    counter!("gateway_sessions_evicted_total").increment(1);
                    session.signal_done();
                }
                Err(TrySendError::Closed(_)) => session.signal_done(),
            }
        }
    }
}

/// Remove sessions whose last liveness is older than the threshold.
fn sweep_stale_sessions(worker: &Worker, liveness_timeout: Duration) {
    let cutoff = now_ns() - liveness_timeout.as_nanos() as i64;
    let stale: Vec<Arc<Session>> = {
        let map = worker.sessions.read().unwrap();
        map.values()
            .filter(|session| session.last_seen_ns() < cutoff)
            .cloned()
            .collect()
    };
    if stale.is_empty() {
        return;
    }

    let mut map = worker.sessions.write().unwrap();
    for session in stale {
        warn!("Session {} inactive past threshold, removing", session.id);
        map.remove(&session.id);
        session.signal_done();
        counter!("gateway_sessions_expired_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(workers: usize) -> FanoutConfig {
        FanoutConfig {
            workers,
            max_sessions_per_worker: 2,
            worker_queue: 4,
            session_queue: 2,
            batch_size: 500,
            batch_timeout: Duration::from_millis(10),
            ..FanoutConfig::default()
        }
    }

    #[tokio::test]
    async fn add_refuses_past_capacity() {
        let engine = FanoutEngine::new(test_config(2));
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(engine.add().expect("capacity left"));
        }
        assert!(engine.add().is_none());
        assert_eq!(engine.session_count(), 4);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn add_spreads_sessions_across_workers() {
        let engine = FanoutEngine::new(test_config(2));
        let a = engine.add().unwrap();
        let b = engine.add().unwrap();
        assert_ne!(a.session.worker, b.session.worker);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let engine = FanoutEngine::new(test_config(1));
        let handle = engine.add().unwrap();
        engine.remove(&handle.session);
        engine.remove(&handle.session);
        assert_eq!(engine.session_count(), 0);
        assert!(handle.session.is_done());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_ready_sessions_only() {
        let engine = FanoutEngine::new(test_config(1));
        let mut handle = engine.add().unwrap();

        engine.broadcast(Bytes::from_static(b"early"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.queue.try_recv().is_err());

        handle.session.mark_ready();
        engine.broadcast(Bytes::from_static(b"live"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.queue.try_recv().unwrap(), Bytes::from_static(b"live"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted() {
        let engine = FanoutEngine::new(test_config(1));
        let handle = engine.add().unwrap();
        handle.session.mark_ready();

        // Nobody drains the session queue (capacity 2); the third delivery
        // must trip the eviction path.
        for _ in 0..3 {
            engine.broadcast(Bytes::from_static(b"frame"));
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(handle.session.is_done());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn overloaded_worker_drops_and_counts() {
        let engine = FanoutEngine::new(test_config(1));

        // On a current-thread runtime the worker task cannot run between
        // these sends, so the inbound channel (capacity 4) must overflow.
        for _ in 0..10 {
            engine.broadcast(Bytes::from_static(b"frame"));
        }
        assert_eq!(engine.dropped_messages(), 6);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn liveness_sweep_removes_idle_sessions() {
        let engine = FanoutEngine::new(test_config(1));
        let fresh = engine.add().unwrap();
        let stale = engine.add().unwrap();
        stale
            .session
            .backdate(now_ns() - Duration::from_secs(600).as_nanos() as i64);

        sweep_stale_sessions(&engine.workers[0], Duration::from_secs(120));

        assert_eq!(engine.session_count(), 1);
        assert!(stale.session.is_done());
        assert!(!fresh.session.is_done());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let engine = FanoutEngine::new(test_config(2));
        let handles: Vec<_> = (0..3).map(|_| engine.add().unwrap()).collect();
        engine.shutdown().await;
        for handle in &handles {
            assert!(handle.session.is_done());
        }
        assert_eq!(engine.session_count(), 0);
    }
}
