//! Per-client session state.
//!
//! A session is owned by exactly one fan-out worker for its lifetime. The
//! write pump is the only task that touches the socket's sink; everything
//! else communicates through the bounded frame queue and the done signal.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

pub type SessionId = u64;

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Monotone counter in the high word, random low word.
fn generate_session_id() -> SessionId {
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    (u64::from(counter) << 32) | u64::from(rand::random::<u32>())
}

pub(crate) fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// One live client connection.
pub struct Session {
    pub id: SessionId,
    /// Index of the owning worker.
    pub worker: usize,
    queue: mpsc::Sender<Bytes>,
    done: watch::Sender<bool>,
    last_seen_ns: AtomicI64,
    ready: AtomicBool,
}

impl Session {
    /// Build a session plus the receiving halves the socket pumps consume.
    pub(crate) fn new(
        worker: usize,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (queue, queue_rx) = mpsc::channel(queue_capacity);
        let (done, done_rx) = watch::channel(false);
        let session = Arc::new(Self {
            id: generate_session_id(),
            worker,
            queue,
            done,
            last_seen_ns: AtomicI64::new(now_ns()),
            ready: AtomicBool::new(false),
        });
        (session, queue_rx, done_rx)
    }

    /// Non-blocking enqueue used by the fan-out path.
    pub fn try_enqueue(&self, frame: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.queue.try_send(frame)
    }

    /// Waiting enqueue used by the bootstrap sequence only.
    pub async fn enqueue(&self, frame: Bytes) -> bool {
        self.queue.send(frame).await.is_ok()
    }

    /// Refresh liveness; called from the read pump on any client traffic.
    pub fn touch(&self) {
        self.last_seen_ns.store(now_ns(), Ordering::Relaxed);
    }

    pub fn last_seen_ns(&self) -> i64 {
        self.last_seen_ns.load(Ordering::Relaxed)
    }

    /// Ask the write pump to close the connection. Safe to call from any
    /// task, any number of times.
    pub fn signal_done(&self) {
        self.done.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Sessions receive broadcasts only after the bootstrap sequence; the
    /// STATE frame must precede every UPDATE.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, ns: i64) {
        self.last_seen_ns.store(ns, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered_by_counter() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(b >> 32 > a >> 32);
    }

    #[tokio::test]
    async fn done_signal_is_idempotent() {
        let (session, _queue, mut done) = Session::new(0, 4);
        assert!(!session.is_done());
        session.signal_done();
        session.signal_done();
        assert!(session.is_done());
        done.changed().await.unwrap();
        assert!(*done.borrow());
    }

    #[tokio::test]
    async fn queue_is_bounded() {
        let (session, _queue, _done) = Session::new(0, 2);
        assert!(session.try_enqueue(Bytes::from_static(b"a")).is_ok());
        assert!(session.try_enqueue(Bytes::from_static(b"b")).is_ok());
        assert!(matches!(
            session.try_enqueue(Bytes::from_static(b"c")),
            Err(TrySendError::Full(_))
        ));
    }
}
