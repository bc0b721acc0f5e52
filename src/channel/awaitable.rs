use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::{debug, trace};

use crate::channel::control::{AwaitableId, ConnectionResult};

/// The answer a pending handshake wait is completed with
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlReply {
    Connection(ConnectionResult),
    Pong,
    Disconnected,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AwaitOutcome<T> {
    Completed(T),
    TimedOut,
    /// the owning endpoint was disposed while waiting
    Cancelled,
}

/// Correlates asynchronous requests with their responses through a short integer id. Every wait
///  is bounded by a timeout, and [Awaitables::cancel_all] resolves all pending waits at once.
#[derive(Default)]
pub struct Awaitables {
    next_id: AtomicU16,
    pending: Mutex<FxHashMap<AwaitableId, oneshot::Sender<ControlReply>>>,
    cancelled: AtomicBool,
}
impl Awaitables {
    pub fn new() -> Awaitables {
        Default::default()
    }

    pub async fn register(&self) -> (AwaitableId, oneshot::Receiver<ControlReply>) {
        let (send, recv) = oneshot::channel();
        let mut pending = self.pending.lock().await;

        let mut id = self.next_id.fetch_add(1, Ordering::AcqRel);
        while pending.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::AcqRel);
        }

        if self.cancelled.load(Ordering::Acquire) {
            // the sender is dropped right away, so the wait resolves as cancelled
            debug!("registering awaitable after cancellation");
        }
        else {
            pending.insert(id, send);
        }
        (id, recv)
    }

    /// Completes a pending wait. Returns false for ids that are unknown, e.g. because the wait
    ///  timed out already or the response is a duplicate.
    pub async fn complete(&self, id: AwaitableId, reply: ControlReply) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(sender) => {
                trace!("completing awaitable {} with {:?}", id, reply);
                sender.send(reply).is_ok()
            }
            None => {
                debug!("no pending awaitable {} for {:?} - ignoring", id, reply);
                false
            }
        }
    }

    pub async fn wait(&self, id: AwaitableId, recv: oneshot::Receiver<ControlReply>, bound: Duration) -> AwaitOutcome<ControlReply> {
        match time::timeout(bound, recv).await {
            Ok(Ok(reply)) => AwaitOutcome::Completed(reply),
            Ok(Err(_)) => AwaitOutcome::Cancelled,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                AwaitOutcome::TimedOut
            }
        }
    }

    /// resolves all pending and future waits as cancelled
    pub async fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.pending.lock().await.clear();
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}
