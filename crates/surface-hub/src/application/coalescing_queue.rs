//! Keyed write-coalescing queue.
//!
//! Every driver needs the same thing: draw requests arrive faster than the
//! device can absorb them, and only the newest image for each key matters.
//! [`CoalescingQueue`] keeps one pending payload per key.  Queuing a key that
//! already has a pending payload replaces it.
//!
//! # Guarantees
//!
//! - At most one `process` call is in flight per key at any time.
//! - Different keys are processed concurrently.
//! - After an in-flight call for a key finishes, the newest payload queued in
//!   the meantime (if any) is processed next.
//! - A processor error for one key is reported on the error channel and
//!   never stalls other keys.
//!
//! # How it works (for beginners)
//!
//! One background "drain" task owns a [`JoinSet`] of per-key jobs.  It wakes
//! whenever something is queued or a job finishes, starts a job for every key
//! that has a pending payload and nothing in flight, and goes back to sleep.
//! Each job removes its key from the in-flight set when it ends, even if it
//! panics, through a drop guard.
//!
//! With a non-zero *settle* delay a job waits before picking up its payload,
//! so a burst of updates collapses into one call with the final value.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, trace};

use crate::application::panel::SurfaceError;

/// Does the actual work for a key.
#[async_trait]
pub trait QueueProcessor<K, P>: Send + Sync
where
    K: Send + 'static,
    P: Send + 'static,
{
    /// Handles the newest payload for `key`.
    ///
    /// # Errors
    ///
    /// Any error is forwarded to the queue's error channel.
    async fn process(&self, key: K, payload: P) -> Result<(), SurfaceError>;
}

/// A processor failure, reported on the queue's error channel.
#[derive(Debug)]
pub struct QueueError<K> {
    pub key: K,
    pub error: SurfaceError,
}

struct QueueState<K, P> {
    pending: HashMap<K, P>,
    in_flight: HashSet<K>,
    closed: bool,
}

struct Shared<K, P> {
    state: Mutex<QueueState<K, P>>,
    wake: Notify,
}

impl<K, P> Shared<K, P> {
    fn lock(&self) -> MutexGuard<'_, QueueState<K, P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the in-flight mark when a job ends, however it ends.
struct InFlightGuard<K: Eq + Hash, P> {
    shared: Arc<Shared<K, P>>,
    key: K,
}

impl<K: Eq + Hash, P> Drop for InFlightGuard<K, P> {
    fn drop(&mut self) {
        self.shared.lock().in_flight.remove(&self.key);
        self.shared.wake.notify_one();
    }
}

/// Keyed latest-value queue with per-key serialisation.
///
/// Must be created inside a Tokio runtime.  Dropping the queue closes it.
pub struct CoalescingQueue<K, P> {
    shared: Arc<Shared<K, P>>,
    drain: JoinHandle<()>,
}

impl<K, P> CoalescingQueue<K, P>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    P: Send + 'static,
{
    /// Creates a queue that processes payloads as soon as a key is idle.
    ///
    /// Returns the queue and the channel processor errors are reported on.
    pub fn new<Q>(processor: Arc<Q>) -> (Self, mpsc::UnboundedReceiver<QueueError<K>>)
    where
        Q: QueueProcessor<K, P> + 'static,
    {
        Self::with_settle(processor, Duration::ZERO)
    }

    /// Like [`CoalescingQueue::new`], but every job waits `settle` before
    /// taking its payload.
    pub fn with_settle<Q>(processor: Arc<Q>, settle: Duration) -> (Self, mpsc::UnboundedReceiver<QueueError<K>>)
    where
        Q: QueueProcessor<K, P> + 'static,
    {
        let processor: Arc<dyn QueueProcessor<K, P>> = processor;
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                closed: false,
            }),
            wake: Notify::new(),
        });
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_loop(Arc::clone(&shared), processor, errors_tx, settle));
        (Self { shared, drain }, errors_rx)
    }

    /// Stores `payload` as the newest value for `key`.
    ///
    /// No-op once the queue is closed.
    pub fn queue(&self, key: K, payload: P) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                trace!("queue closed; dropping update for {key:?}");
                return;
            }
            state.pending.insert(key, payload);
        }
        self.shared.wake.notify_one();
    }

    /// Abandons pending work and stops the drain task.
    ///
    /// In-flight jobs are cancelled at their next await point.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            state.pending.clear();
        }
        self.drain.abort();
    }
}

impl<K, P> Drop for CoalescingQueue<K, P> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
        }
        self.drain.abort();
    }
}

// ── Drain task ───────────────────────────────────────────────────────────────

async fn drain_loop<K, P>(
    shared: Arc<Shared<K, P>>,
    processor: Arc<dyn QueueProcessor<K, P>>,
    errors: mpsc::UnboundedSender<QueueError<K>>,
    settle: Duration,
) where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    P: Send + 'static,
{
    let mut jobs: JoinSet<Option<QueueError<K>>> = JoinSet::new();

    loop {
        let ready: Vec<K> = {
            let mut state = shared.lock();
            if state.closed {
                break;
            }
            let ready: Vec<K> = state
                .pending
                .keys()
                .filter(|k| !state.in_flight.contains(*k))
                .cloned()
                .collect();
            for key in &ready {
                state.in_flight.insert(key.clone());
            }
            ready
        };

        for key in ready {
            jobs.spawn(run_job(Arc::clone(&shared), Arc::clone(&processor), key, settle));
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => match joined {
                Ok(Some(err)) => {
                    let _ = errors.send(err);
                }
                Ok(None) => {}
                Err(e) if e.is_panic() => error!("coalescing queue job panicked: {e}"),
                Err(_) => {}
            },
        }
    }
}

async fn run_job<K, P>(
    shared: Arc<Shared<K, P>>,
    processor: Arc<dyn QueueProcessor<K, P>>,
    key: K,
    settle: Duration,
) -> Option<QueueError<K>>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    P: Send + 'static,
{
    let _guard = InFlightGuard {
        shared: Arc::clone(&shared),
        key: key.clone(),
    };

    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    let payload = shared.lock().pending.remove(&key)?;
    match processor.process(key.clone(), payload).await {
        Ok(()) => None,
        Err(error) => Some(QueueError { key, error }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
