//! FIFO admission for the synchronous render path.
//!
//! Calls are pushed onto a submission queue; a single dispatcher hands out
//! permits strictly in submission order. Submitted work always runs to the
//! end, even when the caller stops waiting for it.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use metrics::gauge;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::debug;

pub const DEFAULT_SYNC_CONCURRENCY: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("concurrency limiter is shut down")]
    Closed,
    #[error("submitted render aborted before producing a result")]
    Aborted,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl Counters {
    fn publish(&self) {
        gauge!("docpress_sync_in_flight").set(self.in_flight.load(Ordering::Acquire) as f64);
        gauge!("docpress_sync_queued").set(self.queued.load(Ordering::Acquire) as f64);
    }
}

/// A granted turn; releases its permit when dropped.
struct Slot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.counters.publish();
    }
}

#[derive(Clone)]
pub struct ConcurrencyLimiter {
    limit: usize,
    submissions: mpsc::UnboundedSender<oneshot::Sender<Slot>>,
    counters: Arc<Counters>,
}

impl ConcurrencyLimiter {
    /// Must be called from within a Tokio runtime; spawns the dispatcher.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        let (submissions, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        tokio::spawn(dispatch(
            Arc::new(Semaphore::new(limit)),
            receiver,
            Arc::clone(&counters),
        ));

        Self {
            limit,
            submissions,
            counters,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    /// Run `job` once a slot frees up, in submission order.
    pub async fn run<F, T>(&self, job: F) -> Result<T, LimiterError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (start_tx, start_rx) = oneshot::channel::<Slot>();
        let (done_tx, done_rx) = oneshot::channel();

        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        self.counters.publish();
        if self.submissions.send(start_tx).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(LimiterError::Closed);
        }

        tokio::spawn(async move {
            let Ok(slot) = start_rx.await else {
                return;
            };
            let output = job.await;
            drop(slot);
            if done_tx.send(output).is_err() {
                debug!(
                    target = "application::render::limiter",
                    "caller went away before its render finished"
                );
            }
        });

        done_rx.await.map_err(|_| LimiterError::Aborted)
    }
}

async fn dispatch(
    permits: Arc<Semaphore>,
    mut submissions: mpsc::UnboundedReceiver<oneshot::Sender<Slot>>,
    counters: Arc<Counters>,
) {
    while let Some(start) = submissions.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        counters.queued.fetch_sub(1, Ordering::AcqRel);
        counters.in_flight.fetch_add(1, Ordering::AcqRel);
        counters.publish();

        // A refused slot is dropped here, which frees the permit again.
        let _ = start.send(Slot {
            _permit: permit,
            counters: Arc::clone(&counters),
        });
    }
}
