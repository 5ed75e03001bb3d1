//! Event stream replay
//!
//! A single reader walks the event stream in log order and routes each
//! decoded request to one of N workers by its partition key. Every worker
//! owns a bounded queue, so slow workers throttle the reader, and requests
//! touching the same key are reapplied in log order.

use crate::handlers::MethodHandlers;
use crate::request::{RequestBody, ServiceRequest};
use async_trait::async_trait;
use cachemeta_common::{Error, LogId, Result};
use cachemeta_events::{EventEntry, EventSink, EventStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Result of a completed replay
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ReplayOutcome {
    /// First position requested
    pub from: LogId,
    /// Position at which live writing resumes
    pub resume: LogId,
    /// Requests reapplied
    pub dispatched: u64,
}

pub struct ReplayDispatcher {
    handlers: Arc<MethodHandlers>,
    workers: usize,
    queue_capacity: usize,
}

impl ReplayDispatcher {
    /// `queue_capacity` is the total backlog shared by all workers
    pub fn new(handlers: Arc<MethodHandlers>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            handlers,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Reapply every entry at or after `from`. Fails on the first decode or
    /// handler error; workers are always drained before returning.
    pub async fn run(&self, events: &dyn EventStream, from: LogId) -> Result<ReplayOutcome> {
        let per_worker = (self.queue_capacity / self.workers).max(1);
        let dispatched = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::new();
        let mut senders = Vec::with_capacity(self.workers);

        for id in 0..self.workers {
            let (tx, rx) = mpsc::channel(per_worker);
            senders.push(tx);
            workers.spawn(replay_worker(
                id,
                rx,
                Arc::clone(&self.handlers),
                Arc::clone(&dispatched),
            ));
        }

        info!(
            "Replaying event stream from {} with {} workers",
            from, self.workers
        );
        let router = PartitionRouter { senders };
        let read = events.read_events_from(from, &router).await;
        // Closing the queues lets the workers drain and exit
        drop(router);

        let mut worker_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| Error::internal(format!("replay worker panicked: {e}")));
            if let Err(e) = result.and_then(|r| r)
                && worker_error.is_none()
            {
                worker_error = Some(e);
            }
        }

        // A failed worker closes its queue, which the reader then reports as
        // a send failure; the worker's error is the root cause.
        if let Some(e) = worker_error {
            return Err(e);
        }
        let resume = read?;

        let outcome = ReplayOutcome {
            from,
            resume,
            dispatched: dispatched.load(Ordering::Relaxed),
        };
        info!(
            "Replay complete: {} requests from {}, resuming at {}",
            outcome.dispatched, from, resume
        );
        Ok(outcome)
    }
}

/// Decodes entries and hands them to the worker owning their key
struct PartitionRouter {
    senders: Vec<mpsc::Sender<(LogId, ServiceRequest)>>,
}

#[async_trait]
impl EventSink for PartitionRouter {
    async fn accept(&self, entry: EventEntry) -> Result<()> {
        let body = RequestBody::decode(entry.kind, &entry.payload).inspect_err(|e| {
            error!(
                "Cannot replay event at {}: {}; aborting restore",
                entry.position, e
            );
        })?;
        let slot = (body.partition_key() % self.senders.len() as u64) as usize;
        self.senders[slot]
            .send((entry.position, ServiceRequest::replay(body)))
            .await
            .map_err(|_| Error::internal(format!("replay worker {slot} stopped")))
    }
}

async fn replay_worker(
    id: usize,
    mut rx: mpsc::Receiver<(LogId, ServiceRequest)>,
    handlers: Arc<MethodHandlers>,
    dispatched: Arc<AtomicU64>,
) -> Result<()> {
    let mut applied = 0u64;
    while let Some((position, mut request)) = rx.recv().await {
        request.replaying = true;
        // Retry and persist flags have no caller to report to
        handlers.dispatch(&request).inspect_err(|e| {
            error!(
                "Replay worker {} failed at {} ({:?}): {}",
                id,
                position,
                request.kind(),
                e
            );
        })?;
        applied += 1;
        dispatched.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Replay worker {} applied {} requests", id, applied);
    Ok(())
}
