//! Feeds the worker pool from the event stream.
//!
//! The spooler maintains two bounded queues: jobs awaiting a worker, and
//! cancellation requests awaiting the terminator. At construction it seeds
//! the job queue with runs that were already queued before the engine came
//! up, then translates bus events into queue entries until shut down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{Event, EventBus, EventKind, RunService};
use crate::error::EngineError;
use crate::run::Run;

pub const QUEUE_CAPACITY: usize = 100;

/// A unit of work for a worker: execute the current phase of this run.
#[derive(Debug, Clone)]
pub struct Job {
    pub run: Run,
}

/// A request to cancel an in-flight run.
#[derive(Debug, Clone)]
pub struct Cancelation {
    pub run_id: String,
    pub force: bool,
}

pub struct Spooler {
    bus: Arc<dyn EventBus>,
    job_tx: mpsc::Sender<Job>,
    cancel_tx: mpsc::Sender<Cancelation>,
    job_rx: Option<mpsc::Receiver<Job>>,
    cancel_rx: Option<mpsc::Receiver<Cancelation>>,
}

impl Spooler {
    /// Construct a spooler, seeding the job queue with runs queued before
    /// startup. Fails if the backlog cannot be listed; starting with a
    /// silently incomplete queue would strand those runs.
    pub async fn new(
        runs: Arc<dyn RunService>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self, EngineError> {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (cancel_tx, cancel_rx) = mpsc::channel(QUEUE_CAPACITY);

        let backlog = runs.list_queued_runs().await?;
        tracing::info!(existing = backlog.len(), "seeding job queue");
        for run in backlog {
            if !run.status.is_queued() {
                tracing::warn!(run_id = %run.id, status = ?run.status, "skipping non-queued run in backlog");
                continue;
            }
            if job_tx.send(Job { run }).await.is_err() {
                return Err(EngineError::BusClosed);
            }
        }

        Ok(Self {
            bus,
            job_tx,
            cancel_tx,
            job_rx: Some(job_rx),
            cancel_rx: Some(cancel_rx),
        })
    }

    /// The job queue's receiving end. Yields `Some` exactly once.
    pub fn jobs(&mut self) -> Option<mpsc::Receiver<Job>> {
        self.job_rx.take()
    }

    /// The cancellation queue's receiving end. Yields `Some` exactly once.
    pub fn cancelations(&mut self) -> Option<mpsc::Receiver<Cancelation>> {
        self.cancel_rx.take()
    }

    /// Translate bus events into queue entries until `token` fires or the
    /// bus closes.
    pub async fn start(&self, token: CancellationToken) -> Result<(), EngineError> {
        let mut events = self.bus.subscribe("spooler").await?;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => return Err(EngineError::BusClosed),
                },
            }
        }
    }

    async fn handle_event(&self, event: Event) -> Result<(), EngineError> {
        match event.kind {
            EventKind::PlanQueued | EventKind::ApplyQueued => {
                tracing::debug!(run_id = %event.run.id, phase = %event.run.phase, "spooling job");
                self.job_tx
                    .send(Job { run: event.run })
                    .await
                    .map_err(|_| EngineError::BusClosed)
            }
            EventKind::RunCanceled { force } => {
                tracing::debug!(run_id = %event.run.id, force, "spooling cancelation");
                self.cancel_tx
                    .send(Cancelation {
                        run_id: event.run.id,
                        force,
                    })
                    .await
                    .map_err(|_| EngineError::BusClosed)
            }
        }
    }
}
