//! The worker pool and the cancellation router.
//!
//! The supervisor spawns a fixed number of workers racing to dequeue jobs,
//! plus one task routing cancellation requests to the terminator. Worker
//! failures are reported against the run and logged; they never take the
//! pool down.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::client::EngineClients;
use crate::config::Config;
use crate::download::Downloader;
use crate::error::EngineError;
use crate::operation::{Operation, OperationHandle};
use crate::run::{Phase, RunStatus};
use crate::spooler::{Cancelation, Job};
use crate::terminator::Terminator;

pub struct Supervisor {
    config: Config,
    clients: EngineClients,
    downloader: Arc<Downloader>,
    terminator: Arc<Terminator>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        clients: EngineClients,
        downloader: Arc<Downloader>,
        terminator: Arc<Terminator>,
    ) -> Self {
        Self {
            config,
            clients,
            downloader,
            terminator,
        }
    }

    /// Run the pool until `token` fires or both queues close. Jobs already
    /// in flight at shutdown are allowed to finish.
    pub async fn start(
        &self,
        token: CancellationToken,
        jobs: mpsc::Receiver<Job>,
        mut cancelations: mpsc::Receiver<Cancelation>,
    ) {
        // the receiver is shared; whichever idle worker takes the lock
        // first dequeues the next job
        let jobs = Arc::new(Mutex::new(jobs));

        let mut handles = Vec::with_capacity(self.config.concurrency + 1);
        for id in 0..self.config.concurrency {
            let worker = Worker {
                config: self.config.clone(),
                clients: self.clients.clone(),
                downloader: self.downloader.clone(),
                terminator: self.terminator.clone(),
            };
            let jobs = Arc::clone(&jobs);
            let token = token.clone();
            handles.push(tokio::spawn(async move { worker.run(id, token, jobs).await }));
        }

        let terminator = self.terminator.clone();
        let router_token = token.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = router_token.cancelled() => return,
                    msg = cancelations.recv() => match msg {
                        Some(cancel) => terminator.cancel(&cancel.run_id, cancel.force),
                        None => return,
                    },
                }
            }
        }));

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(%err, "supervisor task panicked");
            }
        }
    }
}

struct Worker {
    config: Config,
    clients: EngineClients,
    downloader: Arc<Downloader>,
    terminator: Arc<Terminator>,
}

impl Worker {
    async fn run(
        self,
        id: usize,
        token: CancellationToken,
        jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    ) {
        loop {
            let job = {
                let mut rx = jobs.lock().await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => return,
                    },
                }
            };
            let run_id = job.run.id.clone();
            tracing::info!(worker = id, run_id = %run_id, phase = %job.run.phase, "starting job");
            if let Err(err) = self.process(job).await {
                tracing::error!(worker = id, run_id = %run_id, %err, "job failed");
            }
        }
    }

    /// Execute one job end to end, reporting status transitions against the
    /// run. The handle stays checked in with the terminator for exactly as
    /// long as the operation executes.
    async fn process(&self, job: Job) -> Result<(), EngineError> {
        let run = job.run;
        // a cancellation can race the queue; a run already in a terminal
        // status has nothing left to execute
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run.id, status = ?run.status, "skipping terminal run");
            return Ok(());
        }
        let running = match run.phase {
            Phase::Plan => RunStatus::Planning,
            Phase::Apply => RunStatus::Applying,
            other => return Err(anyhow!("job for non-executable phase {other}").into()),
        };
        self.clients.runs.update_status(&run.id, running).await?;

        let run_id = run.id.clone();
        let handle = Arc::new(OperationHandle::new());
        self.terminator.check_in(&run_id, handle.clone());
        let result = match Operation::new(
            run,
            self.config.clone(),
            self.clients.clone(),
            self.downloader.clone(),
            handle,
        ) {
            Ok(operation) => operation.execute().await,
            Err(err) => Err(err),
        };
        self.terminator.check_out(&run_id);

        match result {
            // finish_plan/finish_apply already recorded the outcome
            Ok(()) => Ok(()),
            Err(err) if err.is_canceled() => {
                self.clients
                    .runs
                    .update_status(&run_id, RunStatus::Canceled)
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.clients
                    .runs
                    .update_status(&run_id, RunStatus::Errored)
                    .await?;
                Err(err)
            }
        }
    }
}
