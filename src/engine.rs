//! Top-level assembly: spooler, downloader, terminator and worker pool
//! wired together from a `Config` and the collaborator set.

use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::client::{EngineClients, EventBus};
use crate::config::Config;
use crate::download::{Downloader, HashicorpReleases, ReleaseFetcher};
use crate::error::EngineError;
use crate::spooler::Spooler;
use crate::supervisor::Supervisor;
use crate::terminator::Terminator;

pub struct Engine {
    spooler: Spooler,
    supervisor: Supervisor,
}

impl Engine {
    /// Wire up an engine fetching terraform binaries from the official
    /// releases host. Fails if the backlog of already-queued runs cannot
    /// be listed.
    pub async fn new(
        config: Config,
        clients: EngineClients,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self, EngineError> {
        Self::with_fetcher(config, clients, bus, Arc::new(HashicorpReleases::new())).await
    }

    /// Same as `new` with the release fetcher swapped out.
    pub async fn with_fetcher(
        config: Config,
        clients: EngineClients,
        bus: Arc<dyn EventBus>,
        fetcher: Arc<dyn ReleaseFetcher>,
    ) -> Result<Self, EngineError> {
        let spooler = Spooler::new(clients.runs.clone(), bus).await?;
        let downloader = Arc::new(Downloader::new(config.terraform_bin_dir.clone(), fetcher));
        let terminator = Arc::new(Terminator::new());
        let supervisor = Supervisor::new(config, clients, downloader, terminator);
        Ok(Self {
            spooler,
            supervisor,
        })
    }

    /// Run until `token` fires or the event bus closes. Jobs in flight are
    /// allowed to finish before this returns.
    pub async fn start(mut self, token: CancellationToken) -> Result<(), EngineError> {
        let jobs = self
            .spooler
            .jobs()
            .ok_or_else(|| anyhow!("job queue already taken"))?;
        let cancelations = self
            .spooler
            .cancelations()
            .ok_or_else(|| anyhow!("cancellation queue already taken"))?;

        let supervisor = self.supervisor;
        let pool_token = token.clone();
        let pool =
            tokio::spawn(async move { supervisor.start(pool_token, jobs, cancelations).await });

        let result = self.spooler.start(token.clone()).await;
        // whatever stopped the spooler also brings the pool down
        token.cancel();
        pool.await
            .map_err(|e| anyhow!("worker pool task panicked: {e}"))?;
        result
    }
}
