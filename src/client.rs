//! Collaborator contracts the engine depends on.
//!
//! Transport, persistence and authorization live elsewhere; the engine only
//! sees these traits. Real implementations sit in the embedding daemon, test
//! doubles in `tests/engine.rs`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::report::PlanReport;
use crate::run::{Phase, Run, RunStatus};
use crate::variable::Variable;

/// Format of an uploaded plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    /// Opaque binary plan, consumed by `terraform apply`.
    Binary,
    /// Output of `terraform show -json`.
    Json,
}

/// Run CRU and artifact transfer, backed by the external run service.
#[async_trait]
pub trait RunService: Send + Sync {
    /// All runs currently in a queued-phase status, for seeding the spooler.
    async fn list_queued_runs(&self) -> Result<Vec<Run>, EngineError>;

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<(), EngineError>;

    /// Record a successful plan with its parsed change counts.
    async fn finish_plan(&self, run_id: &str, report: PlanReport) -> Result<(), EngineError>;

    /// Record a successful apply with its parsed change counts.
    async fn finish_apply(&self, run_id: &str, report: PlanReport) -> Result<(), EngineError>;

    /// Effective variables for the run's workspace.
    async fn list_variables(&self, run_id: &str) -> Result<Vec<Variable>, EngineError>;

    async fn upload_plan_file(
        &self,
        run_id: &str,
        file: &[u8],
        format: PlanFormat,
    ) -> Result<(), EngineError>;

    async fn upload_lock_file(&self, run_id: &str, file: &[u8]) -> Result<(), EngineError>;

    /// Lock file uploaded during the plan phase. `ResourceNotFound` when the
    /// plan never uploaded one.
    async fn download_lock_file(&self, run_id: &str) -> Result<Vec<u8>, EngineError>;

    async fn download_plan_file(&self, run_id: &str) -> Result<Vec<u8>, EngineError>;

    /// Append a chunk to the run's live phase log.
    async fn put_log_chunk(
        &self,
        run_id: &str,
        phase: Phase,
        chunk: Vec<u8>,
    ) -> Result<(), EngineError>;
}

/// Configuration version (tarball) retrieval.
#[async_trait]
pub trait ConfigurationVersionService: Send + Sync {
    /// Download the tar+gzip configuration archive.
    async fn download(&self, configuration_version_id: &str) -> Result<Vec<u8>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct StateVersion {
    pub id: String,
    pub serial: i64,
}

/// Workspace state storage.
#[async_trait]
pub trait StateVersionService: Send + Sync {
    /// Current state version for the workspace. `ResourceNotFound` when the
    /// workspace has no state yet.
    async fn current(&self, workspace_id: &str) -> Result<StateVersion, EngineError>;

    async fn download(&self, state_version_id: &str) -> Result<Vec<u8>, EngineError>;

    async fn create(&self, workspace_id: &str, state: &[u8])
    -> Result<StateVersion, EngineError>;
}

/// Organization-wide pub/sub event types the spooler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PlanQueued,
    ApplyQueued,
    RunCanceled { force: bool },
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub run: Run,
}

/// Pub/sub event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Subscribe under a stable consumer name. Events arrive in publish
    /// order; the stream ends when the bus shuts down.
    async fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<Event>, EngineError>;
}

/// Rewrites HCL in a directory. The engine only uses the backend-stripping
/// transform; the parsing internals are not its concern.
pub trait HclRewriter: Send + Sync {
    /// Remove `backend`/`cloud` blocks from all `.tf` files under `dir`.
    fn strip_backend(&self, dir: &Path) -> Result<(), EngineError>;
}

/// Destination for live log output, shared by the pipeline steps and the
/// binary downloader.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, chunk: &[u8]) -> Result<(), EngineError>;
}

/// The collaborator set threaded through the engine.
#[derive(Clone)]
pub struct EngineClients {
    pub runs: Arc<dyn RunService>,
    pub configs: Arc<dyn ConfigurationVersionService>,
    pub states: Arc<dyn StateVersionService>,
    pub hcl: Arc<dyn HclRewriter>,
}
