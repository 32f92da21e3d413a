//! Typed error hierarchy for the run-execution engine.
//!
//! `EngineError` covers everything the pipeline and its collaborators can
//! fail with. Two variants are load-bearing for control flow:
//! - `Canceled` — a run aborted by a cancellation request, which is a
//!   distinct terminal outcome rather than a failure.
//! - `ResourceNotFound` — "no state version yet" / "no lock file uploaded",
//!   which specific steps treat as an empty-result success.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution canceled")]
    Canceled,

    #[error("resource not found")]
    ResourceNotFound,

    #[error("{program} exited with {}: {stderr}", exit_label(*code))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("no recognised change summary in {phase} output")]
    MalformedOutput { phase: &'static str },

    #[error("downloading terraform {version}: {source}")]
    Download {
        version: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("event bus closed")]
    BusClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True for cancellation, which the worker reports as a canceled run
    /// rather than an errored one.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound)
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "signal".to_string(),
    }
}
