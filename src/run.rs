//! Run and phase types.
//!
//! A `Run` is one plan/apply request against a workspace. The engine never
//! creates or deletes runs — it reads their fields and drives status
//! transitions through the external run service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sub-lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Plan,
    Apply,
    Final,
}

impl Phase {
    /// Name used in log routing and status reporting.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Final => "final",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    PlannedAndFinished,
    ApplyQueued,
    Applying,
    Applied,
    Errored,
    Canceled,
    Discarded,
}

impl RunStatus {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Applied
                | Self::PlannedAndFinished
                | Self::Errored
                | Self::Canceled
                | Self::Discarded
        )
    }

    /// Check if the run is waiting to be picked up by a worker.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::PlanQueued | Self::ApplyQueued)
    }
}

/// One plan/apply execution request against a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workspace_id: String,
    pub organization: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub is_destroy: bool,
    pub configuration_version_id: String,
    pub terraform_version: String,
    /// Relative sub-path within the unpacked configuration that terraform
    /// runs in. Empty means the configuration root.
    #[serde(default)]
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_statuses() {
        assert!(RunStatus::PlanQueued.is_queued());
        assert!(RunStatus::ApplyQueued.is_queued());
        assert!(!RunStatus::Planning.is_queued());
        assert!(!RunStatus::Errored.is_queued());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Errored.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(RunStatus::Discarded.is_terminal());
        assert!(RunStatus::Applied.is_terminal());
        assert!(!RunStatus::PlanQueued.is_terminal());
        assert!(!RunStatus::Applying.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::PlanQueued).unwrap();
        assert_eq!(json, "\"plan_queued\"");
        let json = serde_json::to_string(&Phase::Apply).unwrap();
        assert_eq!(json, "\"apply\"");
    }
}
