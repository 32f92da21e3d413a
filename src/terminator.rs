//! Registry routing cancellation requests to in-flight executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A handle capable of canceling one in-flight execution.
///
/// Graceful cancellation (`force == false`) flags the execution so it stops
/// before its next step; forced cancellation also interrupts whatever the
/// current step is blocked on.
pub trait Cancelable: Send + Sync {
    fn cancel(&self, force: bool);
}

/// Maps run IDs to the cancelable handle of whichever worker is currently
/// executing them. Handles are checked in for the duration of execution
/// only; nothing here is persisted.
#[derive(Default)]
pub struct Terminator {
    mapping: Mutex<HashMap<String, Arc<dyn Cancelable>>>,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handle executing `run_id`.
    pub fn check_in(&self, run_id: &str, handle: Arc<dyn Cancelable>) {
        let mut mapping = self.mapping.lock().unwrap_or_else(|e| e.into_inner());
        mapping.insert(run_id.to_string(), handle);
    }

    /// Deregister `run_id` once its execution ends, whatever the outcome.
    pub fn check_out(&self, run_id: &str) {
        let mut mapping = self.mapping.lock().unwrap_or_else(|e| e.into_inner());
        mapping.remove(run_id);
    }

    /// Route a cancellation to the execution of `run_id`, if there is one.
    /// A miss is silently ignored: the run may have finished, never started
    /// here, or be running on a different agent.
    pub fn cancel(&self, run_id: &str, force: bool) {
        let handle = {
            let mapping = self.mapping.lock().unwrap_or_else(|e| e.into_inner());
            mapping.get(run_id).cloned()
        };
        match handle {
            Some(handle) => {
                tracing::info!(run_id, force, "canceling run");
                handle.cancel(force);
            }
            None => {
                tracing::debug!(run_id, "cancellation for run not executing here");
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.mapping.lock().unwrap().len()
    }
}
