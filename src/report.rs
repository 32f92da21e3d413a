//! Parsing of resource change counts out of terraform CLI output.
//!
//! Terraform prints a one-line change summary whose wording has shifted
//! across releases. The parser recognises the known forms exactly; anything
//! else is a hard error, because an unrecognised summary means a terraform
//! version whose output this engine does not understand.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// Pre-v1.0 wording.
static PLAN_NO_CHANGES_LEGACY: &str = "No changes. Infrastructure is up-to-date.";
// v1.0+ wording.
static PLAN_NO_CHANGES: &str = "No changes. Your infrastructure matches the configuration.";

static PLAN_CHANGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy\.").unwrap()
});

static APPLY_CHANGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Apply complete! Resources: (\d+) added, (\d+) changed, (\d+) destroyed\.")
        .unwrap()
});

/// Resource change counts reported by a plan or apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub adds: u32,
    pub changes: u32,
    pub deletions: u32,
}

impl PlanReport {
    /// Extract change counts from the combined init+plan output.
    pub fn from_plan_output(output: &str) -> Result<Self, EngineError> {
        if output.contains(PLAN_NO_CHANGES) || output.contains(PLAN_NO_CHANGES_LEGACY) {
            return Ok(Self::default());
        }
        match PLAN_CHANGES.captures(output) {
            Some(caps) => Ok(Self {
                adds: parse_count(&caps[1])?,
                changes: parse_count(&caps[2])?,
                deletions: parse_count(&caps[3])?,
            }),
            None => Err(EngineError::MalformedOutput { phase: "plan" }),
        }
    }

    /// Extract change counts from apply output.
    pub fn from_apply_output(output: &str) -> Result<Self, EngineError> {
        match APPLY_CHANGES.captures(output) {
            Some(caps) => Ok(Self {
                adds: parse_count(&caps[1])?,
                changes: parse_count(&caps[2])?,
                deletions: parse_count(&caps[3])?,
            }),
            None => Err(EngineError::MalformedOutput { phase: "apply" }),
        }
    }
}

fn parse_count(digits: &str) -> Result<u32, EngineError> {
    digits
        .parse()
        .map_err(|e| anyhow::anyhow!("change count out of range: {e}").into())
}
