//! Workspace variables and their rendering into the working directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Where a variable is surfaced during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableCategory {
    /// Written to `terraform.tfvars` in the working directory.
    Terraform,
    /// Exported into the terraform process environment.
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
    pub category: VariableCategory,
}

/// Render terraform-category variables to `terraform.tfvars` under `dir`.
/// Env-category variables are skipped; the operation exports those into the
/// subprocess environment instead.
pub fn write_terraform_vars(dir: &Path, variables: &[Variable]) -> std::io::Result<()> {
    let mut rendered = String::new();
    for v in variables {
        if v.category == VariableCategory::Terraform {
            rendered.push_str(&format!("{} = \"{}\"\n", v.key, v.value));
        }
    }
    std::fs::write(dir.join("terraform.tfvars"), rendered)
}
