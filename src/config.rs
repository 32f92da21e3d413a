//! Engine configuration.
//!
//! Loaded from an optional `terraflow.toml` next to the daemon's working
//! directory; every knob has a default so a missing file means a default
//! configuration, not an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Environment always exported to terraform subprocesses.
pub const DEFAULT_ENVS: &[(&str, &str)] = &[
    ("TF_IN_AUTOMATION", "true"),
    ("CHECKPOINT_DISABLE", "true"),
];

/// Shared provider plugin cache, bind-mounted into the sandbox when enabled.
pub fn plugin_cache_dir() -> PathBuf {
    std::env::temp_dir().join("plugin-cache")
}

/// Configuration for the run-execution engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of workers, i.e. runs processed concurrently.
    pub concurrency: usize,
    /// Wrap `terraform apply` in a bubblewrap sandbox.
    pub sandbox: bool,
    /// Dump execution info into run logs.
    pub debug: bool,
    /// Use terraform's shared provider plugin cache.
    pub plugin_cache: bool,
    /// Destination directory for downloaded terraform binaries.
    pub terraform_bin_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            sandbox: false,
            debug: false,
            plugin_cache: false,
            terraform_bin_dir: std::env::temp_dir().join("terraflow-bins"),
        }
    }
}

/// Raw TOML structure for `terraflow.toml`
#[derive(Debug, Deserialize)]
struct ConfigToml {
    engine: Option<EngineSection>,
}

#[derive(Debug, Deserialize)]
struct EngineSection {
    concurrency: Option<usize>,
    sandbox: Option<bool>,
    debug: Option<bool>,
    plugin_cache: Option<bool>,
    terraform_bin_dir: Option<PathBuf>,
}

impl Config {
    /// Load config from `terraflow.toml` in `dir`. Returns defaults if the
    /// file doesn't exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("terraflow.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let toml: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.engine {
            if let Some(concurrency) = section.concurrency {
                config.concurrency = concurrency;
            }
            if let Some(sandbox) = section.sandbox {
                config.sandbox = sandbox;
            }
            if let Some(debug) = section.debug {
                config.debug = debug;
            }
            if let Some(plugin_cache) = section.plugin_cache {
                config.plugin_cache = plugin_cache;
            }
            if let Some(dir) = section.terraform_bin_dir {
                config.terraform_bin_dir = dir;
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency, 5);
        assert!(!config.sandbox);
        assert!(!config.debug);
        assert!(!config.plugin_cache);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.concurrency, 5);
        assert!(!config.sandbox);
    }

    #[test]
    fn load_full() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("terraflow.toml"),
            r#"
[engine]
concurrency = 2
sandbox = true
plugin_cache = true
terraform_bin_dir = "/var/cache/terraform"
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.concurrency, 2);
        assert!(config.sandbox);
        assert!(config.plugin_cache);
        assert_eq!(
            config.terraform_bin_dir,
            PathBuf::from("/var/cache/terraform")
        );
        assert!(!config.debug); // default
    }

    #[test]
    fn load_partial_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("terraflow.toml"), "[engine]\nsandbox = true\n").unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert!(config.sandbox);
        assert_eq!(config.concurrency, 5);
    }

    #[test]
    fn load_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("terraflow.toml"), "not valid toml {{{{").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
