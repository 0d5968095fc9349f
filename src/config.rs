//! Engine configuration: repository layout, git coordination settings,
//! and queue limits.
//!
//! Everything the engine touches lives under one repository root — the same
//! version-controlled tree that backs the distributed lock store. All other
//! paths are derived from it by convention and can be overridden via a JSON
//! config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration, loadable from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the shared, version-controlled operations repository
    pub repo_root: PathBuf,
    /// Git remote used for lock coordination pushes/pulls
    pub git_remote: String,
    /// Branch carrying lock and state files
    pub git_branch: String,
    /// Connector script for remote command execution, relative to `repo_root`
    pub connector_script: PathBuf,
    /// Maximum operations executing concurrently in the queue
    pub max_concurrent: usize,
    /// Terminal operations retained for status queries (oldest evicted first)
    pub history_limit: usize,
    /// Entries retained in the append-only operation log
    pub operation_log_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            git_remote: "origin".to_string(),
            git_branch: "main".to_string(),
            connector_script: PathBuf::from("scripts/ssh/connect.sh"),
            max_concurrent: 3,
            history_limit: 1000,
            operation_log_limit: 1000,
        }
    }
}

impl EngineConfig {
    /// Create a configuration rooted at the given repository path
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.repo_root.is_dir() {
            anyhow::bail!("Repository root does not exist: {:?}", self.repo_root);
        }
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        if self.history_limit == 0 {
            anyhow::bail!("history_limit must be at least 1");
        }
        Ok(())
    }

    /// Directory holding operation templates, organized by operation type
    pub fn operations_dir(&self) -> PathBuf {
        self.repo_root.join("operations")
    }

    /// Directory holding JSON state documents
    pub fn state_dir(&self) -> PathBuf {
        self.repo_root.join("infra").join("state")
    }

    /// Directory holding per-resource lock records
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    /// Absolute path to the remote-command connector script
    pub fn connector_path(&self) -> PathBuf {
        self.repo_root.join(&self.connector_script)
    }
}
