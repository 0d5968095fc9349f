//! Distributed resource locking over a shared version-controlled tree.
//!
//! This is a cooperative, optimistic lock: there is no lock service. Each
//! operator process pulls the shared tree, writes a lock record locally,
//! commits, and tries to publish. The publish is the single point of truth —
//! if it is rejected, a concurrent writer won the race and the local commit
//! is rolled back. A rejected publish for any other reason is
//! indistinguishable from contention and is treated the same way.
//!
//! The coordination medium is abstracted behind [`SyncTransport`] so a
//! consensus-backed store could replace the git transport without touching
//! callers.

use crate::config::EngineConfig;
use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of attempting to publish local changes upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The publish was accepted; this process won any race
    Accepted,
    /// The publish was rejected; a concurrent writer got there first
    Rejected,
}

/// The synchronization protocol the lock coordinator runs against.
///
/// Errors mean the transport itself is broken (cannot spawn git, storage
/// gone); ordinary contention surfaces as [`PushOutcome::Rejected`].
pub trait SyncTransport: Send + Sync {
    /// Bring the local tree up to date with the shared store
    fn pull(&self) -> Result<()>;
    /// Record the given paths locally with a message
    fn commit(&self, paths: &[&Path], message: &str) -> Result<()>;
    /// Try to publish local commits upstream
    fn push(&self) -> Result<PushOutcome>;
    /// Undo the most recent local commit after a rejected publish
    fn discard_last(&self) -> Result<()>;
}

/// Metadata stored in a lock record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub operator: String,
    pub timestamp: String,
    pub operation: String,
}

impl LockInfo {
    /// Serialize to the on-disk `key: value` line format
    fn to_record(&self) -> String {
        format!(
            "operator: {}\ntimestamp: {}\noperation: {}\n",
            self.operator, self.timestamp, self.operation
        )
    }

    /// Parse the on-disk `key: value` line format; unknown keys are ignored
    fn from_record(content: &str) -> Self {
        let mut info = Self {
            operator: String::new(),
            timestamp: String::new(),
            operation: String::new(),
        };
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().to_string();
                match key.trim() {
                    "operator" => info.operator = value,
                    "timestamp" => info.timestamp = value,
                    "operation" => info.operation = value,
                    _ => {}
                }
            }
        }
        info
    }
}

/// Acquires and releases named resource locks through a [`SyncTransport`]
pub struct LockCoordinator {
    lock_dir: PathBuf,
    transport: Box<dyn SyncTransport>,
}

impl LockCoordinator {
    pub fn new(lock_dir: impl Into<PathBuf>, transport: Box<dyn SyncTransport>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            transport,
        }
    }

    /// Build a coordinator backed by the configured git repository
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.lock_dir(), Box::new(GitTransport::from_config(config)))
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        self.lock_dir.join(format!("{resource}.lock"))
    }

    /// Whether a lock record currently exists for the resource
    pub fn is_locked(&self, resource: &str) -> bool {
        self.lock_path(resource).exists()
    }

    /// Lock metadata, or `None` when the resource is unlocked
    pub fn lock_info(&self, resource: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(resource);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(LockInfo::from_record(&content)))
    }

    /// Try to acquire the lock. Returns `false` when the resource is already
    /// held (and `force` is unset) or when this process lost the publish
    /// race, in which case the local commit has been rolled back.
    pub fn acquire(
        &self,
        resource: &str,
        operator: &str,
        operation: &str,
        force: bool,
    ) -> Result<bool> {
        self.transport.pull()?;

        if self.is_locked(resource) && !force {
            debug!(resource, "lock already held");
            return Ok(false);
        }

        let info = LockInfo {
            operator: operator.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            operation: operation.to_string(),
        };

        fs::create_dir_all(&self.lock_dir)?;
        let path = self.lock_path(resource);
        fs::write(&path, info.to_record())?;

        self.transport
            .commit(&[&path], &format!("Lock: {resource} ({operation})"))?;

        match self.transport.push()? {
            PushOutcome::Accepted => {
                debug!(resource, operator, "lock acquired");
                Ok(true)
            }
            PushOutcome::Rejected => {
                // Lost the race: drop our commit and resync
                warn!(resource, "lock publish rejected, rolling back");
                self.transport.discard_last()?;
                self.transport.pull()?;
                Ok(false)
            }
        }
    }

    /// Release the lock. Releasing an unheld resource is a no-op success.
    /// A rejected publish rolls the deletion back unless `force` is set, in
    /// which case the local deletion stands (best-effort).
    pub fn release(&self, resource: &str, force: bool) -> Result<bool> {
        let path = self.lock_path(resource);
        if !path.exists() {
            return Ok(true);
        }

        self.transport.pull()?;

        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.transport
            .commit(&[&path], &format!("Release lock: {resource}"))?;

        match self.transport.push()? {
            PushOutcome::Accepted => Ok(true),
            PushOutcome::Rejected if force => {
                warn!(resource, "release publish rejected, keeping local deletion (force)");
                Ok(true)
            }
            PushOutcome::Rejected => {
                warn!(resource, "release publish rejected, rolling back");
                self.transport.discard_last()?;
                self.transport.pull()?;
                Ok(false)
            }
        }
    }

    /// Poll `acquire` until it succeeds or `timeout` elapses. Blocking and
    /// polling by design; there is no fairness between waiters.
    pub fn wait_for_lock(
        &self,
        resource: &str,
        operator: &str,
        operation: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        let start = Instant::now();

        while start.elapsed() < timeout {
            if self.acquire(resource, operator, operation, false)? {
                return Ok(true);
            }
            std::thread::sleep(poll_interval);
        }

        Ok(false)
    }
}

/// Transport for a purely local tree: nothing to pull, every publish is
/// accepted. Single-operator setups without a shared remote use this; races
/// cannot occur because only one process writes the tree.
pub struct LocalTransport;

impl SyncTransport for LocalTransport {
    fn pull(&self) -> Result<()> {
        Ok(())
    }
    fn commit(&self, _paths: &[&Path], _message: &str) -> Result<()> {
        Ok(())
    }
    fn push(&self) -> Result<PushOutcome> {
        Ok(PushOutcome::Accepted)
    }
    fn discard_last(&self) -> Result<()> {
        Ok(())
    }
}

/// Git-backed transport: pull/commit/push against a configured remote branch
pub struct GitTransport {
    repo_root: PathBuf,
    remote: String,
    branch: String,
}

impl GitTransport {
    pub fn new(repo_root: impl Into<PathBuf>, remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.repo_root, &config.git_remote, &config.git_branch)
    }

    /// Run a git subcommand, capturing output
    fn git(&self, args: &[&str]) -> Result<(bool, String, String)> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(args)
            .output()?;

        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }
}

impl SyncTransport for GitTransport {
    fn pull(&self) -> Result<()> {
        let (ok, _, stderr) = self.git(&["pull", &self.remote, &self.branch])?;
        if !ok {
            // A failed pull is not fatal here; the push decides races
            warn!(stderr = stderr.trim(), "git pull failed");
        }
        Ok(())
    }

    fn commit(&self, paths: &[&Path], message: &str) -> Result<()> {
        for path in paths {
            let path_str = path.to_string_lossy();
            let (ok, _, stderr) = self.git(&["add", "-A", "--", &path_str])?;
            if !ok {
                warn!(path = %path_str, stderr = stderr.trim(), "git add failed");
            }
        }
        let (ok, _, stderr) = self.git(&["commit", "-m", message])?;
        if !ok {
            warn!(stderr = stderr.trim(), "git commit failed");
        }
        Ok(())
    }

    fn push(&self) -> Result<PushOutcome> {
        let (ok, _, stderr) = self.git(&["push", &self.remote, &self.branch])?;
        if ok {
            Ok(PushOutcome::Accepted)
        } else {
            debug!(stderr = stderr.trim(), "git push rejected");
            Ok(PushOutcome::Rejected)
        }
    }

    fn discard_last(&self) -> Result<()> {
        let (ok, _, stderr) = self.git(&["reset", "--hard", "HEAD~1"])?;
        if !ok {
            warn!(stderr = stderr.trim(), "git reset failed");
        }
        Ok(())
    }
}
