//! Notification delivery contract.
//!
//! The engine only needs a synchronous send-and-result call; concrete
//! delivery (messaging platforms, pagers) lives behind this trait. The
//! default implementation writes structured log lines, which is also the
//! `channel: log` behavior.

use crate::error::Result;
use tracing::{info, warn};

/// Outward notification collaborator
pub trait Notifier: Send + Sync {
    /// Deliver a message to a channel at the given priority
    fn send(&self, channel: &str, message: &str, priority: &str) -> Result<()>;
}

/// Default notifier: structured log output only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, channel: &str, message: &str, priority: &str) -> Result<()> {
        if priority == "high" {
            warn!(channel, priority, "{message}");
        } else {
            info!(channel, priority, "{message}");
        }
        Ok(())
    }
}
