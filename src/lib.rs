//! opsrunner library
//!
//! Template-driven operation orchestration: YAML operation templates with
//! parameter substitution, git-coordinated distributed locks, a typed step
//! executor, rollback and notifications, and a priority operation queue.

pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod state;
pub mod step;
pub mod template;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use error::{OpsError, Result};
pub use exec::CommandOutput;
pub use lock::{LockCoordinator, LockInfo, PushOutcome, SyncTransport};
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{OperationResult, Orchestrator};
pub use queue::{OperationQueue, OperationStatus, QueueStats, QueuedOperation};
pub use state::StateStore;
pub use step::{Step, StepExecutor, StepKind};
pub use template::{Template, TemplateLoader, VarMap};
