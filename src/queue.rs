//! Priority operation queue with a fixed worker pool.
//!
//! The queue owns all cross-worker shared state behind one coarse mutex:
//! pending list, running map, and bounded trailing history. The mutex is
//! held only for short pull/insert/move operations; operation execution
//! happens on the worker thread outside the lock. There is no preemption
//! and no cancellation of in-flight operations.

use crate::config::EngineConfig;
use crate::orchestrator::{OperationResult, Orchestrator};
use crate::template::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{info, warn};

/// How long an idle worker sleeps before polling the queue again
const IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// Listings include at most this many historical operations
const LIST_HISTORY_LIMIT: usize = 100;

/// Lifecycle of a queued operation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

/// One operation tracked by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub template_ref: String,
    pub parameters: VarMap,
    /// Higher priority runs first; ties break by arrival order
    pub priority: i64,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<OperationResult>,
}

/// Queue counters for the `stats` surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_completed: usize,
    pub max_concurrent: usize,
    pub workers_alive: usize,
}

/// All shared mutable state, guarded by the queue's single mutex
struct QueueInner {
    pending: Vec<QueuedOperation>,
    running: HashMap<String, QueuedOperation>,
    history: Vec<QueuedOperation>,
    sequence: u64,
}

impl QueueInner {
    /// Claim the highest-priority pending operation if capacity allows
    fn claim_next(&mut self, max_concurrent: usize) -> Option<QueuedOperation> {
        if self.running.len() >= max_concurrent || self.pending.is_empty() {
            return None;
        }

        let mut op = self.pending.remove(0);
        op.status = OperationStatus::Running;
        op.started_at = Some(Utc::now());
        self.running.insert(op.id.clone(), op.clone());
        Some(op)
    }

    /// Record a finished operation and move it into history
    fn complete(&mut self, id: &str, result: OperationResult, history_limit: usize) {
        let Some(mut op) = self.running.remove(id) else {
            warn!(id, "completed operation missing from running set");
            return;
        };

        op.status = if result.success {
            OperationStatus::Success
        } else {
            OperationStatus::Failed
        };
        op.error = result.error.clone();
        op.completed_at = Some(Utc::now());
        op.result = Some(result);

        self.push_history(op, history_limit);
    }

    fn push_history(&mut self, op: QueuedOperation, history_limit: usize) {
        self.history.push(op);
        if self.history.len() > history_limit {
            let excess = self.history.len() - history_limit;
            self.history.drain(..excess);
        }
    }
}

/// Thread-safe operation queue with priority scheduling
pub struct OperationQueue {
    config: EngineConfig,
    inner: Arc<Mutex<QueueInner>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running_flag: Arc<AtomicBool>,
}

impl OperationQueue {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(QueueInner {
                pending: Vec::new(),
                running: HashMap::new(),
                history: Vec::new(),
                sequence: 0,
            })),
            workers: Mutex::new(Vec::new()),
            running_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add an operation; returns its generated id
    pub fn enqueue(&self, template_ref: &str, parameters: VarMap, priority: i64) -> String {
        let mut inner = self.inner.lock().unwrap();

        // Id derives from submission time and position
        let id = format!("op_{}_{}", Utc::now().timestamp(), inner.sequence);
        inner.sequence += 1;

        inner.pending.push(QueuedOperation {
            id: id.clone(),
            template_ref: template_ref.to_string(),
            parameters,
            priority,
            status: OperationStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        });

        // Stable sort: equal priorities keep arrival order
        inner.pending.sort_by(|a, b| b.priority.cmp(&a.priority));

        info!(id = %id, template = template_ref, priority, "operation queued");
        id
    }

    /// Look up one operation across pending, running, and history
    pub fn status(&self, id: &str) -> Option<QueuedOperation> {
        let inner = self.inner.lock().unwrap();

        inner
            .pending
            .iter()
            .find(|op| op.id == id)
            .or_else(|| inner.running.get(id))
            .or_else(|| inner.history.iter().find(|op| op.id == id))
            .cloned()
    }

    /// Cancel a pending operation. Running and terminal operations cannot
    /// be cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let Some(index) = inner.pending.iter().position(|op| op.id == id) else {
            return false;
        };

        let mut op = inner.pending.remove(index);
        op.status = OperationStatus::Cancelled;
        op.completed_at = Some(Utc::now());
        inner.push_history(op, self.config.history_limit);

        info!(id, "operation cancelled");
        true
    }

    /// Snapshot of pending, running, and recent history, optionally filtered
    pub fn list(&self, filter: Option<OperationStatus>) -> Vec<QueuedOperation> {
        let inner = self.inner.lock().unwrap();
        let matches = |op: &QueuedOperation| filter.map_or(true, |f| op.status == f);

        let mut out: Vec<QueuedOperation> = Vec::new();
        out.extend(inner.pending.iter().filter(|op| matches(op)).cloned());
        out.extend(inner.running.values().filter(|op| matches(op)).cloned());

        let skip = inner.history.len().saturating_sub(LIST_HISTORY_LIMIT);
        out.extend(inner.history[skip..].iter().filter(|op| matches(op)).cloned());
        out
    }

    /// Queue counters plus live worker count
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let workers = self.workers.lock().unwrap();

        QueueStats {
            pending: inner.pending.len(),
            running: inner.running.len(),
            succeeded: inner
                .history
                .iter()
                .filter(|op| op.status == OperationStatus::Success)
                .count(),
            failed: inner
                .history
                .iter()
                .filter(|op| op.status == OperationStatus::Failed)
                .count(),
            total_completed: inner.history.len(),
            max_concurrent: self.config.max_concurrent,
            workers_alive: workers.iter().filter(|w| !w.is_finished()).count(),
        }
    }

    /// Start worker threads pulling from the queue
    pub fn start_workers(&self, count: Option<usize>) {
        let count = count.unwrap_or(self.config.max_concurrent);
        self.running_flag.store(true, Ordering::SeqCst);

        let mut workers = self.workers.lock().unwrap();
        for i in 0..count {
            let inner = Arc::clone(&self.inner);
            let flag = Arc::clone(&self.running_flag);
            let config = self.config.clone();

            let handle = thread::Builder::new()
                .name(format!("ops-worker-{i}"))
                .spawn(move || worker_loop(inner, config, flag))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        info!(count, "started queue workers");
    }

    /// Signal workers to stop and wait for them. In-flight operations run
    /// to completion first; there is no preemption.
    pub fn stop_workers(&self) {
        self.running_flag.store(false, Ordering::SeqCst);

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("stopped queue workers");
    }
}

/// Worker main loop: claim, execute, record, repeat
fn worker_loop(inner: Arc<Mutex<QueueInner>>, config: EngineConfig, flag: Arc<AtomicBool>) {
    let orchestrator = Orchestrator::new(config.clone());

    while flag.load(Ordering::SeqCst) {
        let claimed = inner.lock().unwrap().claim_next(config.max_concurrent);

        let Some(op) = claimed else {
            thread::sleep(IDLE_INTERVAL);
            continue;
        };

        info!(id = %op.id, template = %op.template_ref, "worker executing operation");
        // Execution happens outside the queue lock
        let result = orchestrator.execute(&op.template_ref, &op.parameters, false);

        inner
            .lock()
            .unwrap()
            .complete(&op.id, result, config.history_limit);
    }
}
