//! Operation driver: template load, parameter validation, substitution,
//! prerequisite gate, sequential step execution, rollback on failure, and
//! notification dispatch.
//!
//! Every stage is isolated: a rollback or notification problem is logged
//! but never changes the operation's already-determined outcome. The only
//! thing that fails an operation is a failing prerequisite or step.

use crate::config::EngineConfig;
use crate::error::{OpsError, Result};
use crate::exec;
use crate::lock::LockCoordinator;
use crate::notify::{LogNotifier, Notifier};
use crate::state::StateStore;
use crate::step::{Step, StepExecutor};
use crate::template::{
    substitute_value, NotificationSpec, Template, TemplateLoader, VarMap,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Wall-clock limit for a single prerequisite command
const PREREQUISITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Structured outcome of one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub timestamp: String,
    pub dry_run: bool,
    /// Ordered `name (type)` listing, present only on dry runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_steps: Option<Vec<String>>,
}

impl Default for OperationResult {
    fn default() -> Self {
        Self {
            success: false,
            operation: None,
            error: None,
            duration_seconds: 0.0,
            timestamp: String::new(),
            dry_run: false,
            planned_steps: None,
        }
    }
}

/// Executes operation templates with error handling and rollback
pub struct Orchestrator {
    config: EngineConfig,
    loader: TemplateLoader,
    state: StateStore,
    locks: LockCoordinator,
    notifier: Box<dyn Notifier>,
}

impl Orchestrator {
    /// Standard orchestrator: git-coordinated locks, log notifications
    pub fn new(config: EngineConfig) -> Self {
        let locks = LockCoordinator::from_config(&config);
        Self::with_components(config, locks, Box::new(LogNotifier))
    }

    /// Orchestrator with explicit collaborators (embedding, tests)
    pub fn with_components(
        config: EngineConfig,
        locks: LockCoordinator,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let loader = TemplateLoader::new(config.operations_dir());
        let state = StateStore::new(config.state_dir(), config.operation_log_limit);
        Self {
            config,
            loader,
            state,
            locks,
            notifier,
        }
    }

    /// Execute an operation template with the provided parameters.
    ///
    /// Never panics or returns `Err`: every failure mode is folded into the
    /// structured result, matching what the queue records and the CLI prints.
    pub fn execute(&self, template_ref: &str, provided: &VarMap, dry_run: bool) -> OperationResult {
        let started = Instant::now();

        info!(template = template_ref, "loading template");
        let template = match self.loader.load(template_ref) {
            Ok(t) => t,
            Err(e) => return self.failure(None, &e, started),
        };

        let operation = template.operation.name.clone();
        info!(
            operation = %operation,
            kind = %template.operation.kind,
            "{}",
            template.operation.description
        );

        if let Err(e) = self.loader.validate_parameters(&template, provided) {
            return self.failure(Some(operation), &e, started);
        }
        let merged = self.loader.merge_parameters(&template, provided);

        let template = match self.loader.substitute_variables(&template, &merged) {
            Ok(t) => t,
            Err(e) => return self.failure(Some(operation), &e, started),
        };

        if dry_run {
            let planned = template
                .steps
                .iter()
                .map(|s| format!("{} ({})", s.name, s.kind))
                .collect();
            info!(operation = %operation, "dry run, steps listed without executing");
            let mut result = self.success(operation, started);
            result.dry_run = true;
            result.planned_steps = Some(planned);
            return result;
        }

        let mut vars = merged;

        if let Err(e) = self.check_prerequisites(&template) {
            // Prerequisites gate the operation before any step runs, so
            // there is nothing to roll back
            self.notify_failure(&template, &vars, &e);
            return self.failure(Some(operation), &e, started);
        }

        info!(steps = template.steps.len(), "executing steps");
        if let Err(e) = self.execute_steps(&template.steps, &mut vars) {
            self.run_rollback(&template, &mut vars);
            self.notify_failure(&template, &vars, &e);
            return self.failure(Some(operation), &e, started);
        }

        let on_success = template
            .notifications
            .as_ref()
            .map(|n| n.on_success.clone())
            .unwrap_or_default();
        self.send_notifications("on_success", &on_success, &vars);

        let result = self.success(operation.clone(), started);
        info!(
            operation = %operation,
            duration_seconds = format!("{:.1}", result.duration_seconds),
            "operation completed"
        );
        result
    }

    fn executor(&self) -> StepExecutor<'_> {
        StepExecutor::new(
            &self.config,
            &self.locks,
            &self.state,
            self.notifier.as_ref(),
        )
    }

    /// Run prerequisite checks in order; the first failure aborts
    fn check_prerequisites(&self, template: &Template) -> Result<()> {
        let total = template.prerequisites.len();
        if total == 0 {
            return Ok(());
        }

        info!(total, "checking prerequisites");
        for (i, prereq) in template.prerequisites.iter().enumerate() {
            let name = prereq
                .check
                .clone()
                .unwrap_or_else(|| format!("prerequisite_{}", i + 1));

            let out = exec::run_shell(
                &prereq.command,
                &self.config.repo_root,
                Some(PREREQUISITE_TIMEOUT),
            )
            .map_err(|e| OpsError::PrerequisiteFailed(format!("{name}: {e}")))?;

            if let Some(expected) = &prereq.expected {
                if out.stdout.trim() != expected {
                    return Err(OpsError::PrerequisiteFailed(format!(
                        "{name}: output does not match expected value"
                    )));
                }
            }
            if let Some(fragment) = &prereq.expected_contains {
                if !out.stdout.contains(fragment) {
                    return Err(OpsError::PrerequisiteFailed(format!(
                        "{name}: expected '{fragment}' not found in output"
                    )));
                }
            }
            if !out.success {
                return Err(OpsError::PrerequisiteFailed(format!(
                    "{name}: exit code {}",
                    out.exit_code.unwrap_or(-1)
                )));
            }

            info!(check = %name, "prerequisite passed [{}/{}]", i + 1, total);
        }

        Ok(())
    }

    /// Execute steps in order; a failure aborts unless the step opted into
    /// `continue_on_failure`
    fn execute_steps(&self, steps: &[Step], vars: &mut VarMap) -> Result<()> {
        let executor = self.executor();
        let total = steps.len();

        for (i, step) in steps.iter().enumerate() {
            info!(step = %step.name, kind = %step.kind, "step [{}/{}]", i + 1, total);

            match executor.execute(step, vars) {
                Ok(_) => {}
                Err(e) if step.continue_on_failure => {
                    warn!(step = %step.name, error = %e, "step failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Best-effort rollback: every configured step runs even when earlier
    /// rollback steps fail, and nothing here alters the operation outcome
    fn run_rollback(&self, template: &Template, vars: &mut VarMap) {
        let Some(rollback) = &template.rollback else {
            return;
        };
        if !rollback.enabled || rollback.on_failure.is_empty() {
            return;
        }

        warn!(
            steps = rollback.on_failure.len(),
            "execution failed, running rollback"
        );
        let executor = self.executor();

        for step in &rollback.on_failure {
            // Rollback re-substitutes against the then-current environment,
            // so outputs bound during the failed run are visible
            let step = resubstitute_step(step, vars);
            if let Err(e) = executor.execute(&step, vars) {
                warn!(step = %step.name, error = %e, "rollback step failed");
            }
        }
    }

    fn notify_failure(&self, template: &Template, vars: &VarMap, error: &OpsError) {
        let specs = template
            .notifications
            .as_ref()
            .map(|n| n.on_failure.clone())
            .unwrap_or_default();

        let mut vars = vars.clone();
        vars.insert(
            "error_message".to_string(),
            Value::String(error.to_string()),
        );
        self.send_notifications("on_failure", &specs, &vars);
    }

    /// Route notification descriptors through the step executor; delivery
    /// problems are logged, never propagated
    fn send_notifications(&self, trigger: &str, specs: &[NotificationSpec], vars: &VarMap) {
        if specs.is_empty() {
            return;
        }

        let executor = self.executor();
        for spec in specs {
            let step = notification_step(trigger, spec);
            let mut scratch = vars.clone();
            if let Err(e) = executor.execute(&step, &mut scratch) {
                warn!(channel = %spec.channel, error = %e, "notification failed");
            }
        }
    }

    fn success(&self, operation: String, started: Instant) -> OperationResult {
        OperationResult {
            success: true,
            operation: Some(operation),
            error: None,
            duration_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            dry_run: false,
            planned_steps: None,
        }
    }

    fn failure(
        &self,
        operation: Option<String>,
        error: &OpsError,
        started: Instant,
    ) -> OperationResult {
        warn!(error = %error, "operation failed");
        OperationResult {
            success: false,
            operation,
            error: Some(error.to_string()),
            duration_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            dry_run: false,
            planned_steps: None,
        }
    }
}

/// Build the synthetic step carrying a notification descriptor. The name
/// records which trigger fired it, so logs distinguish success from
/// failure notifications.
fn notification_step(trigger: &str, spec: &NotificationSpec) -> Step {
    Step {
        name: format!("notification_{trigger}"),
        kind: "notification".to_string(),
        output: None,
        continue_on_failure: false,
        params: serde_json::json!({
            "channel": spec.channel,
            "message": spec.message,
            "priority": spec.priority,
        })
        .as_object()
        .cloned()
        .unwrap_or_default(),
    }
}

/// Re-run substitution over a single step against the current environment.
/// Falls back to the original step if the round-trip fails.
fn resubstitute_step(step: &Step, vars: &VarMap) -> Step {
    serde_json::to_value(step)
        .map(|raw| substitute_value(&raw, vars))
        .and_then(serde_json::from_value)
        .unwrap_or_else(|_| step.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_step_carries_trigger() {
        let spec = NotificationSpec {
            channel: "ops".to_string(),
            message: "deployed ${app_name}".to_string(),
            priority: "high".to_string(),
        };

        let step = notification_step("on_success", &spec);
        assert_eq!(step.name, "notification_on_success");
        assert_eq!(step.kind, "notification");
        assert_eq!(step.params["channel"], json!("ops"));
        assert_eq!(step.params["priority"], json!("high"));

        let step = notification_step("on_failure", &spec);
        assert_eq!(step.name, "notification_on_failure");
    }

    #[test]
    fn test_resubstitute_step_uses_current_environment() {
        let step = Step {
            name: "undo".to_string(),
            kind: "command".to_string(),
            output: None,
            continue_on_failure: false,
            params: json!({"command": "echo ${release}"})
                .as_object()
                .cloned()
                .unwrap(),
        };

        let mut vars = serde_json::Map::new();
        vars.insert("release".to_string(), json!("v2"));

        let out = resubstitute_step(&step, &vars);
        assert_eq!(out.params["command"], json!("echo v2"));
    }
}
