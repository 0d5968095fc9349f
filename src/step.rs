//! Step model and executor.
//!
//! Steps are the unit of work inside an operation. Each descriptor carries a
//! `type` tag plus type-specific fields; the executor parses the tag into
//! the closed [`StepKind`] enum and dispatches with an exhaustive match, so
//! adding a kind is a compile-time decision and the unknown-kind branch is
//! explicit: unknown kinds log a warning and count as success, letting newer
//! templates pass through older engines.

use crate::config::EngineConfig;
use crate::error::{OpsError, Result};
use crate::exec;
use crate::lock::LockCoordinator;
use crate::notify::Notifier;
use crate::state::StateStore;
use crate::template::{replace_tokens, value_to_string, VarMap};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A single step descriptor. Type-specific fields stay in `params` so that
/// unknown kinds round-trip untouched through substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Variable name to bind this step's result into the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Lock record metadata carried on lock steps
#[derive(Debug, Clone, Deserialize)]
pub struct LockMetadata {
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default = "default_operation")]
    pub operation: String,
}

impl Default for LockMetadata {
    fn default() -> Self {
        Self {
            operator: default_operator(),
            operation: default_operation(),
        }
    }
}

fn default_operator() -> String {
    "orchestrator".to_string()
}

fn default_operation() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockStep {
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub metadata: LockMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnlockStep {
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandStep {
    pub command: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Optional per-command timeout in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCommandStep {
    pub host: String,
    pub directory: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub timeout: u64,
    pub command: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

fn default_remote_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateQueryStep {
    pub file: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateUpdateStep {
    pub file: String,
    #[serde(default)]
    pub updates: Map<String, Value>,
}

/// Probe method for health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMethod {
    Http,
    RemoteCommand,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckStep {
    #[serde(default = "default_health_method")]
    pub method: HealthMethod,
    // HTTP probe
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    // Remote-command probe
    pub host: Option<String>,
    pub directory: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub expected_output: String,
    // Retry policy
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub optional: bool,
}

fn default_health_method() -> HealthMethod {
    HealthMethod::Http
}

fn default_expected_status() -> u16 {
    200
}

fn default_health_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalStep {
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForeachStep {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default = "default_item_var", rename = "as")]
    pub bind: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_item_var() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelayStep {
    #[serde(default)]
    pub seconds: f64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationStep {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_channel() -> String {
    "log".to_string()
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationLogStep {
    #[serde(default)]
    pub entry: Map<String, Value>,
}

/// The closed set of step kinds the engine executes
#[derive(Debug, Clone)]
pub enum StepKind {
    Lock(LockStep),
    Unlock(UnlockStep),
    Command(CommandStep),
    RemoteCommand(RemoteCommandStep),
    StateQuery(StateQueryStep),
    StateUpdate(StateUpdateStep),
    HealthCheck(HealthCheckStep),
    Conditional(ConditionalStep),
    Foreach(ForeachStep),
    Delay(DelayStep),
    Notification(NotificationStep),
    OperationLog(OperationLogStep),
    /// Forward-compatibility: an unrecognized `type` tag
    Unknown(String),
}

impl StepKind {
    /// Parse a descriptor's tag and type-specific fields
    pub fn parse(step: &Step) -> Result<Self> {
        let kind = match step.kind.as_str() {
            "lock" => Self::Lock(from_params(step)?),
            "unlock" => Self::Unlock(from_params(step)?),
            "command" => Self::Command(from_params(step)?),
            "remote_command" => Self::RemoteCommand(from_params(step)?),
            "state_query" => Self::StateQuery(from_params(step)?),
            "state_update" => Self::StateUpdate(from_params(step)?),
            "health_check" => Self::HealthCheck(from_params(step)?),
            "conditional" => Self::Conditional(from_params(step)?),
            "foreach" => Self::Foreach(from_params(step)?),
            "delay" => Self::Delay(from_params(step)?),
            "notification" => Self::Notification(from_params(step)?),
            "operation_log" => Self::OperationLog(from_params(step)?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(kind)
    }
}

fn from_params<T: DeserializeOwned>(step: &Step) -> Result<T> {
    serde_json::from_value(Value::Object(step.params.clone())).map_err(|e| {
        OpsError::invalid_template(format!("step '{}' ({}): {e}", step.name, step.kind))
    })
}

/// Resolve `command`/`commands` into a non-empty list
fn command_list(command: &Option<String>, commands: &[String]) -> Result<Vec<String>> {
    if !commands.is_empty() {
        Ok(commands.to_vec())
    } else if let Some(cmd) = command {
        Ok(vec![cmd.clone()])
    } else {
        Err(OpsError::invalid_template(
            "step requires 'command' or 'commands'",
        ))
    }
}

/// Executes one step at a time against the engine's collaborators
pub struct StepExecutor<'a> {
    config: &'a EngineConfig,
    locks: &'a LockCoordinator,
    state: &'a StateStore,
    notifier: &'a dyn Notifier,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        config: &'a EngineConfig,
        locks: &'a LockCoordinator,
        state: &'a StateStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            config,
            locks,
            state,
            notifier,
        }
    }

    /// Execute a step. On success the result is bound into `vars` under the
    /// step's `output` name (if declared). Failures come back as
    /// [`OpsError::StepFailed`] tagged with the originating step's identity.
    pub fn execute(&self, step: &Step, vars: &mut VarMap) -> Result<Option<Value>> {
        debug!(step = %step.name, kind = %step.kind, "executing step");

        match self.run(step, vars) {
            Ok(output) => {
                if let Some(name) = &step.output {
                    vars.insert(name.clone(), output.clone().unwrap_or(Value::Null));
                }
                Ok(output)
            }
            // Nested failures already carry their step identity
            Err(e @ OpsError::StepFailed { .. }) => Err(e),
            Err(e) => Err(OpsError::step_failed(&step.name, &step.kind, &e)),
        }
    }

    fn run(&self, step: &Step, vars: &mut VarMap) -> Result<Option<Value>> {
        match StepKind::parse(step)? {
            StepKind::Lock(p) => self.run_lock(&p, vars),
            StepKind::Unlock(p) => self.run_unlock(&p, vars),
            StepKind::Command(p) => self.run_command(&p),
            StepKind::RemoteCommand(p) => self.run_remote(&p).map(Some),
            StepKind::StateQuery(p) => self.run_state_query(&p),
            StepKind::StateUpdate(p) => self.run_state_update(&p),
            StepKind::HealthCheck(p) => self.run_health_check(&p),
            StepKind::Conditional(p) => self.run_conditional(&p, vars),
            StepKind::Foreach(p) => self.run_foreach(&p, vars),
            StepKind::Delay(p) => self.run_delay(&p),
            StepKind::Notification(p) => self.run_notification(&p, vars),
            StepKind::OperationLog(p) => self.run_operation_log(&p),
            StepKind::Unknown(kind) => {
                warn!(step = %step.name, kind, "unknown step type, treating as no-op");
                Ok(None)
            }
        }
    }

    /// The resource name comes from the environment when bound, falling
    /// back to the step's own field
    fn resolve_resource(&self, vars: &VarMap, fallback: &str) -> String {
        vars.get("resource")
            .map(value_to_string)
            .unwrap_or_else(|| fallback.to_string())
    }

    fn run_lock(&self, p: &LockStep, vars: &VarMap) -> Result<Option<Value>> {
        let resource = self.resolve_resource(vars, &p.resource);
        let acquired =
            self.locks
                .acquire(&resource, &p.metadata.operator, &p.metadata.operation, false)?;

        if !acquired {
            return Err(OpsError::lock_conflict(format!(
                "failed to acquire lock on {resource}"
            )));
        }
        Ok(Some(json!(true)))
    }

    fn run_unlock(&self, p: &UnlockStep, vars: &VarMap) -> Result<Option<Value>> {
        let resource = self.resolve_resource(vars, &p.resource);
        let released = self.locks.release(&resource, p.force)?;
        Ok(Some(json!(released)))
    }

    fn run_command(&self, p: &CommandStep) -> Result<Option<Value>> {
        let timeout = p.timeout.map(Duration::from_secs);
        let mut outputs = Vec::new();

        for cmd in command_list(&p.command, &p.commands)? {
            let out = exec::run_shell(&cmd, &self.config.repo_root, timeout)?;
            out.ensure_success(&cmd)?;
            outputs.push(out.stdout);
        }

        Ok(Some(Value::String(outputs.join("\n"))))
    }

    fn run_remote(&self, p: &RemoteCommandStep) -> Result<Value> {
        let connector = self.config.connector_path();
        let timeout = Duration::from_secs(p.timeout);
        let mut outputs = Vec::new();

        for cmd in command_list(&p.command, &p.commands)? {
            let remote_cmd = match &p.directory {
                Some(dir) => format!("cd {dir} && {cmd}"),
                None => cmd.clone(),
            };

            let mut command = Command::new(&connector);
            command.arg(&p.host).arg(&remote_cmd);

            let label = format!("{} on {}", cmd, p.host);
            let out = exec::run(command, &label, Some(timeout)).map_err(|e| {
                OpsError::RemoteCommandFailed {
                    host: p.host.clone(),
                    message: e.to_string(),
                }
            })?;

            if !out.success {
                return Err(OpsError::RemoteCommandFailed {
                    host: p.host.clone(),
                    message: format!("{cmd}: {}", out.stderr.trim()),
                });
            }
            outputs.push(out.stdout);
        }

        Ok(Value::String(outputs.join("\n")))
    }

    fn run_state_query(&self, p: &StateQueryStep) -> Result<Option<Value>> {
        // Missing paths read as null, never as an error
        let value = self.state.get_value(&p.file, &p.path)?;
        Ok(Some(value.unwrap_or(Value::Null)))
    }

    fn run_state_update(&self, p: &StateUpdateStep) -> Result<Option<Value>> {
        self.state.update_values(&p.file, &p.updates)?;
        Ok(None)
    }

    fn run_health_check(&self, p: &HealthCheckStep) -> Result<Option<Value>> {
        let attempts = p.retries.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            match self.probe(p) {
                Ok(()) => return Ok(Some(json!("ok"))),
                Err(e) => {
                    last_failure = e.to_string();
                    debug!(attempt, attempts, error = %last_failure, "health probe failed");
                    if attempt < attempts {
                        std::thread::sleep(Duration::from_secs(p.retry_delay));
                    }
                }
            }
        }

        if p.optional {
            info!("optional health check exhausted retries, skipping");
            Ok(Some(json!("skipped")))
        } else {
            Err(OpsError::HealthCheckFailed(last_failure))
        }
    }

    /// One probe attempt; `Err` for both transport failures and mismatches
    fn probe(&self, p: &HealthCheckStep) -> Result<()> {
        match p.method {
            HealthMethod::Http => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(p.timeout))
                    .build()?;
                let response = client.get(&p.url).send()?;
                let status = response.status().as_u16();

                if status == p.expected_status {
                    Ok(())
                } else {
                    Err(OpsError::HealthCheckFailed(format!(
                        "{} returned status {status}, expected {}",
                        p.url, p.expected_status
                    )))
                }
            }
            HealthMethod::RemoteCommand => {
                let host = p.host.clone().ok_or_else(|| {
                    OpsError::invalid_template("remote_command health check requires 'host'")
                })?;
                let remote = RemoteCommandStep {
                    host,
                    directory: p.directory.clone(),
                    timeout: p.timeout,
                    command: p.command.clone(),
                    commands: p.commands.clone(),
                };
                let output = self.run_remote(&remote)?;

                if value_to_string(&output).contains(&p.expected_output) {
                    Ok(())
                } else {
                    Err(OpsError::HealthCheckFailed(format!(
                        "expected '{}' in probe output",
                        p.expected_output
                    )))
                }
            }
        }
    }

    fn run_conditional(&self, p: &ConditionalStep, vars: &mut VarMap) -> Result<Option<Value>> {
        // TODO: evaluate `condition` once a grammar is settled; declared
        // conditions are currently recorded but every branch runs.
        if !p.condition.is_empty() {
            debug!(condition = %p.condition, "conditional step always proceeds");
        }

        for sub in &p.steps {
            self.execute(sub, vars)?;
        }
        Ok(Some(json!(true)))
    }

    fn run_foreach(&self, p: &ForeachStep, vars: &VarMap) -> Result<Option<Value>> {
        // An `items` binding in the environment wins over the step's field
        let items = match vars.get("items").and_then(Value::as_array) {
            Some(bound) => bound.clone(),
            None => p.items.clone(),
        };

        let mut results = Vec::new();
        for item in &items {
            // Loop bindings stay confined to the iteration
            let mut loop_vars = vars.clone();
            loop_vars.insert(p.bind.clone(), item.clone());

            for sub in &p.steps {
                match self.execute(sub, &mut loop_vars) {
                    Ok(output) => results.push(output.unwrap_or(Value::Null)),
                    Err(OpsError::StepFailed { step, kind, message }) => {
                        return Err(OpsError::StepFailed {
                            step,
                            kind,
                            message: format!(
                                "{message} (item '{}')",
                                value_to_string(item)
                            ),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(Some(Value::Array(results)))
    }

    fn run_delay(&self, p: &DelayStep) -> Result<Option<Value>> {
        // `seconds` comes straight from template text; negative and
        // non-finite values are step failures, not panics
        let duration = Duration::try_from_secs_f64(p.seconds).map_err(|_| {
            OpsError::invalid_template(format!("invalid delay seconds: {}", p.seconds))
        })?;

        if let Some(description) = &p.description {
            info!("{description}");
        }
        std::thread::sleep(duration);
        Ok(None)
    }

    fn run_notification(&self, p: &NotificationStep, vars: &VarMap) -> Result<Option<Value>> {
        // Messages re-substitute at send time against the current environment
        let message = replace_tokens(&p.message, vars);

        // Best-effort: delivery problems never fail the step
        if let Err(e) = self.notifier.send(&p.channel, &message, &p.priority) {
            warn!(channel = %p.channel, error = %e, "notification delivery failed");
        }
        Ok(None)
    }

    fn run_operation_log(&self, p: &OperationLogStep) -> Result<Option<Value>> {
        self.state.append_operation(Value::Object(p.entry.clone()))?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalTransport;
    use crate::notify::LogNotifier;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct Recording {
        sent: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    impl Notifier for Recording {
        fn send(&self, channel: &str, message: &str, priority: &str) -> Result<()> {
            self.sent.lock().unwrap().push((
                channel.to_string(),
                message.to_string(),
                priority.to_string(),
            ));
            Ok(())
        }
    }

    struct Fixture {
        config: EngineConfig,
        locks: LockCoordinator,
        state: StateStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path());
        let locks = LockCoordinator::new(config.lock_dir(), Box::new(LocalTransport));
        let state = StateStore::new(config.state_dir(), config.operation_log_limit);
        Fixture {
            config,
            locks,
            state,
            _dir: dir,
        }
    }

    fn step(name: &str, kind: &str, params: Value) -> Step {
        Step {
            name: name.to_string(),
            kind: kind.to_string(),
            output: None,
            continue_on_failure: false,
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_unknown_kind_is_noop_success() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);

        let s = step("future", "quantum_deploy", json!({"qubits": 9}));
        let mut vars = Map::new();
        assert_eq!(executor.execute(&s, &mut vars).unwrap(), None);
    }

    #[test]
    fn test_command_output_binding() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);

        let mut s = step("version", "command", json!({"command": "echo v1.2.3"}));
        s.output = Some("release".to_string());

        let mut vars = Map::new();
        executor.execute(&s, &mut vars).unwrap();
        assert_eq!(
            vars["release"].as_str().unwrap().trim(),
            "v1.2.3"
        );
    }

    #[test]
    fn test_command_failure_wraps_step_identity() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);

        let s = step("broken", "command", json!({"command": "echo bad >&2; exit 7"}));
        let mut vars = Map::new();
        let err = executor.execute(&s, &mut vars).unwrap_err();

        match err {
            OpsError::StepFailed { step, kind, message } => {
                assert_eq!(step, "broken");
                assert_eq!(kind, "command");
                assert!(message.contains("bad"));
            }
            other => panic!("expected StepFailed, got {other}"),
        }
    }

    #[test]
    fn test_lock_and_unlock_steps() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let lock = step(
            "take-lock",
            "lock",
            json!({"resource": "home-mcp", "metadata": {"operator": "alice", "operation": "deploy"}}),
        );
        executor.execute(&lock, &mut vars).unwrap();
        assert!(f.locks.is_locked("home-mcp"));

        // A second lock step on the held resource fails
        let err = executor.execute(&lock, &mut vars).unwrap_err();
        assert!(err.to_string().contains("lock"));

        let unlock = step("drop-lock", "unlock", json!({"resource": "home-mcp"}));
        executor.execute(&unlock, &mut vars).unwrap();
        assert!(!f.locks.is_locked("home-mcp"));
    }

    #[test]
    fn test_resource_from_environment_wins() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);

        let mut vars = Map::new();
        vars.insert("resource".to_string(), json!("from-vars"));

        let lock = step("take-lock", "lock", json!({"resource": "from-step"}));
        executor.execute(&lock, &mut vars).unwrap();
        assert!(f.locks.is_locked("from-vars"));
        assert!(!f.locks.is_locked("from-step"));
    }

    #[test]
    fn test_state_query_and_update() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let update = step(
            "mark-running",
            "state_update",
            json!({"file": "apps.json", "updates": {".apps.home-mcp.status": "running"}}),
        );
        executor.execute(&update, &mut vars).unwrap();

        let mut query = step(
            "read-status",
            "state_query",
            json!({"file": "apps.json", "path": ".apps.home-mcp.status"}),
        );
        query.output = Some("status".to_string());
        executor.execute(&query, &mut vars).unwrap();
        assert_eq!(vars["status"], json!("running"));

        // Missing path queries resolve to null, not an error
        let missing = step(
            "read-missing",
            "state_query",
            json!({"file": "apps.json", "path": ".apps.ghost.status"}),
        );
        assert_eq!(executor.execute(&missing, &mut vars).unwrap(), Some(Value::Null));
    }

    #[test]
    fn test_foreach_names_failing_element() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step(
            "each-app",
            "foreach",
            json!({
                "items": ["good", "bad"],
                "as": "app",
                "steps": [
                    {"name": "check", "type": "command",
                     "command": "test \"$APP_OK\" = yes"}
                ]
            }),
        );
        // First element fails too, but the error must name an element
        let err = executor.execute(&s, &mut vars).unwrap_err();
        assert!(err.to_string().contains("item 'good'"));
    }

    #[test]
    fn test_foreach_collects_outputs() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step(
            "each",
            "foreach",
            json!({
                "items": ["a", "b"],
                "steps": [{"name": "echo", "type": "command", "command": "echo hi"}]
            }),
        );
        let out = executor.execute(&s, &mut vars).unwrap().unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_notification_resubstitutes_message() {
        let f = fixture();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let notifier = Recording { sent: Arc::clone(&sent) };
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);

        let mut vars = Map::new();
        vars.insert("app_name".to_string(), json!("home-mcp"));

        let s = step(
            "notify",
            "notification",
            json!({"channel": "ops", "message": "deployed ${app_name}", "priority": "high"}),
        );
        executor.execute(&s, &mut vars).unwrap();

        let messages = sent.lock().unwrap();
        assert_eq!(
            messages[0],
            ("ops".to_string(), "deployed home-mcp".to_string(), "high".to_string())
        );
    }

    #[test]
    fn test_optional_health_check_skips_after_retries() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        // Nothing listens on this port; every attempt fails fast
        let s = step(
            "probe",
            "health_check",
            json!({
                "method": "http",
                "url": "http://127.0.0.1:1",
                "retries": 3,
                "retry_delay": 0,
                "timeout": 1,
                "optional": true
            }),
        );
        let out = executor.execute(&s, &mut vars).unwrap();
        assert_eq!(out, Some(json!("skipped")));
    }

    #[test]
    fn test_required_health_check_fails_after_retries() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step(
            "probe",
            "health_check",
            json!({
                "method": "http",
                "url": "http://127.0.0.1:1",
                "retries": 2,
                "retry_delay": 0,
                "timeout": 1
            }),
        );
        let err = executor.execute(&s, &mut vars).unwrap_err();
        assert!(matches!(err, OpsError::StepFailed { .. }));
    }

    #[test]
    fn test_conditional_runs_nested_steps() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step(
            "maybe",
            "conditional",
            json!({
                "condition": "${platform} == 'fly.io'",
                "steps": [
                    {"name": "inner", "type": "command", "command": "echo ran",
                     "output": "inner_out"}
                ]
            }),
        );
        executor.execute(&s, &mut vars).unwrap();
        // The stub always proceeds, so the nested step ran and bound output
        assert_eq!(vars["inner_out"].as_str().unwrap().trim(), "ran");
    }

    /// Stand-in for the SSH connector: drop the host argument and run the
    /// command locally
    fn install_connector(f: &Fixture) {
        use std::os::unix::fs::PermissionsExt;

        let path = f.config.connector_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "#!/bin/sh\nshift\nexec sh -c \"$1\"\n").unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn test_delay_rejects_negative_seconds() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step("pause", "delay", json!({"seconds": -1.0}));
        let err = executor.execute(&s, &mut vars).unwrap_err();
        assert!(matches!(err, OpsError::StepFailed { .. }));
        assert!(err.to_string().contains("delay seconds"));

        // Zero is a legal no-op delay
        let s = step("pause", "delay", json!({"seconds": 0.0}));
        assert!(executor.execute(&s, &mut vars).is_ok());
    }

    #[test]
    fn test_remote_command_runs_through_connector() {
        let f = fixture();
        install_connector(&f);
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let mut s = step(
            "remote",
            "remote_command",
            json!({"host": "web-1", "command": "printf remote-ok"}),
        );
        s.output = Some("out".to_string());
        executor.execute(&s, &mut vars).unwrap();
        assert_eq!(vars["out"], json!("remote-ok"));
    }

    #[test]
    fn test_remote_command_directory_prefix() {
        let f = fixture();
        install_connector(&f);
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let dir = f.config.repo_root.join("deploy");
        std::fs::create_dir_all(&dir).unwrap();

        let mut s = step(
            "remote",
            "remote_command",
            json!({
                "host": "web-1",
                "directory": dir.to_string_lossy(),
                "command": "pwd"
            }),
        );
        s.output = Some("cwd".to_string());
        executor.execute(&s, &mut vars).unwrap();
        // The command ran inside the requested directory
        assert!(vars["cwd"].as_str().unwrap().trim().ends_with("deploy"));
    }

    #[test]
    fn test_remote_command_failure_names_host() {
        let f = fixture();
        install_connector(&f);
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step(
            "remote",
            "remote_command",
            json!({"host": "web-1", "command": "echo nope >&2; exit 5"}),
        );
        let err = executor.execute(&s, &mut vars).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("web-1"));
        assert!(text.contains("nope"));
    }

    #[test]
    fn test_remote_health_probe_matches_output() {
        let f = fixture();
        install_connector(&f);
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let ok = step(
            "probe",
            "health_check",
            json!({
                "method": "remote_command",
                "host": "web-1",
                "command": "printf healthy",
                "expected_output": "healthy",
                "retries": 1,
                "retry_delay": 0
            }),
        );
        assert_eq!(executor.execute(&ok, &mut vars).unwrap(), Some(json!("ok")));

        // Probe output without the expected fragment exhausts retries
        let bad = step(
            "probe",
            "health_check",
            json!({
                "method": "remote_command",
                "host": "web-1",
                "command": "printf degraded",
                "expected_output": "healthy",
                "retries": 2,
                "retry_delay": 0
            }),
        );
        let err = executor.execute(&bad, &mut vars).unwrap_err();
        assert!(err.to_string().contains("healthy"));
    }

    #[test]
    fn test_operation_log_step_appends() {
        let f = fixture();
        let notifier = LogNotifier;
        let executor = StepExecutor::new(&f.config, &f.locks, &f.state, &notifier);
        let mut vars = Map::new();

        let s = step(
            "audit",
            "operation_log",
            json!({"entry": {"operation": "deploy", "result": "ok"}}),
        );
        executor.execute(&s, &mut vars).unwrap();

        let log = f.state.read_state("operations.json").unwrap();
        assert_eq!(log["operations"][0]["operation"], json!("deploy"));
    }
}
