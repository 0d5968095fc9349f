//! Operation template loading, validation, parameter resolution, and
//! variable substitution.
//!
//! Templates are YAML documents with three required facets (`operation`,
//! `parameters`, `steps`) plus optional prerequisites, rollback, and
//! notification facets. Substitution replaces `${name}` tokens anywhere in
//! the template — string leaves and map keys alike — via a structural tree
//! walk, so values containing substitution-like text never get re-expanded
//! through a serialized blob.

use crate::error::{OpsError, Result};
use crate::step::Step;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

/// The variable environment: names bound to JSON values
pub type VarMap = Map<String, Value>;

/// Allowed operation categories; doubles as the template subdirectory name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationType {
    Deploy,
    Maintain,
    Recovery,
}

/// The `operation` facet: identity and category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub description: String,
}

/// A pre-execution check; failure aborts the operation before any step runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    /// Display name for logging; defaults to a positional name
    #[serde(default)]
    pub check: Option<String>,
    pub command: String,
    /// Exact (trimmed) stdout expectation
    #[serde(default)]
    pub expected: Option<String>,
    /// Substring stdout expectation
    #[serde(default)]
    pub expected_contains: Option<String>,
}

/// Rollback facet: best-effort undo steps run only on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollback {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub on_failure: Vec<Step>,
}

fn default_true() -> bool {
    true
}

/// A single notification descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSpec {
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

/// Notification triggers by outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default)]
    pub on_success: Vec<NotificationSpec>,
    #[serde(default)]
    pub on_failure: Vec<NotificationSpec>,
}

/// A parsed, validated operation template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub operation: OperationInfo,
    pub parameters: VarMap,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub rollback: Option<Rollback>,
    #[serde(default)]
    pub notifications: Option<Notifications>,
}

/// Loads templates from the operations root and resolves their parameters
#[derive(Debug, Clone)]
pub struct TemplateLoader {
    operations_dir: PathBuf,
}

impl TemplateLoader {
    pub fn new(operations_dir: impl Into<PathBuf>) -> Self {
        Self {
            operations_dir: operations_dir.into(),
        }
    }

    /// Resolve a template reference to a concrete file path.
    ///
    /// A bare name like `deploy_mcp_server` expands to
    /// `deploy/mcp-server.yml`; relative paths resolve under the operations
    /// root; absolute paths are used as-is.
    pub fn resolve(&self, template_ref: &str) -> PathBuf {
        let mut reference = template_ref.to_string();

        if !reference.contains('/') && !reference.contains('.') {
            if let Some((category, name)) = reference.split_once('_') {
                reference = format!("{category}/{}.yml", name.replace('_', "-"));
            }
        }

        let path = Path::new(&reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.operations_dir.join(path)
        }
    }

    /// Load and validate a template
    pub fn load(&self, template_ref: &str) -> Result<Template> {
        let path = self.resolve(template_ref);

        if !path.exists() {
            return Err(OpsError::TemplateNotFound(path));
        }

        let content = fs::read_to_string(&path)?;
        let raw: Value = serde_yaml::from_str(&content)?;

        validate_shape(&raw)?;

        let template: Template = serde_json::from_value(raw)
            .map_err(|e| OpsError::invalid_template(e.to_string()))?;
        Ok(template)
    }

    /// Parameters whose declared default is empty or null are required
    pub fn required_parameters(&self, template: &Template) -> Vec<String> {
        template
            .parameters
            .iter()
            .filter(|(_, default)| is_empty_default(default))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fail with `MissingParameter` naming every unmet required parameter.
    ///
    /// An explicitly provided empty string does not satisfy a requirement.
    pub fn validate_parameters(&self, template: &Template, provided: &VarMap) -> Result<()> {
        let missing: Vec<String> = self
            .required_parameters(template)
            .into_iter()
            .filter(|name| match provided.get(name) {
                Some(value) => is_empty_default(value),
                None => true,
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OpsError::MissingParameter(missing.join(", ")))
        }
    }

    /// Merge provided values over declared defaults; unknown keys pass through
    pub fn merge_parameters(&self, template: &Template, provided: &VarMap) -> VarMap {
        let mut merged = template.parameters.clone();
        for (key, value) in provided {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Substitute `${name}` tokens throughout the template.
    ///
    /// Built-in time variables are computed fresh on every call; user
    /// variables shadow them. Pure transform: neither input is modified.
    pub fn substitute_variables(&self, template: &Template, vars: &VarMap) -> Result<Template> {
        let mut all_vars = builtin_vars();
        for (key, value) in vars {
            all_vars.insert(key.clone(), value.clone());
        }

        let raw = serde_json::to_value(template)?;
        let substituted = substitute_value(&raw, &all_vars);
        let template: Template = serde_json::from_value(substituted)
            .map_err(|e| OpsError::invalid_template(e.to_string()))?;
        Ok(template)
    }
}

/// An empty string or null default marks a parameter as required
fn is_empty_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Built-in time variables, computed once per substitution call
fn builtin_vars() -> VarMap {
    let now = Utc::now();
    let mut vars = Map::new();
    vars.insert(
        "current_date".to_string(),
        Value::String(now.format("%Y-%m-%d").to_string()),
    );
    vars.insert(
        "current_time".to_string(),
        Value::String(now.format("%H:%M:%S").to_string()),
    );
    vars.insert(
        "current_timestamp".to_string(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    vars
}

/// The string form a variable takes when interpolated into text
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `${name}` token in `text` with the variable's string form
pub fn replace_tokens(text: &str, vars: &VarMap) -> String {
    let mut result = text.to_string();
    for (key, value) in vars {
        let token = format!("${{{key}}}");
        if result.contains(&token) {
            result = result.replace(&token, &value_to_string(value));
        }
    }
    result
}

/// Structural substitution: walk the tree, interpolating at string leaves
/// and in object keys (dotted state paths may be parameterized)
pub fn substitute_value(value: &Value, vars: &VarMap) -> Value {
    match value {
        Value::String(s) => Value::String(replace_tokens(s, vars)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, vars)).collect())
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(replace_tokens(key, vars), substitute_value(val, vars));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Validate the raw document shape before typed deserialization, so error
/// messages name the offending facet rather than a serde path
fn validate_shape(raw: &Value) -> Result<()> {
    let root = raw
        .as_object()
        .ok_or_else(|| OpsError::invalid_template("template root must be a mapping"))?;

    for key in ["operation", "parameters", "steps"] {
        if !root.contains_key(key) {
            return Err(OpsError::invalid_template(format!(
                "missing required key: {key}"
            )));
        }
    }

    let operation = root["operation"]
        .as_object()
        .ok_or_else(|| OpsError::invalid_template("operation must be a mapping"))?;
    for key in ["name", "type", "description"] {
        if !operation.contains_key(key) {
            return Err(OpsError::invalid_template(format!(
                "operation missing required key: {key}"
            )));
        }
    }

    let op_type = operation["type"].as_str().unwrap_or_default();
    if !matches!(op_type, "deploy" | "maintain" | "recovery") {
        return Err(OpsError::invalid_template(format!(
            "invalid operation type: {op_type}"
        )));
    }

    let steps = root["steps"]
        .as_array()
        .ok_or_else(|| OpsError::invalid_template("steps must be a list"))?;
    for (i, step) in steps.iter().enumerate() {
        let map = step
            .as_object()
            .ok_or_else(|| OpsError::invalid_template(format!("step {i} must be a mapping")))?;
        if !map.contains_key("name") {
            return Err(OpsError::invalid_template(format!("step {i} missing 'name'")));
        }
        if !map.contains_key("type") {
            return Err(OpsError::invalid_template(format!("step {i} missing 'type'")));
        }
    }

    Ok(())
}
