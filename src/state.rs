//! Infrastructure state documents and the append-only operation log.
//!
//! State lives as whole JSON documents under the state directory. Writes are
//! atomic (temp file + rename) so readers never observe a partial document.
//! Values are addressed with dotted paths (`.fly_apps.myapp.status`); a `*`
//! segment matches existing keys during navigation and fans out at the
//! terminal position.

use crate::error::{OpsError, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;

/// Name of the capped operation log document
const OPERATIONS_FILE: &str = "operations.json";

/// Reads and writes JSON state documents under a single state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
    operation_log_limit: usize,
}

impl StateStore {
    /// Create a store over the given state directory
    pub fn new(state_dir: impl Into<PathBuf>, operation_log_limit: usize) -> Self {
        Self {
            state_dir: state_dir.into(),
            operation_log_limit,
        }
    }

    /// Read an entire state document; missing files read as an empty object
    pub fn read_state(&self, file: &str) -> Result<Value> {
        let path = self.state_dir.join(file);
        if !path.exists() {
            return Ok(Value::Object(Map::new()));
        }

        let content = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&content)?;
        Ok(value)
    }

    /// Write an entire state document atomically (temp file + rename)
    pub fn write_state(&self, file: &str, data: &Value) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        let path = self.state_dir.join(file);
        let tmp = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(data)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read a single value by dotted path; missing paths yield `None`
    pub fn get_value(&self, file: &str, path: &str) -> Result<Option<Value>> {
        let data = self.read_state(file)?;

        let mut current = &data;
        for key in split_path(path) {
            match current.get(key) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }

        Ok(Some(current.clone()))
    }

    /// Set a single value by dotted path, creating intermediate objects
    pub fn set_value(&self, file: &str, path: &str, value: Value) -> Result<()> {
        let mut data = self.read_state(file)?;
        apply_update(&mut data, path, value)?;
        self.write_state(file, &data)
    }

    /// Apply a batch of dotted-path updates in one read-modify-write cycle
    pub fn update_values(&self, file: &str, updates: &Map<String, Value>) -> Result<()> {
        let mut data = self.read_state(file)?;

        for (path, value) in updates {
            apply_update(&mut data, path, value.clone())?;
        }

        self.write_state(file, &data)
    }

    /// Append an entry to the capped operation log, trimming oldest first
    pub fn append_operation(&self, entry: Value) -> Result<()> {
        let mut data = self.read_state(OPERATIONS_FILE)?;

        let root = data
            .as_object_mut()
            .ok_or_else(|| OpsError::state("operations.json root is not an object"))?;

        let ops = root
            .entry("operations")
            .or_insert_with(|| Value::Array(Vec::new()));
        let list = ops
            .as_array_mut()
            .ok_or_else(|| OpsError::state("operations key is not an array"))?;

        list.push(entry);

        if list.len() > self.operation_log_limit {
            let excess = list.len() - self.operation_log_limit;
            list.drain(..excess);
        }

        self.write_state(OPERATIONS_FILE, &data)
    }
}

/// Split a dotted path into segments, tolerating a leading dot
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('.').split('.')
}

/// Write `value` at `path` inside `data`, creating intermediate objects.
///
/// A `*` segment navigates into the first object-valued child; a terminal
/// `*` assigns the value to every existing key at that level.
fn apply_update(data: &mut Value, path: &str, value: Value) -> Result<()> {
    let keys: Vec<&str> = split_path(path).collect();
    let (last, parents) = keys
        .split_last()
        .ok_or_else(|| OpsError::state(format!("empty state path: '{path}'")))?;

    let mut current = data;
    for key in parents {
        let map = current
            .as_object_mut()
            .ok_or_else(|| OpsError::state(format!("path '{path}' crosses a non-object value")))?;

        if *key == "*" {
            let child = map
                .values_mut()
                .find(|v| v.is_object())
                .ok_or_else(|| OpsError::state(format!("wildcard in '{path}' matched nothing")))?;
            current = child;
        } else {
            current = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }

    let map = current
        .as_object_mut()
        .ok_or_else(|| OpsError::state(format!("path '{path}' crosses a non-object value")))?;

    if *last == "*" {
        for slot in map.values_mut() {
            *slot = value.clone();
        }
    } else {
        map.insert(last.to_string(), value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path(), 1000)
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let data = store(&dir).read_state("nothing.json").unwrap();
        assert_eq!(data, json!({}));
    }

    #[test]
    fn test_get_value_dotted_path() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_state(
            "apps.json",
            &json!({"fly_apps": {"home-mcp": {"status": "running"}}}),
        )
        .unwrap();

        let value = s.get_value("apps.json", ".fly_apps.home-mcp.status").unwrap();
        assert_eq!(value, Some(json!("running")));

        let missing = s.get_value("apps.json", ".fly_apps.nope.status").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_set_value_creates_intermediates() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.set_value("apps.json", ".fly_apps.new-app.status", json!("deploying"))
            .unwrap();

        let data = s.read_state("apps.json").unwrap();
        assert_eq!(data["fly_apps"]["new-app"]["status"], json!("deploying"));
    }

    #[test]
    fn test_update_values_batch() {
        let dir = tempdir().unwrap();
        let s = store(&dir);

        let mut updates = Map::new();
        updates.insert(".a.x".to_string(), json!(1));
        updates.insert(".a.y".to_string(), json!(2));
        s.update_values("doc.json", &updates).unwrap();

        let data = s.read_state("doc.json").unwrap();
        assert_eq!(data["a"], json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_terminal_wildcard_fans_out() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_state(
            "apps.json",
            &json!({"apps": {"one": "stale", "two": "stale"}}),
        )
        .unwrap();

        let mut updates = Map::new();
        updates.insert(".apps.*".to_string(), json!("checked"));
        s.update_values("apps.json", &updates).unwrap();

        let data = s.read_state("apps.json").unwrap();
        assert_eq!(data["apps"], json!({"one": "checked", "two": "checked"}));
    }

    #[test]
    fn test_navigation_wildcard_enters_first_object() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_state("apps.json", &json!({"apps": {"only": {"status": "old"}}}))
            .unwrap();

        let mut updates = Map::new();
        updates.insert(".apps.*.status".to_string(), json!("new"));
        s.update_values("apps.json", &updates).unwrap();

        let data = s.read_state("apps.json").unwrap();
        assert_eq!(data["apps"]["only"]["status"], json!("new"));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_state("doc.json", &json!({"k": "v"})).unwrap();

        assert!(dir.path().join("doc.json").exists());
        assert!(!dir.path().join("doc.tmp").exists());
    }

    #[test]
    fn test_operation_log_is_capped() {
        let dir = tempdir().unwrap();
        let s = StateStore::new(dir.path(), 5);

        for i in 0..8 {
            s.append_operation(json!({"seq": i})).unwrap();
        }

        let data = s.read_state(OPERATIONS_FILE).unwrap();
        let ops = data["operations"].as_array().unwrap();
        assert_eq!(ops.len(), 5);
        // Oldest entries evicted first
        assert_eq!(ops[0]["seq"], json!(3));
        assert_eq!(ops[4]["seq"], json!(7));
    }
}
