use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use hearth_core::error::{HearthError, Result};
use hearth_core::record::NodeError;

/// Key under which run inputs are exposed to conditions and templates.
pub const INPUT_KEY: &str = "input";

/// Outcome of one step or invoke action, as stored in the context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEntry {
    Success(Value),
    Failure(NodeError),
}

impl ContextEntry {
    /// JSON view that condition paths navigate:
    /// `{"status": "success", "result": ...}` or `{"status": "failed", "error": ...}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(result) => json!({ "status": "success", "result": result }),
            Self::Failure(error) => json!({
                "status": "failed",
                "error": error.message,
                "error_kind": error.kind,
            }),
        }
    }
}

/// Per-run accumulation of step and action outcomes.
///
/// Each key is written at most once. Entries are stored as their JSON view,
/// so path resolution borrows without cloning.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the run's inputs under `input`.
    pub fn with_inputs(inputs: Map<String, Value>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(INPUT_KEY.to_string(), Value::Object(inputs));
        Self { entries }
    }

    /// Record a node outcome. Rejects a second write to the same key.
    pub fn record(&mut self, key: &str, entry: ContextEntry) -> Result<()> {
        if self.entries.contains_key(key) {
            return Err(HearthError::ContextConflict(key.to_string()));
        }
        self.entries.insert(key.to_string(), entry.to_json());
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Resolve a dot-separated path such as `ping.result.hosts.0.name`.
    /// Numeric segments index into arrays. `None` when any segment is absent.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let head = segments.next().filter(|s| !s.is_empty())?;
        let mut current = self.entries.get(head)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, for the sealed record.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }
}
