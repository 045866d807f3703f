use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chain::FailurePolicy;
use crate::error::{HearthError, Result};
use crate::permissions::PermissionPolicy;

/// Top-level hearth configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub export: Option<ExportConfig>,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub tools: Vec<CommandToolConfig>,
}

/// Chain engine limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deepest allowed action nesting (a step's own actions are depth 1).
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Timeout applied to tool calls that set none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Chain-wide failure policy for steps that do not declare one.
    #[serde(default)]
    pub halt_on_step_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            default_timeout_secs: default_timeout_secs(),
            halt_on_step_failure: false,
        }
    }
}

impl EngineConfig {
    pub fn default_failure_policy(&self) -> FailurePolicy {
        if self.halt_on_step_failure {
            FailurePolicy::Halt
        } else {
            FailurePolicy::Continue
        }
    }
}

fn default_max_depth() -> usize { 32 }
fn default_timeout_secs() -> u64 { 30 }

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.hearth/hearth.db".to_string() }

/// JSONL export of sealed execution records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Enable export (default: true when section is present).
    #[serde(default = "default_export_enabled")]
    pub enabled: bool,
    /// Directory for export files. Default: ~/.hearth/records
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_export_enabled() -> bool { true }

/// Tool permissions per caller group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Group used when a run names no caller group.
    #[serde(default = "default_group")]
    pub default_group: String,
    #[serde(default)]
    pub groups: std::collections::HashMap<String, Vec<String>>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            default_group: default_group(),
            groups: Default::default(),
        }
    }
}

fn default_group() -> String { "default".to_string() }

impl PermissionsConfig {
    /// Convert to a PermissionPolicy.
    pub fn to_policy(&self) -> PermissionPolicy {
        PermissionPolicy {
            groups: self.groups.clone(),
        }
    }
}

/// A host command exposed as a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandToolConfig {
    pub name: String,
    /// Shell command; `{{field}}` placeholders are filled from the call arguments.
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Parse stdout as JSON when it is valid JSON.
    #[serde(default = "default_parse_json")]
    pub parse_json: bool,
}

fn default_parse_json() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| HearthError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| HearthError::Config(e.to_string()))
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the export directory when export is enabled.
    pub fn export_dir(&self) -> Option<PathBuf> {
        let export = self.export.as_ref().filter(|e| e.enabled)?;
        Some(match export.dir {
            Some(ref dir) => expand_home(dir),
            None => expand_home("~/.hearth/records"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
