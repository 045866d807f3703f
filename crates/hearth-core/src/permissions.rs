use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::traits::PermissionSource;
use crate::types::Caller;

/// Decision from the permission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny,
}

/// Group → tool-name pattern grants.
///
/// Only allows are modeled: a tool is denied exactly when no pattern granted
/// to the caller's group matches it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

impl PermissionPolicy {
    /// Grant patterns to a group (builder style, mostly for tests and fixtures).
    pub fn grant(mut self, group: impl Into<String>, patterns: &[&str]) -> Self {
        self.groups
            .entry(group.into())
            .or_default()
            .extend(patterns.iter().map(|p| p.to_string()));
        self
    }

    /// Patterns granted to a group (empty when the group is unknown).
    pub fn patterns_for(&self, group: &str) -> &[String] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl PermissionSource for PermissionPolicy {
    fn permissions_for(&self, caller: &Caller) -> BoxFuture<'_, Result<PermissionSet>> {
        let set = PermissionSet::new(self.patterns_for(&caller.group));
        Box::pin(async move { Ok(set) })
    }
}

/// Compiled set of tool-name patterns for one caller.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    wildcard: bool,
    exact: Vec<String>,
    patterns: Vec<regex::Regex>,
}

impl PermissionSet {
    /// Compile patterns. `*` alone grants every tool; other patterns treat `*`
    /// as "any run of characters". Patterns that fail to compile are skipped
    /// with a warning.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut set = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern == "*" {
                set.wildcard = true;
            } else if pattern.contains('*') {
                let source = format!(
                    "^{}$",
                    pattern
                        .split('*')
                        .map(regex::escape)
                        .collect::<Vec<_>>()
                        .join(".*")
                );
                match regex::Regex::new(&source) {
                    Ok(re) => set.patterns.push(re),
                    Err(e) => {
                        tracing::warn!(
                            pattern = %pattern,
                            error = %e,
                            "Invalid tool permission pattern, skipping"
                        );
                    }
                }
            } else if !pattern.is_empty() {
                set.exact.push(pattern.to_string());
            }
        }
        set
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        self.wildcard
            || self.exact.iter().any(|t| t == tool_name)
            || self.patterns.iter().any(|re| re.is_match(tool_name))
    }

    pub fn decide(&self, tool_name: &str) -> GateDecision {
        if self.allows(tool_name) {
            GateDecision::Allow
        } else {
            GateDecision::Deny
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.exact.is_empty() && self.patterns.is_empty()
    }
}
