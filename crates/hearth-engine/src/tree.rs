//! Validated, arena-backed form of a chain definition.
//!
//! Storage hands the engine flat rows whose parent links are ids. `ChainTree`
//! resolves those links into index-based child lists once, rejecting anything
//! the executor could not run: dangling or cyclic parents, nesting deeper than
//! the configured limit, branches without conditions, terminal actions with
//! children and clashing context keys. A built tree is immutable and can be
//! shared by concurrent runs.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use hearth_core::chain::*;
use hearth_core::error::{HearthError, Result};

use crate::condition::{Condition, ConditionGroup};
use crate::context::INPUT_KEY;

/// Children of a node, split by branch label and ordered by position.
#[derive(Debug, Clone, Default)]
pub struct Children {
    pub then: Vec<usize>,
    pub otherwise: Vec<usize>,
}

impl Children {
    pub fn select(&self, label: BranchLabel) -> &[usize] {
        match label {
            BranchLabel::Then => &self.then,
            BranchLabel::Else => &self.otherwise,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.then.is_empty() && self.otherwise.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: StepId,
    pub position: i64,
    /// Context key this step's outcome is stored under.
    pub key: String,
    pub call: ToolCall,
    pub on_failure: Option<FailurePolicy>,
    pub timeout: Option<Duration>,
    /// Gating group, index into the tree's groups.
    pub condition: Option<usize>,
    pub children: Children,
}

#[derive(Debug, Clone)]
pub enum ActionNodeKind {
    Invoke {
        key: String,
        call: ToolCall,
        timeout: Option<Duration>,
    },
    Branch,
    Terminal {
        status: TerminalStatus,
        message: Option<String>,
    },
}

impl ActionNodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoke { .. } => "invoke",
            Self::Branch => "branch",
            Self::Terminal { .. } => "terminal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionNode {
    pub id: ActionId,
    /// 1 for actions owned by a step, parent depth + 1 below that.
    pub depth: usize,
    pub kind: ActionNodeKind,
    pub condition: Option<usize>,
    pub children: Children,
}

#[derive(Debug, Clone)]
pub struct ChainTree {
    chain: Chain,
    steps: Vec<StepNode>,
    actions: Vec<ActionNode>,
    groups: Vec<ConditionGroup>,
    depth: usize,
}

fn invalid(msg: impl Into<String>) -> HearthError {
    HearthError::InvalidChain(msg.into())
}

impl ChainTree {
    /// Resolve and validate a flat definition.
    pub fn build(def: &ChainDefinition, max_depth: usize) -> Result<Self> {
        let chain_id = def.chain.id;

        // Steps, ordered by position.
        let mut step_index: HashMap<StepId, usize> = HashMap::new();
        let mut step_defs: Vec<&StepDef> = def.steps.iter().collect();
        step_defs.sort_by_key(|s| (s.position, s.id));
        let mut positions = HashSet::new();
        for step in &step_defs {
            if step_index.insert(step.id, step_index.len()).is_some() {
                return Err(invalid(format!("duplicate step id {}", step.id)));
            }
            if !positions.insert(step.position) {
                return Err(invalid(format!(
                    "steps share position {} in chain {}",
                    step.position, chain_id
                )));
            }
            if step.call.tool.trim().is_empty() {
                return Err(invalid(format!("step {} names no tool", step.id)));
            }
        }

        // Actions, in definition order. Parent links are checked below.
        let mut action_index: HashMap<ActionId, usize> = HashMap::new();
        for action in &def.actions {
            if action_index.insert(action.id, action_index.len()).is_some() {
                return Err(invalid(format!("duplicate action id {}", action.id)));
            }
            if let ActionKind::Invoke { call, .. } = &action.kind {
                if call.tool.trim().is_empty() {
                    return Err(invalid(format!("action {} names no tool", action.id)));
                }
            }
        }

        let mut step_children: Vec<Vec<&ActionDef>> = vec![Vec::new(); step_defs.len()];
        let mut action_children: Vec<Vec<&ActionDef>> = vec![Vec::new(); def.actions.len()];
        for action in &def.actions {
            match action.owner {
                Owner::Step(step_id) => {
                    let idx = step_index.get(&step_id).ok_or_else(|| {
                        invalid(format!("action {} belongs to unknown step {}", action.id, step_id))
                    })?;
                    step_children[*idx].push(action);
                }
                Owner::Action(parent_id) => {
                    if parent_id == action.id {
                        return Err(invalid(format!("action {} is its own parent", action.id)));
                    }
                    let idx = action_index.get(&parent_id).ok_or_else(|| {
                        invalid(format!(
                            "action {} belongs to unknown action {}",
                            action.id, parent_id
                        ))
                    })?;
                    action_children[*idx].push(action);
                }
            }
        }

        let split = |children: &mut Vec<&ActionDef>| -> Children {
            children.sort_by_key(|a| (a.position, a.id));
            let mut out = Children::default();
            for child in children.iter() {
                let idx = action_index[&child.id];
                match child.branch {
                    BranchLabel::Then => out.then.push(idx),
                    BranchLabel::Else => out.otherwise.push(idx),
                }
            }
            out
        };

        // Depth of every action reachable from a step. Each action has one
        // parent, so anything left unvisited sits on a parent cycle.
        let mut depths: Vec<Option<usize>> = vec![None; def.actions.len()];
        let mut stack: Vec<(usize, usize)> = step_children
            .iter()
            .flatten()
            .map(|a| (action_index[&a.id], 1))
            .collect();
        let mut deepest = 0;
        while let Some((idx, depth)) = stack.pop() {
            if depth > max_depth {
                return Err(invalid(format!(
                    "action {} is nested {} levels deep (limit {})",
                    def.actions[idx].id, depth, max_depth
                )));
            }
            depths[idx] = Some(depth);
            deepest = deepest.max(depth);
            stack.extend(
                action_children[idx]
                    .iter()
                    .map(|child| (action_index[&child.id], depth + 1)),
            );
        }
        if let Some(idx) = depths.iter().position(Option::is_none) {
            return Err(invalid(format!(
                "action {} is not reachable from any step (parent cycle)",
                def.actions[idx].id
            )));
        }

        // Condition groups, at most one per owner.
        let mut group_index: HashMap<GroupId, usize> = HashMap::new();
        let mut group_by_owner: HashMap<Owner, usize> = HashMap::new();
        let mut groups = Vec::with_capacity(def.condition_groups.len());
        for group in &def.condition_groups {
            if group_index.insert(group.id, groups.len()).is_some() {
                return Err(invalid(format!("duplicate condition group id {}", group.id)));
            }
            let owner_known = match group.owner {
                Owner::Step(id) => step_index.contains_key(&id),
                Owner::Action(id) => action_index.contains_key(&id),
            };
            if !owner_known {
                return Err(invalid(format!(
                    "condition group {} belongs to an unknown node",
                    group.id
                )));
            }
            if group_by_owner.insert(group.owner, groups.len()).is_some() {
                return Err(invalid(format!(
                    "node owning condition group {} already has a group",
                    group.id
                )));
            }
            groups.push(ConditionGroup {
                id: group.id,
                combinator: group.combinator,
                conditions: Vec::new(),
            });
        }

        let mut condition_defs: Vec<&ConditionDef> = def.conditions.iter().collect();
        condition_defs.sort_by_key(|c| (c.position, c.id));
        let mut condition_ids = HashSet::new();
        for condition in condition_defs {
            if !condition_ids.insert(condition.id) {
                return Err(invalid(format!("duplicate condition id {}", condition.id)));
            }
            let idx = group_index.get(&condition.group_id).ok_or_else(|| {
                invalid(format!(
                    "condition {} belongs to unknown group {}",
                    condition.id, condition.group_id
                ))
            })?;
            if condition.path.trim().is_empty() {
                return Err(invalid(format!("condition {} has an empty path", condition.id)));
            }
            groups[*idx].conditions.push(Condition::new(condition));
        }

        // Context keys are unique chain-wide and never shadow the inputs.
        let mut keys = HashSet::new();
        let mut claim = |key: &str, node: String| -> Result<()> {
            if key.is_empty() || key.contains('.') {
                return Err(invalid(format!("{} has invalid context key '{}'", node, key)));
            }
            if key == INPUT_KEY {
                return Err(invalid(format!("{} uses reserved context key '{}'", node, key)));
            }
            if !keys.insert(key.to_string()) {
                return Err(invalid(format!(
                    "{} reuses context key '{}'; set an explicit key",
                    node, key
                )));
            }
            Ok(())
        };

        let mut steps = Vec::with_capacity(step_defs.len());
        for (idx, step) in step_defs.iter().enumerate() {
            let key = step.key.clone().unwrap_or_else(|| step.call.tool.clone());
            claim(&key, format!("step {}", step.id))?;
            steps.push(StepNode {
                id: step.id,
                position: step.position,
                key,
                call: step.call.clone(),
                on_failure: step.on_failure,
                timeout: step.timeout_secs.map(Duration::from_secs),
                condition: group_by_owner.get(&Owner::Step(step.id)).copied(),
                children: split(&mut step_children[idx]),
            });
        }

        let mut actions = Vec::with_capacity(def.actions.len());
        for (idx, action) in def.actions.iter().enumerate() {
            let condition = group_by_owner.get(&Owner::Action(action.id)).copied();
            let children = split(&mut action_children[idx]);
            let kind = match &action.kind {
                ActionKind::Invoke {
                    call,
                    key,
                    timeout_secs,
                } => {
                    let key = key.clone().unwrap_or_else(|| call.tool.clone());
                    claim(&key, format!("action {}", action.id))?;
                    ActionNodeKind::Invoke {
                        key,
                        call: call.clone(),
                        timeout: timeout_secs.map(Duration::from_secs),
                    }
                }
                ActionKind::Branch => {
                    if condition.is_none() {
                        return Err(invalid(format!(
                            "branch action {} has no condition group",
                            action.id
                        )));
                    }
                    ActionNodeKind::Branch
                }
                ActionKind::Terminal { status, message } => {
                    if !children.is_empty() {
                        return Err(invalid(format!(
                            "terminal action {} cannot have children",
                            action.id
                        )));
                    }
                    ActionNodeKind::Terminal {
                        status: *status,
                        message: message.clone(),
                    }
                }
            };
            actions.push(ActionNode {
                id: action.id,
                depth: depths[idx].unwrap_or(1),
                kind,
                condition,
                children,
            });
        }

        Ok(Self {
            chain: def.chain.clone(),
            steps,
            actions,
            groups,
            depth: deepest,
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn id(&self) -> ChainId {
        self.chain.id
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[StepNode] {
        &self.steps
    }

    pub fn action(&self, idx: usize) -> &ActionNode {
        &self.actions[idx]
    }

    pub fn actions(&self) -> &[ActionNode] {
        &self.actions
    }

    pub fn group(&self, idx: usize) -> &ConditionGroup {
        &self.groups[idx]
    }

    /// Deepest action nesting in the chain (0 when there are no actions).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Every tool the chain can call, sorted and deduplicated.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .steps
            .iter()
            .map(|s| s.call.tool.as_str())
            .chain(self.actions.iter().filter_map(|a| match &a.kind {
                ActionNodeKind::Invoke { call, .. } => Some(call.tool.as_str()),
                _ => None,
            }))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_test_utils::{on_action, on_step, ChainFixture};
    use serde_json::json;

    fn message(err: HearthError) -> String {
        match err {
            HearthError::InvalidChain(msg) => msg,
            other => panic!("expected InvalidChain, got {:?}", other),
        }
    }

    #[test]
    fn orders_steps_and_children_by_position() {
        let def = ChainFixture::new(1, "nightly")
            .step_at(10, 2, "notify")
            .step_at(11, 1, "ping")
            .invoke(1, on_step(11), BranchLabel::Else, "alert")
            .invoke(2, on_step(11), BranchLabel::Then, "log")
            .with_last_action(|a| a.position = -1)
            .invoke(3, on_step(11), BranchLabel::Then, "audit")
            .build();
        let tree = ChainTree::build(&def, 32).unwrap();

        let steps: Vec<&str> = tree.steps().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(steps, vec!["ping", "notify"]);

        let ping = &tree.steps()[0];
        let then: Vec<ActionId> = ping.children.then.iter().map(|i| tree.action(*i).id).collect();
        assert_eq!(then, vec![ActionId(2), ActionId(3)]);
        assert_eq!(ping.children.otherwise.len(), 1);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.tool_names(), vec!["alert", "audit", "log", "notify", "ping"]);
    }

    #[test]
    fn rejects_dangling_and_cyclic_parents() {
        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .invoke(1, on_step(9), BranchLabel::Then, "x")
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("unknown step"));

        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .invoke(1, on_action(2), BranchLabel::Then, "x")
            .invoke(2, on_action(1), BranchLabel::Then, "y")
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("parent cycle"));

        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .invoke(1, on_action(1), BranchLabel::Then, "x")
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("own parent"));
    }

    #[test]
    fn enforces_max_depth() {
        let mut fixture = ChainFixture::new(1, "deep")
            .step(1, "ping")
            .invoke(1, on_step(1), BranchLabel::Then, "t1");
        for id in 2..=5 {
            fixture = fixture.invoke(id, on_action(id - 1), BranchLabel::Then, &format!("t{}", id));
        }
        let def = fixture.build();

        let tree = ChainTree::build(&def, 5).unwrap();
        assert_eq!(tree.depth(), 5);
        let err = message(ChainTree::build(&def, 4).unwrap_err());
        assert!(err.contains("limit 4"), "{}", err);
    }

    #[test]
    fn branch_needs_group_and_terminal_is_leaf() {
        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .branch(1, on_step(1), BranchLabel::Then)
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("no condition group"));

        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .terminal(1, on_step(1), BranchLabel::Then, TerminalStatus::Success)
            .invoke(2, on_action(1), BranchLabel::Then, "x")
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("cannot have children"));
    }

    #[test]
    fn context_keys_must_be_unique() {
        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .step(2, "ping")
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("reuses context key"));

        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .step(2, "ping")
            .with_last_step(|s| s.key = Some("ping_again".into()))
            .build();
        assert!(ChainTree::build(&def, 32).is_ok());

        let def = ChainFixture::new(1, "c")
            .step(1, "input")
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("reserved"));
    }

    #[test]
    fn groups_attach_to_known_owners_once() {
        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .when(on_step(1), "input.force", Operator::Exists, json!(null))
            .build();
        let tree = ChainTree::build(&def, 32).unwrap();
        let group = tree.group(tree.steps()[0].condition.unwrap());
        assert_eq!(group.conditions.len(), 1);

        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .when(on_step(1), "a", Operator::Exists, json!(null))
            .when(on_step(1), "b", Operator::Exists, json!(null))
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("already has a group"));

        let def = ChainFixture::new(1, "c")
            .step(1, "ping")
            .when(on_action(7), "a", Operator::Exists, json!(null))
            .build();
        assert!(message(ChainTree::build(&def, 32).unwrap_err()).contains("unknown node"));
    }

    #[test]
    fn empty_chain_is_valid() {
        let tree = ChainTree::build(&ChainFixture::new(3, "empty").build(), 32).unwrap();
        assert!(tree.steps().is_empty());
        assert_eq!(tree.depth(), 0);
    }
}
