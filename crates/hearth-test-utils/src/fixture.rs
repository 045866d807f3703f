use hearth_core::chain::*;

pub fn on_step(id: i64) -> Owner {
    Owner::Step(StepId(id))
}

pub fn on_action(id: i64) -> Owner {
    Owner::Action(ActionId(id))
}

/// Builder for flat chain definitions.
///
/// Steps get `position = id` unless added with [`ChainFixture::step_at`];
/// actions get increasing positions in insertion order, so siblings run in
/// the order they were added. Group and condition ids are assigned
/// automatically.
pub struct ChainFixture {
    def: ChainDefinition,
    next_position: i64,
    next_group: i64,
    next_condition: i64,
}

impl ChainFixture {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            def: ChainDefinition {
                chain: Chain {
                    id: ChainId(id),
                    name: name.to_string(),
                    description: None,
                    enabled: true,
                },
                steps: Vec::new(),
                actions: Vec::new(),
                condition_groups: Vec::new(),
                conditions: Vec::new(),
            },
            next_position: 0,
            next_group: 1,
            next_condition: 1,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.def.chain.enabled = false;
        self
    }

    pub fn step(self, id: i64, tool: &str) -> Self {
        self.step_at(id, id, tool)
    }

    pub fn step_at(self, id: i64, position: i64, tool: &str) -> Self {
        self.step_with(StepDef {
            id: StepId(id),
            position,
            key: None,
            call: ToolCall::new(tool),
            on_failure: None,
            timeout_secs: None,
        })
    }

    pub fn step_with(mut self, step: StepDef) -> Self {
        self.def.steps.push(step);
        self
    }

    /// Mutate the most recently added step.
    pub fn with_last_step(mut self, f: impl FnOnce(&mut StepDef)) -> Self {
        if let Some(step) = self.def.steps.last_mut() {
            f(step);
        }
        self
    }

    pub fn invoke(self, id: i64, owner: Owner, branch: BranchLabel, tool: &str) -> Self {
        self.action(
            id,
            owner,
            branch,
            ActionKind::Invoke {
                call: ToolCall::new(tool),
                key: None,
                timeout_secs: None,
            },
        )
    }

    pub fn branch(self, id: i64, owner: Owner, branch: BranchLabel) -> Self {
        self.action(id, owner, branch, ActionKind::Branch)
    }

    pub fn terminal(self, id: i64, owner: Owner, branch: BranchLabel, status: TerminalStatus) -> Self {
        self.action(
            id,
            owner,
            branch,
            ActionKind::Terminal {
                status,
                message: None,
            },
        )
    }

    pub fn action(mut self, id: i64, owner: Owner, branch: BranchLabel, kind: ActionKind) -> Self {
        let position = self.next_position;
        self.next_position += 1;
        self.def.actions.push(ActionDef {
            id: ActionId(id),
            owner,
            branch,
            position,
            kind,
        });
        self
    }

    /// Mutate the most recently added action.
    pub fn with_last_action(mut self, f: impl FnOnce(&mut ActionDef)) -> Self {
        if let Some(action) = self.def.actions.last_mut() {
            f(action);
        }
        self
    }

    /// Attach a condition group with its conditions to an owner.
    pub fn conditions(
        mut self,
        owner: Owner,
        combinator: Combinator,
        conditions: &[(&str, Operator, serde_json::Value)],
    ) -> Self {
        let group_id = GroupId(self.next_group);
        self.next_group += 1;
        self.def.condition_groups.push(ConditionGroupDef {
            id: group_id,
            owner,
            combinator,
        });
        for (i, (path, operator, value)) in conditions.iter().enumerate() {
            self.def.conditions.push(ConditionDef {
                id: ConditionId(self.next_condition),
                group_id,
                path: path.to_string(),
                operator: *operator,
                value: value.clone(),
                position: i as i64,
            });
            self.next_condition += 1;
        }
        self
    }

    /// Shorthand for a single-condition AND group.
    pub fn when(self, owner: Owner, path: &str, operator: Operator, value: serde_json::Value) -> Self {
        self.conditions(owner, Combinator::And, &[(path, operator, value)])
    }

    pub fn build(self) -> ChainDefinition {
        self.def
    }
}
