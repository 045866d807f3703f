use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hearth_core::chain::{BranchLabel, ChainDefinition, ChainId, FailurePolicy};
use hearth_core::config::EngineConfig;
use hearth_core::error::{HearthError, Result};
use hearth_core::event::EventBus;
use hearth_core::record::{
    ExecutionRecord, NodeError, RunStatus, StepRecord, StepStatus, TerminalStop,
};
use hearth_core::traits::{ChainSource, PermissionSource, RecordSink, ToolDispatcher};
use hearth_core::types::{Caller, ChainEvent, RunId, ToolContext};

use crate::context::{ContextEntry, ExecutionContext};
use crate::executor::{ActionExecutor, ActionOutcome};
use crate::gate::PermissionGate;
use crate::tree::ChainTree;

/// Who is running a chain and with which inputs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub caller: Caller,
    /// Exposed to conditions and argument templates as `input.*`.
    pub inputs: Map<String, Value>,
}

impl RunRequest {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            inputs: Map::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }
}

/// Runs chains step by step and seals their execution records.
///
/// The runner holds no per-run state; concurrent runs each get their own
/// context, permission snapshot and record.
pub struct ChainRunner {
    dispatcher: Arc<dyn ToolDispatcher>,
    permissions: Arc<dyn PermissionSource>,
    event_bus: Arc<EventBus>,
    sinks: Vec<Arc<dyn RecordSink>>,
    config: EngineConfig,
}

/// How the step loop ended.
#[derive(Default)]
struct Progress {
    step_failed: bool,
    action_failed: bool,
    halted: bool,
    cancelled: bool,
    stop: Option<TerminalStop>,
}

impl ChainRunner {
    pub fn new(
        dispatcher: Arc<dyn ToolDispatcher>,
        permissions: Arc<dyn PermissionSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            dispatcher,
            permissions,
            event_bus: Arc::new(EventBus::default()),
            sinks: Vec::new(),
            config,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Add a sink that receives every sealed record.
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a definition against this runner's depth limit.
    pub fn build_tree(&self, def: &ChainDefinition) -> Result<ChainTree> {
        ChainTree::build(def, self.config.max_depth)
    }

    /// Load, validate and run a chain from `source`.
    pub async fn run_by_id(
        &self,
        source: &dyn ChainSource,
        chain_id: ChainId,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        let def = source.load_chain(chain_id).await?;
        let tree = self.build_tree(&def)?;
        self.run(&tree, request, cancel).await
    }

    /// Run a validated chain to completion.
    ///
    /// Only a disabled chain is rejected up front. Every other outcome,
    /// including tool failures, denials and cancellation, is reported in the
    /// returned record.
    pub async fn run(
        &self,
        tree: &ChainTree,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        let chain = tree.chain();
        if !chain.enabled {
            return Err(HearthError::InvalidChain(format!(
                "chain {} ('{}') is disabled",
                chain.id, chain.name
            )));
        }

        let run_id = RunId::new();
        let started_at = Utc::now();
        info!(run_id = %run_id, chain_id = %chain.id, chain = %chain.name, caller = %request.caller, "Chain run started");
        self.event_bus.publish(ChainEvent::RunStarted {
            run_id: run_id.clone(),
            chain_id: chain.id,
            chain_name: chain.name.clone(),
        });

        let gate = PermissionGate::for_caller(
            self.permissions.as_ref(),
            request.caller.clone(),
            self.dispatcher.clone(),
            self.event_bus.clone(),
        )
        .await;
        let tool_ctx = ToolContext {
            run_id: run_id.clone(),
            chain_id: chain.id,
            caller: request.caller.clone(),
        };
        let executor = ActionExecutor::new(
            tree,
            &gate,
            &self.event_bus,
            &cancel,
            tool_ctx,
            Duration::from_secs(self.config.default_timeout_secs),
        );
        let mut context = ExecutionContext::with_inputs(request.inputs);

        let (steps, progress) = self.run_steps(tree, &executor, &mut context, &run_id).await;
        let status = overall_status(tree, &steps, &progress);

        let record = ExecutionRecord {
            run_id: run_id.clone(),
            chain_id: chain.id,
            chain_name: chain.name.clone(),
            caller: request.caller.group,
            status,
            steps,
            stop: progress.stop,
            context: context.snapshot(),
            started_at,
            finished_at: Utc::now(),
        };

        info!(run_id = %run_id, status = %status, steps = record.steps.len(), "Chain run finished");
        self.event_bus.publish(ChainEvent::RunFinished {
            run_id,
            status,
        });

        for sink in &self.sinks {
            if let Err(e) = sink.append(&record).await {
                error!(run_id = %record.run_id, error = %e, "Failed to persist execution record");
            }
        }

        Ok(record)
    }

    async fn run_steps(
        &self,
        tree: &ChainTree,
        executor: &ActionExecutor<'_>,
        context: &mut ExecutionContext,
        run_id: &RunId,
    ) -> (Vec<StepRecord>, Progress) {
        let mut records = Vec::with_capacity(tree.steps().len());
        let mut progress = Progress::default();
        let default_policy = self.config.default_failure_policy();

        for step in tree.steps() {
            if executor.is_cancelled() {
                progress.cancelled = true;
                break;
            }

            let started_at = Utc::now();
            let mut record = StepRecord {
                step_id: step.id,
                position: step.position,
                key: step.key.clone(),
                tool: step.call.tool.clone(),
                status: StepStatus::Ran,
                result: None,
                error: None,
                actions: Vec::new(),
                started_at,
                finished_at: started_at,
            };

            if !executor.gate_open(step.condition, context) {
                info!(run_id = %run_id, step_id = %step.id, "Step conditions not met, skipping");
                record.status = StepStatus::Skipped;
                self.finish_step(run_id, &mut records, record);
                continue;
            }

            self.event_bus.publish(ChainEvent::StepStarted {
                run_id: run_id.clone(),
                step_id: step.id,
                tool: step.call.tool.clone(),
            });

            let label = match executor.call(&step.call, step.timeout, context).await {
                Ok(value) => {
                    executor.remember(context, &step.key, ContextEntry::Success(value.clone()));
                    record.result = Some(value);
                    BranchLabel::Then
                }
                Err(HearthError::Cancelled) => {
                    record.status = StepStatus::Cancelled;
                    progress.cancelled = true;
                    self.finish_step(run_id, &mut records, record);
                    break;
                }
                Err(e) => {
                    warn!(run_id = %run_id, step_id = %step.id, tool = %step.call.tool, error = %e, "Step failed");
                    let error = NodeError::from(&e);
                    executor.remember(context, &step.key, ContextEntry::Failure(error.clone()));
                    record.status = StepStatus::Failed;
                    record.error = Some(error);
                    progress.step_failed = true;

                    if step.on_failure.unwrap_or(default_policy) == FailurePolicy::Halt {
                        info!(run_id = %run_id, step_id = %step.id, "Halting chain after step failure");
                        progress.halted = true;
                        self.finish_step(run_id, &mut records, record);
                        break;
                    }
                    BranchLabel::Else
                }
            };

            let (outcome, traces) = executor
                .run_children(step.children.select(label), context)
                .await;
            record.actions = traces;
            match outcome {
                ActionOutcome::Stopped(stop) => {
                    progress.stop = Some(stop);
                    self.finish_step(run_id, &mut records, record);
                    break;
                }
                ActionOutcome::Cancelled => {
                    progress.cancelled = true;
                    self.finish_step(run_id, &mut records, record);
                    break;
                }
                ActionOutcome::PartiallyFailed | ActionOutcome::Failed(_) => {
                    progress.action_failed = true;
                }
                ActionOutcome::Succeeded | ActionOutcome::Skipped => {}
            }
            self.finish_step(run_id, &mut records, record);
        }

        (records, progress)
    }

    fn finish_step(&self, run_id: &RunId, records: &mut Vec<StepRecord>, mut record: StepRecord) {
        record.finished_at = Utc::now();
        self.event_bus.publish(ChainEvent::StepFinished {
            run_id: run_id.clone(),
            step_id: record.step_id,
            status: record.status,
        });
        records.push(record);
    }
}

/// Seal rule, first match wins:
/// a terminal action decides `stopped`; then cancellation; a step failure is
/// `failed` when it halted the chain or the last step never ran successfully,
/// otherwise `partially_failed`; action-only failures are `partially_failed`.
fn overall_status(tree: &ChainTree, steps: &[StepRecord], progress: &Progress) -> RunStatus {
    if progress.stop.is_some() {
        return RunStatus::Stopped;
    }
    if progress.cancelled {
        return RunStatus::Cancelled;
    }
    if progress.step_failed {
        let last_ran = tree.steps().last().is_some_and(|last| {
            steps
                .iter()
                .any(|s| s.step_id == last.id && s.status == StepStatus::Ran)
        });
        if progress.halted || !last_ran {
            return RunStatus::Failed;
        }
        return RunStatus::PartiallyFailed;
    }
    if progress.action_failed {
        return RunStatus::PartiallyFailed;
    }
    RunStatus::Completed
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::BoxFuture;
    use hearth_core::chain::{ActionId, Operator, StepId, TerminalStatus};
    use hearth_core::error::ErrorKind;
    use hearth_core::permissions::PermissionPolicy;
    use hearth_core::record::NodeStatus;
    use hearth_test_utils::{
        on_action, on_step, ChainFixture, MemoryChainSource, MemoryRecordSink, ScriptedDispatcher,
    };
    use serde_json::json;

    fn runner(dispatcher: &Arc<ScriptedDispatcher>) -> ChainRunner {
        let policy = PermissionPolicy::default()
            .grant("admins", &["*"])
            .grant("household", &["ping", "notify"]);
        ChainRunner::new(dispatcher.clone(), Arc::new(policy), EngineConfig::default())
    }

    fn admin() -> RunRequest {
        RunRequest::new(Caller::group("admins"))
    }

    async fn run(runner: &ChainRunner, def: &ChainDefinition, request: RunRequest) -> ExecutionRecord {
        let tree = runner.build_tree(def).unwrap();
        runner
            .run(&tree, request, CancellationToken::new())
            .await
            .unwrap()
    }

    fn ping_then_notify() -> ChainDefinition {
        ChainFixture::new(1, "nas-health")
            .step(1, "ping")
            .step(2, "notify")
            .when(on_step(2), "ping.status", Operator::Equals, json!("success"))
            .build()
    }

    #[tokio::test]
    async fn healthy_ping_notifies_and_completes() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "ok"}))
                .ok("notify", json!("sent")),
        );
        let record = run(&runner(&dispatcher), &ping_then_notify(), admin()).await;

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(dispatcher.calls(), vec!["ping", "notify"]);
        assert_eq!(record.steps.len(), 2);
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Ran));
        assert_eq!(record.context["ping"]["result"]["status"], "ok");
        assert_eq!(record.caller, "admins");
    }

    #[tokio::test]
    async fn failed_ping_skips_notify_and_fails() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .fail("ping", "host unreachable")
                .ok("notify", json!("sent")),
        );
        let record = run(&runner(&dispatcher), &ping_then_notify(), admin()).await;

        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(dispatcher.calls(), vec!["ping"]);
        let ping = record.step(StepId(1)).unwrap();
        assert_eq!(ping.status, StepStatus::Failed);
        assert_eq!(ping.error.as_ref().unwrap().kind, ErrorKind::Tool);
        assert_eq!(record.step(StepId(2)).unwrap().status, StepStatus::Skipped);
        assert_eq!(record.context["ping"]["status"], "failed");
        assert!(!record.context.contains_key("notify"));
    }

    #[tokio::test]
    async fn nested_branch_reaches_terminal_and_stops() {
        let def = ChainFixture::new(2, "nested")
            .step(1, "check")
            .branch(1, on_step(1), BranchLabel::Then)
            .when(on_action(1), "check.result.a", Operator::Equals, json!(true))
            .branch(2, on_action(1), BranchLabel::Then)
            .when(on_action(2), "check.result.b", Operator::Equals, json!(true))
            .invoke(3, on_action(2), BranchLabel::Then, "never")
            .terminal(4, on_action(2), BranchLabel::Else, TerminalStatus::Failure)
            .with_last_action(|a| {
                a.kind = hearth_core::chain::ActionKind::Terminal {
                    status: TerminalStatus::Failure,
                    message: Some("b is down".into()),
                }
            })
            .step(2, "after")
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("check", json!({"a": true, "b": false}))
                .ok("never", json!(null))
                .ok("after", json!(null)),
        );
        let record = run(&runner(&dispatcher), &def, admin()).await;

        assert_eq!(record.status, RunStatus::Stopped);
        assert_eq!(dispatcher.calls(), vec!["check"]);
        let stop = record.stop.as_ref().unwrap();
        assert_eq!(stop.action_id, ActionId(4));
        assert_eq!(stop.status, TerminalStatus::Failure);
        assert_eq!(stop.message.as_deref(), Some("b is down"));
        assert_eq!(record.action(ActionId(1)).unwrap().branch, Some(BranchLabel::Then));
        assert_eq!(record.action(ActionId(2)).unwrap().branch, Some(BranchLabel::Else));
        assert!(record.action(ActionId(3)).is_none());
        assert!(record.step(StepId(2)).is_none());
    }

    #[tokio::test]
    async fn action_failure_runs_else_children_and_partially_fails() {
        let def = ChainFixture::new(3, "plex")
            .step(1, "ping")
            .invoke(1, on_step(1), BranchLabel::Then, "plex_restart")
            .invoke(2, on_action(1), BranchLabel::Else, "alert")
            .with_last_action(|a| {
                if let hearth_core::chain::ActionKind::Invoke { call, .. } = &mut a.kind {
                    call.args = json!({"text": "restart failed: {{plex_restart.error}}"});
                }
            })
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!("pong"))
                .fail("plex_restart", "connection refused")
                .ok("alert", json!("queued")),
        );
        let record = run(&runner(&dispatcher), &def, admin()).await;

        assert_eq!(record.status, RunStatus::PartiallyFailed);
        assert_eq!(dispatcher.calls(), vec!["ping", "plex_restart", "alert"]);
        let restart = record.action(ActionId(1)).unwrap();
        assert_eq!(restart.status, NodeStatus::Failed);
        assert_eq!(restart.branch, Some(BranchLabel::Else));
        assert_eq!(record.context["plex_restart"]["status"], "failed");
        let text = dispatcher.args_for("alert")[0]["text"].as_str().unwrap().to_string();
        assert!(text.contains("connection refused"), "{}", text);
    }

    #[tokio::test]
    async fn failure_policy_decides_between_continue_and_halt() {
        let def = ChainFixture::new(4, "backup")
            .step(1, "snapshot")
            .step(2, "prune")
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .fail("snapshot", "disk full")
                .ok("prune", json!(null)),
        );

        let record = run(&runner(&dispatcher), &def, admin()).await;
        assert_eq!(record.status, RunStatus::PartiallyFailed);
        assert_eq!(dispatcher.call_count("prune"), 1);

        let halting = ChainFixture::new(4, "backup")
            .step(1, "snapshot")
            .with_last_step(|s| s.on_failure = Some(FailurePolicy::Halt))
            .step(2, "prune")
            .build();
        let record = run(&runner(&dispatcher), &halting, admin()).await;
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(dispatcher.call_count("prune"), 1);

        let config = EngineConfig {
            halt_on_step_failure: true,
            ..Default::default()
        };
        let strict = ChainRunner::new(
            dispatcher.clone(),
            Arc::new(PermissionPolicy::default().grant("admins", &["*"])),
            config,
        );
        let record = run(&strict, &def, admin()).await;
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(dispatcher.call_count("prune"), 1);
    }

    #[tokio::test]
    async fn unauthorized_action_is_recorded_not_dispatched() {
        let def = ChainFixture::new(5, "media")
            .step(1, "ping")
            .invoke(1, on_step(1), BranchLabel::Then, "plex_restart")
            .invoke(2, on_step(1), BranchLabel::Then, "notify")
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!("pong"))
                .ok("plex_restart", json!("ok"))
                .ok("notify", json!("sent")),
        );
        let runner = runner(&dispatcher);
        let mut events = runner.event_bus().subscribe();
        let record = run(&runner, &def, RunRequest::new(Caller::group("household"))).await;

        assert_eq!(record.status, RunStatus::PartiallyFailed);
        assert_eq!(dispatcher.calls(), vec!["ping", "notify"]);
        let denied = record.action(ActionId(1)).unwrap();
        assert_eq!(denied.status, NodeStatus::Failed);
        assert_eq!(denied.error.as_ref().unwrap().kind, ErrorKind::Authorization);

        let mut blocked = false;
        while let Ok(event) = events.try_recv() {
            if let ChainEvent::ToolBlocked { tool, group, .. } = event {
                assert_eq!(tool, "plex_restart");
                assert_eq!(group, "household");
                blocked = true;
            }
        }
        assert!(blocked);
    }

    #[tokio::test]
    async fn gated_off_actions_are_skipped_and_count_as_success() {
        let def = ChainFixture::new(6, "gated")
            .step(1, "ping")
            .invoke(1, on_step(1), BranchLabel::Then, "notify")
            .when(on_action(1), "ping.result.loss", Operator::GreaterThan, json!(0))
            .terminal(2, on_step(1), BranchLabel::Then, TerminalStatus::Success)
            .when(on_action(2), "input.stop", Operator::Exists, json!(null))
            .branch(3, on_step(1), BranchLabel::Then)
            .conditions(on_action(3), hearth_core::chain::Combinator::And, &[])
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"loss": 0}))
                .ok("notify", json!("sent")),
        );
        let record = run(&runner(&dispatcher), &def, admin()).await;

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(dispatcher.calls(), vec!["ping"]);
        assert_eq!(record.action(ActionId(1)).unwrap().status, NodeStatus::Skipped);
        assert_eq!(record.action(ActionId(2)).unwrap().status, NodeStatus::Skipped);
        let empty = record.action(ActionId(3)).unwrap();
        assert_eq!(empty.status, NodeStatus::Succeeded);
        assert_eq!(empty.branch, Some(BranchLabel::Then));
        let keys: Vec<&String> = record.context.keys().collect();
        assert_eq!(keys, vec!["input", "ping"]);
    }

    #[tokio::test]
    async fn inputs_feed_templates_and_conditions() {
        let def = ChainFixture::new(7, "wake")
            .step(1, "ping")
            .with_last_step(|s| s.call.args = json!({"host": "{{input.host}}"}))
            .step(2, "notify")
            .with_last_step(|s| {
                s.call.args = json!({"message": "{{input.host}} is {{ping.result.status}}"})
            })
            .when(on_step(2), "input.notify", Operator::Equals, json!(true))
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "up"}))
                .ok("notify", json!("sent")),
        );
        let request = admin()
            .with_input("host", json!("nas"))
            .with_input("notify", json!(true));
        let record = run(&runner(&dispatcher), &def, request).await;

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(dispatcher.args_for("ping"), vec![json!({"host": "nas"})]);
        assert_eq!(dispatcher.args_for("notify")[0]["message"], "nas is up");
    }

    #[tokio::test]
    async fn runs_are_deterministic_apart_from_identity() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "ok"}))
                .ok("notify", json!("sent")),
        );
        let runner = runner(&dispatcher);
        let def = ping_then_notify();
        let first = run(&runner, &def, admin()).await;
        let second = run(&runner, &def, admin()).await;

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.normalized(), second.normalized());
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let dispatcher = Arc::new(ScriptedDispatcher::new().ok("ping", json!("pong")));
        let runner = runner(&dispatcher);
        let tree = runner.build_tree(&ping_then_notify()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let record = runner.run(&tree, admin(), cancel).await.unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert!(record.steps.is_empty());
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_call() {
        let def = ChainFixture::new(8, "scan")
            .step(1, "scan")
            .step(2, "report")
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("scan", json!("done"))
                .delay("scan", Duration::from_secs(600))
                .ok("report", json!(null)),
        );
        let runner = runner(&dispatcher);
        let tree = runner.build_tree(&def).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let record = runner.run(&tree, admin(), cancel).await.unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0].status, StepStatus::Cancelled);
        assert!(!record.context.contains_key("scan"));
        assert_eq!(dispatcher.call_count("report"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_is_a_tool_failure() {
        let def = ChainFixture::new(9, "slow")
            .step(1, "scan")
            .with_last_step(|s| s.timeout_secs = Some(2))
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("scan", json!("done"))
                .delay("scan", Duration::from_secs(60)),
        );
        let record = run(&runner(&dispatcher), &def, admin()).await;

        assert_eq!(record.status, RunStatus::Failed);
        let error = record.steps[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Tool);
        assert!(error.message.contains("timeout"), "{}", error.message);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_default_timeout_bounds_untimed_calls() {
        let def = ChainFixture::new(11, "scrub")
            .step(1, "scan")
            .step(2, "report")
            .with_last_step(|s| s.timeout_secs = Some(10))
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("scan", json!("done"))
                .delay("scan", Duration::from_secs(600))
                .ok("report", json!("sent"))
                .delay("report", Duration::from_secs(5)),
        );
        let config = EngineConfig {
            default_timeout_secs: 2,
            ..EngineConfig::default()
        };
        let runner = ChainRunner::new(
            dispatcher.clone(),
            Arc::new(PermissionPolicy::default().grant("admins", &["*"])),
            config,
        );

        let started = tokio::time::Instant::now();
        let record = run(&runner, &def, admin()).await;

        assert!(started.elapsed() < Duration::from_secs(60));
        let scan = record.step(StepId(1)).unwrap();
        assert_eq!(scan.status, StepStatus::Failed);
        assert!(scan.error.as_ref().unwrap().message.contains("timeout"));
        // The step's own timeout outlasts the engine default.
        assert_eq!(record.step(StepId(2)).unwrap().status, StepStatus::Ran);
        assert_eq!(record.status, RunStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn terminal_stops_later_siblings_of_enclosing_branch() {
        let def = ChainFixture::new(12, "disk-guard")
            .step(1, "check")
            .branch(1, on_step(1), BranchLabel::Then)
            .when(on_action(1), "check.status", Operator::Equals, json!("success"))
            .branch(2, on_action(1), BranchLabel::Then)
            .when(on_action(2), "check.result.full", Operator::Equals, json!(true))
            .terminal(3, on_action(2), BranchLabel::Then, TerminalStatus::Failure)
            .invoke(4, on_action(1), BranchLabel::Then, "cleanup")
            .step(2, "report")
            .build();
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("check", json!({"full": true}))
                .ok("cleanup", json!(null))
                .ok("report", json!(null)),
        );
        let record = run(&runner(&dispatcher), &def, admin()).await;

        assert_eq!(record.status, RunStatus::Stopped);
        assert_eq!(dispatcher.calls(), vec!["check"]);
        assert_eq!(record.stop.as_ref().unwrap().action_id, ActionId(3));
        assert_eq!(record.action(ActionId(1)).unwrap().status, NodeStatus::Stopped);
        assert!(record.action(ActionId(4)).is_none());
        assert!(!record.context.contains_key("cleanup"));
        assert!(record.step(StepId(2)).is_none());
    }

    fn ping_gates_disk_check() -> ChainDefinition {
        ChainFixture::new(13, "ping-then-disk")
            .step(1, "ping")
            .step(2, "disk_check")
            .when(on_step(2), "ping.result", Operator::Equals, json!("ok"))
            .invoke(1, on_step(2), BranchLabel::Then, "notify")
            .build()
    }

    #[tokio::test]
    async fn ping_result_gates_step_and_its_post_action() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!("ok"))
                .ok("disk_check", json!({"free_gb": 120}))
                .ok("notify", json!("sent")),
        );
        let record = run(&runner(&dispatcher), &ping_gates_disk_check(), admin()).await;

        assert_eq!(record.step(StepId(1)).unwrap().status, StepStatus::Ran);
        assert_eq!(record.step(StepId(2)).unwrap().status, StepStatus::Ran);
        assert_eq!(dispatcher.call_count("notify"), 1);
        assert_eq!(record.action(ActionId(1)).unwrap().status, NodeStatus::Succeeded);
        assert_eq!(record.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn failed_ping_leaves_result_unset_and_skips_gated_step() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .fail("ping", "no route to host")
                .ok("disk_check", json!({"free_gb": 120}))
                .ok("notify", json!("sent")),
        );
        let record = run(&runner(&dispatcher), &ping_gates_disk_check(), admin()).await;

        assert_eq!(record.step(StepId(1)).unwrap().status, StepStatus::Failed);
        assert_eq!(record.step(StepId(2)).unwrap().status, StepStatus::Skipped);
        assert_eq!(dispatcher.call_count("disk_check"), 0);
        assert_eq!(dispatcher.call_count("notify"), 0);
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn disabled_chain_is_rejected() {
        let dispatcher = Arc::new(ScriptedDispatcher::new());
        let runner = runner(&dispatcher);
        let tree = runner
            .build_tree(&ChainFixture::new(10, "off").step(1, "ping").disabled().build())
            .unwrap();
        let err = runner
            .run(&tree, admin(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::InvalidChain(_)));
    }

    struct BrokenSink;

    impl RecordSink for BrokenSink {
        fn append<'a>(&'a self, _record: &'a ExecutionRecord) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(HearthError::Database("read-only".into())) })
        }
    }

    #[tokio::test]
    async fn sealed_records_reach_sinks_and_sink_errors_are_not_fatal() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "ok"}))
                .ok("notify", json!("sent")),
        );
        let sink = Arc::new(MemoryRecordSink::new());
        let runner = runner(&dispatcher)
            .with_sink(Arc::new(BrokenSink))
            .with_sink(sink.clone());

        let record = run(&runner, &ping_then_notify(), admin()).await;
        let stored = sink.records();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], record);
    }

    #[tokio::test]
    async fn run_by_id_loads_from_source() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "ok"}))
                .ok("notify", json!("sent")),
        );
        let runner = runner(&dispatcher);
        let source = MemoryChainSource::new().with(ping_then_notify());

        let record = runner
            .run_by_id(&source, ChainId(1), admin(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.chain_name, "nas-health");

        let err = runner
            .run_by_id(&source, ChainId(99), admin(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::ChainNotFound(99)));
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "ok"}))
                .ok("notify", json!("sent")),
        );
        let runner = runner(&dispatcher);
        let mut rx = runner.event_bus().subscribe();
        let record = run(&runner, &ping_then_notify(), admin()).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ChainEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(ChainEvent::RunFinished { run_id, status: RunStatus::Completed }) if *run_id == record.run_id
        ));
        let finished = events
            .iter()
            .filter(|e| matches!(e, ChainEvent::StepFinished { .. }))
            .count();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn concurrent_runs_are_isolated() {
        let dispatcher = Arc::new(
            ScriptedDispatcher::new()
                .ok("ping", json!({"status": "ok"}))
                .ok("notify", json!("sent")),
        );
        let runner = runner(&dispatcher);
        let tree = runner.build_tree(&ping_then_notify()).unwrap();

        let (a, b) = tokio::join!(
            runner.run(&tree, admin().with_input("n", json!(1)), CancellationToken::new()),
            runner.run(&tree, admin().with_input("n", json!(2)), CancellationToken::new()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.context["input"]["n"], 1);
        assert_eq!(b.context["input"]["n"], 2);
        assert_eq!(dispatcher.call_count("ping"), 2);
    }
}
