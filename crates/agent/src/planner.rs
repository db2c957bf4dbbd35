//! Planner: asks the model for a plan, then applies the safety
//! normalizations and merges the steps into the thread.

use std::sync::Arc;

use serde_json::{json, Value};
use stepwise_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use stepwise_core::config::ToolNamesConfig;
use stepwise_core::domain::message::{Message, MessageKind};
use stepwise_core::domain::plan::{Plan, PlanAction, PlanDraft};
use stepwise_core::domain::state::{ConversationState, ReplanRequest};
use stepwise_core::domain::step::{Step, StepDraft, StepId, StepStatus};
use stepwise_core::domain::tool::{ToolArgs, ToolSpec};
use tracing::{info, warn};

use crate::llm::{complete_as, ChatMessage, LanguageModel, StructuredSchema};

const FOLLOW_UP_PHRASES: &[&str] = &[
    "summarize that",
    "summarise that",
    "what did you find",
    "based on the above",
    "explain the result",
    "explain that",
    "recap",
    "what does that mean",
    "tl;dr",
    "tldr",
];

const TABULAR_HINTS: &[&str] =
    &["sql", "query", "table", "rows", "columns", "database", "tabular"];

pub struct Planner {
    model: Arc<dyn LanguageModel>,
    tools: ToolNamesConfig,
    available: Vec<ToolSpec>,
    max_steps: usize,
    audit: Arc<dyn AuditSink>,
}

impl Planner {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: ToolNamesConfig,
        available: Vec<ToolSpec>,
        max_steps: usize,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { model, tools, available, max_steps, audit }
    }

    pub async fn plan(&self, state: &mut ConversationState, audit: &AuditContext) -> Plan {
        let draft = if is_follow_up(state) {
            PlanDraft::no_execution("answerable from completed step outputs")
        } else {
            self.draft(state).await
        };
        let draft = self.normalize(draft, state);
        let step_count = draft.steps.len();
        let plan = merge(state, draft);

        state.append(
            Message::assistant(format!(
                "Plan v{} ({}): {} new step(s).",
                plan.version,
                plan.action.as_str(),
                step_count
            ))
            .with_kind(MessageKind::Ephemeral),
        );
        info!(
            event_name = "planner.plan_applied",
            thread_id = %state.thread_id,
            plan_version = plan.version,
            action = plan.action.as_str(),
            requires_execution = plan.requires_execution,
            steps = step_count,
            "plan applied"
        );
        self.audit.emit(
            AuditEvent::new(
                audit,
                "planner.plan_applied",
                AuditCategory::Planning,
                AuditOutcome::Success,
            )
            .with_metadata("plan_version", plan.version.to_string())
            .with_metadata("action", plan.action.as_str())
            .with_metadata("steps", step_count.to_string()),
        );
        plan
    }

    async fn draft(&self, state: &ConversationState) -> PlanDraft {
        let messages = [
            ChatMessage::system(
                "You plan the steps needed to answer the user's request with the available \
                 tools. Decide whether to reuse the open steps, append new steps, or replace \
                 the plan. Every step has an instruction, a goal, a success criterion, optional \
                 constraints, and may pre-bind a tool and its arguments.",
            ),
            ChatMessage::user(self.prompt(state)),
        ];
        match complete_as::<PlanDraft>(self.model.as_ref(), &messages, &plan_schema()).await {
            Ok(draft) => draft,
            Err(error) => {
                warn!(
                    event_name = "planner.model_fallback",
                    thread_id = %state.thread_id,
                    error = %error,
                    "planner model failed; falling back to a single step"
                );
                PlanDraft {
                    action: PlanAction::Replace,
                    requires_execution: true,
                    reason: "planner model unavailable".to_string(),
                    steps: Vec::new(),
                }
            }
        }
    }

    fn prompt(&self, state: &ConversationState) -> String {
        let turn = &state.turn;
        let mut sections = vec![format!("Request:\n{}", state.request_text())];
        if let Some(intent) = turn.intent_class {
            sections.push(format!("Intent: {}", intent.as_str()));
        }
        if let Some(target) = &turn.analysis_target {
            sections.push(format!("Target: {target}"));
        }
        if !turn.assumptions.is_empty() {
            sections.push(format!("Assumptions:\n- {}", turn.assumptions.join("\n- ")));
        }
        if !state.steps.is_empty() {
            let listed = state
                .steps
                .iter()
                .map(|step| format!("- {} [{}] {}", step.id, step.status.as_str(), step.instruction))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Current steps:\n{listed}"));
        }
        match &turn.replan_request {
            Some(ReplanRequest::RepairStep { step_id, error }) => sections.push(format!(
                "Step {step_id} failed with `{}`. Plan steps that work around it.",
                error.code
            )),
            Some(ReplanRequest::Escalation { feedback }) => sections.push(format!(
                "The previous answer was rejected: {}. Plan steps that fix it.",
                feedback.reason
            )),
            None => {}
        }
        let tools = self
            .available
            .iter()
            .map(|tool| format!("- {}: {}", tool.name, tool.description))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Tools:\n{tools}"));
        sections.join("\n\n")
    }

    /// Safety normalizations, in order, then the step cap.
    fn normalize(&self, mut draft: PlanDraft, state: &ConversationState) -> PlanDraft {
        if draft.action == PlanAction::Reuse {
            if state.has_open_steps() {
                draft.steps.clear();
            } else {
                draft.action = PlanAction::Append;
            }
        }

        if draft.requires_execution && draft.action != PlanAction::Reuse && draft.steps.is_empty() {
            draft.steps.push(StepDraft {
                instruction: state.request_text(),
                goal: "Answer the user's request".to_string(),
                success_criteria: "The result answers the request".to_string(),
                ..StepDraft::default()
            });
        }

        let forced_baseline = match self.missing_baseline(state) {
            Some(target) => {
                self.force_baseline(&mut draft, &target);
                true
            }
            None => false,
        };

        if draft.action != PlanAction::Reuse && self.needs_schema_grounding(&draft, state) {
            let at = usize::from(forced_baseline).min(draft.steps.len());
            draft.steps.insert(
                at,
                StepDraft {
                    instruction: "Look up the exact table and column names".to_string(),
                    goal: "Ground the queries in the schema".to_string(),
                    success_criteria: "Table and column names are known".to_string(),
                    tool: Some(self.tools.schema.clone()),
                    tool_args: Some(ToolArgs::new()),
                    ..StepDraft::default()
                },
            );
        }

        draft.steps.truncate(self.max_steps);
        draft
    }

    /// Target of a bound-target analysis whose baseline never ran.
    fn missing_baseline(&self, state: &ConversationState) -> Option<String> {
        let turn = &state.turn;
        if !turn.intent_class.is_some_and(|intent| intent.is_target_analysis()) {
            return None;
        }
        let target = turn.analysis_target.clone()?;
        let completed = state.all_completed().any(|step| self.is_baseline_for(step, &target));
        let open = state
            .steps
            .iter()
            .any(|step| step.status.is_open() && self.is_baseline_for(step, &target));
        (!completed && !open).then_some(target)
    }

    fn is_baseline_for(&self, step: &Step, target: &str) -> bool {
        step.selected_tool.as_deref() == Some(self.tools.baseline.as_str())
            && step
                .tool_args
                .as_ref()
                .and_then(|args| args.get("target"))
                .and_then(Value::as_str)
                .is_some_and(|bound| bound.eq_ignore_ascii_case(target))
    }

    fn force_baseline(&self, draft: &mut PlanDraft, target: &str) {
        let proposed = draft.steps.iter().position(|step| {
            step.tool.as_deref() == Some(self.tools.baseline.as_str())
                && step
                    .tool_args
                    .as_ref()
                    .and_then(|args| args.get("target"))
                    .and_then(Value::as_str)
                    .map_or(true, |bound| bound.eq_ignore_ascii_case(target))
        });
        let mut baseline = match proposed {
            Some(index) => draft.steps.remove(index),
            None => StepDraft {
                instruction: format!("Run the baseline analysis for {target}"),
                goal: format!("Establish baseline metrics for {target}"),
                success_criteria: "Baseline metrics are available".to_string(),
                tool: Some(self.tools.baseline.clone()),
                ..StepDraft::default()
            },
        };
        baseline.tool_args.get_or_insert_with(ToolArgs::new).insert("target".into(), json!(target));
        draft.steps.insert(0, baseline);
        draft.requires_execution = true;
        if draft.action == PlanAction::Reuse {
            draft.action = PlanAction::Append;
        }
    }

    fn needs_schema_grounding(&self, draft: &PlanDraft, state: &ConversationState) -> bool {
        let schema = self.tools.schema.as_str();
        let query = self.tools.query.as_str();
        let tabular = draft.steps.iter().any(|step| {
            step.tool.as_deref() == Some(query)
                || implies_tabular(&step.instruction)
                || implies_tabular(&step.goal)
        });
        if !tabular {
            return false;
        }
        let drafted = draft.steps.iter().any(|step| step.tool.as_deref() == Some(schema));
        let existing = draft.action == PlanAction::Append
            && state.steps.iter().any(|step| {
                step.status != StepStatus::Skipped && step.selected_tool.as_deref() == Some(schema)
            });
        !drafted && !existing
    }
}

/// Applies a normalized draft to the thread.
fn merge(state: &mut ConversationState, draft: PlanDraft) -> Plan {
    if draft.action != PlanAction::Reuse {
        if draft.action == PlanAction::Replace {
            for step in &mut state.steps {
                step.skip();
            }
            let superseded = std::mem::take(&mut state.steps);
            state.archived_steps.extend(superseded);
        }
        state.plan_version += 1;
        let version = state.plan_version;
        let turn = state.turn_index;
        state.steps.extend(draft.steps.into_iter().enumerate().map(|(index, step)| {
            Step::from_draft(StepId::scoped(version, index + 1), version, turn, step)
        }));
    }

    let reason = if draft.reason.trim().is_empty() {
        format!("{} plan", draft.action.as_str())
    } else {
        draft.reason
    };
    let plan = Plan {
        version: state.plan_version,
        action: draft.action,
        requires_execution: draft.requires_execution,
        reason,
    };
    state.plan = Some(plan.clone());
    state.turn.planned = true;
    state.turn.replan_request = None;
    plan
}

fn is_follow_up(state: &ConversationState) -> bool {
    if state.turn.replan_request.is_some() || state.all_completed().next().is_none() {
        return false;
    }
    let request = state.request_text().to_lowercase();
    FOLLOW_UP_PHRASES.iter().any(|phrase| request.contains(phrase))
}

fn implies_tabular(text: &str) -> bool {
    let lower = text.to_lowercase();
    TABULAR_HINTS.iter().any(|hint| lower.contains(hint))
}

fn plan_schema() -> StructuredSchema {
    StructuredSchema::new(
        "plan",
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["reuse", "append", "replace"]},
                "requires_execution": {"type": "boolean"},
                "reason": {"type": "string"},
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "instruction": {"type": "string"},
                            "goal": {"type": "string"},
                            "success_criteria": {"type": "string"},
                            "constraints": {"type": "array", "items": {"type": "string"}},
                            "tool": {"type": ["string", "null"]},
                            "tool_args": {"type": ["object", "null"]}
                        },
                        "required": ["instruction"]
                    }
                }
            },
            "required": ["action", "requires_execution", "steps"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use stepwise_core::audit::{AuditContext, InMemoryAuditSink};
    use stepwise_core::config::ToolNamesConfig;
    use stepwise_core::domain::intent::IntentClass;
    use stepwise_core::domain::message::Message;
    use stepwise_core::domain::plan::PlanAction;
    use stepwise_core::domain::state::{ConversationState, ReplanRequest};
    use stepwise_core::domain::step::{Step, StepDraft, StepId, StepStatus};
    use stepwise_core::domain::tool::ToolError;

    use super::Planner;
    use crate::test_support::{args, ScriptedModel};

    fn tool_names() -> ToolNamesConfig {
        ToolNamesConfig {
            baseline: "analyze_target".into(),
            query: "sql_query".into(),
            schema: "schema_reference".into(),
        }
    }

    fn planner(model: Arc<ScriptedModel>, max_steps: usize) -> Planner {
        Planner::new(model, tool_names(), Vec::new(), max_steps, Arc::new(InMemoryAuditSink::default()))
    }

    fn audit() -> AuditContext {
        AuditContext::new("thread-plan", "req-1", "planner")
    }

    fn state(text: &str) -> ConversationState {
        let mut state = ConversationState::new("thread-plan");
        state.turn_index = 1;
        state.append(Message::user(text));
        state
    }

    fn analyze_current(state: &mut ConversationState, target: &str) {
        state.bound_target = Some(target.into());
        state.turn.intent_class = Some(IntentClass::AnalyzeCurrentTarget);
        state.turn.analysis_target = Some(target.into());
    }

    fn done_step(version: u32, ordinal: usize, tool: &str, tool_args: serde_json::Value) -> Step {
        let mut step = Step::from_draft(
            StepId::scoped(version, ordinal),
            version,
            1,
            StepDraft {
                instruction: format!("run {tool}"),
                tool: Some(tool.into()),
                tool_args: Some(args(tool_args)),
                ..StepDraft::default()
            },
        );
        step.start().expect("start");
        step.complete(json!({"value": 1})).expect("complete");
        step
    }

    #[tokio::test]
    async fn bound_target_analysis_gets_baseline_first() {
        let model = Arc::new(ScriptedModel::default().with_structured_for(
            "plan",
            json!({
                "action": "replace",
                "requires_execution": true,
                "steps": [{"instruction": "Chart the 30 day volatility", "tool": "volatility"}]
            }),
        ));
        let mut state = state("analyze its volatility");
        analyze_current(&mut state, "AAPL");

        let plan = planner(model, 8).plan(&mut state, &audit()).await;

        assert_eq!(plan.version, 1);
        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.steps[0].id, StepId::scoped(1, 1));
        assert_eq!(state.steps[0].selected_tool.as_deref(), Some("analyze_target"));
        assert_eq!(state.steps[0].tool_args.as_ref().and_then(|a| a.get("target")), Some(&json!("AAPL")));
        assert_eq!(state.steps[1].selected_tool.as_deref(), Some("volatility"));
        assert!(state.turn.planned);
    }

    #[tokio::test]
    async fn completed_baseline_for_same_target_is_not_repeated() {
        let model = Arc::new(ScriptedModel::default().with_structured_for(
            "plan",
            json!({
                "action": "append",
                "requires_execution": true,
                "steps": [{"instruction": "Compute momentum"}]
            }),
        ));
        let mut state = state("analyze its momentum");
        analyze_current(&mut state, "AAPL");
        state.plan_version = 1;
        state.steps.push(done_step(1, 1, "analyze_target", json!({"target": "aapl"})));

        planner(model, 8).plan(&mut state, &audit()).await;

        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.steps[1].id, StepId::scoped(2, 1));
        assert_eq!(state.steps[1].instruction, "Compute momentum");
    }

    #[tokio::test]
    async fn model_proposed_baseline_moves_to_front() {
        let model = Arc::new(ScriptedModel::default().with_structured_for(
            "plan",
            json!({
                "action": "replace",
                "requires_execution": true,
                "steps": [
                    {"instruction": "Compute drawdown"},
                    {"instruction": "Baseline", "tool": "analyze_target"}
                ]
            }),
        ));
        let mut state = state("analyze its drawdown");
        analyze_current(&mut state, "MSFT");

        planner(model, 8).plan(&mut state, &audit()).await;

        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.steps[0].instruction, "Baseline");
        assert_eq!(state.steps[0].tool_args.as_ref().and_then(|a| a.get("target")), Some(&json!("MSFT")));
    }

    #[tokio::test]
    async fn tabular_plans_are_grounded_after_the_baseline() {
        let model = Arc::new(ScriptedModel::default().with_structured_for(
            "plan",
            json!({
                "action": "replace",
                "requires_execution": true,
                "steps": [{"instruction": "Query daily closes", "tool": "sql_query"}]
            }),
        ));
        let mut state = state("analyze its closing prices");
        analyze_current(&mut state, "AAPL");

        planner(model, 8).plan(&mut state, &audit()).await;

        let tools = state
            .steps
            .iter()
            .map(|step| step.selected_tool.clone().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(tools, ["analyze_target", "schema_reference", "sql_query"]);
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_one_step() {
        let model = Arc::new(ScriptedModel::default().with_structured_error_for("plan"));
        let mut state = state("show me market news");

        let plan = planner(model, 8).plan(&mut state, &audit()).await;

        assert_eq!(plan.action, PlanAction::Replace);
        assert!(plan.requires_execution);
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].instruction, "show me market news");
    }

    #[tokio::test]
    async fn follow_up_skips_the_model_and_archives() {
        let model = Arc::new(ScriptedModel::default());
        let mut state = state("can you summarize that?");
        state.plan_version = 1;
        state.steps.push(done_step(1, 1, "sql_query", json!({"query": "select 1"})));

        let plan = planner(model.clone(), 8).plan(&mut state, &audit()).await;

        assert!(!plan.requires_execution);
        assert!(model.calls().is_empty());
        assert!(state.steps.is_empty());
        assert_eq!(state.completed_outputs().len(), 1);
    }

    #[tokio::test]
    async fn reuse_without_open_steps_becomes_append() {
        let model = Arc::new(ScriptedModel::default().with_structured_for(
            "plan",
            json!({"action": "reuse", "requires_execution": true, "steps": []}),
        ));
        let mut state = state("and the volume?");
        state.plan_version = 1;
        state.steps.push(done_step(1, 1, "sql_query", json!({"query": "select 1"})));

        let plan = planner(model, 8).plan(&mut state, &audit()).await;

        assert_eq!(plan.action, PlanAction::Append);
        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.steps[0].status, StepStatus::Done);
        assert_eq!(state.steps[1].id, StepId::scoped(2, 1));
    }

    #[tokio::test]
    async fn replace_skips_open_steps_and_caps_new_ones() {
        let steps = (0..5).map(|n| json!({"instruction": format!("step {n}")})).collect::<Vec<_>>();
        let model = Arc::new(ScriptedModel::default().with_structured_for(
            "plan",
            json!({"action": "replace", "requires_execution": true, "steps": steps}),
        ));
        let mut state = state("start over");
        state.plan_version = 1;
        state.steps.push(Step::from_draft(
            StepId::scoped(1, 1),
            1,
            1,
            StepDraft { instruction: "old".into(), ..StepDraft::default() },
        ));
        state.turn.replan_request = Some(ReplanRequest::RepairStep {
            step_id: StepId::scoped(1, 1),
            error: ToolError::new("no_such_table", "missing"),
        });

        planner(model, 3).plan(&mut state, &audit()).await;

        assert_eq!(state.archived_steps.len(), 1);
        assert_eq!(state.archived_steps[0].status, StepStatus::Skipped);
        assert_eq!(state.steps.len(), 3);
        assert!(state.turn.replan_request.is_none());
    }
}
