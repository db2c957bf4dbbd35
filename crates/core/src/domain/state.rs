use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::feedback::AnswerFeedback;
use crate::domain::intent::IntentClass;
use crate::domain::message::{Message, MessageId, MessageLog};
use crate::domain::plan::Plan;
use crate::domain::step::{Step, StepId, StepStatus};
use crate::domain::tool::ToolError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRef {
    pub message_id: MessageId,
    pub normalized: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplanRequest {
    RepairStep { step_id: StepId, error: ToolError },
    Escalation { feedback: AnswerFeedback },
}

/// Error that ends the turn early; surfaced to the user as a limitation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub step_id: Option<StepId>,
    pub error: ToolError,
}

/// Scratch fields scoped to one user question. Reset when a new distinct
/// question arrives; kept when the same question is retried.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub question: Option<QuestionRef>,
    pub intent_class: Option<IntentClass>,
    pub analysis_target: Option<String>,
    pub needs_clarification: bool,
    pub clarification_signature: Option<String>,
    pub guardrail_response: Option<String>,
    pub assumptions: Vec<String>,
    pub planned: bool,
    pub replans_used: u32,
    pub replan_request: Option<ReplanRequest>,
    pub repair_requested: BTreeSet<StepId>,
    pub answer_revision_attempts: u32,
    pub master_escalations_from_validation: u32,
    pub terminal_error: Option<TurnError>,
    pub clarified: Option<ClarifiedQuestion>,
    pub answered: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ClarificationResolution {
    BindTarget(String),
    KeepBoundTarget,
    CompareTargets(Vec<String>),
    UseMethod(String),
    ProceedWithoutTarget,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub label: String,
    pub resolution: ClarificationResolution,
}

/// Clarification waiting for the user's reply. `question` is the original
/// request that raised it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingClarification {
    pub signature: String,
    pub question: String,
    pub options: Vec<ClarificationOption>,
}

/// A reply that answered a pending clarification. The original question is
/// re-run with the chosen resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifiedQuestion {
    pub question: String,
    pub signature: String,
    pub label: String,
    pub resolution: ClarificationResolution,
}

/// Clarification bookkeeping kept for the life of the thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationLedger {
    pub asked_turns: u32,
    pub asked_signatures: BTreeSet<String>,
    pub pending: Option<PendingClarification>,
}

impl ClarificationLedger {
    pub fn budget_exhausted(&self, budget: u32) -> bool {
        self.asked_turns >= budget
    }

    pub fn already_asked(&self, signature: &str) -> bool {
        self.asked_signatures.contains(signature)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub messages: MessageLog,
    pub summary: String,
    pub summary_cursor: usize,
    pub token_estimate: usize,
    pub bound_target: Option<String>,
    pub plan: Option<Plan>,
    pub plan_version: u32,
    pub turn_index: u32,
    pub steps: Vec<Step>,
    pub archived_steps: Vec<Step>,
    pub clarification: ClarificationLedger,
    pub turn: TurnState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            messages: MessageLog::new(),
            summary: String::new(),
            summary_cursor: 0,
            token_estimate: 0,
            bound_target: None,
            plan: None,
            plan_version: 0,
            turn_index: 0,
            steps: Vec::new(),
            archived_steps: Vec::new(),
            clarification: ClarificationLedger::default(),
            turn: TurnState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn append(&mut self, message: Message) -> bool {
        self.updated_at = Utc::now();
        self.messages.append(message)
    }

    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages.latest_user()
    }

    pub fn latest_user_text(&self) -> &str {
        self.latest_user_message().map(|message| message.content.as_str()).unwrap_or_default()
    }

    /// The request this turn works on: the clarified original question when
    /// the latest message answered a clarification, else the latest message.
    pub fn request_text(&self) -> String {
        match &self.turn.clarified {
            Some(clarified) => {
                format!("{}\n\nClarification: {}", clarified.question, clarified.label)
            }
            None => self.latest_user_text().to_string(),
        }
    }

    /// Steps created for the current question.
    pub fn turn_steps(&self) -> impl Iterator<Item = &Step> {
        let turn = self.turn_index;
        self.steps.iter().filter(move |step| step.turn == turn)
    }

    /// Steps that failed for the current question, including ones a
    /// replacing replan has since archived.
    pub fn turn_failures(&self) -> impl Iterator<Item = &Step> {
        let turn = self.turn_index;
        self.archived_steps
            .iter()
            .chain(self.steps.iter())
            .filter(move |step| step.turn == turn && step.status == StepStatus::Failed)
    }

    pub fn first_open_index(&self) -> Option<usize> {
        self.steps.iter().position(|step| step.status.is_open())
    }

    pub fn has_open_steps(&self) -> bool {
        self.first_open_index().is_some()
    }

    pub fn running_count(&self) -> usize {
        self.steps.iter().filter(|step| step.status == StepStatus::Running).count()
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == id)
    }

    /// Completed steps of the active plan, or of the most recently superseded
    /// plan when the active list has none.
    pub fn completed_outputs(&self) -> Vec<&Step> {
        let active = self
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Done)
            .collect::<Vec<_>>();
        if !active.is_empty() {
            return active;
        }
        let Some(latest_version) = self.archived_steps.iter().map(|step| step.plan_version).max()
        else {
            return Vec::new();
        };
        self.archived_steps
            .iter()
            .filter(|step| step.plan_version == latest_version && step.status == StepStatus::Done)
            .collect()
    }

    /// Any step ever completed in this thread, superseded plans included.
    pub fn all_completed(&self) -> impl Iterator<Item = &Step> {
        self.archived_steps
            .iter()
            .chain(self.steps.iter())
            .filter(|step| step.status == StepStatus::Done)
    }

    /// Copy suitable for long-term storage: ephemeral and tool-internal
    /// messages are dropped and the summary cursor is remapped.
    pub fn for_persistence(&self) -> Self {
        let (messages, summary_cursor) = self.messages.retained(self.summary_cursor);
        Self { messages, summary_cursor, ..self.clone() }
    }
}

pub fn normalize_question(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        normalize_question, ClarificationResolution, ClarifiedQuestion, ConversationState,
    };
    use crate::domain::message::{Message, MessageKind};
    use crate::domain::step::{Step, StepDraft, StepId};
    use crate::domain::tool::ToolError;

    fn done_step(version: u32, ordinal: usize) -> Step {
        let mut step = Step::from_draft(
            StepId::scoped(version, ordinal),
            version,
            1,
            StepDraft { instruction: format!("step {ordinal}"), ..StepDraft::default() },
        );
        step.start().expect("start");
        step.complete(json!({"value": ordinal})).expect("complete");
        step
    }

    #[test]
    fn completed_outputs_fall_back_to_latest_archived_plan() {
        let mut state = ConversationState::new("thread-1");
        state.archived_steps.push(done_step(1, 1));
        state.archived_steps.push(done_step(2, 1));
        state.archived_steps.push(done_step(2, 2));

        let outputs = state.completed_outputs();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|step| step.plan_version == 2));
    }

    #[test]
    fn turn_failures_include_archived_steps_of_the_current_turn() {
        let mut state = ConversationState::new("thread-1");
        state.turn_index = 1;
        let failed = |turn: u32| {
            let mut step = Step::from_draft(
                StepId::scoped(1, 1),
                1,
                turn,
                StepDraft { instruction: "fetch".to_string(), ..StepDraft::default() },
            );
            step.start().expect("start");
            step.fail(ToolError::new("permission_denied", "denied")).expect("fail");
            step
        };
        state.archived_steps.push(failed(0));
        state.archived_steps.push(failed(1));
        state.steps.push(done_step(2, 1));

        assert_eq!(state.turn_failures().count(), 1);
        state.steps.push(failed(1));
        assert_eq!(state.turn_failures().count(), 2);
    }

    #[test]
    fn persistence_copy_drops_ephemeral_messages() {
        let mut state = ConversationState::new("thread-2");
        state.append(Message::user("hello"));
        state.append(Message::assistant("note").with_kind(MessageKind::Ephemeral));
        state.append(Message::assistant("hi"));
        state.summary_cursor = 2;

        let persisted = state.for_persistence();
        assert_eq!(persisted.messages.len(), 2);
        assert_eq!(persisted.summary_cursor, 1);
        assert_eq!(state.messages.len(), 3);
    }

    #[test]
    fn request_text_prefers_clarified_question() {
        let mut state = ConversationState::new("thread-3");
        state.append(Message::user("2"));
        assert_eq!(state.request_text(), "2");

        state.turn.clarified = Some(ClarifiedQuestion {
            question: "analyze MSFT".to_string(),
            signature: "target_mismatch:AAPL->MSFT".to_string(),
            label: "Stay on AAPL".to_string(),
            resolution: ClarificationResolution::KeepBoundTarget,
        });
        assert_eq!(state.request_text(), "analyze MSFT\n\nClarification: Stay on AAPL");
    }

    #[test]
    fn question_normalization_collapses_whitespace_and_case() {
        assert_eq!(normalize_question("  Analyze   AAPL \n"), "analyze aapl");
    }
}
