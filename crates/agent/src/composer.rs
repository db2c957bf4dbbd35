//! Answer composer: drafts the user-facing answer from completed step
//! outputs, stated limitations and assumptions.

use std::sync::Arc;

use serde_json::Value;
use stepwise_core::domain::state::ConversationState;
use stepwise_core::domain::tool::codes;
use tracing::warn;

use crate::context::{cap_chars, model_history};
use crate::llm::{ChatMessage, LanguageModel};

const FINDING_CHARS: usize = 600;

pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
}

impl AnswerComposer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn compose(&self, state: &ConversationState) -> String {
        let mut messages = vec![ChatMessage::system(
            "Write the final answer to the user's request from the findings below. Present \
             several comparable records as a markdown table. When a limitation is listed, say \
             plainly what could not be done. Do not mention internal error codes or tool names.",
        )];
        messages.extend(model_history(state));
        messages.push(ChatMessage::user(brief(state)));

        match self.model.complete(&messages).await {
            Ok(reply) if !reply.content.trim().is_empty() => reply.content.trim().to_string(),
            Ok(_) => fallback_answer(state),
            Err(error) => {
                warn!(
                    event_name = "composer.model_fallback",
                    thread_id = %state.thread_id,
                    error = %error,
                    "composing answer without the model"
                );
                fallback_answer(state)
            }
        }
    }
}

fn brief(state: &ConversationState) -> String {
    let mut sections = vec![format!("Request:\n{}", state.request_text())];
    let findings = findings(state);
    if findings.is_empty() {
        sections.push("Findings: none".to_string());
    } else {
        sections.push(format!("Findings:\n{}", findings.join("\n")));
    }
    if !state.turn.assumptions.is_empty() {
        sections.push(format!("Assumptions:\n- {}", state.turn.assumptions.join("\n- ")));
    }
    if let Some(limitation) = limitation_paragraph(state) {
        sections.push(limitation);
    }
    sections.join("\n\n")
}

/// One line per completed step: its goal and a capped rendering of its output.
pub fn findings(state: &ConversationState) -> Vec<String> {
    state
        .completed_outputs()
        .into_iter()
        .filter_map(|step| {
            let result = step.result.as_ref()?;
            Some(format!("- {}: {}", step.goal, cap_chars(&render_value(result), FINDING_CHARS)))
        })
        .collect()
}

/// Deterministic answer used when the model cannot draft one.
pub fn fallback_answer(state: &ConversationState) -> String {
    let findings = findings(state);
    let mut parts = Vec::new();
    if findings.is_empty() {
        parts.push("I could not gather any results for this request.".to_string());
    } else {
        parts.push(format!("Here is what I found:\n{}", findings.join("\n")));
    }
    if !state.turn.assumptions.is_empty() {
        parts.push(format!("Assumptions: {}", state.turn.assumptions.join(" ")));
    }
    if let Some(limitation) = limitation_paragraph(state) {
        parts.push(limitation);
    }
    parts.join("\n\n")
}

/// Failures of this turn, summarized by category, never verbatim.
pub fn limitation_paragraph(state: &ConversationState) -> Option<String> {
    let mut reasons: Vec<&'static str> = Vec::new();
    let failed = state.turn_failures().filter_map(|step| step.error.as_ref());
    let terminal = state.turn.terminal_error.as_ref().map(|turn_error| &turn_error.error);
    for error in failed.chain(terminal) {
        let reason = failure_category(&error.code);
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
    if reasons.is_empty() {
        return None;
    }
    Some(format!(
        "Limitation: I could not complete part of this request because {}.",
        reasons.join("; ")
    ))
}

fn failure_category(code: &str) -> &'static str {
    match code {
        codes::TIMEOUT | codes::RATE_LIMITED => "a data source did not respond in time",
        codes::NO_SUCH_COLUMN
        | codes::NO_SUCH_TABLE
        | codes::QUERY_SYNTAX_ERROR
        | codes::INVALID_ARGUMENTS => "a query could not be run against the available data",
        codes::UNKNOWN_TOOL => "a required tool is not available",
        codes::LOOP_DETECTED => "repeated corrections did not resolve a tool error",
        codes::MODEL_UNAVAILABLE => "the planning service was unavailable",
        codes::PERMISSION_DENIED => "access to a data source was denied",
        codes::NOT_FOUND => "the requested data was not found",
        _ => "a step failed unexpectedly",
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("text").and_then(Value::as_str) {
            Some(text) if map.len() == 1 => text.to_string(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use stepwise_core::domain::message::Message;
    use stepwise_core::domain::state::{ConversationState, TurnError};
    use stepwise_core::domain::step::{Step, StepDraft, StepId};
    use stepwise_core::domain::tool::{codes, ToolError};

    use super::{fallback_answer, limitation_paragraph, AnswerComposer};
    use crate::test_support::ScriptedModel;

    fn state() -> ConversationState {
        let mut state = ConversationState::new("thread-compose");
        state.turn_index = 1;
        state.append(Message::user("How did AAPL trade this week?"));
        let mut done = Step::from_draft(
            StepId::scoped(1, 1),
            1,
            1,
            StepDraft { instruction: "Baseline".into(), goal: "Baseline metrics".into(), ..StepDraft::default() },
        );
        done.start().expect("start");
        done.complete(json!({"text": "AAPL closed up 2%"})).expect("complete");
        state.steps.push(done);
        state
    }

    #[tokio::test]
    async fn model_draft_is_used_when_available() {
        let model = Arc::new(ScriptedModel::default().with_completion("  AAPL rose 2% this week.  "));
        let answer = AnswerComposer::new(model).compose(&state()).await;
        assert_eq!(answer, "AAPL rose 2% this week.");
    }

    #[tokio::test]
    async fn fallback_lists_findings_and_limitations() {
        let mut state = state();
        let mut failed = Step::from_draft(
            StepId::scoped(1, 2),
            1,
            1,
            StepDraft { instruction: "Query volume".into(), ..StepDraft::default() },
        );
        failed.start().expect("start");
        failed
            .fail(ToolError::new(codes::NO_SUCH_TABLE, "relation \"vol\" does not exist"))
            .expect("fail");
        state.steps.push(failed);

        let model = Arc::new(ScriptedModel::default().with_completion_error());
        let answer = AnswerComposer::new(model).compose(&state).await;

        assert!(answer.starts_with("Here is what I found:"));
        assert!(answer.contains("Baseline metrics: AAPL closed up 2%"));
        assert!(answer.contains("Limitation:"));
        assert!(!answer.contains("no_such_table"));
        assert!(!answer.contains("relation"));
    }

    #[test]
    fn terminal_error_is_summarized_once_per_category() {
        let mut state = state();
        state.turn.terminal_error = Some(TurnError {
            step_id: None,
            error: ToolError::new(codes::TIMEOUT, "upstream timed out after 30s"),
        });
        let limitation = limitation_paragraph(&state).expect("limitation present");
        assert_eq!(
            limitation,
            "Limitation: I could not complete part of this request because a data source did not \
             respond in time."
        );
        assert!(fallback_answer(&state).ends_with(&limitation));
    }
}
