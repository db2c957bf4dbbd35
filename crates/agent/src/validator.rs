//! Answer validation and the single-pass rewriter.
//!
//! Deterministic checks always win over the optional model check. Every
//! non-accept decision spends a per-turn budget, so a turn validates at most
//! `max_rewrites + max_escalations + 1` times.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use stepwise_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use stepwise_core::config::ValidatorConfig;
use stepwise_core::domain::feedback::{AnswerDecision, AnswerFeedback, AnswerIssue};
use stepwise_core::domain::state::ConversationState;
use tracing::{debug, info, warn};

use crate::composer::{findings, limitation_paragraph};
use crate::llm::{complete_as, ChatMessage, LanguageModel, StructuredSchema};

pub const UNVERIFIED_NOTE: &str =
    "Note: I could not fully verify this answer; some details may be incomplete.";

const LIMITATION_PHRASES: &[&str] = &[
    "limitation",
    "could not",
    "couldn't",
    "unable to",
    "was not able",
    "wasn't able",
    "not available",
    "unavailable",
    "incomplete",
    "failed",
];

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    decision: AnswerDecision,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    rewrite_instructions: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct AnswerValidator {
    model: Option<Arc<dyn LanguageModel>>,
    config: ValidatorConfig,
    max_rewrites: u32,
    max_escalations: u32,
    audit: Arc<dyn AuditSink>,
}

impl AnswerValidator {
    pub fn new(
        model: Option<Arc<dyn LanguageModel>>,
        config: ValidatorConfig,
        max_rewrites: u32,
        max_escalations: u32,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { model, config, max_rewrites, max_escalations, audit }
    }

    pub async fn validate(
        &self,
        state: &ConversationState,
        draft: &str,
        audit: &AuditContext,
    ) -> AnswerFeedback {
        let issues = deterministic_issues(state, draft, self.config.min_answer_chars);
        let feedback = if !issues.is_empty() {
            let reason = issues.iter().map(AnswerIssue::describe).collect::<Vec<_>>().join("; ");
            self.within_budget(
                state,
                AnswerFeedback {
                    decision: AnswerDecision::Rewrite,
                    reason,
                    rewrite_instructions: Some(rewrite_instructions(&issues)),
                    issues,
                    confidence: None,
                },
            )
        } else {
            match (&self.model, self.config.model_check) {
                (Some(model), true) => match self.model_check(model.as_ref(), state, draft).await {
                    Some(feedback) => self.within_budget(state, feedback),
                    None => AnswerFeedback::accept("model check unavailable"),
                },
                _ => AnswerFeedback::accept("deterministic checks passed"),
            }
        };

        let decision = decision_str(feedback.decision);
        info!(
            event_name = "validator.decision",
            thread_id = %state.thread_id,
            decision,
            issues = feedback.issues.len(),
            rewrites_used = state.turn.answer_revision_attempts,
            escalations_used = state.turn.master_escalations_from_validation,
            "answer validated"
        );
        self.audit.emit(
            AuditEvent::new(
                audit,
                "validator.decision",
                AuditCategory::Validation,
                if feedback.decision == AnswerDecision::Accept {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Rejected
                },
            )
            .with_metadata("decision", decision)
            .with_metadata("reason", feedback.reason.clone()),
        );
        feedback
    }

    /// Downgrades a rejection to the next budget that still has room; accepts
    /// once both are spent.
    fn within_budget(&self, state: &ConversationState, feedback: AnswerFeedback) -> AnswerFeedback {
        let turn = &state.turn;
        let rewrite_left = turn.answer_revision_attempts < self.max_rewrites;
        let escalation_left = turn.master_escalations_from_validation < self.max_escalations;
        let decision = match feedback.decision {
            AnswerDecision::Accept => AnswerDecision::Accept,
            AnswerDecision::Rewrite if rewrite_left => AnswerDecision::Rewrite,
            AnswerDecision::Escalate if escalation_left => AnswerDecision::Escalate,
            _ if escalation_left => AnswerDecision::Escalate,
            _ if rewrite_left => AnswerDecision::Rewrite,
            _ => {
                return AnswerFeedback {
                    decision: AnswerDecision::Accept,
                    reason: format!("budgets exhausted: {}", feedback.reason),
                    ..feedback
                };
            }
        };
        AnswerFeedback { decision, ..feedback }
    }

    async fn model_check(
        &self,
        model: &dyn LanguageModel,
        state: &ConversationState,
        draft: &str,
    ) -> Option<AnswerFeedback> {
        let schema = StructuredSchema::new(
            "answer_review",
            json!({
                "type": "object",
                "properties": {
                    "decision": {"type": "string", "enum": ["accept", "rewrite", "escalate"]},
                    "reason": {"type": "string"},
                    "issues": {"type": "array", "items": {"type": "string"}},
                    "rewrite_instructions": {"type": ["string", "null"]},
                    "confidence": {"type": ["number", "null"]}
                },
                "required": ["decision"]
            }),
        );
        let messages = [
            ChatMessage::system(
                "Review the draft answer against the request and findings. Accept it when it \
                 answers the request faithfully. Ask for a rewrite when the wording or format is \
                 the problem, and escalate when more work is needed.",
            ),
            ChatMessage::user(format!(
                "Request:\n{}\n\nFindings:\n{}\n\nDraft answer:\n{draft}",
                state.request_text(),
                findings(state).join("\n")
            )),
        ];
        match complete_as::<ModelVerdict>(model, &messages, &schema).await {
            Ok(verdict) => {
                let mut issues =
                    verdict.issues.into_iter().map(AnswerIssue::Reported).collect::<Vec<_>>();
                if issues.is_empty() && verdict.decision != AnswerDecision::Accept {
                    issues.push(AnswerIssue::Reported(verdict.reason.clone()));
                }
                Some(AnswerFeedback {
                    decision: verdict.decision,
                    reason: verdict.reason,
                    issues,
                    rewrite_instructions: verdict.rewrite_instructions,
                    confidence: verdict.confidence,
                })
            }
            Err(error) => {
                debug!(event_name = "validator.model_check_failed", error = %error, "failing open");
                None
            }
        }
    }
}

/// Final text for an accepted answer. An acceptance that still carries
/// issues gets the unverified note.
pub fn finalize(draft: &str, feedback: &AnswerFeedback) -> String {
    if feedback.decision == AnswerDecision::Accept && !feedback.issues.is_empty() {
        return format!("{}\n\n{UNVERIFIED_NOTE}", draft.trim_end());
    }
    draft.to_string()
}

pub fn deterministic_issues(
    state: &ConversationState,
    draft: &str,
    min_chars: usize,
) -> Vec<AnswerIssue> {
    let mut issues = Vec::new();
    if draft.trim().chars().count() < min_chars {
        issues.push(AnswerIssue::EmptyAnswer);
    }
    let failed_this_turn = state.turn.terminal_error.is_some()
        || state.turn_failures().next().is_some();
    if failed_this_turn && !mentions_limitation(draft) {
        issues.push(AnswerIssue::MissingLimitation);
    }
    if comparable_records(state).is_some() && !has_markdown_table(draft) {
        issues.push(AnswerIssue::TabularDataNotTabulated);
    }
    issues
}

fn mentions_limitation(draft: &str) -> bool {
    let lower = draft.to_lowercase();
    LIMITATION_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

fn has_markdown_table(draft: &str) -> bool {
    let mut previous_has_pipe = false;
    for line in draft.lines().map(str::trim) {
        let separator = line.contains('|')
            && line.contains("---")
            && line.chars().all(|ch| matches!(ch, '|' | '-' | ':' | ' '));
        if separator && previous_has_pipe {
            return true;
        }
        previous_has_pipe = line.contains('|');
    }
    false
}

/// First completed output holding two or more records with the same keys.
fn comparable_records(state: &ConversationState) -> Option<Vec<Map<String, Value>>> {
    state.completed_outputs().into_iter().find_map(|step| {
        let result = step.result.as_ref()?;
        let rows = match result {
            Value::Array(rows) => rows,
            Value::Object(map) => map.get("rows")?.as_array()?,
            _ => return None,
        };
        let records = rows.iter().filter_map(Value::as_object).cloned().collect::<Vec<_>>();
        let first_keys = records.first()?.keys().collect::<BTreeSet<_>>();
        let comparable = records.len() >= 2
            && records.len() == rows.len()
            && records.iter().all(|record| record.keys().collect::<BTreeSet<_>>() == first_keys);
        comparable.then_some(records)
    })
}

fn rewrite_instructions(issues: &[AnswerIssue]) -> String {
    issues
        .iter()
        .map(|issue| match issue {
            AnswerIssue::EmptyAnswer => "Restate the findings in full sentences.".to_string(),
            AnswerIssue::MissingLimitation => {
                "State plainly which part of the request could not be completed.".to_string()
            }
            AnswerIssue::TabularDataNotTabulated => {
                "Present the comparable records as a markdown table.".to_string()
            }
            AnswerIssue::Reported(detail) => detail.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn decision_str(decision: AnswerDecision) -> &'static str {
    match decision {
        AnswerDecision::Accept => "accept",
        AnswerDecision::Rewrite => "rewrite",
        AnswerDecision::Escalate => "escalate",
    }
}

pub struct AnswerRewriter {
    model: Arc<dyn LanguageModel>,
}

impl AnswerRewriter {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// One rewrite pass. The result goes back through validation.
    pub async fn rewrite(
        &self,
        state: &ConversationState,
        draft: &str,
        feedback: &AnswerFeedback,
    ) -> String {
        let messages = [
            ChatMessage::system(
                "Revise the draft answer so it fixes every listed issue. Keep every fact from \
                 the findings and do not invent new ones. Reply with the revised answer only.",
            ),
            ChatMessage::user(format!(
                "Request:\n{}\n\nFindings:\n{}\n\nDraft answer:\n{draft}\n\nIssues: {}\n\n\
                 Instructions: {}",
                state.request_text(),
                findings(state).join("\n"),
                feedback.reason,
                feedback.rewrite_instructions.as_deref().unwrap_or("none")
            )),
        ];
        match self.model.complete(&messages).await {
            Ok(reply) if !reply.content.trim().is_empty() => reply.content.trim().to_string(),
            Ok(_) => patch(state, draft, feedback),
            Err(error) => {
                warn!(
                    event_name = "validator.rewrite_fallback",
                    thread_id = %state.thread_id,
                    error = %error,
                    "patching answer without the model"
                );
                patch(state, draft, feedback)
            }
        }
    }
}

/// Deterministic fixes for the deterministic issues.
fn patch(state: &ConversationState, draft: &str, feedback: &AnswerFeedback) -> String {
    let mut answer = draft.trim().to_string();
    for issue in &feedback.issues {
        let addition = match issue {
            AnswerIssue::EmptyAnswer => {
                let found = findings(state);
                if found.is_empty() {
                    None
                } else {
                    Some(format!("Here is what I found:\n{}", found.join("\n")))
                }
            }
            AnswerIssue::MissingLimitation => Some(limitation_paragraph(state).unwrap_or_else(|| {
                "Limitation: part of this request could not be completed.".to_string()
            })),
            AnswerIssue::TabularDataNotTabulated => {
                comparable_records(state).map(|records| render_table(&records))
            }
            AnswerIssue::Reported(_) => None,
        };
        if let Some(addition) = addition {
            if !answer.is_empty() {
                answer.push_str("\n\n");
            }
            answer.push_str(&addition);
        }
    }
    answer
}

fn render_table(records: &[Map<String, Value>]) -> String {
    let Some(first) = records.first() else {
        return String::new();
    };
    let headers = first.keys().cloned().collect::<Vec<_>>();
    let mut lines = vec![
        format!("| {} |", headers.join(" | ")),
        format!("|{}", " --- |".repeat(headers.len())),
    ];
    for record in records {
        let cells = headers
            .iter()
            .map(|key| match record.get(key) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect::<Vec<_>>();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}
