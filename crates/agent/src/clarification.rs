//! Clarification prompts and resolution of the user's reply.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use stepwise_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use stepwise_core::domain::intent::{Ambiguity, AmbiguityKind};
use stepwise_core::domain::message::Role;
use stepwise_core::domain::state::{
    ClarificationOption, ClarificationResolution, ClarifiedQuestion, ConversationState,
    PendingClarification,
};
use tracing::{debug, info};

use crate::guardrails::explicit_targets;
use crate::llm::{complete_as, ChatMessage, LanguageModel, StructuredSchema};

const MAX_OPTIONS: usize = 3;
const MAX_OPTION_WORDS: usize = 8;

const FALLBACK_METHODS: &[&str] = &[
    "Run a baseline analysis",
    "Analyze the price trend and volatility",
    "Compare returns against a benchmark",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClarificationPrompt {
    pub message: String,
    pub options: Vec<ClarificationOption>,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct MethodOptions {
    options: Vec<String>,
}

pub struct ClarificationGate {
    model: Option<Arc<dyn LanguageModel>>,
    audit: Arc<dyn AuditSink>,
}

impl ClarificationGate {
    pub fn new(model: Option<Arc<dyn LanguageModel>>, audit: Arc<dyn AuditSink>) -> Self {
        Self { model, audit }
    }

    /// Builds the prompt and records the question in the thread's ledger.
    pub async fn ask(
        &self,
        state: &mut ConversationState,
        ambiguity: &Ambiguity,
        audit: &AuditContext,
    ) -> ClarificationPrompt {
        let question = match &state.turn.clarified {
            Some(clarified) => clarified.question.clone(),
            None => state.latest_user_text().to_string(),
        };

        let (why, options) = match &ambiguity.kind {
            AmbiguityKind::TargetMismatch { bound, requested } => (
                format!("this conversation is about {bound}, but your message mentions {requested}"),
                vec![
                    option(
                        format!("Switch to {requested}"),
                        ClarificationResolution::BindTarget(requested.clone()),
                    ),
                    option(format!("Stay on {bound}"), ClarificationResolution::KeepBoundTarget),
                    option(
                        format!("Compare {bound} and {requested}"),
                        ClarificationResolution::CompareTargets(vec![
                            bound.clone(),
                            requested.clone(),
                        ]),
                    ),
                ],
            ),
            AmbiguityKind::MultipleTargets { targets } => {
                let mut options = targets
                    .iter()
                    .take(MAX_OPTIONS - 1)
                    .map(|target| {
                        option(
                            format!("Analyze {target}"),
                            ClarificationResolution::BindTarget(target.clone()),
                        )
                    })
                    .collect::<Vec<_>>();
                options.push(option(
                    format!("Compare {}", join_names(targets)),
                    ClarificationResolution::CompareTargets(targets.clone()),
                ));
                (
                    format!("your message mentions several targets ({})", targets.join(", ")),
                    options,
                )
            }
            AmbiguityKind::UnboundCurrentTarget => {
                let mut options = recent_targets(state)
                    .into_iter()
                    .take(MAX_OPTIONS - 1)
                    .map(|target| {
                        option(
                            format!("Analyze {target}"),
                            ClarificationResolution::BindTarget(target),
                        )
                    })
                    .collect::<Vec<_>>();
                options.push(option(
                    "Treat this as a general question",
                    ClarificationResolution::ProceedWithoutTarget,
                ));
                (
                    "your message refers to a current target, but none has been set yet".to_string(),
                    options,
                )
            }
            AmbiguityKind::AnalysisMethodUnspecified => (
                "the request does not say which analysis method to use".to_string(),
                self.method_options(&question).await,
            ),
        };

        let message = render_prompt(&why, &options);
        let ledger = &mut state.clarification;
        ledger.asked_turns += 1;
        ledger.asked_signatures.insert(ambiguity.signature.clone());
        ledger.pending = Some(PendingClarification {
            signature: ambiguity.signature.clone(),
            question,
            options: options.clone(),
        });

        info!(
            event_name = "clarification.asked",
            thread_id = %state.thread_id,
            signature = %ambiguity.signature,
            options = options.len(),
            asked_turns = state.clarification.asked_turns,
            "clarification requested"
        );
        self.audit.emit(
            AuditEvent::new(
                audit,
                "clarification.asked",
                AuditCategory::Guard,
                AuditOutcome::Success,
            )
            .with_metadata("signature", ambiguity.signature.clone())
            .with_metadata("options", options.len().to_string()),
        );

        ClarificationPrompt { message, options, signature: ambiguity.signature.clone() }
    }

    async fn method_options(&self, question: &str) -> Vec<ClarificationOption> {
        let labels = match &self.model {
            Some(model) => suggest_methods(model.as_ref(), question).await,
            None => Vec::new(),
        };
        let labels = if labels.len() >= 2 {
            labels
        } else {
            FALLBACK_METHODS.iter().map(|label| label.to_string()).collect()
        };
        labels
            .into_iter()
            .map(|label| {
                let method = label.to_lowercase();
                option(label, ClarificationResolution::UseMethod(method))
            })
            .collect()
    }
}

async fn suggest_methods(model: &dyn LanguageModel, question: &str) -> Vec<String> {
    let schema = StructuredSchema::new(
        "clarification_options",
        json!({
            "type": "object",
            "properties": {"options": {"type": "array", "items": {"type": "string"}}},
            "required": ["options"]
        }),
    );
    let messages = [
        ChatMessage::system(
            "Suggest up to three short, distinct analysis methods that would answer the \
             request. Each option is a plain imperative phrase of at most eight words.",
        ),
        ChatMessage::user(question),
    ];
    match complete_as::<MethodOptions>(model, &messages, &schema).await {
        Ok(reply) => sanitize_options(reply.options),
        Err(error) => {
            debug!(
                event_name = "clarification.options_fallback",
                error = %error,
                "using templated method options"
            );
            Vec::new()
        }
    }
}

/// Matches a reply against the pending options: a number, `option N`, `#N`,
/// a label, or a single identifier.
pub fn resolve(pending: &PendingClarification, reply: &str) -> Option<ClarifiedQuestion> {
    let chosen = pick_option(pending, reply)?;
    Some(ClarifiedQuestion {
        question: pending.question.clone(),
        signature: pending.signature.clone(),
        label: chosen.label,
        resolution: chosen.resolution,
    })
}

fn pick_option(pending: &PendingClarification, reply: &str) -> Option<ClarificationOption> {
    let trimmed = reply.trim();
    let lower = trimmed.to_lowercase();

    let numeral = lower
        .strip_prefix("option")
        .or_else(|| lower.strip_prefix('#'))
        .unwrap_or(lower.as_str())
        .trim()
        .trim_end_matches(['.', ')']);
    if let Ok(number) = numeral.parse::<usize>() {
        return number.checked_sub(1).and_then(|index| pending.options.get(index)).cloned();
    }

    if let Some(exact) =
        pending.options.iter().find(|candidate| candidate.label.to_lowercase() == lower)
    {
        return Some(exact.clone());
    }

    let targets = explicit_targets(trimmed);
    if let [target] = targets.as_slice() {
        let bound = pending.options.iter().find(|candidate| {
            matches!(&candidate.resolution, ClarificationResolution::BindTarget(t) if t == target)
        });
        if let Some(bound) = bound {
            return Some(bound.clone());
        }
        if pending.signature == "unbound_current_target" {
            return Some(option(
                format!("Analyze {target}"),
                ClarificationResolution::BindTarget(target.clone()),
            ));
        }
    }

    if lower.chars().count() >= 3 {
        let mut partial = pending
            .options
            .iter()
            .filter(|candidate| candidate.label.to_lowercase().contains(&lower));
        if let (Some(only), None) = (partial.next(), partial.next()) {
            return Some(only.clone());
        }
    }
    None
}

fn render_prompt(why: &str, options: &[ClarificationOption]) -> String {
    let listed = options
        .iter()
        .enumerate()
        .map(|(index, option)| format!("{}. {}", index + 1, option.label))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "I need one detail before I continue: {why}.\n\n{listed}\n\nReply with the option number \
         (1-{}) or restate your request.",
        options.len()
    )
}

/// Identifiers from earlier user messages, most recent first.
fn recent_targets(state: &ConversationState) -> Vec<String> {
    let mut seen = Vec::new();
    for message in state.messages.entries().iter().rev() {
        if message.role != Role::User {
            continue;
        }
        for target in explicit_targets(&message.content) {
            if !seen.contains(&target) {
                seen.push(target);
            }
        }
    }
    seen
}

fn sanitize_options(raw: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for candidate in raw {
        let Some(label) = sanitize_option(&candidate) else {
            continue;
        };
        if cleaned.iter().any(|existing| existing.eq_ignore_ascii_case(&label)) {
            continue;
        }
        cleaned.push(label);
        if cleaned.len() == MAX_OPTIONS {
            break;
        }
    }
    cleaned
}

fn sanitize_option(raw: &str) -> Option<String> {
    let text = raw
        .trim()
        .trim_start_matches(|ch: char| {
            ch.is_ascii_digit() || matches!(ch, '.' | ')' | '-' | '*' | '•' | ' ')
        })
        .trim_matches(|ch| matches!(ch, '"' | '\'' | '`'))
        .trim_end_matches(|ch| matches!(ch, '.' | '!' | '?' | ':' | ';' | ','))
        .trim();
    let words = text.split_whitespace().count();
    if words == 0 || words > MAX_OPTION_WORDS {
        return None;
    }
    let mut chars = text.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

fn join_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

fn option(label: impl Into<String>, resolution: ClarificationResolution) -> ClarificationOption {
    ClarificationOption { label: label.into(), resolution }
}
