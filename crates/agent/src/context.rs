//! Token-budget-aware compaction of the message history.

use std::sync::Arc;

use stepwise_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use stepwise_core::config::ContextConfig;
use stepwise_core::domain::message::{Message, Role};
use stepwise_core::domain::state::ConversationState;
use tracing::{info, warn};

use crate::llm::{ChatMessage, LanguageModel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompactionOutcome {
    BelowTrigger,
    /// Nothing between the cursor and the recent window.
    NothingToFold,
    /// The range held only non-retained entries; the cursor moved without a
    /// model call.
    SkippedEmptyChunk { cursor: usize },
    Compacted { folded: usize, cursor: usize },
    ModelUnavailable,
}

pub struct ContextManager {
    model: Arc<dyn LanguageModel>,
    config: ContextConfig,
    audit: Arc<dyn AuditSink>,
}

impl ContextManager {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        config: ContextConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { model, config, audit }
    }

    pub async fn compact(
        &self,
        state: &mut ConversationState,
        audit: &AuditContext,
    ) -> CompactionOutcome {
        state.token_estimate = estimate_tokens(state);
        if state.token_estimate < self.config.trigger_tokens {
            return CompactionOutcome::BelowTrigger;
        }

        let end = state.messages.len().saturating_sub(self.config.recent_window);
        if end <= state.summary_cursor {
            return CompactionOutcome::NothingToFold;
        }

        let chunk = state
            .messages
            .slice(state.summary_cursor, end)
            .iter()
            .filter(|message| message.is_retained())
            .collect::<Vec<_>>();
        if chunk.is_empty() {
            state.summary_cursor = end;
            return CompactionOutcome::SkippedEmptyChunk { cursor: end };
        }

        let prompt = fold_prompt(&state.summary, &chunk);
        let folded = chunk.len();
        let summary = match self.model.complete(&prompt).await {
            Ok(reply) => reply.content,
            Err(error) => {
                warn!(
                    event_name = "context.compaction_failed",
                    thread_id = %state.thread_id,
                    error = %error,
                    "summary model call failed; history left as-is"
                );
                self.audit.emit(
                    AuditEvent::new(
                        audit,
                        "context.compacted",
                        AuditCategory::Context,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("reason", "model_unavailable"),
                );
                return CompactionOutcome::ModelUnavailable;
            }
        };

        state.summary = cap_chars(summary.trim(), self.config.summary_max_chars);
        state.summary_cursor = end;
        state.token_estimate = estimate_tokens(state);

        info!(
            event_name = "context.compacted",
            thread_id = %state.thread_id,
            folded,
            cursor = end,
            token_estimate = state.token_estimate,
            "history folded into summary"
        );
        self.audit.emit(
            AuditEvent::new(audit, "context.compacted", AuditCategory::Context, AuditOutcome::Success)
                .with_metadata("folded", folded.to_string())
                .with_metadata("cursor", end.to_string()),
        );
        CompactionOutcome::Compacted { folded, cursor: end }
    }
}

/// Rough token count: one token per four characters of summary plus visible
/// history.
pub fn estimate_tokens(state: &ConversationState) -> usize {
    let chars = state.summary.chars().count()
        + state
            .messages
            .projection(state.summary_cursor)
            .map(|message| message.content.chars().count())
            .sum::<usize>();
    chars.div_ceil(4)
}

/// Model-facing history: the rolling summary, then every retained message
/// after the cursor.
pub fn model_history(state: &ConversationState) -> Vec<ChatMessage> {
    let mut history = Vec::new();
    if !state.summary.is_empty() {
        history.push(ChatMessage::system(format!(
            "Summary of the earlier conversation:\n{}",
            state.summary
        )));
    }
    history.extend(state.messages.projection(state.summary_cursor).map(|message| ChatMessage {
        role: message.role,
        content: message.content.clone(),
    }));
    history
}

fn fold_prompt(summary: &str, chunk: &[&Message]) -> Vec<ChatMessage> {
    let transcript = chunk
        .iter()
        .map(|message| format!("{}: {}", speaker(message.role), message.content))
        .collect::<Vec<_>>()
        .join("\n");
    let existing = if summary.is_empty() { "(none)" } else { summary };
    vec![
        ChatMessage::system(
            "You maintain a rolling summary of a conversation. Merge the existing summary with \
             the new messages. Keep targets, decisions, findings and open questions. Reply with \
             the summary text only.",
        ),
        ChatMessage::user(format!("Existing summary:\n{existing}\n\nNew messages:\n{transcript}")),
    ]
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
        Role::Tool => "Tool",
    }
}

pub(crate) fn cap_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut capped = text.chars().take(max_chars.saturating_sub(1)).collect::<String>();
    capped.push('…');
    capped
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stepwise_core::audit::{AuditContext, InMemoryAuditSink};
    use stepwise_core::config::ContextConfig;
    use stepwise_core::domain::message::{Message, MessageKind};
    use stepwise_core::domain::state::ConversationState;

    use super::{cap_chars, estimate_tokens, model_history, CompactionOutcome, ContextManager};
    use crate::test_support::ScriptedModel;

    fn config() -> ContextConfig {
        ContextConfig { trigger_tokens: 10, recent_window: 2, summary_max_chars: 40 }
    }

    fn long_state(count: usize) -> ConversationState {
        let mut state = ConversationState::new("thread-ctx");
        for index in 0..count {
            state.append(Message::user(format!("message number {index} about AAPL prices")));
        }
        state
    }

    fn manager(model: Arc<ScriptedModel>) -> ContextManager {
        ContextManager::new(model, config(), Arc::new(InMemoryAuditSink::default()))
    }

    fn audit() -> AuditContext {
        AuditContext::new("thread-ctx", "req-1", "context")
    }

    #[tokio::test]
    async fn below_trigger_only_refreshes_estimate() {
        let model = Arc::new(ScriptedModel::default());
        let mut state = ConversationState::new("thread-ctx");
        state.append(Message::user("hi"));

        let outcome = manager(model.clone()).compact(&mut state, &audit()).await;
        assert_eq!(outcome, CompactionOutcome::BelowTrigger);
        assert_eq!(state.token_estimate, 1);
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn folds_everything_but_recent_window_and_caps_summary() {
        let model = Arc::new(ScriptedModel::default().with_completion("x".repeat(100)));
        let mut state = long_state(6);

        let outcome = manager(model.clone()).compact(&mut state, &audit()).await;
        assert_eq!(outcome, CompactionOutcome::Compacted { folded: 4, cursor: 4 });
        assert_eq!(state.summary_cursor, 4);
        assert_eq!(state.summary.chars().count(), 40);
        assert!(state.summary.ends_with('…'));
        assert_eq!(state.messages.projection(state.summary_cursor).count(), 2);
    }

    #[tokio::test]
    async fn second_compaction_without_new_messages_does_not_call_model() {
        let model = Arc::new(ScriptedModel::default().with_completion("summary of AAPL talk"));
        let mut state = long_state(6);
        let manager = manager(model.clone());

        manager.compact(&mut state, &audit()).await;
        let cursor = state.summary_cursor;
        let outcome = manager.compact(&mut state, &audit()).await;

        assert_eq!(state.summary_cursor, cursor);
        assert_ne!(outcome, CompactionOutcome::Compacted { folded: 4, cursor: 4 });
        assert_eq!(model.count("complete"), 1);
    }

    #[tokio::test]
    async fn empty_chunk_advances_cursor_without_model_call() {
        let model = Arc::new(ScriptedModel::default());
        let mut state = ConversationState::new("thread-ctx");
        for _ in 0..4 {
            state.append(
                Message::assistant("scratch note that is long enough to count")
                    .with_kind(MessageKind::Ephemeral),
            );
        }
        for _ in 0..2 {
            state.append(Message::user("a retained message that keeps the estimate high"));
        }

        let outcome = manager(model.clone()).compact(&mut state, &audit()).await;
        assert_eq!(outcome, CompactionOutcome::SkippedEmptyChunk { cursor: 4 });
        assert_eq!(state.summary_cursor, 4);
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn model_failure_leaves_state_unchanged() {
        let model = Arc::new(ScriptedModel::default().with_completion_error());
        let mut state = long_state(6);

        let outcome = manager(model).compact(&mut state, &audit()).await;
        assert_eq!(outcome, CompactionOutcome::ModelUnavailable);
        assert_eq!(state.summary_cursor, 0);
        assert!(state.summary.is_empty());
    }

    #[test]
    fn history_starts_with_summary() {
        let mut state = long_state(3);
        state.summary = "earlier: user asked about AAPL".to_string();
        state.summary_cursor = 2;

        let history = model_history(&state);
        assert_eq!(history.len(), 2);
        assert!(history[0].content.contains("earlier"));
        assert!(estimate_tokens(&state) > 0);
    }

    #[test]
    fn cap_keeps_short_text() {
        assert_eq!(cap_chars("short", 10), "short");
        assert_eq!(cap_chars("abcdef", 4), "abc…");
    }
}
