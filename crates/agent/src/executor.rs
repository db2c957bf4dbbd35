//! Executor: runs the first open step through a bounded,
//! signature-deduplicated correction loop.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use stepwise_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use stepwise_core::config::ToolNamesConfig;
use stepwise_core::domain::message::{Message, MessageKind, Role};
use stepwise_core::domain::state::ConversationState;
use stepwise_core::domain::step::{CorrectionSource, RetryRecord, Step, StepStatus};
use stepwise_core::domain::tool::{codes, ToolArgs, ToolError, ToolResult};
use stepwise_core::errors::ApplicationError;
use stepwise_core::signature::attempt_signature;
use tracing::{debug, info, warn};

use crate::context::{cap_chars, model_history};
use crate::llm::{ChatMessage, LanguageModel};
use crate::schema::SchemaCatalog;
use crate::tools::ToolRegistry;

const AGGREGATE_MARKERS: &[&str] = &["count(", "sum(", "avg(", "min(", "max("];
const QUERY_ARG_KEYS: &[&str] = &["query", "sql"];

const EMPTY_RESULT_HINT: &str = "The previous call returned no data. Adjust the arguments, for \
example widen the date range or relax the filters, and keep the same tool.";

/// What one `execute_one` call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed,
    /// Empty result; the step is pending again for one same-tool retry.
    Requeued,
    /// Attempt budget was already spent.
    Skipped,
    /// No open step.
    Idle,
}

enum Proposal {
    Call { tool: String, args: ToolArgs },
    Answer(String),
    Unavailable(String),
}

pub struct Executor {
    model: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    catalog: Option<Arc<dyn SchemaCatalog>>,
    tools: ToolNamesConfig,
    max_attempts: u32,
    audit: Arc<dyn AuditSink>,
}

impl Executor {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        catalog: Option<Arc<dyn SchemaCatalog>>,
        tools: ToolNamesConfig,
        max_attempts: u32,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { model, registry, catalog, tools, max_attempts, audit }
    }

    pub async fn execute_one(
        &self,
        state: &mut ConversationState,
        audit: &AuditContext,
    ) -> Result<StepOutcome, ApplicationError> {
        let Some(index) = state.first_open_index() else {
            return Ok(StepOutcome::Idle);
        };
        let mut step = state.steps[index].clone();
        let mut notes = Vec::new();

        let outcome = self.run(state, &mut step, &mut notes, audit).await?;

        info!(
            event_name = "executor.step_finished",
            thread_id = %state.thread_id,
            step_id = %step.id,
            status = step.status.as_str(),
            attempts = step.attempts,
            error_code = step.error.as_ref().map(|e| e.code.as_str()).unwrap_or(""),
            "step finished"
        );
        state.steps[index] = step;
        for note in notes {
            state.append(note);
        }
        Ok(outcome)
    }

    async fn run(
        &self,
        state: &ConversationState,
        step: &mut Step,
        notes: &mut Vec<Message>,
        audit: &AuditContext,
    ) -> Result<StepOutcome, ApplicationError> {
        if step.status == StepStatus::Running {
            step.fail(ToolError::new(codes::EXECUTION_EXCEPTION, "the step was interrupted"))?;
            return Ok(StepOutcome::Failed);
        }
        if step.attempts >= self.max_attempts {
            warn!(
                event_name = "executor.attempts_exhausted",
                thread_id = %state.thread_id,
                step_id = %step.id,
                attempts = step.attempts,
                "skipping step with no attempts left"
            );
            step.skip();
            return Ok(StepOutcome::Skipped);
        }

        let (mut tool, mut args) = match self.propose(state, step).await {
            Proposal::Call { tool, args } => (tool, args),
            Proposal::Answer(text) => {
                step.start()?;
                step.complete(json!({ "text": text }))?;
                step.record_retry(record(step, "model", ToolArgs::new(), "answered_by_model"));
                notes.push(internal_note(format!("{} answered by the model (source=model)", step.id)));
                return Ok(StepOutcome::Done);
            }
            Proposal::Unavailable(reason) => {
                step.start()?;
                let error = ToolError::new(codes::MODEL_UNAVAILABLE, "no tool call could be proposed");
                step.fail(error.clone())?;
                let mut entry = record(step, "model", ToolArgs::new(), reason);
                entry.error = Some(error);
                step.record_retry(entry);
                return Ok(StepOutcome::Failed);
            }
        };

        let mut tried = BTreeSet::new();
        loop {
            step.start()?;
            let signature = attempt_signature(&tool, &args);
            tried.insert(signature.clone());
            step.last_attempt_signature = Some(signature);
            info!(
                event_name = "executor.attempt",
                thread_id = %state.thread_id,
                step_id = %step.id,
                tool = %tool,
                attempt = step.attempts,
                "invoking tool"
            );

            let result = self.registry.invoke(&tool, args.clone()).await;
            notes.push(internal_note(format!(
                "{tool}: {}",
                serde_json::to_string(&result).unwrap_or_default()
            )));

            let error = match result {
                ToolResult::Success { data, .. } => {
                    if is_empty_result(&data, &args)
                        && !step.empty_retry_used
                        && step.attempts < self.max_attempts
                    {
                        step.requeue_after_empty(EMPTY_RESULT_HINT)?;
                        let mut entry = record(step, &tool, args.clone(), "empty_result");
                        entry.source = CorrectionSource::EmptyResult;
                        step.record_retry(entry);
                        return Ok(StepOutcome::Requeued);
                    }
                    step.complete(data)?;
                    step.record_retry(record(step, &tool, args.clone(), "succeeded"));
                    return Ok(StepOutcome::Done);
                }
                ToolResult::Failure { error, .. } => error,
            };

            step.fail(error.clone())?;
            let mut entry = record(step, &tool, args.clone(), "");
            entry.error = Some(error.clone());

            if !error.is_retryable() || step.attempts >= self.max_attempts {
                entry.reason = if error.is_retryable() {
                    "attempts_exhausted".to_string()
                } else {
                    "not_retryable".to_string()
                };
                step.record_retry(entry);
                return Ok(StepOutcome::Failed);
            }

            let mut switch_allowed = error.allows_tool_switch();
            if let Some((corrected, reason)) = self.deterministic_correction(&tool, &args, &error) {
                if tried.contains(&attempt_signature(&tool, &corrected)) {
                    switch_allowed = true;
                } else {
                    entry.new_args = Some(corrected.clone());
                    entry.reason = reason;
                    entry.source = CorrectionSource::Deterministic;
                    self.note_correction(state, step, &entry, audit);
                    step.record_retry(entry);
                    step.reopen_with_correction(tool.clone(), corrected.clone())?;
                    args = corrected;
                    continue;
                }
            }

            let Some((new_tool, new_args)) =
                self.model_correction(state, step, &tool, &args, &error, switch_allowed).await
            else {
                entry.reason = "no_correction".to_string();
                step.record_retry(entry);
                return Ok(StepOutcome::Failed);
            };

            entry.new_args = Some(new_args.clone());
            if new_tool == tool {
                entry.source = CorrectionSource::Model;
            } else {
                entry.new_tool = Some(new_tool.clone());
                entry.source = CorrectionSource::ToolSwitch;
            }
            if tried.contains(&attempt_signature(&new_tool, &new_args)) {
                entry.reason = "loop_detected: the correction repeats a failed call".to_string();
                step.record_retry(entry);
                step.error = Some(ToolError::new(
                    codes::LOOP_DETECTED,
                    "the proposed correction repeats a call that already failed",
                ));
                return Ok(StepOutcome::Failed);
            }
            entry.reason = format!("model_correction after `{}`", error.code);
            self.note_correction(state, step, &entry, audit);
            step.record_retry(entry);
            step.reopen_with_correction(new_tool.clone(), new_args.clone())?;
            tool = new_tool;
            args = new_args;
        }
    }

    async fn propose(&self, state: &ConversationState, step: &Step) -> Proposal {
        if let Some(tool) = &step.selected_tool {
            let args = step.tool_args.clone().unwrap_or_default();
            let Some(hint) = &step.retry_hint else {
                return Proposal::Call { tool: tool.clone(), args };
            };
            let messages = step_messages(state, step, Some(hint.as_str()));
            let specs = self.registry.specs_for(&[tool.as_str()]);
            let args = match self.model.complete_with_tools(&messages, &specs).await {
                Ok(reply) => match reply.tool_call {
                    Some(call) if &call.name == tool => call.arguments,
                    _ => args,
                },
                Err(error) => {
                    debug!(event_name = "executor.retry_hint_ignored", error = %error, "keeping arguments");
                    args
                }
            };
            return Proposal::Call { tool: tool.clone(), args };
        }

        let messages = step_messages(state, step, None);
        match self.model.complete_with_tools(&messages, &self.registry.specs()).await {
            Ok(reply) => match (reply.tool_call, reply.text) {
                (Some(call), _) => Proposal::Call { tool: call.name, args: call.arguments },
                (None, Some(text)) => Proposal::Answer(text),
                (None, None) => Proposal::Unavailable("model_returned_nothing".to_string()),
            },
            Err(error) => {
                warn!(
                    event_name = "executor.model_unavailable",
                    thread_id = %state.thread_id,
                    step_id = %step.id,
                    error = %error,
                    "no tool call proposed"
                );
                Proposal::Unavailable("model_unavailable".to_string())
            }
        }
    }

    /// Rewrites an unknown column in a query using the schema catalog.
    fn deterministic_correction(
        &self,
        tool: &str,
        args: &ToolArgs,
        error: &ToolError,
    ) -> Option<(ToolArgs, String)> {
        if tool != self.tools.query {
            return None;
        }
        let catalog = self.catalog.as_ref()?;
        let informal = missing_column(&error.message).or_else(|| {
            (error.code == codes::NO_SUCH_COLUMN)
                .then(|| error.message.trim().to_string())
                .filter(|name| !name.contains(char::is_whitespace))
        })?;
        let bare = informal.rsplit('.').next().unwrap_or(informal.as_str()).to_string();
        let exact = catalog.resolve_field(&informal)?;
        if exact.eq_ignore_ascii_case(&bare) {
            return None;
        }

        let key = QUERY_ARG_KEYS.iter().find(|key| args.get(**key).is_some_and(Value::is_string))?;
        let query = args.get(*key).and_then(Value::as_str)?;
        let rewritten = replace_identifier(query, &bare, &exact)?;
        let mut corrected = args.clone();
        corrected.insert((*key).to_string(), Value::String(rewritten));
        Some((
            corrected,
            format!("deterministic_correction: mapped column `{bare}` to `{exact}` from schema metadata"),
        ))
    }

    async fn model_correction(
        &self,
        state: &ConversationState,
        step: &Step,
        tool: &str,
        args: &ToolArgs,
        error: &ToolError,
        switch_allowed: bool,
    ) -> Option<(String, ToolArgs)> {
        let specs =
            if switch_allowed { self.registry.specs() } else { self.registry.specs_for(&[tool]) };
        let failure = format!(
            "The call `{tool}` with arguments {} failed with `{}`: {}. Propose a corrected call.",
            Value::Object(args.clone()),
            error.code,
            cap_chars(&error.message, 300)
        );
        let messages = step_messages(state, step, Some(&failure));
        match self.model.complete_with_tools(&messages, &specs).await {
            Ok(reply) => reply
                .tool_call
                .filter(|call| specs.iter().any(|spec| spec.name == call.name))
                .map(|call| (call.name, call.arguments)),
            Err(model_error) => {
                debug!(
                    event_name = "executor.correction_unavailable",
                    error = %model_error,
                    "model could not propose a correction"
                );
                None
            }
        }
    }

    fn note_correction(
        &self,
        state: &ConversationState,
        step: &Step,
        entry: &RetryRecord,
        audit: &AuditContext,
    ) {
        info!(
            event_name = "executor.correction",
            thread_id = %state.thread_id,
            step_id = %step.id,
            attempt = entry.attempt,
            source = ?entry.source,
            reason = %entry.reason,
            "step corrected"
        );
        let mut event = AuditEvent::new(
            audit,
            "executor.correction",
            AuditCategory::Execution,
            AuditOutcome::Success,
        )
        .with_metadata("step_id", step.id.to_string())
        .with_metadata("attempt", entry.attempt.to_string())
        .with_metadata("reason", entry.reason.clone());
        if let Some(error) = &entry.error {
            event = event.with_metadata("error_code", error.code.clone());
        }
        if let Some(new_tool) = &entry.new_tool {
            event = event.with_metadata("new_tool", new_tool.clone());
        }
        self.audit.emit(event);
    }
}

fn record(step: &Step, tool: &str, old_args: ToolArgs, reason: impl Into<String>) -> RetryRecord {
    RetryRecord {
        attempt: step.attempts,
        tool: tool.to_string(),
        old_args,
        new_args: None,
        new_tool: None,
        error: None,
        reason: reason.into(),
        source: CorrectionSource::None,
        recorded_at: Utc::now(),
    }
}

fn internal_note(content: String) -> Message {
    Message::new(Role::Tool, content).with_kind(MessageKind::ToolInternal)
}

fn step_messages(state: &ConversationState, step: &Step, extra: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(
        "You execute one step of a plan. Call exactly one of the offered tools with complete \
         arguments. If no tool is needed, answer the step in plain text.",
    )];
    messages.extend(model_history(state));

    let mut brief = format!("Step {}: {}\nGoal: {}", step.id, step.instruction, step.goal);
    if !step.success_criteria.is_empty() {
        brief.push_str(&format!("\nSuccess criteria: {}", step.success_criteria));
    }
    if !step.constraints.is_empty() {
        brief.push_str(&format!("\nConstraints: {}", step.constraints.join("; ")));
    }
    let earlier = state
        .completed_outputs()
        .into_iter()
        .filter_map(|done| {
            let result = done.result.as_ref()?;
            Some(format!("- {}: {}", done.id, cap_chars(&result.to_string(), 500)))
        })
        .collect::<Vec<_>>();
    if !earlier.is_empty() {
        brief.push_str(&format!("\nEarlier results:\n{}", earlier.join("\n")));
    }
    if let Some(extra) = extra {
        brief.push_str(&format!("\n\n{extra}"));
    }
    messages.push(ChatMessage::user(brief));
    messages
}

/// Empty tool payloads: null, blank text, empty collections, `{rows: []}`,
/// and aggregate queries whose every value is null or zero.
pub fn is_empty_result(data: &Value, args: &ToolArgs) -> bool {
    let empty_shape = match data {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => {
            map.is_empty()
                || map.get("rows").and_then(Value::as_array).is_some_and(|rows| rows.is_empty())
        }
        _ => false,
    };
    empty_shape || (is_aggregate_query(args) && aggregate_is_blank(data))
}

fn is_aggregate_query(args: &ToolArgs) -> bool {
    QUERY_ARG_KEYS.iter().filter_map(|key| args.get(*key).and_then(Value::as_str)).any(|query| {
        let lower = query.to_ascii_lowercase();
        AGGREGATE_MARKERS.iter().any(|marker| lower.contains(marker))
    })
}

fn aggregate_is_blank(data: &Value) -> bool {
    let rows = match data {
        Value::Array(rows) => rows,
        Value::Object(map) => match map.get("rows").and_then(Value::as_array) {
            Some(rows) => rows,
            None => return false,
        },
        _ => return false,
    };
    !rows.is_empty() && rows.iter().all(row_is_blank)
}

fn row_is_blank(row: &Value) -> bool {
    match row {
        Value::Object(map) => map.values().all(is_null_or_zero),
        Value::Array(values) => values.iter().all(is_null_or_zero),
        other => is_null_or_zero(other),
    }
}

fn is_null_or_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Number(number) => number.as_f64().is_some_and(|n| n == 0.0),
        _ => false,
    }
}

/// Column named in a "no such column: X" or `column "X" does not exist`
/// message.
fn missing_column(message: &str) -> Option<String> {
    let lower = message.to_ascii_lowercase();
    let raw = if let Some(position) = lower.find("no such column:") {
        let rest = message[position + "no such column:".len()..].trim_start();
        rest.split(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '"' | '`')))
            .next()
            .unwrap_or_default()
    } else if let Some(position) = lower.find("column \"") {
        let rest = &message[position + "column \"".len()..];
        &rest[..rest.find('"')?]
    } else {
        return None;
    };
    let name = raw.trim_matches(|ch| matches!(ch, '"' | '`'));
    (!name.is_empty()).then(|| name.to_string())
}

/// Case-insensitive replacement of `from` where it stands as a whole
/// identifier. `None` when nothing matched.
fn replace_identifier(text: &str, from: &str, to: &str) -> Option<String> {
    let haystack = text.to_ascii_lowercase();
    let needle = from.to_ascii_lowercase();
    if needle.is_empty() {
        return None;
    }
    let is_ident = |ch: char| ch.is_ascii_alphanumeric() || ch == '_';

    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut replaced = false;
    while let Some(found) = haystack[cursor..].find(&needle) {
        let start = cursor + found;
        let end = start + needle.len();
        let before_ok = text[..start].chars().next_back().map_or(true, |ch| !is_ident(ch));
        let after_ok = text[end..].chars().next().map_or(true, |ch| !is_ident(ch));
        output.push_str(&text[cursor..start]);
        if before_ok && after_ok {
            output.push_str(to);
            replaced = true;
        } else {
            output.push_str(&text[start..end]);
        }
        cursor = end;
    }
    output.push_str(&text[cursor..]);
    replaced.then_some(output)
}
