use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use stepwise_agent::llm::{ChatMessage, LanguageModel, ModelReply, StructuredSchema};
use stepwise_cli::commands::ask::{run_with_model, AskOptions};
use stepwise_cli::commands::{config, CommandResult};
use stepwise_cli::store::JsonFileThreadStore;
use stepwise_core::config::AppConfig;
use stepwise_core::domain::state::ConversationState;
use stepwise_core::domain::tool::ToolSpec;

/// Model that answers every call with canned content, or refuses everything.
struct CannedModel {
    online: bool,
}

#[async_trait]
impl LanguageModel for CannedModel {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<ChatMessage> {
        if !self.online {
            return Err(anyhow!("offline"));
        }
        Ok(ChatMessage::assistant("Market breadth improved this week across most sectors."))
    }

    async fn complete_with_tools(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<ModelReply> {
        if !self.online {
            return Err(anyhow!("offline"));
        }
        Ok(ModelReply::text("Advancers outnumbered decliners two to one."))
    }

    async fn complete_structured(
        &self,
        _messages: &[ChatMessage],
        schema: &StructuredSchema,
    ) -> Result<Value> {
        match (self.online, schema.name.as_str()) {
            (true, "plan") => Ok(json!({
                "action": "replace",
                "requires_execution": true,
                "steps": [{"instruction": "Summarize market breadth", "goal": "Breadth summary"}]
            })),
            _ => Err(anyhow!("no structured output for `{}`", schema.name)),
        }
    }
}

fn options(store_dir: &Path, thread_id: &str, message: &str) -> AskOptions {
    AskOptions {
        config_path: None,
        thread_id: thread_id.to_string(),
        message: message.to_string(),
        store_dir: store_dir.to_path_buf(),
    }
}

fn parse_payload(result: &CommandResult) -> Value {
    serde_json::from_str(&result.output).expect("command output should be JSON")
}

fn stored_thread(store_dir: &Path, thread_id: &str) -> ConversationState {
    let path = JsonFileThreadStore::new(store_dir).path_for(thread_id);
    let raw = std::fs::read_to_string(path).expect("thread file exists");
    serde_json::from_str(&raw).expect("thread file parses")
}

#[tokio::test]
async fn ask_answers_capability_questions_without_the_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = Arc::new(CannedModel { online: false });

    let result = run_with_model(
        AppConfig::default(),
        model,
        options(dir.path(), "help-thread", "what can you do?"),
    )
    .await;

    assert_eq!(result.exit_code, 0);
    let payload = parse_payload(&result);
    assert_eq!(payload["command"], "ask");
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["details"]["kind"], "guardrail");
    assert_eq!(payload["details"]["intent"], "meta_help");
    assert!(JsonFileThreadStore::new(dir.path()).path_for("help-thread").exists());
}

#[tokio::test]
async fn ask_runs_a_planned_turn_and_follow_up_reuses_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = Arc::new(CannedModel { online: true });

    let first = run_with_model(
        AppConfig::default(),
        model.clone(),
        options(dir.path(), "desk", "Summarize market breadth for this week"),
    )
    .await;
    let payload = parse_payload(&first);
    assert_eq!(payload["status"], "ok", "unexpected payload: {payload}");
    assert_eq!(payload["message"], "Market breadth improved this week across most sectors.");
    assert_eq!(payload["details"]["kind"], "answer");
    assert_eq!(payload["details"]["validator_passes"], 1);

    let stored = stored_thread(dir.path(), "desk");
    assert_eq!(stored.steps.len(), 1);
    assert_eq!(stored.steps[0].status.as_str(), "done");

    let second =
        run_with_model(AppConfig::default(), model, options(dir.path(), "desk", "recap please"))
            .await;
    assert_eq!(parse_payload(&second)["status"], "ok");

    let stored = stored_thread(dir.path(), "desk");
    assert_eq!(stored.turn_index, 2);
    assert!(stored.steps.is_empty());
    assert_eq!(stored.archived_steps.len(), 1);
    assert_eq!(stored.messages.projection(stored.summary_cursor).count(), 4);
}

#[tokio::test]
async fn ask_rejects_blank_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = run_with_model(
        AppConfig::default(),
        Arc::new(CannedModel { online: true }),
        options(dir.path(), "desk", "   "),
    )
    .await;

    assert_eq!(result.exit_code, 2);
    let payload = parse_payload(&result);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error_class"], "invalid_input");
}

#[test]
fn config_reports_file_sources_and_redacts_secrets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stepwise.toml");
    std::fs::write(
        &path,
        "[llm]\nprovider = \"openai\"\nmodel = \"file-model\"\napi_key = \"sk-secret-value\"\n",
    )
    .expect("write config");

    let result = config::run(Some(&path));

    assert_eq!(result.exit_code, 0);
    assert!(result.output.starts_with("effective config"));
    assert!(result.output.contains("- llm.api_key = <redacted> (source: file ("));
    assert!(result.output.contains("- engine.max_replans = 1 (source: default)"));
    assert!(!result.output.contains("sk-secret-value"));
}
