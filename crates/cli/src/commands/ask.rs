use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use stepwise_agent::http_llm::OpenAiCompatibleModel;
use stepwise_agent::llm::LanguageModel;
use stepwise_agent::runtime::AgentRuntime;
use stepwise_core::config::{AppConfig, LoadOptions};
use tracing::error;

use super::CommandResult;
use crate::store::JsonFileThreadStore;

#[derive(Clone, Debug)]
pub struct AskOptions {
    pub config_path: Option<PathBuf>,
    pub thread_id: String,
    pub message: String,
    pub store_dir: PathBuf,
}

pub async fn run(options: AskOptions) -> CommandResult {
    let load = LoadOptions { config_path: options.config_path.clone(), ..LoadOptions::default() };
    let config = match AppConfig::load(load) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };
    crate::init_logging(&config);

    let model = match OpenAiCompatibleModel::from_config(&config.llm) {
        Ok(model) => model,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "model_configuration",
                format!("language model client could not be created: {error}"),
                2,
            );
        }
    };
    run_with_model(config, Arc::new(model), options).await
}

/// Runs one turn with an already-built model against the file store.
pub async fn run_with_model(
    config: AppConfig,
    model: Arc<dyn LanguageModel>,
    options: AskOptions,
) -> CommandResult {
    if options.thread_id.trim().is_empty() || options.message.trim().is_empty() {
        return CommandResult::failure(
            "ask",
            "invalid_input",
            "both --thread and --message must be non-empty",
            2,
        );
    }

    let store = Arc::new(JsonFileThreadStore::new(options.store_dir));
    let runtime = AgentRuntime::builder(config, model).store(store).build();

    match runtime.advance(&options.thread_id, &options.message).await {
        Ok(outcome) => CommandResult::success_with(
            "ask",
            outcome.answer,
            Some(json!({
                "thread_id": options.thread_id,
                "kind": outcome.kind.as_str(),
                "intent": outcome.intent.map(|intent| intent.as_str()),
                "validator_passes": outcome.validator_passes,
            })),
        ),
        Err(failure) => {
            error!(
                event_name = "cli.ask_failed",
                thread_id = %options.thread_id,
                error_class = failure.error_class(),
                error = %failure,
                "turn failed"
            );
            CommandResult::failure("ask", failure.error_class(), failure.user_message(), 1)
        }
    }
}
