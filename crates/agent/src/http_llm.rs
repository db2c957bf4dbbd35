//! [`LanguageModel`] over an OpenAI-compatible `/chat/completions` endpoint.
//! Works against OpenAI and against Ollama's `/v1` compatibility layer.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use stepwise_core::config::LlmConfig;
use stepwise_core::domain::tool::{ToolArgs, ToolSpec};
use tracing::{debug, warn};

use crate::llm::{ChatMessage, LanguageModel, ModelReply, StructuredSchema, ToolCallProposal};

pub struct OpenAiCompatibleModel {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

impl OpenAiCompatibleModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        validate_base_url(&base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn chat(&self, mut body: Value) -> Result<Value> {
        body["model"] = json!(self.model);
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut request = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key.expose_secret());
            }

            let outcome = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.context("failed to read model response")?;
                    if status.is_success() {
                        return serde_json::from_str(&text).context("model response is not JSON");
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let error = anyhow!("model endpoint returned {status}: {}", truncate(&text, 300));
                    if !retryable {
                        return Err(error);
                    }
                    error
                }
                Err(error) if error.is_timeout() || error.is_connect() => {
                    anyhow!("model endpoint unreachable: {error}")
                }
                Err(error) => return Err(error).context("model request failed"),
            };

            if attempt > self.max_retries {
                return Err(outcome);
            }
            warn!(
                event_name = "llm.retry",
                attempt,
                error = %outcome,
                "retrying model call"
            );
            tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        let response = self.chat(json!({"messages": wire_messages(messages)})).await?;
        let reply = parse_reply(&response)?;
        Ok(ChatMessage::assistant(reply.text.unwrap_or_default()))
    }

    async fn complete_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply> {
        let mut body = json!({"messages": wire_messages(messages)});
        if !tools.is_empty() {
            body["tools"] = json!(tool_definitions(tools));
        }
        let response = self.chat(body).await?;
        parse_reply(&response)
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &StructuredSchema,
    ) -> Result<Value> {
        let body = json!({
            "messages": wire_messages(messages),
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": schema.name, "schema": schema.schema},
            },
        });
        let response = self.chat(body).await?;
        let text = parse_reply(&response)?.text.unwrap_or_default();
        debug!(schema = %schema.name, "structured model reply received");
        extract_json(&text)
    }
}

/// HTTPS everywhere; plain HTTP only for a local model server.
fn validate_base_url(base_url: &str) -> Result<()> {
    let parsed =
        reqwest::Url::parse(base_url).with_context(|| format!("invalid base_url `{base_url}`"))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or_default();
            if matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1") {
                Ok(())
            } else {
                bail!("plain HTTP is only allowed for localhost (base_url `{base_url}`)")
            }
        }
        other => bail!("unsupported URL scheme `{other}` in base_url `{base_url}`"),
    }
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| json!({"role": message.role.as_str(), "content": message.content}))
        .collect()
}

fn tool_definitions(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                },
            })
        })
        .collect()
}

fn parse_reply(response: &Value) -> Result<ModelReply> {
    let message = response["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| anyhow!("model response has no choices"))?;

    let text = message["content"].as_str().map(str::trim).filter(|text| !text.is_empty());
    let tool_call = match message["tool_calls"].as_array().and_then(|calls| calls.first()) {
        Some(call) => {
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| anyhow!("tool call without a function name"))?;
            let raw = call["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments = match serde_json::from_str::<Value>(raw)
                .with_context(|| format!("tool call arguments for `{name}` are not JSON"))?
            {
                Value::Object(map) => map,
                Value::Null => ToolArgs::new(),
                other => bail!("tool call arguments for `{name}` must be an object, got {other}"),
            };
            Some(ToolCallProposal { name: name.to_string(), arguments })
        }
        None => None,
    };

    Ok(ModelReply { text: text.map(str::to_string), tool_call })
}

/// Parses the JSON object in a model reply, tolerating code fences and prose
/// around it.
fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{').ok_or_else(|| anyhow!("no JSON object in model reply"))?;
    let end = trimmed.rfind('}').ok_or_else(|| anyhow!("no JSON object in model reply"))?;
    if end < start {
        bail!("no JSON object in model reply");
    }
    serde_json::from_str(&trimmed[start..=end]).context("model reply holds malformed JSON")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_core::config::AppConfig;

    use super::{extract_json, parse_reply, validate_base_url, OpenAiCompatibleModel};

    #[test]
    fn base_url_rules() {
        assert!(validate_base_url("https://api.openai.com/v1").is_ok());
        assert!(validate_base_url("http://localhost:11434/v1").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
        assert!(validate_base_url("http://models.example.com/v1").is_err());
        assert!(validate_base_url("ftp://localhost").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn default_config_builds_a_client_with_trimmed_url() {
        let mut config = AppConfig::default().llm;
        config.base_url = Some("http://localhost:11434/v1/".to_string());
        let model = OpenAiCompatibleModel::from_config(&config).expect("client builds");
        assert_eq!(model.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn parses_tool_call_arguments() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "sql_query", "arguments": "{\"query\":\"select 1\"}"}
                    }]
                }
            }]
        });

        let reply = parse_reply(&response).expect("reply parses");
        let call = reply.tool_call.expect("tool call present");
        assert_eq!(call.name, "sql_query");
        assert_eq!(call.arguments.get("query"), Some(&json!("select 1")));
        assert!(reply.text.is_none());
    }

    #[test]
    fn rejects_response_without_choices() {
        assert!(parse_reply(&json!({"choices": []})).is_err());
    }

    #[test]
    fn extracts_fenced_json() {
        let value = extract_json("```json\n{\"action\": \"append\"}\n```").expect("json found");
        assert_eq!(value["action"], json!("append"));
        assert!(extract_json("no json here").is_err());
    }
}
