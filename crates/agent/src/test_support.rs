//! Scripted doubles for the model and tool seams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use stepwise_core::domain::tool::{ToolArgs, ToolResult, ToolSpec};

use crate::llm::{ChatMessage, LanguageModel, ModelReply, StructuredSchema};
use crate::tools::Tool;

pub fn args(value: Value) -> ToolArgs {
    match value {
        Value::Object(map) => map,
        _ => ToolArgs::new(),
    }
}

#[derive(Default)]
pub struct ScriptedModel {
    completions: Mutex<VecDeque<Result<String, String>>>,
    tool_replies: Mutex<VecDeque<Result<ModelReply, String>>>,
    structured: Mutex<BTreeMap<String, VecDeque<Result<Value, String>>>>,
    fallback_structured: Mutex<VecDeque<Result<Value, String>>>,
    calls: Mutex<Vec<String>>,
    tool_capabilities: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn with_completion(self, text: impl Into<String>) -> Self {
        push(&self.completions, Ok(text.into()));
        self
    }

    pub fn with_completion_error(self) -> Self {
        push(&self.completions, Err("completion unavailable".to_string()));
        self
    }

    pub fn with_tool_reply(self, reply: ModelReply) -> Self {
        push(&self.tool_replies, Ok(reply));
        self
    }

    pub fn with_tool_error(self) -> Self {
        push(&self.tool_replies, Err("tool completion unavailable".to_string()));
        self
    }

    /// Structured output returned to any schema without a keyed script.
    pub fn with_structured(self, value: Value) -> Self {
        push(&self.fallback_structured, Ok(value));
        self
    }

    pub fn with_structured_for(self, schema: &str, value: Value) -> Self {
        self.keyed(schema, Ok(value));
        self
    }

    pub fn with_structured_error_for(self, schema: &str) -> Self {
        self.keyed(schema, Err(format!("structured `{schema}` unavailable")));
        self
    }

    fn keyed(&self, schema: &str, entry: Result<Value, String>) {
        let mut structured = lock(&self.structured);
        structured.entry(schema.to_string()).or_default().push_back(entry);
    }

    /// Call log entries: `complete`, `tools`, or `structured:<schema>`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(prefix)).count()
    }

    /// Tool names offered on each `complete_with_tools` call.
    pub fn tool_capabilities(&self) -> Vec<Vec<String>> {
        lock(&self.tool_capabilities).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.record("complete".to_string());
        let next = lock(&self.completions).pop_front();
        match next {
            Some(Ok(text)) => Ok(ChatMessage::assistant(text)),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted completion left")),
        }
    }

    async fn complete_with_tools(
        &self,
        _messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply> {
        self.record("tools".to_string());
        lock(&self.tool_capabilities).push(tools.iter().map(|tool| tool.name.clone()).collect());
        let next = lock(&self.tool_replies).pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted tool reply left")),
        }
    }

    async fn complete_structured(
        &self,
        _messages: &[ChatMessage],
        schema: &StructuredSchema,
    ) -> Result<Value> {
        self.record(format!("structured:{}", schema.name));
        let keyed = lock(&self.structured).get_mut(&schema.name).and_then(VecDeque::pop_front);
        let next = keyed.or_else(|| lock(&self.fallback_structured).pop_front());
        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted structured output for `{}`", schema.name)),
        }
    }
}

/// Tool that replays scripted results and records the arguments it saw.
pub struct ScriptedTool {
    name: String,
    results: Mutex<VecDeque<Result<ToolResult, String>>>,
    calls: Mutex<Vec<ToolArgs>>,
    delay: Option<Duration>,
    timeout: Option<Duration>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            timeout: None,
        }
    }

    pub fn returning(self, result: ToolResult) -> Self {
        push(&self.results, Ok(result));
        self
    }

    pub fn raising(self, message: impl Into<String>) -> Self {
        push(&self.results, Err(message.into()));
        self
    }

    pub fn slow(mut self, delay: Duration, timeout: Duration) -> Self {
        self.delay = Some(delay);
        self.timeout = Some(timeout);
        self
    }

    pub fn calls(&self) -> Vec<ToolArgs> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: format!("scripted {}", self.name),
            parameters: json!({"type": "object"}),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolResult> {
        lock(&self.calls).push(args);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.results).pop_front();
        match next {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ToolResult::success(json!({"text": format!("{} ran", self.name)}))),
        }
    }
}

fn push<T>(queue: &Mutex<VecDeque<T>>, item: T) {
    lock(queue).push_back(item);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
