//! Language-model seam.
//!
//! Every stage talks to the model through [`LanguageModel`]. Tool binding is a
//! per-call capability set (`tools` argument), never state held by the model.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_core::domain::message::Role;
use stepwise_core::domain::tool::{ToolArgs, ToolSpec};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallProposal {
    pub name: String,
    pub arguments: ToolArgs,
}

/// Reply to a tool-enabled completion: free text, a tool call, or both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: Option<String>,
    pub tool_call: Option<ToolCallProposal>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_call: None }
    }

    pub fn tool_call(name: impl Into<String>, arguments: ToolArgs) -> Self {
        Self { text: None, tool_call: Some(ToolCallProposal { name: name.into(), arguments }) }
    }
}

/// JSON schema a structured completion must satisfy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredSchema {
    pub name: String,
    pub schema: Value,
}

impl StructuredSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self { name: name.into(), schema }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage>;

    async fn complete_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply>;

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &StructuredSchema,
    ) -> Result<Value>;
}

/// Structured completion deserialized into `T`.
pub async fn complete_as<T>(
    model: &dyn LanguageModel,
    messages: &[ChatMessage],
    schema: &StructuredSchema,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let value = model.complete_structured(messages, schema).await?;
    serde_json::from_value(value)
        .with_context(|| format!("model output does not match schema `{}`", schema.name))
}
