use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arguments passed to a tool. Signatures canonicalize key order, so callers
/// need not care how the map orders its keys.
pub type ToolArgs = Map<String, Value>;

pub mod codes {
    pub const TIMEOUT: &str = "timeout";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INVALID_ARGUMENTS: &str = "invalid_arguments";
    pub const NO_SUCH_COLUMN: &str = "no_such_column";
    pub const NO_SUCH_TABLE: &str = "no_such_table";
    pub const QUERY_SYNTAX_ERROR: &str = "query_syntax_error";
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const EXECUTION_EXCEPTION: &str = "execution_exception";
    pub const LOOP_DETECTED: &str = "loop_detected";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const NOT_FOUND: &str = "not_found";
    pub const MODEL_UNAVAILABLE: &str = "model_unavailable";
}

/// Error codes eligible for correction.
pub const RETRYABLE_CODES: &[&str] = &[
    codes::TIMEOUT,
    codes::RATE_LIMITED,
    codes::INVALID_ARGUMENTS,
    codes::NO_SUCH_COLUMN,
    codes::NO_SUCH_TABLE,
    codes::QUERY_SYNTAX_ERROR,
    codes::UNKNOWN_TOOL,
    codes::EXECUTION_EXCEPTION,
];

/// Retryable codes that changing the arguments cannot fix.
pub const NON_ARGUMENT_CODES: &[&str] =
    &[codes::TIMEOUT, codes::RATE_LIMITED, codes::UNKNOWN_TOOL, codes::EXECUTION_EXCEPTION];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        RETRYABLE_CODES.contains(&self.code.as_str())
    }

    pub fn allows_tool_switch(&self) -> bool {
        NON_ARGUMENT_CODES.contains(&self.code.as_str())
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Uniform result envelope every tool returns. Serialized as
/// `{"ok": true, "data": .., "meta": ..}` or `{"ok": false, "error": .., "meta": ..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum ToolResult {
    Success { data: Value, meta: BTreeMap<String, Value> },
    Failure { error: ToolError, meta: BTreeMap<String, Value> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ToolError>,
    #[serde(default)]
    meta: BTreeMap<String, Value>,
}

impl TryFrom<Envelope> for ToolResult {
    type Error = String;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match (envelope.ok, envelope.error) {
            (true, _) => Ok(Self::Success {
                data: envelope.data.unwrap_or(Value::Null),
                meta: envelope.meta,
            }),
            (false, Some(error)) => Ok(Self::Failure { error, meta: envelope.meta }),
            (false, None) => Err("failed tool result is missing `error`".to_string()),
        }
    }
}

impl From<ToolResult> for Envelope {
    fn from(result: ToolResult) -> Self {
        match result {
            ToolResult::Success { data, meta } => {
                Self { ok: true, data: Some(data), error: None, meta }
            }
            ToolResult::Failure { error, meta } => {
                Self { ok: false, data: None, error: Some(error), meta }
            }
        }
    }
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self::Success { data, meta: BTreeMap::new() }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure { error: ToolError::new(code, message), meta: BTreeMap::new() }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self {
            Self::Success { meta, .. } | Self::Failure { meta, .. } => {
                meta.insert(key.into(), value.into());
            }
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn meta(&self) -> &BTreeMap<String, Value> {
        match self {
            Self::Success { meta, .. } | Self::Failure { meta, .. } => meta,
        }
    }
}

/// Tool description exposed to the language model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{codes, ToolError, ToolResult};

    #[test]
    fn envelope_serializes_with_ok_tag() {
        let success = serde_json::to_value(ToolResult::success(json!({"rows": []})))
            .expect("serialize success");
        assert_eq!(success["ok"], json!(true));
        assert_eq!(success["data"], json!({"rows": []}));

        let failure = serde_json::to_value(ToolResult::failure(codes::TIMEOUT, "took too long"))
            .expect("serialize failure");
        assert_eq!(failure["ok"], json!(false));
        assert_eq!(failure["error"]["code"], json!("timeout"));
    }

    #[test]
    fn failure_without_error_is_rejected() {
        let parsed = serde_json::from_value::<ToolResult>(json!({"ok": false}));
        assert!(parsed.is_err());
    }

    #[test]
    fn retry_classification_follows_allow_list() {
        assert!(ToolError::new(codes::NO_SUCH_COLUMN, "x").is_retryable());
        assert!(!ToolError::new(codes::NO_SUCH_COLUMN, "x").allows_tool_switch());
        assert!(ToolError::new(codes::TIMEOUT, "x").allows_tool_switch());
        assert!(!ToolError::new(codes::PERMISSION_DENIED, "x").is_retryable());
    }
}
