use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::tool::{ToolArgs, ToolError};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn scoped(plan_version: u32, ordinal: usize) -> Self {
        Self(format!("v{plan_version}-s{ordinal}"))
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Where a correction came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSource {
    Deterministic,
    Model,
    EmptyResult,
    ToolSwitch,
    None,
}

/// One iteration of the executor's retry loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub tool: String,
    pub old_args: ToolArgs,
    pub new_args: Option<ToolArgs>,
    pub new_tool: Option<String>,
    pub error: Option<ToolError>,
    pub reason: String,
    pub source: CorrectionSource,
    pub recorded_at: DateTime<Utc>,
}

/// Planned input for a new step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub instruction: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub tool_args: Option<ToolArgs>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub plan_version: u32,
    pub turn: u32,
    pub instruction: String,
    pub goal: String,
    pub success_criteria: String,
    pub constraints: Vec<String>,
    pub selected_tool: Option<String>,
    pub tool_args: Option<ToolArgs>,
    pub status: StepStatus,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<ToolError>,
    pub last_attempt_signature: Option<String>,
    pub retry_history: Vec<RetryRecord>,
    pub empty_retry_used: bool,
    pub retry_hint: Option<String>,
}

impl Step {
    pub fn from_draft(id: StepId, plan_version: u32, turn: u32, draft: StepDraft) -> Self {
        let goal = if draft.goal.trim().is_empty() { draft.instruction.clone() } else { draft.goal };
        Self {
            id,
            plan_version,
            turn,
            instruction: draft.instruction,
            goal,
            success_criteria: draft.success_criteria,
            constraints: draft.constraints,
            selected_tool: draft.tool.filter(|tool| !tool.trim().is_empty()),
            tool_args: draft.tool_args,
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            last_attempt_signature: None,
            retry_history: Vec::new(),
            empty_retry_used: false,
            retry_hint: None,
        }
    }

    /// Pending -> Running. Counts one attempt.
    pub fn start(&mut self) -> Result<(), DomainError> {
        self.require(StepStatus::Pending, StepStatus::Running)?;
        self.status = StepStatus::Running;
        self.attempts += 1;
        Ok(())
    }

    /// Running -> Done.
    pub fn complete(&mut self, result: Value) -> Result<(), DomainError> {
        self.require(StepStatus::Running, StepStatus::Done)?;
        self.status = StepStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.retry_hint = None;
        Ok(())
    }

    /// Running -> Failed.
    pub fn fail(&mut self, error: ToolError) -> Result<(), DomainError> {
        self.require(StepStatus::Running, StepStatus::Failed)?;
        self.status = StepStatus::Failed;
        self.error = Some(error);
        Ok(())
    }

    /// Running -> Pending for a forced same-tool retry after an empty result.
    pub fn requeue_after_empty(&mut self, hint: impl Into<String>) -> Result<(), DomainError> {
        self.require(StepStatus::Running, StepStatus::Pending)?;
        self.status = StepStatus::Pending;
        self.empty_retry_used = true;
        self.retry_hint = Some(hint.into());
        Ok(())
    }

    /// Failed -> Pending. The only way out of `failed`; clears the error and
    /// installs the corrected call.
    pub fn reopen_with_correction(
        &mut self,
        tool: String,
        args: ToolArgs,
    ) -> Result<(), DomainError> {
        self.require(StepStatus::Failed, StepStatus::Pending)?;
        self.status = StepStatus::Pending;
        self.error = None;
        self.selected_tool = Some(tool);
        self.tool_args = Some(args);
        Ok(())
    }

    /// Any open state -> Skipped. Terminal steps are left untouched.
    pub fn skip(&mut self) -> bool {
        if self.status.is_open() {
            self.status = StepStatus::Skipped;
            return true;
        }
        false
    }

    pub fn record_retry(&mut self, record: RetryRecord) {
        self.retry_history.push(record);
    }

    pub fn text(&self) -> String {
        format!("{} {} {}", self.instruction, self.goal, self.success_criteria)
    }

    fn require(&self, expected: StepStatus, to: StepStatus) -> Result<(), DomainError> {
        if self.status == expected {
            return Ok(());
        }
        Err(DomainError::InvalidStepTransition { step: self.id.0.clone(), from: self.status, to })
    }
}
