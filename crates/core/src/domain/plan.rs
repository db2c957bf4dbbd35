use serde::{Deserialize, Serialize};

use crate::domain::step::StepDraft;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Reuse,
    Append,
    Replace,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reuse => "reuse",
            Self::Append => "append",
            Self::Replace => "replace",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    pub action: PlanAction,
    pub requires_execution: bool,
    pub reason: String,
}

/// Plan proposal before safety normalization and merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub action: PlanAction,
    pub requires_execution: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

impl PlanDraft {
    pub fn no_execution(reason: impl Into<String>) -> Self {
        Self {
            action: PlanAction::Replace,
            requires_execution: false,
            reason: reason.into(),
            steps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{PlanAction, PlanDraft};

    #[test]
    fn draft_parses_from_model_json_with_defaults() {
        let draft: PlanDraft = serde_json::from_value(json!({
            "action": "append",
            "requires_execution": true,
            "steps": [{"instruction": "Query daily closes"}]
        }))
        .expect("draft should parse");

        assert_eq!(draft.action, PlanAction::Append);
        assert_eq!(draft.steps.len(), 1);
        assert!(draft.steps[0].constraints.is_empty());
        assert!(draft.reason.is_empty());
    }
}
