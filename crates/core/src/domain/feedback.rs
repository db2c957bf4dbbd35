use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerDecision {
    Accept,
    Rewrite,
    Escalate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerIssue {
    EmptyAnswer,
    MissingLimitation,
    TabularDataNotTabulated,
    /// Issue reported by the model-based check.
    Reported(String),
}

impl AnswerIssue {
    pub fn describe(&self) -> String {
        match self {
            Self::EmptyAnswer => "the answer is empty or nearly empty".to_string(),
            Self::MissingLimitation => {
                "a step failed this turn but the answer does not state the limitation".to_string()
            }
            Self::TabularDataNotTabulated => {
                "comparable records were found but the answer has no table".to_string()
            }
            Self::Reported(detail) => detail.clone(),
        }
    }
}

/// Outcome of one validation pass. Replaced on each pass, never edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerFeedback {
    pub decision: AnswerDecision,
    pub reason: String,
    pub issues: Vec<AnswerIssue>,
    pub rewrite_instructions: Option<String>,
    pub confidence: Option<f32>,
}

impl AnswerFeedback {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            decision: AnswerDecision::Accept,
            reason: reason.into(),
            issues: Vec::new(),
            rewrite_instructions: None,
            confidence: None,
        }
    }
}
