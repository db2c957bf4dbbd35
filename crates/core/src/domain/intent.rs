use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentClass {
    Task,
    MetaHelp,
    BlockedUserCode,
    BlockedSafety,
    AnalyzeCurrentTarget,
    AnalyzeOtherTarget,
    NeedsClarification,
}

impl IntentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::MetaHelp => "meta_help",
            Self::BlockedUserCode => "blocked_user_code",
            Self::BlockedSafety => "blocked_safety",
            Self::AnalyzeCurrentTarget => "analyze_current_target",
            Self::AnalyzeOtherTarget => "analyze_other_target",
            Self::NeedsClarification => "needs_clarification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" => Some(Self::Task),
            "meta_help" => Some(Self::MetaHelp),
            "blocked_user_code" => Some(Self::BlockedUserCode),
            "blocked_safety" => Some(Self::BlockedSafety),
            "analyze_current_target" => Some(Self::AnalyzeCurrentTarget),
            "analyze_other_target" => Some(Self::AnalyzeOtherTarget),
            "needs_clarification" => Some(Self::NeedsClarification),
            _ => None,
        }
    }

    /// Guard classes that end the turn with a canned response.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MetaHelp | Self::BlockedUserCode | Self::BlockedSafety)
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::BlockedUserCode | Self::BlockedSafety)
    }

    pub fn is_target_analysis(&self) -> bool {
        matches!(self, Self::AnalyzeCurrentTarget | Self::AnalyzeOtherTarget)
    }
}

/// Risk of proceeding on an assumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionRisk {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityKind {
    UnboundCurrentTarget,
    MultipleTargets { targets: Vec<String> },
    TargetMismatch { bound: String, requested: String },
    AnalysisMethodUnspecified,
}

/// Ambiguity detected in the latest user message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub kind: AmbiguityKind,
    pub signature: String,
    pub risk: AssumptionRisk,
    /// Assumption that is safe to proceed with, when one exists.
    pub safe_default: Option<String>,
}

impl Ambiguity {
    pub fn new(kind: AmbiguityKind, risk: AssumptionRisk, safe_default: Option<String>) -> Self {
        let signature = match &kind {
            AmbiguityKind::UnboundCurrentTarget => "unbound_current_target".to_string(),
            AmbiguityKind::MultipleTargets { targets } => {
                format!("multiple_targets:{}", targets.join(","))
            }
            AmbiguityKind::TargetMismatch { bound, requested } => {
                format!("target_mismatch:{bound}->{requested}")
            }
            AmbiguityKind::AnalysisMethodUnspecified => "analysis_method_unspecified".to_string(),
        };
        Self { kind, signature, risk, safe_default }
    }

    /// High risk always asks; medium risk asks only without a safe default.
    pub fn warrants_clarification(&self) -> bool {
        match self.risk {
            AssumptionRisk::High => true,
            AssumptionRisk::Medium => self.safe_default.is_none(),
            AssumptionRisk::Low => false,
        }
    }
}
