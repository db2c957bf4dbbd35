use serde::{Deserialize, Serialize};

use crate::domain::step::StepId;
use crate::domain::tool::ToolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Execute,
    Respond,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    ClarificationPending,
    GuardrailResponse,
    TerminalError,
    Unplanned,
    ReplanRequested,
    ParkedFailure,
    RepairFailedStep,
    ReplanBudgetExhausted,
    ExecutionNotRequired,
    NoStepsPlanned,
    PendingStep,
    Complete,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClarificationPending => "clarification_pending",
            Self::GuardrailResponse => "guardrail_response",
            Self::TerminalError => "terminal_error",
            Self::Unplanned => "unplanned",
            Self::ReplanRequested => "replan_requested",
            Self::ParkedFailure => "parked_failure",
            Self::RepairFailedStep => "repair_failed_step",
            Self::ReplanBudgetExhausted => "replan_budget_exhausted",
            Self::ExecutionNotRequired => "execution_not_required",
            Self::NoStepsPlanned => "no_steps_planned",
            Self::PendingStep => "pending_step",
            Self::Complete => "complete",
        }
    }
}

/// Bookkeeping a route asks the router to apply to the conversation state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteEffect {
    None,
    Execute { step_id: StepId },
    RequestRepair { step_id: StepId, error: ToolError },
    SurfaceError { step_id: StepId, error: ToolError },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub stage: Stage,
    pub reason: RouteReason,
    pub effect: RouteEffect,
}

impl Route {
    pub fn to(stage: Stage, reason: RouteReason) -> Self {
        Self { stage, reason, effect: RouteEffect::None }
    }

    pub fn with_effect(mut self, effect: RouteEffect) -> Self {
        self.effect = effect;
        self
    }
}
