//! Master router: the single transition function of a turn.
//!
//! [`route`] is pure and decides the next stage from the conversation state.
//! [`Router::advance`] applies the bookkeeping a route carries (repair
//! requests, surfaced errors) and is the only place a turn is declared done.

use tracing::debug;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::state::{
    normalize_question, ConversationState, QuestionRef, ReplanRequest, TurnError, TurnState,
};
use crate::domain::step::StepStatus;
use crate::flows::states::{Route, RouteEffect, RouteReason, Stage};

/// Opens the turn for the latest user message.
///
/// A new distinct question, or any question after the previous turn was
/// answered, resets every turn-scoped field, advances the turn index and
/// abandons steps still open from the superseded question. Re-running an
/// unanswered question keeps the turn as-is. Returns `true` when a new turn
/// was opened.
pub fn open_turn(state: &mut ConversationState) -> bool {
    let Some(latest) = state.latest_user_message() else {
        return false;
    };
    let question =
        QuestionRef { message_id: latest.id.clone(), normalized: normalize_question(&latest.content) };

    let is_new = state
        .turn
        .question
        .as_ref()
        .map(|current| current.normalized != question.normalized || state.turn.answered)
        .unwrap_or(true);
    if !is_new {
        return false;
    }

    for step in &mut state.steps {
        step.skip();
    }
    state.turn = TurnState { question: Some(question), ..TurnState::default() };
    state.turn_index += 1;
    true
}

/// Decides the next stage. Rules are evaluated in a fixed order.
pub fn route(state: &ConversationState, max_replans: u32) -> Route {
    let turn = &state.turn;

    if turn.needs_clarification {
        return Route::to(Stage::Respond, RouteReason::ClarificationPending);
    }
    if turn.guardrail_response.is_some() {
        return Route::to(Stage::Respond, RouteReason::GuardrailResponse);
    }
    if turn.terminal_error.is_some() {
        return Route::to(Stage::Respond, RouteReason::TerminalError);
    }
    if !turn.planned {
        return Route::to(Stage::Plan, RouteReason::Unplanned);
    }
    if turn.replan_request.is_some() {
        return Route::to(Stage::Plan, RouteReason::ReplanRequested);
    }

    let first_pending = state.steps.iter().find(|step| step.status.is_open());
    let unrepaired_failure = state.turn_steps().find(|step| {
        step.status == StepStatus::Failed && !turn.repair_requested.contains(&step.id)
    });

    if let Some(failed) = unrepaired_failure {
        if let Some(pending) = first_pending {
            return Route::to(Stage::Execute, RouteReason::ParkedFailure)
                .with_effect(RouteEffect::Execute { step_id: pending.id.clone() });
        }
        let error = failed.error.clone().unwrap_or_else(|| {
            crate::domain::tool::ToolError::new("unknown", "step failed without an error")
        });
        if turn.replans_used < max_replans {
            return Route::to(Stage::Plan, RouteReason::RepairFailedStep)
                .with_effect(RouteEffect::RequestRepair { step_id: failed.id.clone(), error });
        }
        return Route::to(Stage::Respond, RouteReason::ReplanBudgetExhausted)
            .with_effect(RouteEffect::SurfaceError { step_id: failed.id.clone(), error });
    }

    let requires_execution = state.plan.as_ref().map(|plan| plan.requires_execution).unwrap_or(true);
    if !requires_execution {
        return Route::to(Stage::Respond, RouteReason::ExecutionNotRequired);
    }
    if first_pending.is_none() && state.turn_steps().next().is_none() {
        return Route::to(Stage::Plan, RouteReason::NoStepsPlanned);
    }
    match first_pending {
        Some(step) => Route::to(Stage::Execute, RouteReason::PendingStep)
            .with_effect(RouteEffect::Execute { step_id: step.id.clone() }),
        None => Route::to(Stage::Respond, RouteReason::Complete),
    }
}

#[derive(Clone, Debug)]
pub struct Router {
    max_replans: u32,
}

impl Router {
    pub fn new(max_replans: u32) -> Self {
        Self { max_replans }
    }

    /// Routes and applies the route's bookkeeping.
    pub fn advance(&self, state: &mut ConversationState) -> Route {
        let route = route(state, self.max_replans);
        match &route.effect {
            RouteEffect::None | RouteEffect::Execute { .. } => {}
            RouteEffect::RequestRepair { step_id, error } => {
                state.turn.replans_used += 1;
                state.turn.repair_requested.insert(step_id.clone());
                state.turn.replan_request =
                    Some(ReplanRequest::RepairStep { step_id: step_id.clone(), error: error.clone() });
            }
            RouteEffect::SurfaceError { step_id, error } => {
                state.turn.terminal_error =
                    Some(TurnError { step_id: Some(step_id.clone()), error: error.clone() });
            }
        }
        if route.stage == Stage::Respond {
            state.turn.answered = true;
        }
        debug!(
            event_name = "router.routed",
            thread_id = %state.thread_id,
            stage = ?route.stage,
            reason = route.reason.as_str(),
            "router selected next stage"
        );
        route
    }

    pub fn advance_with_audit<S>(
        &self,
        state: &mut ConversationState,
        sink: &S,
        audit: &AuditContext,
    ) -> Route
    where
        S: AuditSink + ?Sized,
    {
        let route = self.advance(state);
        let outcome = match route.effect {
            RouteEffect::SurfaceError { .. } => AuditOutcome::Failed,
            _ => AuditOutcome::Success,
        };
        sink.emit(
            AuditEvent::new(audit, "router.routed", AuditCategory::Routing, outcome)
                .with_metadata("stage", format!("{:?}", route.stage))
                .with_metadata("reason", route.reason.as_str()),
        );
        route
    }
}
