//! Turn runtime: wires the guard, planner, executor and answer loop around
//! the router, and serializes turns per thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stepwise_core::audit::{AuditContext, AuditSink, TracingAuditSink};
use stepwise_core::config::AppConfig;
use stepwise_core::domain::feedback::{AnswerDecision, AnswerFeedback};
use stepwise_core::domain::intent::IntentClass;
use stepwise_core::domain::message::Message;
use stepwise_core::domain::state::{ConversationState, ReplanRequest, TurnError};
use stepwise_core::domain::tool::{codes, ToolError};
use stepwise_core::errors::{ApplicationError, DomainError};
use stepwise_core::flows::{open_turn, RouteReason, Router, Stage};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clarification::{resolve, ClarificationGate};
use crate::composer::AnswerComposer;
use crate::context::ContextManager;
use crate::executor::Executor;
use crate::guardrails::{apply_outcome, IntentGuard};
use crate::llm::LanguageModel;
use crate::planner::Planner;
use crate::schema::{SchemaCatalog, SchemaReferenceTool};
use crate::store::{InMemoryThreadStore, ThreadStore};
use crate::tools::ToolRegistry;
use crate::validator::{finalize, AnswerRewriter, AnswerValidator};

/// Upper bound on router hops in one turn. Every hop either plans, runs a
/// step, or responds, and all of those are budgeted, so this only trips on a
/// broken invariant.
const MAX_ROUTER_HOPS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnKind {
    Answer,
    Clarification,
    Guardrail,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Clarification => "clarification",
            Self::Guardrail => "guardrail",
        }
    }
}

/// What one call to [`AgentRuntime::advance`] produced.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub answer: String,
    pub kind: TurnKind,
    pub intent: Option<IntentClass>,
    pub validator_passes: u32,
    pub feedback: Option<AnswerFeedback>,
}

pub struct AgentRuntimeBuilder {
    config: AppConfig,
    model: Arc<dyn LanguageModel>,
    registry: Option<ToolRegistry>,
    catalog: Option<Arc<dyn SchemaCatalog>>,
    store: Option<Arc<dyn ThreadStore>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AgentRuntimeBuilder {
    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Schema metadata for deterministic query repair. Also registered as the
    /// schema reference tool unless a tool already uses that name.
    pub fn schema(mut self, catalog: Arc<dyn SchemaCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn store(mut self, store: Arc<dyn ThreadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> AgentRuntime {
        let Self { config, model, registry, catalog, store, audit } = self;
        let audit = audit.unwrap_or_else(|| Arc::new(TracingAuditSink) as Arc<dyn AuditSink>);
        let mut registry = registry.unwrap_or_else(|| {
            ToolRegistry::new(Duration::from_secs(config.engine.tool_timeout_secs))
        });
        if let Some(catalog) = &catalog {
            if !registry.contains(&config.tools.schema) {
                registry.register(SchemaReferenceTool::new(
                    config.tools.schema.clone(),
                    Arc::clone(catalog),
                ));
            }
        }
        let registry = Arc::new(registry);
        let engine = &config.engine;

        AgentRuntime {
            context: ContextManager::new(
                Arc::clone(&model),
                config.context.clone(),
                Arc::clone(&audit),
            ),
            guard: IntentGuard::new(
                config.guard.clone(),
                engine.max_clarifications,
                Some(Arc::clone(&model)),
                Arc::clone(&audit),
            ),
            gate: ClarificationGate::new(Some(Arc::clone(&model)), Arc::clone(&audit)),
            router: Router::new(engine.max_replans),
            planner: Planner::new(
                Arc::clone(&model),
                config.tools.clone(),
                registry.specs(),
                engine.max_steps_per_plan,
                Arc::clone(&audit),
            ),
            executor: Executor::new(
                Arc::clone(&model),
                Arc::clone(&registry),
                catalog,
                config.tools.clone(),
                engine.max_step_attempts,
                Arc::clone(&audit),
            ),
            composer: AnswerComposer::new(Arc::clone(&model)),
            validator: AnswerValidator::new(
                Some(Arc::clone(&model)),
                config.validator.clone(),
                engine.max_answer_rewrites,
                engine.max_validation_escalations,
                Arc::clone(&audit),
            ),
            rewriter: AnswerRewriter::new(model),
            store: store.unwrap_or_else(|| {
                Arc::new(InMemoryThreadStore::default()) as Arc<dyn ThreadStore>
            }),
            audit,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }
}

pub struct AgentRuntime {
    context: ContextManager,
    guard: IntentGuard,
    gate: ClarificationGate,
    router: Router,
    planner: Planner,
    executor: Executor,
    composer: AnswerComposer,
    validator: AnswerValidator,
    rewriter: AnswerRewriter,
    store: Arc<dyn ThreadStore>,
    audit: Arc<dyn AuditSink>,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentRuntime {
    pub fn builder(config: AppConfig, model: Arc<dyn LanguageModel>) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder {
            config,
            model,
            registry: None,
            catalog: None,
            store: None,
            audit: None,
        }
    }

    /// Runs one user message against a stored thread. Turns on the same
    /// thread run one at a time; distinct threads run concurrently.
    pub async fn advance(
        &self,
        thread_id: &str,
        message: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let lock = {
            let mut locks = self.thread_locks.lock().await;
            Arc::clone(locks.entry(thread_id.to_string()).or_default())
        };
        let outcome = {
            let _turn = lock.lock().await;
            self.advance_stored(thread_id, message).await
        };

        // Drop the entry once no other turn holds or waits on it. Waiters
        // clone under the map lock, so the count cannot grow while we hold it.
        let mut locks = self.thread_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(thread_id);
        }
        outcome
    }

    async fn advance_stored(
        &self,
        thread_id: &str,
        message: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let mut state = self
            .store
            .load(thread_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(thread_id));
        let outcome = self.advance_state(&mut state, message).await?;
        self.store.save(thread_id, &state.for_persistence()).await?;
        Ok(outcome)
    }

    /// Storage-free core of a turn.
    pub async fn advance_state(
        &self,
        state: &mut ConversationState,
        message: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let audit = AuditContext::new(state.thread_id.clone(), Uuid::new_v4().to_string(), "runtime");

        state.append(Message::user(message));
        let clarified = state
            .clarification
            .pending
            .take()
            .and_then(|pending| resolve(&pending, message));
        open_turn(state);
        if clarified.is_some() {
            state.turn.clarified = clarified;
        }

        self.context.compact(state, &audit.with_actor("context")).await;
        let guard = self.guard.classify(state, &audit.with_actor("guard")).await;
        apply_outcome(state, &guard);

        let mut validator_passes = 0;
        let mut hops = 0;
        let outcome = loop {
            hops += 1;
            if hops > MAX_ROUTER_HOPS && state.turn.terminal_error.is_none() {
                warn!(
                    event_name = "runtime.hop_limit",
                    thread_id = %state.thread_id,
                    hops,
                    "turn exceeded router hop limit"
                );
                state.turn.terminal_error = Some(TurnError {
                    step_id: None,
                    error: ToolError::new(codes::EXECUTION_EXCEPTION, "router hop limit reached"),
                });
            }

            let route = self.router.advance_with_audit(state, self.audit.as_ref(), &audit);
            match route.stage {
                Stage::Plan => {
                    self.planner.plan(state, &audit.with_actor("planner")).await;
                }
                Stage::Execute => {
                    self.executor.execute_one(state, &audit.with_actor("executor")).await?;
                }
                Stage::Respond => match route.reason {
                    RouteReason::ClarificationPending => {
                        let Some(ambiguity) = guard.ambiguity.as_ref() else {
                            return Err(DomainError::InvariantViolation(
                                "clarification pending without an ambiguity".to_string(),
                            )
                            .into());
                        };
                        let prompt =
                            self.gate.ask(state, ambiguity, &audit.with_actor("clarification")).await;
                        break turn_outcome(state, prompt.message, TurnKind::Clarification, 0, None);
                    }
                    RouteReason::GuardrailResponse => {
                        let response = state.turn.guardrail_response.clone().unwrap_or_default();
                        break turn_outcome(state, response, TurnKind::Guardrail, 0, None);
                    }
                    _ => {
                        let answered = self
                            .answer(state, &audit.with_actor("validator"), &mut validator_passes)
                            .await;
                        if let Some((answer, feedback)) = answered {
                            break turn_outcome(
                                state,
                                answer,
                                TurnKind::Answer,
                                validator_passes,
                                Some(feedback),
                            );
                        }
                    }
                },
            }
        };

        state.append(Message::assistant(outcome.answer.clone()));
        info!(
            event_name = "runtime.turn_completed",
            thread_id = %state.thread_id,
            correlation_id = %audit.correlation_id,
            kind = outcome.kind.as_str(),
            intent = outcome.intent.map(|intent| intent.as_str()).unwrap_or(""),
            validator_passes = outcome.validator_passes,
            steps = state.turn_steps().count(),
            "turn completed"
        );
        Ok(outcome)
    }

    /// Compose, then validate and rewrite until accepted. `None` means the
    /// validator escalated and the turn goes back to the router.
    async fn answer(
        &self,
        state: &mut ConversationState,
        audit: &AuditContext,
        passes: &mut u32,
    ) -> Option<(String, AnswerFeedback)> {
        let mut draft = self.composer.compose(state).await;
        loop {
            let feedback = self.validator.validate(state, &draft, audit).await;
            *passes += 1;
            match feedback.decision {
                AnswerDecision::Accept => return Some((finalize(&draft, &feedback), feedback)),
                AnswerDecision::Rewrite => {
                    state.turn.answer_revision_attempts += 1;
                    draft = self.rewriter.rewrite(state, &draft, &feedback).await;
                }
                AnswerDecision::Escalate => {
                    state.turn.master_escalations_from_validation += 1;
                    state.turn.replan_request = Some(ReplanRequest::Escalation { feedback });
                    state.turn.answered = false;
                    return None;
                }
            }
        }
    }
}

fn turn_outcome(
    state: &ConversationState,
    answer: String,
    kind: TurnKind,
    validator_passes: u32,
    feedback: Option<AnswerFeedback>,
) -> TurnOutcome {
    TurnOutcome { answer, kind, intent: state.turn.intent_class, validator_passes, feedback }
}
