//! Stepwise agent runtime.
//!
//! One turn runs through a fixed pipeline around the router in
//! `stepwise-core`:
//!
//! 1. **Context** (`context`) - fold old history into the rolling summary
//! 2. **Guard** (`guardrails`) - classify the request, refuse or clarify
//! 3. **Plan** (`planner`) - reuse, append or replace the step list
//! 4. **Execute** (`executor`) - run one step with bounded self-healing retries
//! 5. **Answer** (`composer`, `validator`) - draft, validate, rewrite
//!
//! The language model is only a collaborator behind [`llm::LanguageModel`].
//! Budgets, routing and step transitions are decided deterministically.

pub mod clarification;
pub mod composer;
pub mod context;
pub mod executor;
pub mod guardrails;
pub mod http_llm;
pub mod llm;
pub mod planner;
pub mod runtime;
pub mod schema;
pub mod store;
pub mod tools;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use runtime::{AgentRuntime, AgentRuntimeBuilder, TurnKind, TurnOutcome};
pub use store::{InMemoryThreadStore, ThreadStore};
