pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod signature;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::feedback::{AnswerDecision, AnswerFeedback, AnswerIssue};
pub use domain::intent::{Ambiguity, AmbiguityKind, AssumptionRisk, IntentClass};
pub use domain::message::{Message, MessageKind, MessageLog, Role};
pub use domain::plan::{Plan, PlanAction, PlanDraft};
pub use domain::state::{ConversationState, TurnState};
pub use domain::step::{Step, StepDraft, StepId, StepStatus};
pub use domain::tool::{ToolArgs, ToolError, ToolResult, ToolSpec};
pub use errors::{ApplicationError, DomainError};
pub use flows::{open_turn, route, Route, Router, Stage};
