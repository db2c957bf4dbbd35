use thiserror::Error;

use crate::domain::step::StepStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid step transition for `{step}` from {from:?} to {to:?}")]
    InvalidStepTransition { step: String, from: StepStatus, to: StepStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("language model failure: {0}")]
    Model(String),
    #[error("tool failure: {0}")]
    Tool(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Short, user-safe description. Internal detail stays in logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Domain(_) => "The request could not be processed. Please try rephrasing it.",
            Self::Model(_) | Self::Tool(_) => {
                "A required service is temporarily unavailable. Please retry shortly."
            }
            Self::Persistence(_) => "Conversation state could not be loaded or saved.",
            Self::Configuration(_) => "An unexpected internal error occurred.",
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::Model(_) => "model",
            Self::Tool(_) => "tool",
            Self::Persistence(_) => "persistence",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::step::StepStatus;
    use crate::errors::{ApplicationError, DomainError};

    #[test]
    fn domain_error_converts_and_keeps_details() {
        let error = ApplicationError::from(DomainError::InvalidStepTransition {
            step: "v1-s1".to_owned(),
            from: StepStatus::Done,
            to: StepStatus::Running,
        });

        assert_eq!(error.error_class(), "domain");
        assert!(error.to_string().contains("v1-s1"));
    }

    #[test]
    fn persistence_error_has_user_safe_message() {
        let error = ApplicationError::Persistence("disk full at /var/lib".to_owned());
        assert!(!error.user_message().contains("/var/lib"));
        assert_eq!(error.error_class(), "persistence");
    }
}
