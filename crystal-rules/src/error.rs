use thiserror::Error;

/// Errors returned when a rule or one of its conditions cannot be compiled.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleError {
    #[error("malformed rule `{rule}`: {message}")]
    Malformed { rule: String, message: String },
    #[error("invalid condition `{text}`: {message}")]
    InvalidCondition { text: String, message: String },
}

impl RuleError {
    pub fn malformed(rule: impl Into<String>, message: impl Into<String>) -> Self {
        RuleError::Malformed {
            rule: rule.into(),
            message: message.into(),
        }
    }

    pub fn invalid_condition(text: impl Into<String>, message: impl Into<String>) -> Self {
        RuleError::InvalidCondition {
            text: text.into(),
            message: message.into(),
        }
    }
}
