use serde::{Deserialize, Serialize};

/// Verb applied to a filter when a rule triggers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Insert the filter into the target pipeline.
    Set,
    /// Remove the filter from the target pipeline.
    Delete,
}

impl ActionKind {
    /// Keyword as written in rule text.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Set => "SET",
            ActionKind::Delete => "DELETE",
        }
    }
}

/// One `DO` clause of a rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionInfo {
    pub action: ActionKind,
    pub filter_name: String,
    #[serde(default)]
    pub execution_server: Option<String>,
    #[serde(default)]
    pub params: Option<String>,
    /// Fire once and retire instead of monitoring continuously.
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub callable: bool,
}

impl ActionInfo {
    pub fn set(filter_name: impl Into<String>) -> Self {
        Self {
            action: ActionKind::Set,
            filter_name: filter_name.into(),
            execution_server: None,
            params: None,
            transient: false,
            callable: false,
        }
    }

    pub fn delete(filter_name: impl Into<String>) -> Self {
        Self {
            action: ActionKind::Delete,
            ..Self::set(filter_name)
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}
