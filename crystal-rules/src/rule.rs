use std::fmt;

use crystal_protocol::ObjectSize;
use serde::{Deserialize, Serialize};

use crate::action::ActionInfo;
use crate::condition::Condition;

/// Kind of target a rule is declared against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    Tenant,
    Container,
}

impl TargetKind {
    pub fn parse(keyword: &str) -> Option<Self> {
        if keyword.eq_ignore_ascii_case("TENANT") {
            Some(TargetKind::Tenant)
        } else if keyword.eq_ignore_ascii_case("CONTAINER") {
            Some(TargetKind::Container)
        } else {
            None
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Tenant => f.write_str("TENANT"),
            TargetKind::Container => f.write_str("CONTAINER"),
        }
    }
}

/// Unresolved target as written in the rule: a tenant id or name, or `tenant/container`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RuleTarget {
    pub kind: TargetKind,
    pub expr: String,
}

impl RuleTarget {
    pub fn tenant(expr: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Tenant,
            expr: expr.into(),
        }
    }

    pub fn container(expr: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Container,
            expr: expr.into(),
        }
    }
}

/// Object predicate narrowing which objects a filter applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectFilter {
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_size: Option<ObjectSize>,
}

/// Output of the rule parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledRule {
    pub targets: Vec<RuleTarget>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub object_filter: Option<ObjectFilter>,
    pub actions: Vec<ActionInfo>,
}

impl CompiledRule {
    /// Dynamic rules carry a metric condition and are executed by monitors.
    pub fn is_dynamic(&self) -> bool {
        self.condition.is_some()
    }

    pub fn condition_text(&self) -> Option<String> {
        self.condition.as_ref().map(ToString::to_string)
    }

    pub fn object_type(&self) -> Option<&str> {
        self.object_filter
            .as_ref()
            .and_then(|filter| filter.object_type.as_deref())
    }

    pub fn object_size(&self) -> Option<&ObjectSize> {
        self.object_filter
            .as_ref()
            .and_then(|filter| filter.object_size.as_ref())
    }
}
