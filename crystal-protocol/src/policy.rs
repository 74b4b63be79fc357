use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical target a policy applies to: a tenant, optionally narrowed to a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResolvedTarget {
    pub tenant_id: String,
    pub tenant_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl ResolvedTarget {
    pub fn tenant(tenant_id: impl Into<String>, tenant_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tenant_name: tenant_name.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Identifier used as the pipeline key: `tenant_id` or `tenant_id/container`.
    pub fn target_id(&self) -> String {
        match &self.container {
            Some(container) => format!("{}/{}", self.tenant_id, container),
            None => self.tenant_id.clone(),
        }
    }

    /// Human readable counterpart of [`ResolvedTarget::target_id`].
    pub fn target_name(&self) -> String {
        match &self.container {
            Some(container) => format!("{}/{}", self.tenant_name, container),
            None => self.tenant_name.clone(),
        }
    }

    /// Rebuilds a target from the persisted `target_id` / `target_name` pair.
    pub fn from_persisted(target_id: &str, target_name: &str) -> Self {
        let (tenant_id, container) = match target_id.split_once('/') {
            Some((tenant, container)) => (tenant, Some(container.to_string())),
            None => (target_id, None),
        };
        let tenant_name = target_name
            .split_once('/')
            .map(|(name, _)| name)
            .unwrap_or(target_name);

        Self {
            tenant_id: tenant_id.to_string(),
            tenant_name: tenant_name.to_string(),
            container,
        }
    }
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_name(), self.target_id())
    }
}

/// Object size predicate attached to a policy, e.g. `> 1048576`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectSize {
    pub operand: String,
    pub value: u64,
}

impl fmt::Display for ObjectSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operand, self.value)
    }
}

/// Filter inserted into a target's pipeline, stored under `pipeline:<target>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticPolicyEntry {
    pub policy_id: u64,
    pub filter_name: String,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_size: Option<ObjectSize>,
    #[serde(default)]
    pub execution_server: Option<String>,
    #[serde(default)]
    pub reverse: Option<String>,
    /// Shares the counter with `policy_id`; pipelines run in ascending order.
    pub execution_order: u64,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub callable: bool,
}

/// Listing view of a static policy with its target resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticPolicyView {
    pub id: u64,
    pub target_id: String,
    pub target_name: String,
    #[serde(flatten)]
    pub entry: StaticPolicyEntry,
}

/// Errors raised when a persisted dynamic policy hash cannot be decoded.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("missing field `{0}` in policy record")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Persisted state of a dynamic (condition-gated) policy, stored as the hash `policy:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DynamicPolicyRecord {
    pub id: u64,
    pub raw_rule_text: String,
    pub target_name: String,
    pub target_id: String,
    pub filter_name: String,
    /// Verb of the bound action (`SET` / `DELETE`).
    pub action: String,
    /// Position of the bound action among the rule's `DO` clauses.
    pub action_index: usize,
    pub condition_text: String,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_size: Option<ObjectSize>,
    pub transient: bool,
    pub dispatch_location: String,
    /// `false` keeps the record for auditing without a live monitor.
    pub alive: bool,
}

impl DynamicPolicyRecord {
    pub fn store_key(id: u64) -> String {
        format!("policy:{}", id)
    }

    pub fn target(&self) -> ResolvedTarget {
        ResolvedTarget::from_persisted(&self.target_id, &self.target_name)
    }

    /// Encodes the record as hash fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let object_size = self
            .object_size
            .as_ref()
            .and_then(|size| serde_json::to_string(size).ok())
            .unwrap_or_default();

        vec![
            ("id".into(), self.id.to_string()),
            ("raw_rule_text".into(), self.raw_rule_text.clone()),
            ("target_name".into(), self.target_name.clone()),
            ("target_id".into(), self.target_id.clone()),
            ("filter_name".into(), self.filter_name.clone()),
            ("action".into(), self.action.clone()),
            ("action_index".into(), self.action_index.to_string()),
            ("condition_text".into(), self.condition_text.clone()),
            (
                "object_type".into(),
                self.object_type.clone().unwrap_or_default(),
            ),
            ("object_size".into(), object_size),
            ("transient".into(), self.transient.to_string()),
            ("dispatch_location".into(), self.dispatch_location.clone()),
            ("alive".into(), self.alive.to_string()),
        ]
    }

    /// Decodes a record from the hash fields written by [`DynamicPolicyRecord::to_fields`].
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, RecordError> {
        let get = |name: &'static str| {
            fields
                .get(name)
                .cloned()
                .ok_or(RecordError::MissingField(name))
        };

        let raw_id = get("id")?;
        let id = raw_id.parse().map_err(|_| RecordError::InvalidField {
            field: "id",
            value: raw_id.clone(),
        })?;

        let raw_index = get("action_index")?;
        let action_index = raw_index.parse().map_err(|_| RecordError::InvalidField {
            field: "action_index",
            value: raw_index.clone(),
        })?;

        let object_type = fields
            .get("object_type")
            .filter(|value| !value.is_empty())
            .cloned();
        let object_size = match fields.get("object_size").filter(|value| !value.is_empty()) {
            Some(raw) => Some(serde_json::from_str(raw).map_err(|_| {
                RecordError::InvalidField {
                    field: "object_size",
                    value: raw.clone(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            id,
            raw_rule_text: get("raw_rule_text")?,
            target_name: get("target_name")?,
            target_id: get("target_id")?,
            filter_name: get("filter_name")?,
            action: get("action")?,
            action_index,
            condition_text: get("condition_text")?,
            object_type,
            object_size,
            transient: parse_flag(fields, "transient")?,
            dispatch_location: fields.get("dispatch_location").cloned().unwrap_or_default(),
            alive: parse_flag(fields, "alive")?,
        })
    }
}

fn parse_flag(fields: &BTreeMap<String, String>, name: &'static str) -> Result<bool, RecordError> {
    let raw = fields.get(name).ok_or(RecordError::MissingField(name))?;
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(RecordError::InvalidField {
            field: name,
            value: raw.clone(),
        }),
    }
}
