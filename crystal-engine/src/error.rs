use crystal_protocol::RecordError;
use crystal_rules::RuleError;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::installer::InstallerError;
use crate::store::StoreError;

/// Errors surfaced by the policy engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("project `{0}` does not exist")]
    ProjectNotFound(String),
    #[error("project `{0}` is not Crystal enabled")]
    ProjectNotCrystalEnabled(String),
    #[error("filter `{0}` does not exist")]
    FilterNotFound(String),
    #[error("malformed rule: {0}")]
    MalformedRule(String),
    #[error("malformed metric sample: {0}")]
    MalformedSample(String),
    #[error("policy store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("remote filter action failed: {0}")]
    RemoteActionFailed(String),
    #[error("policy {0} not found")]
    PolicyNotFound(String),
    #[error("failed to spawn monitor for policy {policy_id}: {reason}")]
    SpawnFailed { policy_id: u64, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Stable machine readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ProjectNotFound(_) => "project_not_found",
            EngineError::ProjectNotCrystalEnabled(_) => "project_not_crystal_enabled",
            EngineError::FilterNotFound(_) => "filter_not_found",
            EngineError::MalformedRule(_) => "malformed_rule",
            EngineError::MalformedSample(_) => "malformed_sample",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::RemoteActionFailed(_) => "remote_action_failed",
            EngineError::PolicyNotFound(_) => "policy_not_found",
            EngineError::SpawnFailed { .. } => "spawn_failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub(crate) fn spawn_failed(policy_id: u64, reason: impl Into<String>) -> Self {
        EngineError::SpawnFailed {
            policy_id,
            reason: reason.into(),
        }
    }
}

impl Serialize for EngineError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_struct("EngineError", 2)?;
        body.serialize_field("code", self.code())?;
        body.serialize_field("message", &self.to_string())?;
        body.end()
    }
}

impl From<RuleError> for EngineError {
    fn from(err: RuleError) -> Self {
        EngineError::MalformedRule(err.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

impl From<RecordError> for EngineError {
    fn from(err: RecordError) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

impl From<InstallerError> for EngineError {
    fn from(err: InstallerError) -> Self {
        match err {
            InstallerError::FilterNotFound(name) => EngineError::FilterNotFound(name),
            other => EngineError::RemoteActionFailed(other.to_string()),
        }
    }
}
