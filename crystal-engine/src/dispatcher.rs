use std::sync::Arc;

use crystal_protocol::{FilterSpec, ResolvedTarget, StaticPolicyEntry};
use crystal_rules::{ActionInfo, ActionKind, ObjectFilter};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::installer::FilterInstaller;
use crate::registry::PolicyRegistry;

/// Result of applying one filter action to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Installed { policy_id: u64 },
    Uninstalled { removed: Vec<u64> },
}

/// Applies `SET` / `DELETE` filter actions through the installer and keeps
/// the static pipeline entries in step.
#[derive(Clone)]
pub struct ActionDispatcher {
    registry: PolicyRegistry,
    installer: Arc<dyn FilterInstaller>,
}

impl ActionDispatcher {
    pub fn new(registry: PolicyRegistry, installer: Arc<dyn FilterInstaller>) -> Self {
        Self { registry, installer }
    }

    /// Fails with `FilterNotFound` before touching the registry if the filter is unknown.
    pub async fn lookup_filter(&self, name: &str) -> Result<FilterSpec, EngineError> {
        self.registry
            .get_filter(name)
            .await?
            .ok_or_else(|| EngineError::FilterNotFound(name.to_string()))
    }

    /// Applies the action. Installer failures are returned as-is and never retried.
    ///
    /// `SET` stores its entry before the installer runs, so the allocated id is
    /// always held by the store; a failed install leaves the entry in place.
    pub async fn apply(
        &self,
        target: &ResolvedTarget,
        action: &ActionInfo,
        object_filter: Option<&ObjectFilter>,
    ) -> Result<DispatchOutcome, EngineError> {
        let filter = self.lookup_filter(&action.filter_name).await?;
        let target_id = target.target_id();

        match action.action {
            ActionKind::Set => {
                let policy_id = self.registry.next_id().await?;
                let entry = StaticPolicyEntry {
                    policy_id,
                    filter_name: filter.name.clone(),
                    object_type: object_filter.and_then(|f| f.object_type.clone()),
                    object_size: object_filter.and_then(|f| f.object_size.clone()),
                    execution_server: action.execution_server.clone(),
                    reverse: None,
                    execution_order: policy_id,
                    params: action.params.clone().unwrap_or_default(),
                    callable: action.callable,
                };

                self.registry.put_static(&target_id, policy_id, &entry).await?;
                if let Err(err) = self.installer.install(target, &filter, &entry).await {
                    warn!(policy_id, target_id = %target_id, filter = %filter.name, error = %err, "filter install failed, entry kept");
                    return Err(err.into());
                }
                info!(policy_id, target_id = %target_id, filter = %filter.name, "filter installed");
                Ok(DispatchOutcome::Installed { policy_id })
            }
            ActionKind::Delete => {
                if let Err(err) = self.installer.uninstall(target, &filter).await {
                    warn!(target_id = %target_id, filter = %filter.name, error = %err, "filter uninstall failed");
                    return Err(err.into());
                }
                let removed = self
                    .registry
                    .delete_static_matching(&target_id, &filter.name)
                    .await?;
                info!(target_id = %target_id, filter = %filter.name, removed = removed.len(), "filter uninstalled");
                Ok(DispatchOutcome::Uninstalled { removed })
            }
        }
    }
}
