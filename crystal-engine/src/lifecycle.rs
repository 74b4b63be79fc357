use std::collections::HashMap;
use std::sync::Arc;

use crystal_core::config::{CoreConfig, TransientRetirement};
use crystal_protocol::{DynamicPolicyRecord, ResolvedTarget};
use crystal_rules::{ActionInfo, CompiledRule, Condition, ObjectFilter, RuleParser};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::dispatcher::ActionDispatcher;
use crate::error::EngineError;
use crate::fanout::MetricFanout;
use crate::monitor::{self, Monitor, MonitorBinding, MonitorHandle, MonitorKind};
use crate::registry::PolicyRegistry;

/// Switches governing what happens to records when monitors fire.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub node_name: String,
    pub transient_retirement: TransientRetirement,
    pub persistent_alive_after_fire: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            node_name: "crystal-node".into(),
            transient_retirement: TransientRetirement::MarkInactive,
            persistent_alive_after_fire: true,
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            transient_retirement: config.transient_retirement,
            persistent_alive_after_fire: config.persistent_alive_after_fire,
        }
    }

    fn dispatch_location(&self, kind: MonitorKind, policy_id: u64) -> String {
        format!(
            "{}/monitors/{}/{}",
            self.node_name,
            kind,
            DynamicPolicyRecord::store_key(policy_id)
        )
    }
}

/// Per-target result of deploying a dynamic rule.
#[derive(Debug, Serialize)]
pub struct TargetFailure {
    pub target_id: String,
    pub filter_name: String,
    pub error: EngineError,
}

#[derive(Debug, Default, Serialize)]
pub struct DynamicDeployment {
    pub policies: Vec<u64>,
    pub failures: Vec<TargetFailure>,
}

/// A stored record that did not get a monitor during [`MonitorManager::reload`].
#[derive(Debug, Clone, Serialize)]
pub struct ReloadFailure {
    pub key: String,
    /// `None` when the record could not be decoded at all.
    pub policy_id: Option<u64>,
    pub reason: String,
}

/// Outcome of rebuilding monitors from the registry.
///
/// `alive_records` counts undecodable records too, since their `alive` flag is unknown.
#[derive(Debug, Default, Serialize)]
pub struct ReloadReport {
    pub alive_records: usize,
    pub spawned: Vec<u64>,
    pub failed: Vec<ReloadFailure>,
}

impl ReloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.spawned.len() == self.alive_records
    }
}

struct ManagerInner {
    registry: PolicyRegistry,
    dispatcher: ActionDispatcher,
    fanout: MetricFanout,
    parser: Arc<dyn RuleParser>,
    settings: MonitorSettings,
    handles: RwLock<HashMap<u64, Arc<MonitorHandle>>>,
}

/// Owner of every live monitor, keyed by policy id.
///
/// The manager is the only writer of the handle table. Monitor tasks hold a
/// clone to report their own retirement.
#[derive(Clone)]
pub struct MonitorManager {
    inner: Arc<ManagerInner>,
}

impl MonitorManager {
    pub fn new(
        registry: PolicyRegistry,
        dispatcher: ActionDispatcher,
        fanout: MetricFanout,
        parser: Arc<dyn RuleParser>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                dispatcher,
                fanout,
                parser,
                settings,
                handles: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.inner.dispatcher
    }

    pub fn fanout(&self) -> &MetricFanout {
        &self.inner.fanout
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    pub fn contains(&self, policy_id: u64) -> bool {
        self.inner.handles.read().contains_key(&policy_id)
    }

    pub fn len(&self) -> usize {
        self.inner.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.handles.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Starts a monitor for `record` and subscribes it to its tenant's samples.
    pub fn spawn(
        &self,
        record: &DynamicPolicyRecord,
        action: &ActionInfo,
        target: &ResolvedTarget,
        object_filter: Option<ObjectFilter>,
    ) -> Result<Arc<MonitorHandle>, EngineError> {
        let policy_id = record.id;
        let condition = Condition::parse(&record.condition_text)
            .map_err(|err| EngineError::spawn_failed(policy_id, err.to_string()))?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::spawn_failed(policy_id, "no async runtime available"));
        }

        let kind = MonitorKind::for_action(action);
        let binding = MonitorBinding {
            target: target.clone(),
            action: action.clone(),
            object_filter,
        };

        let mut handles = self.inner.handles.write();
        if handles.contains_key(&policy_id) {
            return Err(EngineError::spawn_failed(policy_id, "monitor already running"));
        }
        let handle = monitor::start(Monitor::new(kind, policy_id, condition), binding, self.clone());
        handles.insert(policy_id, handle.clone());
        self.inner.fanout.attach(&target.tenant_id, handle.clone());
        drop(handles);

        info!(policy_id, %kind, target_id = %target.target_id(), "monitor spawned");
        Ok(handle)
    }

    /// Persists and spawns one monitor per target and action of a dynamic rule.
    ///
    /// Store failures abort the deployment; spawn failures are reported per
    /// target and leave the record in place with `alive = true`.
    pub async fn deploy_dynamic(
        &self,
        rule_text: &str,
        rule: &CompiledRule,
        targets: &[ResolvedTarget],
    ) -> Result<DynamicDeployment, EngineError> {
        let condition_text = rule
            .condition_text()
            .ok_or_else(|| EngineError::MalformedRule("dynamic rule without condition".into()))?;

        let mut deployment = DynamicDeployment::default();
        for target in targets {
            for (action_index, action) in rule.actions.iter().enumerate() {
                let policy_id = self.inner.registry.next_id().await?;
                let kind = MonitorKind::for_action(action);
                let record = DynamicPolicyRecord {
                    id: policy_id,
                    raw_rule_text: rule_text.trim().to_string(),
                    target_name: target.target_name(),
                    target_id: target.target_id(),
                    filter_name: action.filter_name.clone(),
                    action: action.action.as_str().to_string(),
                    action_index,
                    condition_text: condition_text.clone(),
                    object_type: rule.object_type().map(str::to_string),
                    object_size: rule.object_size().cloned(),
                    transient: action.transient,
                    dispatch_location: self.inner.settings.dispatch_location(kind, policy_id),
                    alive: true,
                };
                if let Err(err) = self.inner.registry.put_dynamic(&record).await {
                    if let Err(release) = self.inner.registry.release_id(policy_id).await {
                        warn!(policy_id, error = %release, "could not release policy id");
                    }
                    return Err(err);
                }

                match self.spawn(&record, action, target, rule.object_filter.clone()) {
                    Ok(_) => deployment.policies.push(policy_id),
                    Err(err) => {
                        error!(policy_id, target_id = %record.target_id, error = %err, "monitor spawn failed");
                        deployment.failures.push(TargetFailure {
                            target_id: record.target_id.clone(),
                            filter_name: record.filter_name.clone(),
                            error: err,
                        });
                    }
                }
            }
        }
        Ok(deployment)
    }

    /// Rebuilds one monitor per `alive` record. Failed records stay alive for a later respawn.
    pub async fn reload(&self) -> Result<ReloadReport, EngineError> {
        let scan = self.inner.registry.scan_dynamic().await?;
        let mut report = ReloadReport::default();

        for (key, reason) in scan.undecodable {
            error!(%key, %reason, "undecodable policy record left without a monitor");
            report.alive_records += 1;
            report.failed.push(ReloadFailure {
                policy_id: key
                    .strip_prefix(crate::registry::POLICY_PREFIX)
                    .and_then(|id| id.parse().ok()),
                key,
                reason,
            });
        }

        for record in scan.records.into_iter().filter(|record| record.alive) {
            report.alive_records += 1;
            if self.contains(record.id) {
                report.spawned.push(record.id);
                continue;
            }
            match self.spawn_from_record(&record) {
                Ok(()) => report.spawned.push(record.id),
                Err(err) => {
                    error!(policy_id = record.id, error = %err, "could not restore monitor");
                    report.failed.push(ReloadFailure {
                        key: DynamicPolicyRecord::store_key(record.id),
                        policy_id: Some(record.id),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if report.is_complete() {
            info!(monitors = report.spawned.len(), "dynamic policies restored");
        } else {
            warn!(
                alive = report.alive_records,
                spawned = report.spawned.len(),
                "not every alive policy has a running monitor"
            );
        }
        Ok(report)
    }

    fn spawn_from_record(&self, record: &DynamicPolicyRecord) -> Result<(), EngineError> {
        let (_, rule) = self
            .inner
            .parser
            .parse(&record.raw_rule_text)
            .map_err(|err| EngineError::spawn_failed(record.id, err.to_string()))?;
        let action = rule
            .actions
            .get(record.action_index)
            .filter(|action| {
                action.filter_name == record.filter_name && action.action.as_str() == record.action
            })
            .ok_or_else(|| {
                EngineError::spawn_failed(
                    record.id,
                    format!(
                        "rule has no {} {} at position {}",
                        record.action, record.filter_name, record.action_index
                    ),
                )
            })?;
        self.spawn(record, action, &record.target(), rule.object_filter.clone())?;
        Ok(())
    }

    /// Re-spawns the monitor of an existing record, e.g. after a failed reload.
    pub async fn respawn(&self, policy_id: u64) -> Result<(), EngineError> {
        if self.contains(policy_id) {
            return Err(EngineError::spawn_failed(policy_id, "monitor already running"));
        }
        let record = self
            .inner
            .registry
            .get_dynamic(policy_id)
            .await?
            .ok_or_else(|| EngineError::PolicyNotFound(policy_id.to_string()))?;

        self.spawn_from_record(&record)?;
        if !record.alive {
            self.inner.registry.set_alive(policy_id, true).await?;
        }
        Ok(())
    }

    fn detach(&self, policy_id: u64) -> Option<Arc<MonitorHandle>> {
        let handle = self.inner.handles.write().remove(&policy_id)?;
        handle.stop();
        self.inner.fanout.detach(&handle.target().tenant_id, policy_id);
        Some(handle)
    }

    /// Stops the monitor (if any) and deletes the record. Unknown ids are a no-op.
    pub async fn remove(&self, policy_id: u64) -> Result<bool, EngineError> {
        let had_monitor = self.detach(policy_id).is_some();
        let had_record = self.inner.registry.delete_dynamic(policy_id).await?;
        if had_monitor || had_record {
            info!(policy_id, "dynamic policy removed");
        }
        Ok(had_monitor || had_record)
    }

    /// Called by a transient monitor after its action succeeded.
    pub(crate) async fn retire(&self, policy_id: u64) {
        if self.detach(policy_id).is_none() {
            return;
        }
        let result = match self.inner.settings.transient_retirement {
            TransientRetirement::MarkInactive => self.inner.registry.set_alive(policy_id, false).await.map(|_| ()),
            TransientRetirement::Delete => self.inner.registry.delete_dynamic(policy_id).await.map(|_| ()),
        };
        match result {
            Ok(()) => info!(policy_id, "transient policy retired"),
            Err(err) => error!(policy_id, error = %err, "could not record transient retirement"),
        }
    }

    pub(crate) async fn after_persistent_fire(&self, policy_id: u64) {
        if self.inner.settings.persistent_alive_after_fire {
            return;
        }
        if let Err(err) = self.inner.registry.set_alive(policy_id, false).await {
            error!(policy_id, error = %err, "could not mark fired policy inactive");
        }
    }

    /// Stops every live monitor and waits for the tasks. Records are left untouched.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<MonitorHandle>> = self.inner.handles.write().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop();
            self.inner
                .fanout
                .detach(&handle.target().tenant_id, handle.policy_id());
        }
        for handle in handles {
            handle.join().await;
        }
        info!("monitor manager stopped");
    }
}
