use std::collections::BTreeMap;
use std::sync::Arc;

use crystal_protocol::{DynamicPolicyRecord, ObjectTypeEntry, ResolvedTarget, SloEntry, StaticPolicyView};
use crystal_rules::{CompiledRule, RuleParser};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::dispatcher::{ActionDispatcher, DispatchOutcome};
use crate::error::EngineError;
use crate::fanout::MetricFanout;
use crate::installer::FilterInstaller;
use crate::lifecycle::{MonitorManager, MonitorSettings, ReloadReport, TargetFailure};
use crate::registry::PolicyRegistry;
use crate::resolver::{display_name, TargetResolver, TenantDirectory};
use crate::store::PolicyStore;

/// Result of deploying one rule line.
#[derive(Debug, Serialize)]
pub struct LineReport {
    pub rule: String,
    pub dynamic: bool,
    pub policies: Vec<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<TargetFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

impl LineReport {
    fn new(rule: &str) -> Self {
        Self {
            rule: rule.to_string(),
            dynamic: false,
            policies: Vec::new(),
            failures: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DeployReport {
    pub lines: Vec<LineReport>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.lines
            .iter()
            .all(|line| line.error.is_none() && line.failures.is_empty())
    }

    /// First rule-level error, if any line was rejected as a whole.
    pub fn first_error(&self) -> Option<&EngineError> {
        self.lines.iter().find_map(|line| line.error.as_ref())
    }

    pub fn policies(&self) -> impl Iterator<Item = u64> + '_ {
        self.lines.iter().flat_map(|line| line.policies.iter().copied())
    }
}

/// A dynamic record together with the state of its monitor.
#[derive(Debug, Serialize)]
pub struct DynamicPolicyView {
    #[serde(flatten)]
    pub record: DynamicPolicyRecord,
    pub running: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub samples: usize,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

/// Entry point used by the HTTP boundary, the binaries and integration tests.
#[derive(Clone)]
pub struct PolicyService {
    registry: PolicyRegistry,
    resolver: TargetResolver,
    dispatcher: ActionDispatcher,
    manager: MonitorManager,
    parser: Arc<dyn RuleParser>,
}

impl PolicyService {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        directory: Arc<dyn TenantDirectory>,
        installer: Arc<dyn FilterInstaller>,
        parser: Arc<dyn RuleParser>,
        settings: MonitorSettings,
    ) -> Self {
        let registry = PolicyRegistry::new(store);
        let dispatcher = ActionDispatcher::new(registry.clone(), installer);
        let manager = MonitorManager::new(
            registry.clone(),
            dispatcher.clone(),
            MetricFanout::new(),
            parser.clone(),
            settings,
        );
        Self {
            registry,
            resolver: TargetResolver::new(directory),
            dispatcher,
            manager,
            parser,
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    pub fn manager(&self) -> &MonitorManager {
        &self.manager
    }

    pub fn fanout(&self) -> &MetricFanout {
        self.manager.fanout()
    }

    /// Deploys every non-empty line of `text` as an independent rule.
    ///
    /// A line fails as a whole on parse, resolution or filter lookup errors.
    /// Once targets are resolved, failures are recorded per target, except
    /// `StoreUnavailable` which stops the line.
    pub async fn deploy(&self, text: &str) -> DeployReport {
        let mut report = DeployReport::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut line_report = LineReport::new(line);
            if let Err(err) = self.deploy_line(line, &mut line_report).await {
                warn!(rule = %line, error = %err, "rule rejected");
                line_report.error = Some(err);
            }
            report.lines.push(line_report);
        }
        report
    }

    async fn deploy_line(&self, line: &str, report: &mut LineReport) -> Result<(), EngineError> {
        let (dynamic, rule) = self.parser.parse(line)?;
        report.dynamic = dynamic;
        let targets = self.resolver.resolve_rule(&rule).await?;
        for action in &rule.actions {
            self.dispatcher.lookup_filter(&action.filter_name).await?;
        }

        if dynamic {
            let deployment = self.manager.deploy_dynamic(line, &rule, &targets).await?;
            report.policies = deployment.policies;
            report.failures = deployment.failures;
        } else {
            self.deploy_static(&rule, &targets, report).await?;
        }
        info!(
            rule = %line,
            dynamic,
            policies = report.policies.len(),
            failures = report.failures.len(),
            "rule deployed"
        );
        Ok(())
    }

    async fn deploy_static(
        &self,
        rule: &CompiledRule,
        targets: &[ResolvedTarget],
        report: &mut LineReport,
    ) -> Result<(), EngineError> {
        for target in targets {
            for action in &rule.actions {
                match self
                    .dispatcher
                    .apply(target, action, rule.object_filter.as_ref())
                    .await
                {
                    Ok(DispatchOutcome::Installed { policy_id }) => report.policies.push(policy_id),
                    Ok(DispatchOutcome::Uninstalled { .. }) => {}
                    Err(err @ EngineError::StoreUnavailable(_)) => return Err(err),
                    Err(err) => report.failures.push(TargetFailure {
                        target_id: target.target_id(),
                        filter_name: action.filter_name.clone(),
                        error: err,
                    }),
                }
            }
        }
        Ok(())
    }

    // Static policies

    async fn tenant_names(&self) -> Result<BTreeMap<String, String>, EngineError> {
        let mut tenants = self.resolver.directory().list_tenants().await?;
        tenants.insert("global".into(), "Global".into());
        Ok(tenants)
    }

    pub async fn list_static(&self, target_id: Option<&str>) -> Result<Vec<StaticPolicyView>, EngineError> {
        let tenants = self.tenant_names().await?;
        let entries = self.registry.list_static(target_id).await?;
        Ok(entries
            .into_iter()
            .map(|(target_id, entry)| StaticPolicyView {
                id: entry.policy_id,
                target_name: display_name(&target_id, &tenants),
                target_id,
                entry,
            })
            .collect())
    }

    pub async fn get_static(&self, target_id: &str, policy_id: u64) -> Result<StaticPolicyView, EngineError> {
        let entry = self
            .registry
            .get_static(target_id, policy_id)
            .await?
            .ok_or_else(|| EngineError::PolicyNotFound(format!("{}:{}", target_id, policy_id)))?;
        Ok(StaticPolicyView {
            id: policy_id,
            target_id: target_id.to_string(),
            target_name: self.resolver.target_name(target_id).await?,
            entry,
        })
    }

    pub async fn update_static(
        &self,
        target_id: &str,
        policy_id: u64,
        patch: Map<String, Value>,
    ) -> Result<StaticPolicyView, EngineError> {
        let entry = self.registry.update_static(target_id, policy_id, patch).await?;
        Ok(StaticPolicyView {
            id: policy_id,
            target_id: target_id.to_string(),
            target_name: self.resolver.target_name(target_id).await?,
            entry,
        })
    }

    pub async fn delete_static(&self, target_id: &str, policy_id: u64) -> Result<(), EngineError> {
        if self.registry.delete_static(target_id, policy_id).await? {
            Ok(())
        } else {
            Err(EngineError::PolicyNotFound(format!("{}:{}", target_id, policy_id)))
        }
    }

    // Dynamic policies

    pub async fn list_dynamic(&self) -> Result<Vec<DynamicPolicyView>, EngineError> {
        let records = self.registry.list_dynamic().await?;
        Ok(records
            .into_iter()
            .map(|record| DynamicPolicyView {
                running: self.manager.contains(record.id),
                record,
            })
            .collect())
    }

    pub async fn get_dynamic(&self, policy_id: u64) -> Result<DynamicPolicyView, EngineError> {
        let record = self
            .registry
            .get_dynamic(policy_id)
            .await?
            .ok_or_else(|| EngineError::PolicyNotFound(policy_id.to_string()))?;
        Ok(DynamicPolicyView {
            running: self.manager.contains(policy_id),
            record,
        })
    }

    /// Unknown ids are accepted silently so clients may retry.
    pub async fn delete_dynamic(&self, policy_id: u64) -> Result<bool, EngineError> {
        self.manager.remove(policy_id).await
    }

    pub async fn respawn(&self, policy_id: u64) -> Result<(), EngineError> {
        self.manager.respawn(policy_id).await
    }

    pub async fn reload(&self) -> Result<ReloadReport, EngineError> {
        self.manager.reload().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    // Metrics

    /// Ingests newline separated metric lines. Malformed lines are reported, not fatal.
    pub fn ingest_metrics(&self, body: &str) -> IngestReport {
        let mut report = IngestReport::default();
        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            match self.fanout().ingest(line) {
                Ok(delivered) => {
                    report.samples += 1;
                    report.delivered += delivered;
                }
                Err(err) => report.rejected.push(err.to_string()),
            }
        }
        report
    }

    // Object types and SLOs

    pub async fn list_object_types(&self) -> Result<Vec<ObjectTypeEntry>, EngineError> {
        self.registry.list_object_types().await
    }

    pub async fn get_object_type(&self, name: &str) -> Result<ObjectTypeEntry, EngineError> {
        self.registry
            .get_object_type(name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("object type {}", name)))
    }

    pub async fn create_object_type(&self, entry: &ObjectTypeEntry) -> Result<(), EngineError> {
        self.registry.create_object_type(entry).await
    }

    pub async fn replace_object_type(&self, name: &str, types_list: Vec<String>) -> Result<(), EngineError> {
        self.registry.replace_object_type(name, types_list).await
    }

    pub async fn delete_object_type(&self, name: &str) -> Result<(), EngineError> {
        self.registry.delete_object_type(name).await
    }

    pub async fn remove_object_type_item(&self, name: &str, item: &str) -> Result<(), EngineError> {
        self.registry.remove_object_type_item(name, item).await
    }

    pub async fn list_slos(&self) -> Result<Vec<SloEntry>, EngineError> {
        self.registry.list_slos().await
    }

    pub async fn put_slo(&self, slo: &SloEntry) -> Result<(), EngineError> {
        self.registry.put_slo(slo).await
    }

    pub async fn get_slo(&self, dsl_filter: &str, slo_name: &str, target: &str) -> Result<SloEntry, EngineError> {
        self.registry
            .get_slo(dsl_filter, slo_name, target)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("SLO {}:{}:{}", dsl_filter, slo_name, target)))
    }

    pub async fn delete_slo(&self, dsl_filter: &str, slo_name: &str, target: &str) -> Result<(), EngineError> {
        if self.registry.delete_slo(dsl_filter, slo_name, target).await? {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("SLO {}:{}:{}", dsl_filter, slo_name, target)))
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use crystal_protocol::{FilterSpec, StaticPolicyEntry};
    use crystal_rules::DslParser;
    use parking_lot::Mutex;

    use super::*;
    use crate::installer::InstallerError;
    use crate::resolver::StaticTenantDirectory;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct FakeInstaller {
        calls: Mutex<Vec<String>>,
        reject_target: Option<String>,
    }

    #[async_trait]
    impl FilterInstaller for FakeInstaller {
        async fn install(
            &self,
            target: &ResolvedTarget,
            filter: &FilterSpec,
            _policy: &StaticPolicyEntry,
        ) -> Result<(), InstallerError> {
            if self.reject_target.as_deref() == Some(target.target_id().as_str()) {
                return Err(InstallerError::UnexpectedStatus {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                });
            }
            self.calls
                .lock()
                .push(format!("install {} {}", target.target_id(), filter.name));
            Ok(())
        }

        async fn uninstall(&self, target: &ResolvedTarget, filter: &FilterSpec) -> Result<(), InstallerError> {
            self.calls
                .lock()
                .push(format!("uninstall {} {}", target.target_id(), filter.name));
            Ok(())
        }
    }

    async fn service_with(installer: Arc<FakeInstaller>) -> PolicyService {
        let directory = StaticTenantDirectory::new()
            .with_tenant("t1", "alice")
            .with_tenant("t2", "bob")
            .with_disabled_tenant("t3", "carol");
        let service = PolicyService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(directory),
            installer,
            Arc::new(DslParser::new()),
            MonitorSettings::default(),
        );
        service.registry().put_filter(&FilterSpec::new("compress")).await.unwrap();
        service.registry().put_filter(&FilterSpec::new("encrypt")).await.unwrap();
        service
    }

    #[tokio::test]
    async fn static_rule_installs_in_execution_order() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        let report = service
            .deploy("TENANT alice DO SET compress, SET encrypt WITH mode=fast")
            .await;

        assert!(report.is_success());
        assert_eq!(report.policies().collect::<Vec<_>>(), vec![1, 2]);

        let views = service.list_static(Some("t1")).await.unwrap();
        assert_eq!(views.len(), 2);
        assert!(views.windows(2).all(|pair| pair[0].entry.execution_order < pair[1].entry.execution_order));
        assert_eq!(views[0].target_name, "alice");
        assert_eq!(views[1].entry.params, "mode=fast");
    }

    #[tokio::test]
    async fn resolution_failure_allocates_nothing() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        let report = service.deploy("TENANT alice, TENANT carol DO SET compress").await;

        assert!(matches!(
            report.first_error(),
            Some(EngineError::ProjectNotCrystalEnabled(id)) if id == "t3"
        ));
        let report = service.deploy("TENANT nobody WHEN put_bw > 1 DO SET compress").await;
        assert!(matches!(report.first_error(), Some(EngineError::ProjectNotFound(_))));

        assert!(service.list_static(None).await.unwrap().is_empty());
        assert!(service.list_dynamic().await.unwrap().is_empty());
        assert_eq!(service.registry().next_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_filter_rejects_line_before_allocation() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        let report = service.deploy("TENANT alice DO SET compress, SET missing").await;

        assert!(matches!(report.first_error(), Some(EngineError::FilterNotFound(_))));
        assert_eq!(service.registry().next_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remote_failure_is_reported_per_target() {
        let installer = Arc::new(FakeInstaller {
            reject_target: Some("t2".into()),
            ..FakeInstaller::default()
        });
        let service = service_with(installer).await;
        let report = service.deploy("TENANT alice, TENANT bob DO SET compress").await;

        let line = &report.lines[0];
        assert!(line.error.is_none());
        assert_eq!(line.policies, vec![1]);
        assert_eq!(line.failures.len(), 1);
        assert_eq!(line.failures[0].target_id, "t2");
        assert!(matches!(line.failures[0].error, EngineError::RemoteActionFailed(_)));
    }

    #[tokio::test]
    async fn lines_are_deployed_independently() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        let report = service
            .deploy("TENANT alice DO SET compress\n\n# comment\nthis is not a rule\nTENANT bob WHEN put_bw > 5 DO SET encrypt")
            .await;

        assert_eq!(report.lines.len(), 3);
        assert!(report.lines[0].error.is_none());
        assert!(matches!(report.lines[1].error, Some(EngineError::MalformedRule(_))));
        assert!(report.lines[2].dynamic);
        assert_eq!(service.list_dynamic().await.unwrap().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn deleting_everything_resets_ids() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        service.deploy("TENANT alice DO SET compress").await;
        let dynamic = service
            .deploy("TENANT bob WHEN put_bw > 5 DO SET encrypt")
            .await
            .policies()
            .collect::<Vec<_>>();

        service.delete_static("t1", 1).await.unwrap();
        assert!(matches!(
            service.delete_static("t1", 1).await,
            Err(EngineError::PolicyNotFound(_))
        ));
        assert!(service.delete_dynamic(dynamic[0]).await.unwrap());
        assert!(!service.delete_dynamic(dynamic[0]).await.unwrap());

        assert_eq!(service.registry().next_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_static_merges_fields() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        service.deploy("CONTAINER alice/photos DO SET compress").await;

        let mut patch = Map::new();
        patch.insert("params".into(), Value::String("level=9".into()));
        let view = service.update_static("t1/photos", 1, patch).await.unwrap();

        assert_eq!(view.target_name, "alice/photos");
        assert_eq!(view.entry.params, "level=9");
        assert_eq!(view.entry.filter_name, "compress");
    }

    #[tokio::test]
    async fn ingest_reports_rejected_lines() {
        let service = service_with(Arc::new(FakeInstaller::default())).await;
        let report = service.ingest_metrics(
            "{\"tenant_id\":\"t1\",\"metric_name\":\"put_bw\",\"value\":3}\ngarbage\n",
        );
        assert_eq!(report.samples, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.rejected.len(), 1);
    }
}
