// End-to-end checks of the policy engine against an in-memory store.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crystal::crystal_engine::{
    FilterInstaller, InstallerError, MemoryStore, MonitorSettings, PolicyStore, StaticTenantDirectory,
};
use crystal::crystal_protocol::FilterSpec;
use crystal::{DslParser, MetricSample, PolicyService, ResolvedTarget, StaticPolicyEntry};
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingInstaller {
    installs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl FilterInstaller for RecordingInstaller {
    async fn install(
        &self,
        target: &ResolvedTarget,
        filter: &FilterSpec,
        _policy: &StaticPolicyEntry,
    ) -> Result<(), InstallerError> {
        self.installs
            .lock()
            .push((target.target_id(), filter.name.clone()));
        Ok(())
    }

    async fn uninstall(&self, _target: &ResolvedTarget, _filter: &FilterSpec) -> Result<(), InstallerError> {
        Ok(())
    }
}

fn directory() -> Arc<StaticTenantDirectory> {
    Arc::new(
        StaticTenantDirectory::new()
            .with_tenant("t1", "alice")
            .with_tenant("t2", "bob"),
    )
}

async fn service(store: Arc<dyn PolicyStore>, installer: Arc<RecordingInstaller>) -> PolicyService {
    let service = PolicyService::new(
        store,
        directory(),
        installer,
        Arc::new(DslParser::new()),
        MonitorSettings::default(),
    );
    service
        .registry()
        .put_filter(&FilterSpec::new("compress"))
        .await
        .expect("filter registered");
    service
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn transient_rule_fires_once_then_retires() {
    let installer = Arc::new(RecordingInstaller::default());
    let service = service(Arc::new(MemoryStore::new()), installer.clone()).await;

    let report = service
        .deploy("TENANT alice WHEN put_bw > 100 DO SET filter=compress TRANSIENT")
        .await;
    assert!(report.is_success());
    let policy_id = report.lines[0].policies[0];

    let record = service.get_dynamic(policy_id).await.expect("record stored");
    assert!(record.running);
    assert!(record.record.transient);
    assert!(record.record.alive);
    assert_eq!(record.record.target_id, "t1");
    assert_eq!(record.record.filter_name, "compress");
    assert_eq!(service.fanout().subscribers("t1"), 1);

    service.fanout().notify(&MetricSample::new("t1", "put_bw", 150.0));
    service.fanout().notify(&MetricSample::new("t1", "put_bw", 180.0));
    wait_until(|| !service.manager().contains(policy_id)).await;

    assert_eq!(
        installer.installs.lock().clone(),
        vec![("t1".to_string(), "compress".to_string())]
    );
    assert!(!service.manager().contains(policy_id));
    let record = service.get_dynamic(policy_id).await.expect("record kept");
    assert!(!record.record.alive);
    assert!(!record.running);
}

#[tokio::test]
async fn reload_restores_alive_monitors_after_restart() {
    let store: Arc<dyn PolicyStore> = Arc::new(MemoryStore::new());
    let installer = Arc::new(RecordingInstaller::default());

    let first = service(store.clone(), installer.clone()).await;
    let report = first
        .deploy(
            "TENANT alice, TENANT bob WHEN put_bw > 100 DO SET compress\n\
             TENANT alice WHEN get_ops > 10 DO SET compress TRANSIENT",
        )
        .await;
    assert!(report.is_success());
    let transient_id = report.lines[1].policies[0];

    first.fanout().notify(&MetricSample::new("t1", "get_ops", 50.0));
    wait_until(|| !first.manager().contains(transient_id)).await;
    first.shutdown().await;

    let second = service(store, installer.clone()).await;
    let reload = second.reload().await.expect("reload succeeds");

    assert_eq!(reload.alive_records, 2);
    assert!(reload.is_complete());
    assert_eq!(second.manager().len(), 2);
    assert!(!second.manager().contains(transient_id));

    second.fanout().notify(&MetricSample::new("t2", "put_bw", 500.0));
    wait_until(|| installer.installs.lock().len() == 2).await;
    assert_eq!(installer.installs.lock()[1].0, "t2");
    second.shutdown().await;
}

#[tokio::test]
async fn concurrent_allocations_are_distinct() {
    let installer = Arc::new(RecordingInstaller::default());
    let service = service(Arc::new(MemoryStore::new()), installer).await;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = service.registry().clone();
            tokio::spawn(async move { registry.next_id().await })
        })
        .collect();

    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await.expect("task joined").expect("id allocated"));
    }
    assert_eq!(ids.len(), 32);
}

#[tokio::test]
async fn static_listing_is_ordered_and_ids_unique() {
    let installer = Arc::new(RecordingInstaller::default());
    let service = service(Arc::new(MemoryStore::new()), installer).await;

    for rule in [
        "TENANT alice DO SET compress",
        "CONTAINER alice/photos DO SET compress",
        "TENANT alice DO SET compress WITH level=9",
    ] {
        assert!(service.deploy(rule).await.is_success());
    }

    let views = service.list_static(Some("t1")).await.expect("listing");
    let orders: Vec<u64> = views.iter().map(|view| view.entry.execution_order).collect();
    assert_eq!(orders, vec![1, 3]);

    let all = service.list_static(None).await.expect("listing");
    let unique: BTreeSet<u64> = all.iter().map(|view| view.id).collect();
    assert_eq!(unique.len(), all.len());
}
