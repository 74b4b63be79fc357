use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use crystal_protocol::ResolvedTarget;
use crystal_rules::{CompiledRule, RuleTarget, TargetKind};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::EngineError;
use crate::store::PolicyStore;

pub const PROJECTS_KEY: &str = "projects";
pub const ENABLED_PROJECTS_KEY: &str = "projects_crystal_enabled";

/// Source of tenant identity data.
#[async_trait]
pub trait TenantDirectory: Send + Sync + 'static {
    /// Tenant id to display name.
    async fn list_tenants(&self) -> Result<BTreeMap<String, String>, EngineError>;

    /// Ids of tenants with storage automation enabled.
    async fn list_enabled(&self) -> Result<BTreeSet<String>, EngineError>;
}

/// In-memory directory, handy for tests and single-node setups.
#[derive(Default)]
pub struct StaticTenantDirectory {
    tenants: RwLock<BTreeMap<String, String>>,
    enabled: RwLock<BTreeSet<String>>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an enabled tenant.
    pub fn with_tenant(self, id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        self.enabled.write().insert(id.clone());
        self.tenants.write().insert(id, name.into());
        self
    }

    /// Adds a tenant that exists but is not enabled.
    pub fn with_disabled_tenant(self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.tenants.write().insert(id.into(), name.into());
        self
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) {
        let mut set = self.enabled.write();
        if enabled {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn list_tenants(&self) -> Result<BTreeMap<String, String>, EngineError> {
        Ok(self.tenants.read().clone())
    }

    async fn list_enabled(&self) -> Result<BTreeSet<String>, EngineError> {
        Ok(self.enabled.read().clone())
    }
}

/// Directory kept in the policy store: hash `projects` (id to name) and
/// list `projects_crystal_enabled`.
#[derive(Clone)]
pub struct StoreTenantDirectory {
    store: Arc<dyn PolicyStore>,
}

impl StoreTenantDirectory {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantDirectory for StoreTenantDirectory {
    async fn list_tenants(&self) -> Result<BTreeMap<String, String>, EngineError> {
        Ok(self.store.hgetall(PROJECTS_KEY).await?)
    }

    async fn list_enabled(&self) -> Result<BTreeSet<String>, EngineError> {
        Ok(self.store.lrange(ENABLED_PROJECTS_KEY).await?.into_iter().collect())
    }
}

/// Resolves one declared target against a directory snapshot.
///
/// The tenant part is tried as an id first, then as a name.
pub fn resolve(
    kind: TargetKind,
    expr: &str,
    tenants: &BTreeMap<String, String>,
    enabled: &BTreeSet<String>,
) -> Result<ResolvedTarget, EngineError> {
    let (tenant, container) = match kind {
        TargetKind::Tenant => (expr, None),
        TargetKind::Container => match expr.split_once('/') {
            Some((tenant, container)) if !container.is_empty() => (tenant, Some(container)),
            _ => {
                return Err(EngineError::MalformedRule(format!(
                    "container target `{}` must look like tenant/container",
                    expr
                )))
            }
        },
    };

    let (tenant_id, tenant_name) = match tenants.get_key_value(tenant) {
        Some((id, name)) => (id.clone(), name.clone()),
        None => tenants
            .iter()
            .find(|(_, name)| name.as_str() == tenant)
            .map(|(id, name)| (id.clone(), name.clone()))
            .ok_or_else(|| EngineError::ProjectNotFound(tenant.to_string()))?,
    };

    if !enabled.contains(&tenant_id) {
        return Err(EngineError::ProjectNotCrystalEnabled(tenant_id));
    }

    let target = ResolvedTarget::tenant(tenant_id, tenant_name);
    Ok(match container {
        Some(container) => target.with_container(container),
        None => target,
    })
}

/// Target resolution backed by a [`TenantDirectory`].
#[derive(Clone)]
pub struct TargetResolver {
    directory: Arc<dyn TenantDirectory>,
}

impl TargetResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<dyn TenantDirectory> {
        &self.directory
    }

    pub async fn resolve(&self, target: &RuleTarget) -> Result<ResolvedTarget, EngineError> {
        let tenants = self.directory.list_tenants().await?;
        let enabled = self.directory.list_enabled().await?;
        resolve(target.kind, &target.expr, &tenants, &enabled)
    }

    /// Resolves every target of a rule from one directory snapshot.
    ///
    /// The first failure aborts the whole rule. Targets resolving to the same
    /// canonical id are kept once, in declaration order.
    pub async fn resolve_rule(&self, rule: &CompiledRule) -> Result<Vec<ResolvedTarget>, EngineError> {
        let tenants = self.directory.list_tenants().await?;
        let enabled = self.directory.list_enabled().await?;

        let mut seen = BTreeSet::new();
        let mut resolved = Vec::new();
        for target in &rule.targets {
            let canonical = resolve(target.kind, &target.expr, &tenants, &enabled)?;
            if seen.insert(canonical.target_id()) {
                resolved.push(canonical);
            }
        }
        debug!(count = resolved.len(), "rule targets resolved");
        Ok(resolved)
    }

    /// Display name for a persisted target id; unknown tenants fall back to the id.
    pub async fn target_name(&self, target_id: &str) -> Result<String, EngineError> {
        let mut tenants = self.directory.list_tenants().await?;
        tenants.insert("global".into(), "Global".into());
        Ok(display_name(target_id, &tenants))
    }
}

pub(crate) fn display_name(target_id: &str, tenants: &BTreeMap<String, String>) -> String {
    let (tenant, container) = match target_id.split_once('/') {
        Some((tenant, container)) => (tenant, Some(container)),
        None => (target_id, None),
    };
    let name = tenants.get(tenant).map(String::as_str).unwrap_or(tenant);
    match container {
        Some(container) => format!("{}/{}", name, container),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crystal_rules::{DslParser, RuleParser};

    fn directory() -> Arc<StaticTenantDirectory> {
        Arc::new(
            StaticTenantDirectory::new()
                .with_tenant("t1", "alice")
                .with_tenant("t2", "bob")
                .with_disabled_tenant("t3", "carol"),
        )
    }

    #[tokio::test]
    async fn resolves_by_id_or_name() {
        let resolver = TargetResolver::new(directory());

        let by_name = resolver.resolve(&RuleTarget::tenant("alice")).await.unwrap();
        let by_id = resolver.resolve(&RuleTarget::tenant("t1")).await.unwrap();
        assert_eq!(by_name, by_id);
        assert_eq!(by_name.target_id(), "t1");

        let container = resolver
            .resolve(&RuleTarget::container("bob/photos"))
            .await
            .unwrap();
        assert_eq!(container.target_id(), "t2/photos");
        assert_eq!(container.target_name(), "bob/photos");
    }

    #[tokio::test]
    async fn unknown_and_disabled_tenants_fail() {
        let resolver = TargetResolver::new(directory());
        assert!(matches!(
            resolver.resolve(&RuleTarget::tenant("mallory")).await,
            Err(EngineError::ProjectNotFound(name)) if name == "mallory"
        ));
        assert!(matches!(
            resolver.resolve(&RuleTarget::container("carol/c")).await,
            Err(EngineError::ProjectNotCrystalEnabled(id)) if id == "t3"
        ));
    }

    #[tokio::test]
    async fn first_bad_target_aborts_the_rule() {
        let resolver = TargetResolver::new(directory());
        let (_, rule) = DslParser::new()
            .parse("TENANT alice, TENANT carol DO SET compress")
            .unwrap();
        assert!(matches!(
            resolver.resolve_rule(&rule).await,
            Err(EngineError::ProjectNotCrystalEnabled(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_targets_collapse() {
        let resolver = TargetResolver::new(directory());
        let (_, rule) = DslParser::new()
            .parse("TENANT alice, TENANT t1, CONTAINER alice/x DO SET compress")
            .unwrap();
        let targets = resolver.resolve_rule(&rule).await.unwrap();
        let ids: Vec<String> = targets.iter().map(|t| t.target_id()).collect();
        assert_eq!(ids, vec!["t1".to_string(), "t1/x".to_string()]);
    }

    #[tokio::test]
    async fn store_directory_reads_projects() {
        let store: Arc<dyn PolicyStore> = Arc::new(MemoryStore::new());
        store.hset(PROJECTS_KEY, "t9", "zed").await.unwrap();
        store.rpush(ENABLED_PROJECTS_KEY, vec!["t9".into()]).await.unwrap();

        let resolver = TargetResolver::new(Arc::new(StoreTenantDirectory::new(store)));
        let target = resolver.resolve(&RuleTarget::tenant("zed")).await.unwrap();
        assert_eq!(target.tenant_id, "t9");
        assert_eq!(resolver.target_name("t9/box").await.unwrap(), "zed/box");
        assert_eq!(resolver.target_name("global").await.unwrap(), "Global");
        assert_eq!(resolver.target_name("unknown").await.unwrap(), "unknown");
    }
}
