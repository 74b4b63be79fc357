use std::sync::Arc;

use crystal_core::serde_utils::merge_object;
use crystal_protocol::{DynamicPolicyRecord, FilterSpec, ObjectTypeEntry, SloEntry, StaticPolicyEntry};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::store::{PolicyStore, StoreError, StoreOp};

pub const POLICY_COUNTER_KEY: &str = "policies:id";
/// Ids handed out by `next_id` that no entry or record holds yet.
pub const RESERVATION_KEY: &str = "policies:reserved";
pub const PIPELINE_PREFIX: &str = "pipeline:";
pub const POLICY_PREFIX: &str = "policy:";
pub const FILTER_PREFIX: &str = "filter:";
pub const OBJECT_TYPE_PREFIX: &str = "object_type:";
pub const SLO_PREFIX: &str = "SLO:";

fn pipeline_key(target_id: &str) -> String {
    format!("{}{}", PIPELINE_PREFIX, target_id)
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Result of [`PolicyRegistry::scan_dynamic`].
#[derive(Debug, Default)]
pub struct DynamicScan {
    pub records: Vec<DynamicPolicyRecord>,
    /// `(key, reason)` of every record that failed to decode.
    pub undecodable: Vec<(String, String)>,
}

/// Persistent registry of static pipeline entries and dynamic policy records.
///
/// Every policy id comes from a single counter (`policies:id`). An allocated
/// id stays reserved until the entry or record carrying it is written, and
/// the counter is reset to zero only when a delete leaves no static policy,
/// no dynamic policy and no reservation behind.
#[derive(Clone)]
pub struct PolicyRegistry {
    store: Arc<dyn PolicyStore>,
}

impl PolicyRegistry {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    /// Allocates a fresh id and reserves it until `put_static` / `put_dynamic` stores it.
    pub async fn next_id(&self) -> Result<u64, EngineError> {
        Ok(self
            .store
            .incr_reserving(POLICY_COUNTER_KEY, RESERVATION_KEY)
            .await?)
    }

    /// Drops the reservation of an id that will never be stored.
    pub async fn release_id(&self, policy_id: u64) -> Result<(), EngineError> {
        self.store.hdel(RESERVATION_KEY, &policy_id.to_string()).await?;
        self.reset_if_empty().await?;
        Ok(())
    }

    /// Resets the id counter when both registries are empty. Returns whether it did.
    pub async fn reset_if_empty(&self) -> Result<bool, EngineError> {
        let reset = self
            .store
            .reset_counter_if_vacant(
                POLICY_COUNTER_KEY,
                &[POLICY_PREFIX, PIPELINE_PREFIX, RESERVATION_KEY],
            )
            .await?;
        if reset {
            debug!("policy registry empty, id counter reset");
        }
        Ok(reset)
    }

    fn release_op(policy_id: u64) -> StoreOp {
        StoreOp::HDel {
            key: RESERVATION_KEY.to_string(),
            field: policy_id.to_string(),
        }
    }

    // Static policies

    pub async fn put_static(
        &self,
        target_id: &str,
        policy_id: u64,
        entry: &StaticPolicyEntry,
    ) -> Result<(), EngineError> {
        let key = pipeline_key(target_id);
        let json = serde_json::to_string(entry).map_err(|err| corrupt(&key, err))?;
        self.store
            .apply(vec![
                StoreOp::HSet {
                    key: key.clone(),
                    field: policy_id.to_string(),
                    value: json,
                },
                Self::release_op(policy_id),
            ])
            .await?;
        info!(policy_id, target_id = %target_id, filter = %entry.filter_name, "static policy stored");
        Ok(())
    }

    pub async fn get_static(
        &self,
        target_id: &str,
        policy_id: u64,
    ) -> Result<Option<StaticPolicyEntry>, EngineError> {
        let key = pipeline_key(target_id);
        match self.store.hget(&key, &policy_id.to_string()).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|err| corrupt(&key, err))?,
            )),
            None => Ok(None),
        }
    }

    /// Read-merge-write partial update of a static entry.
    pub async fn update_static(
        &self,
        target_id: &str,
        policy_id: u64,
        patch: Map<String, Value>,
    ) -> Result<StaticPolicyEntry, EngineError> {
        let key = pipeline_key(target_id);
        let field = policy_id.to_string();
        let raw = self
            .store
            .hget(&key, &field)
            .await?
            .ok_or_else(|| EngineError::PolicyNotFound(format!("{}:{}", target_id, policy_id)))?;

        let mut current: Map<String, Value> =
            serde_json::from_str(&raw).map_err(|err| corrupt(&key, err))?;
        merge_object(&mut current, patch);

        let updated: StaticPolicyEntry = serde_json::from_value(Value::Object(current))
            .map_err(|err| EngineError::InvalidRequest(err.to_string()))?;
        let json = serde_json::to_string(&updated).map_err(|err| corrupt(&key, err))?;
        self.store.hset(&key, &field, &json).await?;
        Ok(updated)
    }

    /// Deletes one static entry. Returns whether it existed.
    pub async fn delete_static(&self, target_id: &str, policy_id: u64) -> Result<bool, EngineError> {
        let key = pipeline_key(target_id);
        let field = policy_id.to_string();
        let existed = self.store.hget(&key, &field).await?.is_some();
        if existed {
            self.store.hdel(&key, &field).await?;
            info!(policy_id, target_id = %target_id, "static policy deleted");
        }
        self.reset_if_empty().await?;
        Ok(existed)
    }

    /// Deletes every entry of `filter_name` on the target, returning the removed ids.
    pub async fn delete_static_matching(
        &self,
        target_id: &str,
        filter_name: &str,
    ) -> Result<Vec<u64>, EngineError> {
        let removed: Vec<u64> = self
            .list_static_for(target_id)
            .await?
            .into_iter()
            .filter(|entry| entry.filter_name == filter_name)
            .map(|entry| entry.policy_id)
            .collect();

        let key = pipeline_key(target_id);
        for policy_id in &removed {
            self.store.hdel(&key, &policy_id.to_string()).await?;
        }
        self.reset_if_empty().await?;
        Ok(removed)
    }

    async fn list_static_for(&self, target_id: &str) -> Result<Vec<StaticPolicyEntry>, EngineError> {
        let key = pipeline_key(target_id);
        let mut entries = Vec::new();
        for raw in self.store.hgetall(&key).await?.into_values() {
            entries.push(serde_json::from_str::<StaticPolicyEntry>(&raw).map_err(|err| corrupt(&key, err))?);
        }
        entries.sort_by_key(|entry| entry.execution_order);
        Ok(entries)
    }

    /// Static entries as `(target_id, entry)`, sorted ascending on `execution_order`.
    pub async fn list_static(
        &self,
        target_id: Option<&str>,
    ) -> Result<Vec<(String, StaticPolicyEntry)>, EngineError> {
        let targets = match target_id {
            Some(target) => vec![target.to_string()],
            None => self
                .store
                .keys(PIPELINE_PREFIX)
                .await?
                .into_iter()
                .filter_map(|key| key.strip_prefix(PIPELINE_PREFIX).map(str::to_string))
                .collect(),
        };

        let mut listed = Vec::new();
        for target in targets {
            for entry in self.list_static_for(&target).await? {
                listed.push((target.clone(), entry));
            }
        }
        listed.sort_by_key(|(_, entry)| entry.execution_order);
        Ok(listed)
    }

    // Dynamic policies

    pub async fn put_dynamic(&self, record: &DynamicPolicyRecord) -> Result<(), EngineError> {
        let key = DynamicPolicyRecord::store_key(record.id);
        let mut ops: Vec<StoreOp> = record
            .to_fields()
            .into_iter()
            .map(|(field, value)| StoreOp::HSet {
                key: key.clone(),
                field,
                value,
            })
            .collect();
        ops.push(Self::release_op(record.id));
        self.store.apply(ops).await?;
        Ok(())
    }

    pub async fn get_dynamic(&self, policy_id: u64) -> Result<Option<DynamicPolicyRecord>, EngineError> {
        let fields = self.store.hgetall(&DynamicPolicyRecord::store_key(policy_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(DynamicPolicyRecord::from_fields(&fields)?))
    }

    /// Flips the `alive` flag. Returns `false` when the record does not exist;
    /// a concurrently deleted record is never recreated.
    pub async fn set_alive(&self, policy_id: u64, alive: bool) -> Result<bool, EngineError> {
        Ok(self
            .store
            .hupdate(&DynamicPolicyRecord::store_key(policy_id), "alive", &alive.to_string())
            .await?)
    }

    /// Deletes a dynamic record. Returns whether it existed.
    pub async fn delete_dynamic(&self, policy_id: u64) -> Result<bool, EngineError> {
        let key = DynamicPolicyRecord::store_key(policy_id);
        let existed = self.store.exists(&key).await?;
        if existed {
            self.store.del(&key).await?;
            info!(policy_id, "dynamic policy deleted");
        }
        self.reset_if_empty().await?;
        Ok(existed)
    }

    /// Every `policy:*` hash, split into decoded records (ordered by id) and
    /// keys that could not be decoded.
    pub async fn scan_dynamic(&self) -> Result<DynamicScan, EngineError> {
        let mut scan = DynamicScan::default();
        for key in self.store.keys(POLICY_PREFIX).await? {
            let fields = self.store.hgetall(&key).await?;
            match DynamicPolicyRecord::from_fields(&fields) {
                Ok(record) => scan.records.push(record),
                Err(err) => scan.undecodable.push((key, err.to_string())),
            }
        }
        scan.records.sort_by_key(|record| record.id);
        Ok(scan)
    }

    /// All decodable dynamic records ordered by id. Undecodable ones are logged and skipped.
    pub async fn list_dynamic(&self) -> Result<Vec<DynamicPolicyRecord>, EngineError> {
        let scan = self.scan_dynamic().await?;
        for (key, reason) in &scan.undecodable {
            error!(%key, %reason, "skipping undecodable policy record");
        }
        Ok(scan.records)
    }

    // Filters

    pub async fn put_filter(&self, filter: &FilterSpec) -> Result<(), EngineError> {
        let mut fields: Vec<(String, String)> = filter
            .attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        fields.push(("name".into(), filter.name.clone()));
        self.store
            .hset_many(&format!("{}{}", FILTER_PREFIX, filter.name), fields)
            .await?;
        Ok(())
    }

    pub async fn get_filter(&self, name: &str) -> Result<Option<FilterSpec>, EngineError> {
        let mut fields = self.store.hgetall(&format!("{}{}", FILTER_PREFIX, name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        fields.remove("name");
        Ok(Some(FilterSpec {
            name: name.to_string(),
            attributes: fields,
        }))
    }

    // Object types

    pub async fn list_object_types(&self) -> Result<Vec<ObjectTypeEntry>, EngineError> {
        let mut entries = Vec::new();
        for key in self.store.keys(OBJECT_TYPE_PREFIX).await? {
            let types_list = self.store.lrange(&key).await?;
            if let Some(name) = key.strip_prefix(OBJECT_TYPE_PREFIX) {
                entries.push(ObjectTypeEntry {
                    name: name.to_string(),
                    types_list,
                });
            }
        }
        Ok(entries)
    }

    pub async fn get_object_type(&self, name: &str) -> Result<Option<ObjectTypeEntry>, EngineError> {
        let types_list = self.store.lrange(&object_type_key(name)).await?;
        if types_list.is_empty() {
            return Ok(None);
        }
        Ok(Some(ObjectTypeEntry {
            name: name.to_string(),
            types_list,
        }))
    }

    pub async fn create_object_type(&self, entry: &ObjectTypeEntry) -> Result<(), EngineError> {
        validate_object_type(&entry.name, &entry.types_list)?;
        let key = object_type_key(&entry.name);
        if self.store.exists(&key).await? {
            return Err(EngineError::AlreadyExists(format!("object type {}", entry.name)));
        }
        self.store.rpush(&key, entry.types_list.clone()).await?;
        Ok(())
    }

    pub async fn replace_object_type(&self, name: &str, types_list: Vec<String>) -> Result<(), EngineError> {
        validate_object_type(name, &types_list)?;
        let key = object_type_key(name);
        if !self.store.exists(&key).await? {
            return Err(EngineError::NotFound(format!("object type {}", name)));
        }
        self.store.replace_list(&key, types_list).await?;
        Ok(())
    }

    pub async fn delete_object_type(&self, name: &str) -> Result<(), EngineError> {
        let key = object_type_key(name);
        if !self.store.exists(&key).await? {
            return Err(EngineError::NotFound(format!("object type {}", name)));
        }
        self.store.del(&key).await?;
        Ok(())
    }

    pub async fn remove_object_type_item(&self, name: &str, item: &str) -> Result<(), EngineError> {
        let key = object_type_key(name);
        let items = self.store.lrange(&key).await?;
        if !items.iter().any(|existing| existing == item) {
            return Err(EngineError::NotFound(format!("extension {} in object type {}", item, name)));
        }
        self.store.lrem(&key, item).await?;
        Ok(())
    }

    // SLOs

    pub async fn list_slos(&self) -> Result<Vec<SloEntry>, EngineError> {
        let mut slos = Vec::new();
        for key in self.store.keys(SLO_PREFIX).await? {
            let parts: Vec<&str> = key.splitn(4, ':').collect();
            if let [_, dsl_filter, slo_name, target] = parts.as_slice() {
                if let Some(value) = self.store.get(&key).await? {
                    slos.push(SloEntry {
                        dsl_filter: dsl_filter.to_string(),
                        slo_name: slo_name.to_string(),
                        target: target.to_string(),
                        value,
                    });
                }
            }
        }
        Ok(slos)
    }

    pub async fn put_slo(&self, slo: &SloEntry) -> Result<(), EngineError> {
        let key = SloEntry::store_key(&slo.dsl_filter, &slo.slo_name, &slo.target);
        self.store.set(&key, &slo.value).await?;
        Ok(())
    }

    pub async fn get_slo(
        &self,
        dsl_filter: &str,
        slo_name: &str,
        target: &str,
    ) -> Result<Option<SloEntry>, EngineError> {
        let key = SloEntry::store_key(dsl_filter, slo_name, target);
        Ok(self.store.get(&key).await?.map(|value| SloEntry {
            dsl_filter: dsl_filter.to_string(),
            slo_name: slo_name.to_string(),
            target: target.to_string(),
            value,
        }))
    }

    pub async fn delete_slo(&self, dsl_filter: &str, slo_name: &str, target: &str) -> Result<bool, EngineError> {
        let key = SloEntry::store_key(dsl_filter, slo_name, target);
        let existed = self.store.exists(&key).await?;
        self.store.del(&key).await?;
        Ok(existed)
    }
}

fn object_type_key(name: &str) -> String {
    format!("{}{}", OBJECT_TYPE_PREFIX, name)
}

fn validate_object_type(name: &str, types_list: &[String]) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("object type name is required".into()));
    }
    if types_list.is_empty() {
        return Err(EngineError::InvalidRequest("types_list must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn entry(policy_id: u64, filter_name: &str) -> StaticPolicyEntry {
        StaticPolicyEntry {
            policy_id,
            filter_name: filter_name.into(),
            object_type: None,
            object_size: None,
            execution_server: None,
            reverse: None,
            execution_order: policy_id,
            params: String::new(),
            callable: false,
        }
    }

    fn record(id: u64) -> DynamicPolicyRecord {
        DynamicPolicyRecord {
            id,
            raw_rule_text: "TENANT alice WHEN put_bw > 100 DO SET compress".into(),
            target_name: "alice".into(),
            target_id: "t1".into(),
            filter_name: "compress".into(),
            action: "SET".into(),
            action_index: 0,
            condition_text: "put_bw > 100".into(),
            object_type: None,
            object_size: None,
            transient: false,
            dispatch_location: format!("crystal-node/monitors/persistent/policy:{}", id),
            alive: true,
        }
    }

    #[tokio::test]
    async fn static_listing_is_sorted_and_ids_unique() {
        let registry = registry();
        for (target, filter) in [("t2", "cache"), ("t1", "compress"), ("t1", "encrypt"), ("t2", "compress")] {
            let id = registry.next_id().await.unwrap();
            registry.put_static(target, id, &entry(id, filter)).await.unwrap();
        }

        let t1 = registry.list_static(Some("t1")).await.unwrap();
        let orders: Vec<u64> = t1.iter().map(|(_, e)| e.execution_order).collect();
        assert_eq!(orders, vec![2, 3]);

        let all = registry.list_static(None).await.unwrap();
        let ids: HashSet<u64> = all.iter().map(|(_, e)| e.policy_id).collect();
        assert_eq!(ids.len(), all.len());
        assert!(all.windows(2).all(|w| w[0].1.execution_order < w[1].1.execution_order));
    }

    #[tokio::test]
    async fn counter_resets_only_when_everything_is_gone() {
        let registry = registry();
        let static_id = registry.next_id().await.unwrap();
        registry.put_static("t1", static_id, &entry(static_id, "compress")).await.unwrap();
        let dynamic_id = registry.next_id().await.unwrap();
        registry.put_dynamic(&record(dynamic_id)).await.unwrap();

        assert!(registry.delete_static("t1", static_id).await.unwrap());
        assert_eq!(registry.next_id().await.unwrap(), 3);
        registry.release_id(3).await.unwrap();

        assert!(registry.delete_dynamic(dynamic_id).await.unwrap());
        assert_eq!(registry.next_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reserved_id_survives_a_concurrent_reset() {
        let registry = registry();
        let dynamic_id = registry.next_id().await.unwrap();
        registry.put_dynamic(&record(dynamic_id)).await.unwrap();

        let pending = registry.next_id().await.unwrap();
        assert!(registry.delete_dynamic(dynamic_id).await.unwrap());
        assert!(!registry.reset_if_empty().await.unwrap());

        let next = registry.next_id().await.unwrap();
        assert_ne!(next, pending);
        registry.put_static("t1", pending, &entry(pending, "compress")).await.unwrap();
        registry.put_static("t1", next, &entry(next, "cache")).await.unwrap();
        assert_eq!(registry.list_static(Some("t1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn set_alive_does_not_resurrect_deleted_record() {
        let registry = registry();
        registry.put_dynamic(&record(3)).await.unwrap();
        assert!(registry.delete_dynamic(3).await.unwrap());

        assert!(!registry.set_alive(3, false).await.unwrap());
        assert!(registry.scan_dynamic().await.unwrap().undecodable.is_empty());
        assert!(registry.store().keys(POLICY_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_reports_undecodable_records() {
        let registry = registry();
        registry.put_dynamic(&record(1)).await.unwrap();
        registry.store().hset("policy:2", "alive", "false").await.unwrap();

        let scan = registry.scan_dynamic().await.unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.undecodable.len(), 1);
        assert_eq!(scan.undecodable[0].0, "policy:2");
        assert_eq!(registry.list_dynamic().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_static_merges_fields() {
        let registry = registry();
        registry.put_static("t1/photos", 4, &entry(4, "compress")).await.unwrap();

        let patch = json!({ "params": "level=9", "execution_order": 10 });
        let updated = registry
            .update_static("t1/photos", 4, patch.as_object().cloned().unwrap())
            .await
            .unwrap();

        assert_eq!(updated.params, "level=9");
        assert_eq!(updated.execution_order, 10);
        assert_eq!(updated.filter_name, "compress");
        assert_eq!(registry.get_static("t1/photos", 4).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn update_of_missing_static_entry_is_not_found() {
        let err = registry()
            .update_static("t1", 99, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyNotFound(_)));
    }

    #[tokio::test]
    async fn delete_matching_removes_every_instance_of_a_filter() {
        let registry = registry();
        for (id, filter) in [(1, "compress"), (2, "cache"), (3, "compress")] {
            registry.put_static("t1", id, &entry(id, filter)).await.unwrap();
        }

        let removed = registry.delete_static_matching("t1", "compress").await.unwrap();
        assert_eq!(removed, vec![1, 3]);
        let left: Vec<u64> = registry
            .list_static(Some("t1"))
            .await
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.policy_id)
            .collect();
        assert_eq!(left, vec![2]);
    }

    #[tokio::test]
    async fn dynamic_records_round_trip_and_flip_alive() {
        let registry = registry();
        registry.put_dynamic(&record(5)).await.unwrap();
        registry.put_dynamic(&record(2)).await.unwrap();

        assert!(registry.set_alive(5, false).await.unwrap());
        assert!(!registry.set_alive(77, false).await.unwrap());
        assert!(registry.get_dynamic(77).await.unwrap().is_none());

        let listed = registry.list_dynamic().await.unwrap();
        assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 5]);
        assert!(!listed[1].alive);
    }

    #[tokio::test]
    async fn filters_are_looked_up_by_name() {
        let registry = registry();
        registry
            .put_filter(&FilterSpec::new("compress").attribute("language", "java"))
            .await
            .unwrap();

        let filter = registry.get_filter("compress").await.unwrap().unwrap();
        assert_eq!(filter.attributes.get("language").map(String::as_str), Some("java"));
        assert!(!filter.attributes.contains_key("name"));
        assert!(registry.get_filter("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn object_type_lifecycle() {
        let registry = registry();
        let docs = ObjectTypeEntry {
            name: "DOCS".into(),
            types_list: vec!["pdf".into(), "docx".into()],
        };
        registry.create_object_type(&docs).await.unwrap();
        assert!(matches!(
            registry.create_object_type(&docs).await,
            Err(EngineError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.replace_object_type("DOCS", vec![]).await,
            Err(EngineError::InvalidRequest(_))
        ));

        registry.remove_object_type_item("DOCS", "pdf").await.unwrap();
        assert_eq!(
            registry.get_object_type("DOCS").await.unwrap().unwrap().types_list,
            vec!["docx".to_string()]
        );

        registry.replace_object_type("DOCS", vec!["txt".into()]).await.unwrap();
        assert_eq!(registry.list_object_types().await.unwrap().len(), 1);

        registry.delete_object_type("DOCS").await.unwrap();
        assert!(matches!(
            registry.delete_object_type("DOCS").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn slo_crud() {
        let registry = registry();
        let slo = SloEntry {
            dsl_filter: "bandwidth".into(),
            slo_name: "put_bw".into(),
            target: "t1/photos".into(),
            value: "50".into(),
        };
        registry.put_slo(&slo).await.unwrap();

        assert_eq!(registry.list_slos().await.unwrap(), vec![slo.clone()]);
        assert_eq!(
            registry.get_slo("bandwidth", "put_bw", "t1/photos").await.unwrap(),
            Some(slo)
        );
        assert!(registry.delete_slo("bandwidth", "put_bw", "t1/photos").await.unwrap());
        assert!(registry.list_slos().await.unwrap().is_empty());
    }
}
