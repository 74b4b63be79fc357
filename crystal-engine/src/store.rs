use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors produced by a [`PolicyStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("key `{key}` holds a different kind of value")]
    WrongType { key: String },
    #[error("value at `{key}` is not a counter")]
    NotACounter { key: String },
    #[error("corrupt value at `{key}`: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// A single mutation executed as part of [`PolicyStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set { key: String, value: String },
    Delete { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    RPush { key: String, values: Vec<String> },
    /// Removes the first occurrence of `value`.
    LRem { key: String, value: String },
}

/// Key/value store with hash and list values, modelled after the Redis
/// primitives the policy layout relies on.
///
/// `apply` must execute the whole batch atomically: either every operation
/// is visible afterwards or none is.
#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically increments the counter at `key` (missing counts as 0).
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Increments `counter` and records the new value as a field of the
    /// `reservations` hash, in one atomic step.
    async fn incr_reserving(&self, counter: &str, reservations: &str) -> Result<u64, StoreError>;

    /// Sets `counter` back to zero unless some key starts with one of
    /// `prefixes`. The check and the write happen atomically with respect to
    /// `incr_reserving` on the same counter. Returns whether it reset.
    async fn reset_counter_if_vacant(&self, counter: &str, prefixes: &[&str]) -> Result<bool, StoreError>;

    /// Overwrites `field` only if the hash already holds it. Returns whether it did.
    async fn hupdate(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError>;

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.apply(vec![StoreOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        }])
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.apply(vec![StoreOp::Delete {
            key: key.to_string(),
        }])
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.apply(vec![StoreOp::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        }])
        .await
    }

    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        let ops = fields
            .into_iter()
            .map(|(field, value)| StoreOp::HSet {
                key: key.to_string(),
                field,
                value,
            })
            .collect();
        self.apply(ops).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.apply(vec![StoreOp::HDel {
            key: key.to_string(),
            field: field.to_string(),
        }])
        .await
    }

    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<(), StoreError> {
        self.apply(vec![StoreOp::RPush {
            key: key.to_string(),
            values,
        }])
        .await
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.apply(vec![StoreOp::LRem {
            key: key.to_string(),
            value: value.to_string(),
        }])
        .await
    }

    /// Replaces a whole list in one atomic step.
    async fn replace_list(&self, key: &str, values: Vec<String>) -> Result<(), StoreError> {
        self.apply(vec![
            StoreOp::Delete {
                key: key.to_string(),
            },
            StoreOp::RPush {
                key: key.to_string(),
                values,
            },
        ])
        .await
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Scalar(String),
    Hash(BTreeMap<String, String>),
    List(Vec<String>),
}

/// Process-local store. Hashes and lists that become empty are removed, so
/// `keys` only reports values that still hold data.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn increment(entries: &mut BTreeMap<String, Entry>, key: &str) -> Result<u64, StoreError> {
    let current = match entries.get(key) {
        Some(Entry::Scalar(value)) => value.parse::<u64>().map_err(|_| StoreError::NotACounter {
            key: key.to_string(),
        })?,
        Some(_) => return Err(wrong_type(key)),
        None => 0,
    };
    let next = current + 1;
    entries.insert(key.to_string(), Entry::Scalar(next.to_string()));
    Ok(next)
}

fn apply_op(entries: &mut BTreeMap<String, Entry>, op: StoreOp) -> Result<(), StoreError> {
    match op {
        StoreOp::Set { key, value } => {
            entries.insert(key, Entry::Scalar(value));
        }
        StoreOp::Delete { key } => {
            entries.remove(&key);
        }
        StoreOp::HSet { key, field, value } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::Hash(BTreeMap::new()));
            match entry {
                Entry::Hash(hash) => {
                    hash.insert(field, value);
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        StoreOp::HDel { key, field } => {
            let now_empty = match entries.get_mut(&key) {
                Some(Entry::Hash(hash)) => {
                    hash.remove(&field);
                    hash.is_empty()
                }
                Some(_) => return Err(wrong_type(&key)),
                None => false,
            };
            if now_empty {
                entries.remove(&key);
            }
        }
        StoreOp::RPush { key, values } => {
            if values.is_empty() {
                return Ok(());
            }
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::List(Vec::new()));
            match entry {
                Entry::List(list) => list.extend(values),
                _ => return Err(wrong_type(&key)),
            }
        }
        StoreOp::LRem { key, value } => {
            let now_empty = match entries.get_mut(&key) {
                Some(Entry::List(list)) => {
                    if let Some(position) = list.iter().position(|item| *item == value) {
                        list.remove(position);
                    }
                    list.is_empty()
                }
                Some(_) => return Err(wrong_type(&key)),
                None => false,
            };
            if now_empty {
                entries.remove(&key);
            }
        }
    }
    Ok(())
}

fn op_key(op: &StoreOp) -> &str {
    match op {
        StoreOp::Set { key, .. }
        | StoreOp::Delete { key }
        | StoreOp::HSet { key, .. }
        | StoreOp::HDel { key, .. }
        | StoreOp::RPush { key, .. }
        | StoreOp::LRem { key, .. } => key,
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries.lock().get(key) {
            Some(Entry::Scalar(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        increment(&mut self.entries.lock(), key)
    }

    async fn incr_reserving(&self, counter: &str, reservations: &str) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock();
        if let Some(Entry::Scalar(_) | Entry::List(_)) = entries.get(reservations) {
            return Err(wrong_type(reservations));
        }
        let next = increment(&mut entries, counter)?;
        apply_op(
            &mut entries,
            StoreOp::HSet {
                key: reservations.to_string(),
                field: next.to_string(),
                value: String::new(),
            },
        )?;
        Ok(next)
    }

    async fn reset_counter_if_vacant(&self, counter: &str, prefixes: &[&str]) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let occupied = entries
            .keys()
            .any(|key| prefixes.iter().any(|prefix| key.starts_with(prefix)));
        if occupied {
            return Ok(false);
        }
        match entries.get_mut(counter) {
            Some(Entry::Scalar(value)) => {
                *value = "0".to_string();
                Ok(true)
            }
            Some(_) => Err(wrong_type(counter)),
            None => Ok(false),
        }
    }

    async fn hupdate(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        match self.entries.lock().get_mut(key) {
            Some(Entry::Hash(hash)) => match hash.get_mut(field) {
                Some(current) => {
                    *current = value.to_string();
                    Ok(true)
                }
                None => Ok(false),
            },
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match self.entries.lock().get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        match self.entries.lock().get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.entries.lock().get(key) {
            Some(Entry::List(list)) => Ok(list.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();

        // Snapshot the touched keys so a failing op leaves the map untouched.
        let snapshot: HashMap<String, Option<Entry>> = ops
            .iter()
            .map(|op| {
                let key = op_key(op).to_string();
                let previous = entries.get(&key).cloned();
                (key, previous)
            })
            .collect();

        for op in ops {
            if let Err(err) = apply_op(&mut entries, op) {
                for (key, previous) in snapshot {
                    match previous {
                        Some(entry) => entries.insert(key, entry),
                        None => entries.remove(&key),
                    };
                }
                return Err(err);
            }
        }
        Ok(())
    }
}
