use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Registered filter definition (`filter:<name>`), handed to the installer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl FilterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Named group of object extensions, e.g. `DOCS -> [pdf, docx]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectTypeEntry {
    pub name: String,
    pub types_list: Vec<String>,
}

/// Service level objective bound to a filter and a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SloEntry {
    pub dsl_filter: String,
    pub slo_name: String,
    pub target: String,
    pub value: String,
}

impl SloEntry {
    pub fn store_key(dsl_filter: &str, slo_name: &str, target: &str) -> String {
        format!("SLO:{}:{}:{}", dsl_filter, slo_name, target)
    }
}
