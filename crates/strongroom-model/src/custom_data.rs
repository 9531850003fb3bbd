//! Arbitrary string key/value data attached to the database, groups, and
//! entries. Per-item modification stamps are kept in memory when known so
//! merges can resolve key conflicts by recency.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomDataItem {
    pub value: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomData {
    items: BTreeMap<String, CustomDataItem>,
}

impl CustomData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(|item| item.value.as_str())
    }

    pub fn item(&self, key: &str) -> Option<&CustomDataItem> {
        self.items.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.insert(
            key.into(),
            CustomDataItem {
                value: value.into(),
                last_modified: None,
            },
        );
    }

    pub fn set_item(&mut self, key: impl Into<String>, item: CustomDataItem) {
        self.items.insert(key.into(), item);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.items.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CustomDataItem)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }
}
