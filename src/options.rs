use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::filter::Filter;

/// Options of a list query.
///
/// The value is immutable from the outside; every `with_*` call produces a new one. Only explicitly set options take
/// part in the [`signature`](Self::signature), thus two option sets built the same way always produce the same key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    filter:     Option<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    select:     Option<String>,
    #[serde(rename = "maxItems", skip_serializing_if = "Option::is_none")]
    max_items:  Option<usize>,
    #[serde(rename = "pageSize", skip_serializing_if = "Option::is_none")]
    page_size:  Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recursive:  Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    folder:     Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, Value>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_select<S: Into<String>>(mut self, select: S) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = Some(recursive);
        self
    }

    pub fn with_folder<S: Into<String>>(mut self, folder: S) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Any getter-specific option not covered by the typed ones.
    pub fn with_attribute<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn select(&self) -> Option<&str> {
        self.select.as_deref()
    }

    pub fn max_items(&self) -> Option<usize> {
        self.max_items
    }

    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    pub fn recursive(&self) -> Option<bool> {
        self.recursive
    }

    pub fn folder(&self) -> Option<&str> {
        self.folder.as_deref()
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Shallow override: every option set in `other` replaces the one in `self`; unset ones are kept.
    pub fn merge(&self, other: &ListOptions) -> ListOptions {
        let mut attributes = self.attributes.clone();
        attributes.extend(other.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));

        ListOptions {
            filter: other.filter.clone().or_else(|| self.filter.clone()),
            select: other.select.clone().or_else(|| self.select.clone()),
            max_items: other.max_items.or(self.max_items),
            page_size: other.page_size.or(self.page_size),
            recursive: other.recursive.or(self.recursive),
            folder: other.folder.clone().or_else(|| self.folder.clone()),
            attributes,
        }
    }

    /// Key of these options in query signatures.
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
