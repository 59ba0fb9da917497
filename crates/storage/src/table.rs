//! Sorted key-value table contract
//!
//! The engine needs four primitives from the underlying table:
//!
//! - `get(pk, sk, consistent)`: single item read
//! - `put(item)`: single item write, atomic per item
//! - `batch_write(items)`: best-effort multi-item write; the table may skip
//!   items under load and hands them back as unprocessed
//! - `query(...)`: one page of a partition scan, on the primary key or on a
//!   named secondary index
//!
//! Items carry their attributes as a JSON document. Secondary index keys are
//! stored on the item itself, one entry per index it participates in.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use wikivc_core::Result;

/// Per-call item limit of `batch_write`
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Keys of an item inside one secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    /// Index partition key
    pub partition_key: String,
    /// Index sort key
    pub sort_key: String,
}

/// One table item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Primary partition key
    pub partition_key: String,
    /// Primary sort key
    pub sort_key: String,
    /// Secondary index keys by index name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indexes: BTreeMap<String, IndexKey>,
    /// Attribute document
    pub attributes: serde_json::Value,
}

impl Item {
    /// Create an item with no index entries
    pub fn new(
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
        attributes: serde_json::Value,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
            indexes: BTreeMap::new(),
            attributes,
        }
    }

    /// Serialize a record into an item
    pub fn from_record<T: Serialize>(
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
        record: &T,
    ) -> Result<Self> {
        Ok(Self::new(
            partition_key,
            sort_key,
            serde_json::to_value(record)?,
        ))
    }

    /// Add this item to a secondary index
    pub fn with_index(
        mut self,
        index: impl Into<String>,
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
    ) -> Self {
        self.indexes.insert(
            index.into(),
            IndexKey {
                partition_key: partition_key.into(),
                sort_key: sort_key.into(),
            },
        );
        self
    }

    /// Deserialize the attribute document into a record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.attributes.clone())?)
    }
}

/// Sort key restriction of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKeyCondition {
    /// Exact sort key
    Equals(String),
    /// Sort keys starting with the prefix
    BeginsWith(String),
    /// Sort keys within the inclusive range
    Between(String, String),
}

impl SortKeyCondition {
    /// Whether `sort_key` satisfies the condition
    pub fn matches(&self, sort_key: &str) -> bool {
        match self {
            SortKeyCondition::Equals(k) => sort_key == k,
            SortKeyCondition::BeginsWith(p) => sort_key.starts_with(p.as_str()),
            SortKeyCondition::Between(lo, hi) => lo.as_str() <= sort_key && sort_key <= hi.as_str(),
        }
    }
}

/// Continuation point of a paged query: the last sort key returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub String);

/// Partition scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Partition to scan (index partition when `index` is set)
    pub partition_key: String,
    /// Sort key restriction
    pub condition: Option<SortKeyCondition>,
    /// Secondary index name, `None` for the primary key
    pub index: Option<String>,
    /// Ascending sort key order
    pub scan_forward: bool,
    /// Maximum items in this page
    pub limit: Option<usize>,
    /// Strongly consistent read
    pub consistent: bool,
    /// Resume after this sort key
    pub start_after: Option<PageToken>,
}

impl Query {
    /// Forward scan of a whole partition
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            condition: None,
            index: None,
            scan_forward: true,
            limit: None,
            consistent: false,
            start_after: None,
        }
    }

    /// Restrict to sort keys with the given prefix
    pub fn begins_with(mut self, prefix: impl Into<String>) -> Self {
        self.condition = Some(SortKeyCondition::BeginsWith(prefix.into()));
        self
    }

    /// Restrict to sort keys in the inclusive range
    pub fn between(mut self, lo: impl Into<String>, hi: impl Into<String>) -> Self {
        self.condition = Some(SortKeyCondition::Between(lo.into(), hi.into()));
        self
    }

    /// Restrict to one sort key
    pub fn equals(mut self, sort_key: impl Into<String>) -> Self {
        self.condition = Some(SortKeyCondition::Equals(sort_key.into()));
        self
    }

    /// Scan a secondary index instead of the primary key
    pub fn on_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Descending sort key order
    pub fn backward(mut self) -> Self {
        self.scan_forward = false;
        self
    }

    /// Limit the page size
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Request a strongly consistent read
    pub fn consistent(mut self, consistent: bool) -> Self {
        self.consistent = consistent;
        self
    }
}

/// One page of query results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    /// Items in sort key order
    pub items: Vec<Item>,
    /// Token for the next page, `None` when exhausted
    pub next: Option<PageToken>,
}

/// Sorted key-value table
#[async_trait]
pub trait KvTable: Send + Sync {
    /// Read one item; `None` when absent
    async fn get(&self, partition_key: &str, sort_key: &str, consistent: bool)
        -> Result<Option<Item>>;

    /// Write one item, replacing any item with the same primary key
    async fn put(&self, item: Item) -> Result<()>;

    /// Write up to [`KvTable::max_batch_size`] items; returns the items the
    /// table did not process
    async fn batch_write(&self, items: &[Item]) -> Result<Vec<Item>>;

    /// Read one page of a partition
    async fn query(&self, query: &Query) -> Result<QueryPage>;

    /// Per-call item limit of `batch_write`
    fn max_batch_size(&self) -> usize {
        MAX_BATCH_WRITE_ITEMS
    }
}
