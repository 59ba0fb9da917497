//! Relational store contract
//!
//! The relational side owns document rows, tags and the per-collection
//! aggregate that external fields are sourced from. The engine only needs
//! the handful of calls below; `MemoryRelationalStore` implements them in
//! process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use wikivc_core::{Droplet, DocumentType, Error, Result};

/// Id of a tag row
pub type TagId = u64;

/// One upstream column value with its last-changed time
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateValue {
    /// Column value, `None` when null upstream
    pub value: Option<Value>,
    /// When the upstream value last changed
    pub updated_at: Option<DateTime<Utc>>,
}

impl AggregateValue {
    /// Value with a change time
    pub fn new(value: impl Into<Value>, updated_at: DateTime<Utc>) -> Self {
        Self {
            value: Some(value.into()),
            updated_at: Some(updated_at),
        }
    }
}

/// Requested columns of one collection aggregate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    /// Column values by upstream column name
    pub fields: BTreeMap<String, AggregateValue>,
}

impl Aggregate {
    /// Column by name
    pub fn get(&self, name: &str) -> Option<&AggregateValue> {
        self.fields.get(name)
    }

    /// Add a column
    pub fn with(mut self, name: impl Into<String>, value: AggregateValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Relational store used alongside the table
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert the row backing a new document
    async fn create_document_row(
        &self,
        document_id: &Droplet,
        doc_type: DocumentType,
        title: &str,
    ) -> Result<()>;

    /// Id of the named tag, creating it if needed
    async fn find_or_create_tag(&self, name: &str) -> Result<TagId>;

    /// Link a tag to a document
    async fn associate_tag(&self, document_id: &Droplet, tag: TagId) -> Result<()>;

    /// Unlink a tag from a document
    async fn dissociate_tag(&self, document_id: &Droplet, tag: TagId) -> Result<()>;

    /// Fetch the named columns of a collection aggregate in one call;
    /// `None` when the collection is unknown
    async fn load_aggregate_fields(
        &self,
        collection_id: &str,
        fields: &[&str],
    ) -> Result<Option<Aggregate>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Row backing one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRow {
    /// Document type at creation
    pub doc_type: DocumentType,
    /// Title at creation
    pub title: String,
}

#[derive(Debug, Default)]
struct Rows {
    documents: BTreeMap<Droplet, DocumentRow>,
    tags: BTreeMap<String, TagId>,
    document_tags: BTreeSet<(Droplet, TagId)>,
    aggregates: BTreeMap<String, Aggregate>,
    next_tag: TagId,
}

/// In-process relational store
#[derive(Debug, Default)]
pub struct MemoryRelationalStore {
    rows: Mutex<Rows>,
    aggregate_loads: AtomicU64,
}

impl MemoryRelationalStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the aggregate of a collection
    pub fn set_aggregate(&self, collection_id: impl Into<String>, aggregate: Aggregate) {
        self.rows
            .lock()
            .aggregates
            .insert(collection_id.into(), aggregate);
    }

    /// Number of `load_aggregate_fields` calls served
    pub fn aggregate_loads(&self) -> u64 {
        self.aggregate_loads.load(Ordering::SeqCst)
    }

    /// Row of a document
    pub fn document_row(&self, document_id: &Droplet) -> Option<DocumentRow> {
        self.rows.lock().documents.get(document_id).cloned()
    }

    /// Number of document rows
    pub fn document_count(&self) -> usize {
        self.rows.lock().documents.len()
    }

    /// Number of document/tag links
    pub fn tag_link_count(&self) -> usize {
        self.rows.lock().document_tags.len()
    }

    /// Names of the tags linked to a document
    pub fn tags_of(&self, document_id: &Droplet) -> BTreeSet<String> {
        let rows = self.rows.lock();
        rows.tags
            .iter()
            .filter(|(_, id)| rows.document_tags.contains(&(document_id.clone(), **id)))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn create_document_row(
        &self,
        document_id: &Droplet,
        doc_type: DocumentType,
        title: &str,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        if rows.documents.contains_key(document_id) {
            return Err(Error::validation(format!(
                "document row {} already exists",
                document_id
            )));
        }
        rows.documents.insert(
            document_id.clone(),
            DocumentRow {
                doc_type,
                title: title.to_string(),
            },
        );
        Ok(())
    }

    async fn find_or_create_tag(&self, name: &str) -> Result<TagId> {
        let mut rows = self.rows.lock();
        if let Some(id) = rows.tags.get(name) {
            return Ok(*id);
        }
        rows.next_tag += 1;
        let id = rows.next_tag;
        rows.tags.insert(name.to_string(), id);
        Ok(id)
    }

    async fn associate_tag(&self, document_id: &Droplet, tag: TagId) -> Result<()> {
        self.rows
            .lock()
            .document_tags
            .insert((document_id.clone(), tag));
        Ok(())
    }

    async fn dissociate_tag(&self, document_id: &Droplet, tag: TagId) -> Result<()> {
        self.rows
            .lock()
            .document_tags
            .remove(&(document_id.clone(), tag));
        Ok(())
    }

    async fn load_aggregate_fields(
        &self,
        collection_id: &str,
        fields: &[&str],
    ) -> Result<Option<Aggregate>> {
        self.aggregate_loads.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock();
        Ok(rows.aggregates.get(collection_id).map(|agg| Aggregate {
            fields: agg
                .fields
                .iter()
                .filter(|(name, _)| fields.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }))
    }
}
