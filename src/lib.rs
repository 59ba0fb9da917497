//! wikivc - append-only version control for wiki documents
//!
//! Documents are trees of blocks. Every write appends immutable version
//! items to a sorted key-value table and then moves a mutable latest
//! pointer, so any past snapshot can be rebuilt and every change carries a
//! per-attribute audit.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wikivc::{
//!     BlockData, BlockRequest, CreateDocumentRequest, DocumentType, MemoryRelationalStore,
//!     MemoryTable, VersionToken, Wiki, WikiConfig,
//! };
//!
//! let wiki = Wiki::new(
//!     Arc::new(MemoryTable::new()),
//!     Arc::new(MemoryRelationalStore::new()),
//!     &WikiConfig::default(),
//! )?;
//!
//! let mut request = CreateDocumentRequest::new(DocumentType::Article, "Hello", "alice");
//! request.content.push(BlockRequest::new(BlockData::paragraph("First paragraph")));
//! let document = wiki.create_document(request).await?;
//!
//! let view = wiki.get_document(document.id(), VersionToken::Latest).await?;
//! ```
//!
//! # Architecture
//!
//! - `wikivc-core`: droplet ids, key schema, records and the diff engine
//! - `wikivc-storage`: the table contract, in-memory table, batch retry
//! - `wikivc-engine`: document/block entities, external cache, config

pub use wikivc_core::{diff, droplet, keys, types};
pub use wikivc_core::{
    AttributeDiff, AuditAction, BlockAttribActions, BlockData, BlockRecord, BlockRef,
    BlockRequest, BlockType, BlockView, BuildVersionRange, CacheEntry, CreateDocumentRequest,
    DeleteDocumentRequest, DocumentDiff, DocumentRecord, DocumentType, DocumentView, Droplet,
    DropletError, DropletGenerator, Error, ExternalField, ExternalMap, ExternalRequest, KeyInfo,
    Result, StructureDiff, UpdateDocumentRequest, VerificationCount, VersionSlot,
    SCHEMA_VERSION,
};

pub use wikivc_storage::{
    batch_write_with_retry, query_all, BatchWriteReport, Item, KvTable, MemoryTable, Query,
    QueryPage, RetryConfig, SortKeyCondition, TableStats,
};

pub use wikivc_engine::{
    Aggregate, AggregateValue, Block, BlockId, Clock, Document, LatestCheck, ManualClock,
    MemoryRelationalStore, RelationalStore, SystemClock, VersionToken, VersionedEntity, Wiki,
    WikiConfig, WikiContext, CONFIG_FILE_NAME,
};
