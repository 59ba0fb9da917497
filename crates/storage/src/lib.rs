//! Storage layer for wikivc
//!
//! This crate implements the table side of the engine:
//! - KvTable: the async sorted key-value table contract
//! - MemoryTable: BTreeMap-based table with RwLock and secondary indices
//! - Batch writes with exponential-backoff retry of unprocessed items
//! - Paged query helper

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod memory;
pub mod table;

pub use batch::{batch_write_with_retry, query_all, BatchWriteReport, RetryConfig};
pub use memory::{MemoryTable, TableStats};
pub use table::{
    IndexKey, Item, KvTable, PageToken, Query, QueryPage, SortKeyCondition, MAX_BATCH_WRITE_ITEMS,
};
