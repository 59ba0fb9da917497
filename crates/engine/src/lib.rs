//! Version-control engine for wikivc
//!
//! This crate orchestrates the lower layers:
//! - Wiki: facade owning the shared context
//! - Document / Block: versioned entities over the sorted table
//! - EntityState: selected/latest cursors and item/build caches
//! - ExternalCache: per-field TTL refresh from the relational aggregate
//! - RelationalStore: tags, document rows and collection aggregates
//! - WikiConfig: `wikivc.toml` configuration
//!
//! Writes append immutable version items, then rewrite the latest pointer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod config;
pub mod context;
pub mod document;
pub mod entity;
pub mod external;
pub mod relational;
pub mod wiki;

pub use block::{Block, BlockId, BlockWrite};
pub use config::{WikiConfig, CONFIG_FILE_NAME};
pub use context::{Clock, ManualClock, SystemClock, WikiContext};
pub use document::{Document, LatestCheck};
pub use entity::{EntityState, SetOptions, Versioned, VersionedEntity, VersionToken};
pub use external::{unfetched, ExpiredFields, ExternalCache, FieldPolicy};
pub use relational::{
    Aggregate, AggregateValue, DocumentRow, MemoryRelationalStore, RelationalStore, TagId,
};
pub use wiki::Wiki;
