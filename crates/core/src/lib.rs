//! Core types for wikivc
//!
//! This crate defines the foundational pieces shared by storage and engine:
//! - Droplet: time-sortable identifiers and their generator
//! - Keys: the bit-exact key schema of the sorted table
//! - Types: document/block records, requests and build views
//! - Diff: requested-vs-current comparison with audit actions
//! - Error: the error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod diff;
pub mod droplet;
pub mod error;
pub mod keys;
pub mod types;

pub use droplet::{Droplet, DropletError, DropletGenerator};
pub use error::{Error, Result};
pub use keys::VersionSlot;
pub use types::{
    AttributeDiff, AuditAction, BlockAttribActions, BlockData, BlockRecord, BlockRef,
    BlockRequest, BlockType, BlockView, BuildVersionRange, CacheEntry, CreateDocumentRequest,
    DeleteDocumentRequest, DocumentDiff, DocumentRecord, DocumentType, DocumentView,
    ExternalField, ExternalMap, ExternalRequest, KeyInfo, StructureDiff, UpdateDocumentRequest,
    VerificationCount, SCHEMA_VERSION,
};
