//! Key schema for the sorted key-value table
//!
//! The layout is shared with other writers of the same table and must stay
//! bit-exact:
//!
//! ```text
//! Document version   pk = Document::{documentId}   sk = Document::v_{version}
//! Document latest    pk = Document::{documentId}   sk = Document::v_latest
//! Block version      pk = Document::{documentId}   sk = Block::v_{documentVersion}::{blockId}
//! Block history idx  pk = BlockHistory::{documentId}
//!                    sk = Block::{blockId}::v_{version}
//! ```
//!
//! Droplets are all digits, so `v_latest` sorts after every concrete version
//! and `~` sorts after every `Block::v_{version}::{blockId}` suffix.

use std::fmt;

use crate::droplet::Droplet;
use crate::error::{Error, Result};

/// Name of the secondary index holding per-block history
pub const BLOCK_HISTORY_INDEX: &str = "BlockHistory";

const DOCUMENT_PK_PREFIX: &str = "Document::";
const DOCUMENT_SK_PREFIX: &str = "Document::v_";
const BLOCK_SK_PREFIX: &str = "Block::v_";
const BLOCK_HISTORY_PK_PREFIX: &str = "BlockHistory::";
const BLOCK_HISTORY_SK_PREFIX: &str = "Block::";
const LATEST: &str = "latest";
const SEPARATOR: &str = "::";
const RANGE_END: &str = "~";

/// Which record of a document a sort key addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSlot {
    /// The mutable pointer record
    Latest,
    /// An immutable version record
    Version(Droplet),
}

impl fmt::Display for VersionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSlot::Latest => f.write_str(LATEST),
            VersionSlot::Version(v) => write!(f, "{}", v),
        }
    }
}

// ============================================================================
// Documents
// ============================================================================

/// Partition key of a document and all of its blocks
pub fn document_pk(document_id: &Droplet) -> String {
    format!("{}{}", DOCUMENT_PK_PREFIX, document_id)
}

/// Sort key of a document record
pub fn document_sk(slot: &VersionSlot) -> String {
    format!("{}{}", DOCUMENT_SK_PREFIX, slot)
}

/// Prefix shared by every document record sort key (versions and latest)
pub fn document_sk_prefix() -> &'static str {
    DOCUMENT_SK_PREFIX
}

/// Parse a document partition key back into the document id
pub fn parse_document_pk(pk: &str) -> Result<Droplet> {
    let raw = pk
        .strip_prefix(DOCUMENT_PK_PREFIX)
        .ok_or_else(|| Error::invalid_key(format!("not a document partition key: {}", pk)))?;
    droplet(raw, pk)
}

/// Parse a document sort key back into its version slot
pub fn parse_document_sk(sk: &str) -> Result<VersionSlot> {
    let raw = sk
        .strip_prefix(DOCUMENT_SK_PREFIX)
        .ok_or_else(|| Error::invalid_key(format!("not a document sort key: {}", sk)))?;
    if raw == LATEST {
        return Ok(VersionSlot::Latest);
    }
    droplet(raw, sk).map(VersionSlot::Version)
}

// ============================================================================
// Blocks
// ============================================================================

/// Sort key of a block version under its document partition
pub fn block_sk(document_version: &Droplet, block_id: &Droplet) -> String {
    format!(
        "{}{}{}{}",
        BLOCK_SK_PREFIX, document_version, SEPARATOR, block_id
    )
}

/// Inclusive sort key bounds covering every block written in
/// `[start, end]` document versions
pub fn block_range(start: &Droplet, end: &Droplet) -> (String, String) {
    (
        format!("{}{}", BLOCK_SK_PREFIX, start),
        format!("{}{}{}{}", BLOCK_SK_PREFIX, end, SEPARATOR, RANGE_END),
    )
}

/// Parse a block sort key into `(document_version, block_id)`
pub fn parse_block_sk(sk: &str) -> Result<(Droplet, Droplet)> {
    let rest = sk
        .strip_prefix(BLOCK_SK_PREFIX)
        .ok_or_else(|| Error::invalid_key(format!("not a block sort key: {}", sk)))?;
    let (version, block_id) = rest
        .split_once(SEPARATOR)
        .ok_or_else(|| Error::invalid_key(format!("block sort key without id: {}", sk)))?;
    Ok((droplet(version, sk)?, droplet(block_id, sk)?))
}

/// Partition key of the block history index for one document
pub fn block_history_pk(document_id: &Droplet) -> String {
    format!("{}{}", BLOCK_HISTORY_PK_PREFIX, document_id)
}

/// Sort key of one block version in the history index
pub fn block_history_sk(block_id: &Droplet, version: &Droplet) -> String {
    format!(
        "{}{}{}v_{}",
        BLOCK_HISTORY_SK_PREFIX, block_id, SEPARATOR, version
    )
}

/// History index sort key prefix matching every version of one block
pub fn block_history_prefix(block_id: &Droplet) -> String {
    format!("{}{}{}v_", BLOCK_HISTORY_SK_PREFIX, block_id, SEPARATOR)
}

/// Parse a history index sort key into `(block_id, version)`
pub fn parse_block_history_sk(sk: &str) -> Result<(Droplet, Droplet)> {
    let rest = sk
        .strip_prefix(BLOCK_HISTORY_SK_PREFIX)
        .ok_or_else(|| Error::invalid_key(format!("not a block history key: {}", sk)))?;
    let (block_id, version) = rest
        .split_once("::v_")
        .ok_or_else(|| Error::invalid_key(format!("block history key without version: {}", sk)))?;
    Ok((droplet(block_id, sk)?, droplet(version, sk)?))
}

fn droplet(raw: &str, key: &str) -> Result<Droplet> {
    Droplet::decode(raw).map_err(|e| Error::invalid_key(format!("{}: {}", key, e)))
}
