//! Data model for documents and blocks
//!
//! This module defines the records persisted in the table, the requests that
//! drive writes, and the public build views returned to callers:
//!
//! - `DocumentRecord` / `BlockRecord`: one immutable version each
//! - `BlockRef`: structural pointer stored inside a document
//! - `CacheEntry`: one external field value with fetch bookkeeping
//! - `*Request`: write instructions (`None` means "no instruction")
//! - `DocumentView` / `BlockView`: resolved, bookkeeping-free output

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::droplet::Droplet;

/// Schema version stamped on every persisted record
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Audit
// ============================================================================

/// Audit action attached to a version, an attribute or a block reference
///
/// Scalar attributes only ever produce `NoChange` or `Update`; structural
/// diffs of block references use the full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Entity or attribute came into existence
    Create,
    /// Value changed
    Update,
    /// Entity or attribute was removed
    Delete,
    /// Value is identical to the previous version
    NoChange,
    /// Block content unchanged but its position moved
    Move,
}

impl AuditAction {
    /// Whether this action records a modification
    pub fn is_change(&self) -> bool {
        !matches!(self, AuditAction::NoChange)
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::NoChange => "no_change",
            AuditAction::Move => "move",
        };
        f.write_str(s)
    }
}

/// Audit record for one scalar attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDiff {
    /// What happened to the attribute
    pub action: AuditAction,
}

impl AttributeDiff {
    /// Record with the given action
    pub fn new(action: AuditAction) -> Self {
        Self { action }
    }
}

impl Default for AttributeDiff {
    fn default() -> Self {
        Self::new(AuditAction::NoChange)
    }
}

/// Audit record for an ordered list of block references
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureDiff {
    /// Relative order or parent of surviving references changed
    pub transposed: bool,
    /// Action per block id, deleted blocks included
    pub blocks: BTreeMap<Droplet, AuditAction>,
}

impl StructureDiff {
    /// Whether any reference was created, changed, moved or removed
    pub fn has_changes(&self) -> bool {
        self.transposed || self.blocks.values().any(AuditAction::is_change)
    }
}

/// Per-attribute audit of one document version
///
/// Tombstones carry the default (empty) diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDiff {
    /// Document type
    pub doc_type: AttributeDiff,
    /// Title
    pub title: AttributeDiff,
    /// Linked collection
    pub collection_id: AttributeDiff,
    /// Tag set
    pub tags: AttributeDiff,
    /// Key-info block references
    pub key_info: StructureDiff,
    /// Content block references
    pub content: StructureDiff,
    /// External fields, per field
    pub external: BTreeMap<ExternalField, AuditAction>,
}

impl DocumentDiff {
    /// Whether this diff records any modification
    pub fn has_changes(&self) -> bool {
        self.doc_type.action.is_change()
            || self.title.action.is_change()
            || self.collection_id.action.is_change()
            || self.tags.action.is_change()
            || self.key_info.has_changes()
            || self.content.has_changes()
            || self.external.values().any(AuditAction::is_change)
    }
}

// ============================================================================
// External fields
// ============================================================================

/// Attribute sourced from the relational aggregate of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalField {
    /// Project website link
    Website,
    /// Twitter handle or link
    Twitter,
    /// Discord invite link
    Discord,
    /// Current floor price
    FloorPrice,
    /// Total traded volume
    TotalVolume,
    /// Number of distinct owners
    OwnerCount,
}

impl ExternalField {
    /// Every known field
    pub const ALL: [ExternalField; 6] = [
        ExternalField::Website,
        ExternalField::Twitter,
        ExternalField::Discord,
        ExternalField::FloorPrice,
        ExternalField::TotalVolume,
        ExternalField::OwnerCount,
    ];

    /// Configuration name of the field
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalField::Website => "website",
            ExternalField::Twitter => "twitter",
            ExternalField::Discord => "discord",
            ExternalField::FloorPrice => "floor_price",
            ExternalField::TotalVolume => "total_volume",
            ExternalField::OwnerCount => "owner_count",
        }
    }

    /// Look a field up by its configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for ExternalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached value of one external field
///
/// - `cached_at == None`: never fetched
/// - `cache == None` with `cached_at` set: fetched, confirmed absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Last fetched value
    pub cache: Option<Value>,
    /// When the value was fetched
    pub cached_at: Option<DateTime<Utc>>,
    /// When the upstream value itself last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// An entry that has never been fetched
    pub fn unfetched() -> Self {
        Self::default()
    }

    /// A freshly fetched entry
    pub fn fetched(
        cache: Option<Value>,
        cached_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            cache,
            cached_at: Some(cached_at),
            updated_at,
        }
    }

    /// Whether the entry has ever been fetched
    pub fn is_fetched(&self) -> bool {
        self.cached_at.is_some()
    }
}

/// External fields of a document or block
pub type ExternalMap = BTreeMap<ExternalField, CacheEntry>;

/// Resolve cache entries into plain values for output
pub fn resolve_external(map: &ExternalMap) -> BTreeMap<ExternalField, Option<Value>> {
    map.iter()
        .map(|(field, entry)| (*field, entry.cache.clone()))
        .collect()
}

/// Three-way instruction for an external map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "fields")]
pub enum ExternalRequest {
    /// Keep every current field
    #[default]
    Keep,
    /// Delete every current field
    Clear,
    /// Reconcile key-wise against the given map
    Set(ExternalMap),
}

// ============================================================================
// Blocks
// ============================================================================

/// Discriminant of [`BlockData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Plain text paragraph
    Paragraph,
    /// Section heading
    Heading,
    /// Image reference
    Image,
    /// Ordered or unordered list
    List,
    /// Quotation
    Quote,
    /// Single value, used by key-info blocks
    KeyValue,
}

/// Typed block payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockData {
    /// Plain text paragraph
    Paragraph {
        /// Text content
        text: String,
    },
    /// Section heading
    Heading {
        /// Heading level, 1..=6
        level: u8,
        /// Heading text
        text: String,
    },
    /// Image reference
    Image {
        /// Image location
        src: String,
        /// Optional caption
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// Ordered or unordered list
    List {
        /// Numbered list
        ordered: bool,
        /// List entries
        items: Vec<String>,
    },
    /// Quotation
    Quote {
        /// Quoted text
        text: String,
        /// Attribution
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Single value
    KeyValue {
        /// Arbitrary JSON value
        value: Value,
    },
}

impl BlockData {
    /// Discriminant of this payload
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockData::Paragraph { .. } => BlockType::Paragraph,
            BlockData::Heading { .. } => BlockType::Heading,
            BlockData::Image { .. } => BlockType::Image,
            BlockData::List { .. } => BlockType::List,
            BlockData::Quote { .. } => BlockType::Quote,
            BlockData::KeyValue { .. } => BlockType::KeyValue,
        }
    }

    /// Paragraph shorthand
    pub fn paragraph(text: impl Into<String>) -> Self {
        BlockData::Paragraph { text: text.into() }
    }

    /// Key-value shorthand
    pub fn key_value(value: impl Into<Value>) -> Self {
        BlockData::KeyValue {
            value: value.into(),
        }
    }
}

/// Key-info metadata of a block
///
/// `name` is immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Stable name of the key-info entry
    pub name: String,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl KeyInfo {
    /// Key info without a label
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Community verification counters, carried across versions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCount {
    /// Readers who verified the block
    pub verify: u32,
    /// Readers who flagged the block
    pub be_aware: u32,
}

/// Per-attribute audit of one block version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAttribActions {
    /// Payload
    pub data: AuditAction,
    /// Key-info metadata
    pub key_info: AuditAction,
    /// External fields, per field
    #[serde(default)]
    pub external: BTreeMap<ExternalField, AuditAction>,
}

impl BlockAttribActions {
    /// Every attribute marked with the same action
    pub fn uniform(action: AuditAction) -> Self {
        Self {
            data: action,
            key_info: action,
            external: BTreeMap::new(),
        }
    }
}

/// One immutable block version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block id
    pub id: Droplet,
    /// Owning document
    pub document_id: Droplet,
    /// Document version in which this block last changed
    pub document_version: Droplet,
    /// Block version
    pub version: Droplet,
    /// Typed payload
    pub data: BlockData,
    /// Key-info metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_info: Option<KeyInfo>,
    /// External fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalMap>,
    /// Verification counters
    #[serde(default)]
    pub verification_count: VerificationCount,
    /// What happened to the block in this version
    pub block_action: AuditAction,
    /// What happened to each attribute in this version
    pub attrib_actions: BlockAttribActions,
    /// Author of the change
    pub audited_by: String,
    /// Record schema version
    pub schema: u32,
}

impl BlockRecord {
    /// Block type of the payload
    pub fn block_type(&self) -> BlockType {
        self.data.block_type()
    }

    /// Whether this version is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.block_action == AuditAction::Delete
    }
}

/// Structural pointer to one block version inside a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block id
    pub id: Droplet,
    /// Block version referenced
    pub version: Droplet,
    /// Action relative to the previous document version
    pub action: AuditAction,
    /// Nested references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<BlockRef>>,
}

impl BlockRef {
    /// Reference without children
    pub fn new(id: Droplet, version: Droplet, action: AuditAction) -> Self {
        Self {
            id,
            version,
            action,
            children: None,
        }
    }

    /// Children as a slice (empty when absent)
    pub fn children(&self) -> &[BlockRef] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Visit this reference and every descendant, depth first
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a BlockRef)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }
}

/// Visit every reference of a forest, depth first
pub fn walk_refs<'a>(refs: &'a [BlockRef], f: &mut dyn FnMut(&'a BlockRef)) {
    for r in refs {
        r.walk(f);
    }
}

// ============================================================================
// Documents
// ============================================================================

/// Kind of wiki page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// Page about a collection
    Collection,
    /// Page about a creator
    Creator,
    /// Page about a project
    Project,
    /// Free-form article
    Article,
}

/// `[start, end]` document versions whose blocks rebuild one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersionRange(pub Droplet, pub Droplet);

impl BuildVersionRange {
    /// Range covering a single version
    pub fn single(version: Droplet) -> Self {
        BuildVersionRange(version.clone(), version)
    }

    /// First document version of the range
    pub fn start(&self) -> &Droplet {
        &self.0
    }

    /// Last document version of the range
    pub fn end(&self) -> &Droplet {
        &self.1
    }
}

/// One document version
///
/// Version records are persisted with `is_latest == false`; only the latest
/// pointer record carries `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document id
    pub id: Droplet,
    /// Version stamp
    pub version: Droplet,
    /// Whether this record is the latest pointer
    pub is_latest: bool,
    /// Document type
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    /// Title
    pub title: String,
    /// Collection the external fields are sourced from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Key-info block references
    pub key_info: Vec<BlockRef>,
    /// Content block references
    pub content: Vec<BlockRef>,
    /// Tags
    pub tags: BTreeSet<String>,
    /// External fields
    #[serde(default)]
    pub external: ExternalMap,
    /// What happened in this version
    pub action: Option<AuditAction>,
    /// Per-attribute audit
    pub diff: DocumentDiff,
    /// Author of the change
    pub audited_by: String,
    /// Free-form change comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_comment: Option<String>,
    /// Versions to fetch when rebuilding this snapshot
    pub build_version_range: BuildVersionRange,
    /// Record schema version
    pub schema: u32,
}

impl DocumentRecord {
    /// Whether this version is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.action == Some(AuditAction::Delete)
    }

    /// Every block reference, key info first, depth first
    pub fn all_refs(&self) -> Vec<&BlockRef> {
        let mut out = Vec::new();
        walk_refs(&self.key_info, &mut |r| out.push(r));
        walk_refs(&self.content, &mut |r| out.push(r));
        out
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Write instruction for one block
///
/// `id == None` creates a new block; `Some` addresses an existing one. Every
/// other `None` means "keep the current value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockRequest {
    /// Existing block id
    #[serde(default)]
    pub id: Option<Droplet>,
    /// New payload
    #[serde(default)]
    pub data: Option<BlockData>,
    /// New key-info metadata
    #[serde(default)]
    pub key_info: Option<KeyInfo>,
    /// External field instruction
    #[serde(default)]
    pub external: ExternalRequest,
    /// Child blocks, `None` keeps the current children
    #[serde(default)]
    pub children: Option<Vec<BlockRequest>>,
}

impl BlockRequest {
    /// Request creating a new block
    pub fn new(data: BlockData) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Request addressing an existing block, changing nothing yet
    pub fn existing(id: Droplet) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Set the payload
    pub fn with_data(mut self, data: BlockData) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the key-info metadata
    pub fn with_key_info(mut self, key_info: KeyInfo) -> Self {
        self.key_info = Some(key_info);
        self
    }

    /// Set the external field instruction
    pub fn with_external(mut self, external: ExternalRequest) -> Self {
        self.external = external;
        self
    }

    /// Set the children
    pub fn with_children(mut self, children: Vec<BlockRequest>) -> Self {
        self.children = Some(children);
        self
    }
}

/// Request creating a new document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDocumentRequest {
    /// Document type
    pub doc_type: DocumentType,
    /// Title
    pub title: String,
    /// Collection the external fields are sourced from
    #[serde(default)]
    pub collection_id: Option<String>,
    /// Key-info blocks
    #[serde(default)]
    pub key_info: Vec<BlockRequest>,
    /// Content blocks
    #[serde(default)]
    pub content: Vec<BlockRequest>,
    /// Tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// External fields to track
    #[serde(default)]
    pub external: ExternalMap,
    /// Author
    pub audited_by: String,
    /// Change comment
    #[serde(default)]
    pub audit_comment: Option<String>,
}

impl CreateDocumentRequest {
    /// Minimal request with no blocks
    pub fn new(doc_type: DocumentType, title: impl Into<String>, audited_by: impl Into<String>) -> Self {
        Self {
            doc_type,
            title: title.into(),
            collection_id: None,
            key_info: Vec::new(),
            content: Vec::new(),
            tags: BTreeSet::new(),
            external: ExternalMap::new(),
            audited_by: audited_by.into(),
            audit_comment: None,
        }
    }
}

/// Request updating an existing document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDocumentRequest {
    /// New document type
    #[serde(default)]
    pub doc_type: Option<DocumentType>,
    /// New title
    #[serde(default)]
    pub title: Option<String>,
    /// New linked collection
    #[serde(default)]
    pub collection_id: Option<String>,
    /// Full key-info block list, `None` keeps the current list
    #[serde(default)]
    pub key_info: Option<Vec<BlockRequest>>,
    /// Full content block list, `None` keeps the current list
    #[serde(default)]
    pub content: Option<Vec<BlockRequest>>,
    /// New tag set
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    /// External field instruction
    #[serde(default)]
    pub external: ExternalRequest,
    /// Author
    pub audited_by: String,
    /// Change comment
    #[serde(default)]
    pub audit_comment: Option<String>,
}

impl UpdateDocumentRequest {
    /// Request changing nothing yet
    pub fn new(audited_by: impl Into<String>) -> Self {
        Self {
            audited_by: audited_by.into(),
            ..Default::default()
        }
    }
}

/// Request deleting a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDocumentRequest {
    /// Author
    pub audited_by: String,
    /// Change comment
    #[serde(default)]
    pub audit_comment: Option<String>,
}

// ============================================================================
// Build views
// ============================================================================

/// Resolved block as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockView {
    /// Block id
    pub id: Droplet,
    /// Owning document
    pub document_id: Droplet,
    /// Block version
    pub version: Droplet,
    /// Document version in which the block last changed
    pub document_version: Droplet,
    /// Block type
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Payload
    pub data: BlockData,
    /// Key-info metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_info: Option<KeyInfo>,
    /// Resolved external values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub external: BTreeMap<ExternalField, Option<Value>>,
    /// Verification counters
    pub verification_count: VerificationCount,
    /// Action relative to the previous document version
    pub action: AuditAction,
    /// Resolved children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockView>,
}

/// Resolved document as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentView {
    /// Document id
    pub id: Droplet,
    /// Version stamp
    pub version: Droplet,
    /// Whether this is the latest version
    pub is_latest: bool,
    /// Document type
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    /// Title
    pub title: String,
    /// Linked collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Resolved key-info blocks
    pub key_info: Vec<BlockView>,
    /// Resolved content blocks
    pub content: Vec<BlockView>,
    /// Tags
    pub tags: BTreeSet<String>,
    /// Resolved external values
    pub external: BTreeMap<ExternalField, Option<Value>>,
    /// What happened in this version
    pub action: Option<AuditAction>,
    /// Per-attribute audit
    pub diff: DocumentDiff,
    /// Author
    pub audited_by: String,
    /// Change comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_comment: Option<String>,
    /// Versions fetched to build this snapshot
    pub build_version_range: BuildVersionRange,
}
