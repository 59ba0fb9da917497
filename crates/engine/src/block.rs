//! Block entity
//!
//! A block is the smallest versioned unit. Every version is stored twice
//! over one item:
//!
//! - primary key `Document::{documentId}` / `Block::v_{documentVersion}::{blockId}`,
//!   which lets a document fetch all blocks of a version range in one query
//! - index `BlockHistory`: `BlockHistory::{documentId}` / `Block::{blockId}::v_{version}`,
//!   which lists the history of one block
//!
//! Writes never touch the table directly: `create`, `update` and `delete`
//! return the raw item and the owning document batches it with its own
//! version item.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error};
use wikivc_core::diff::{compare_block_data, compare_external, compare_key_info};
use wikivc_core::keys::{
    block_history_pk, block_history_prefix, block_history_sk, block_sk, document_pk,
    parse_block_sk, BLOCK_HISTORY_INDEX,
};
use wikivc_core::types::resolve_external;
use wikivc_core::{
    AuditAction, BlockAttribActions, BlockRecord, BlockRequest, BlockView, Droplet, Error,
    ExternalMap, ExternalRequest, Result, SCHEMA_VERSION,
};
use wikivc_storage::{query_all, Item, Query};

use crate::context::WikiContext;
use crate::entity::{EntityState, SetOptions, Versioned, VersionedEntity, VersionToken};
use crate::external::unfetched;

/// Identity of a block: owning document plus block id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    /// Owning document
    pub document_id: Droplet,
    /// Block id
    pub block_id: Droplet,
}

impl BlockId {
    /// Block `block_id` of document `document_id`
    pub fn new(document_id: Droplet, block_id: Droplet) -> Self {
        Self {
            document_id,
            block_id,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.block_id)
    }
}

impl Versioned for BlockRecord {
    type Id = BlockId;

    fn entity_id(&self) -> BlockId {
        BlockId::new(self.document_id.clone(), self.id.clone())
    }

    fn version(&self) -> &Droplet {
        &self.version
    }
}

impl Versioned for BlockView {
    type Id = BlockId;

    fn entity_id(&self) -> BlockId {
        BlockId::new(self.document_id.clone(), self.id.clone())
    }

    fn version(&self) -> &Droplet {
        &self.version
    }
}

/// Parameters shared by every block write of one document version
#[derive(Debug, Clone, Copy)]
pub struct BlockWrite<'a> {
    /// Document version being written
    pub document_version: &'a Droplet,
    /// Author of the change
    pub audited_by: &'a str,
    /// Collection external fields are sourced from
    pub collection_id: Option<&'a str>,
    /// The collection differs from the previous document version, so
    /// cached external values are stale whatever their age
    pub collection_changed: bool,
    /// Time of the write
    pub now: DateTime<Utc>,
}

/// One block and the versions of it loaded so far
#[derive(Debug)]
pub struct Block {
    ctx: Arc<WikiContext>,
    state: EntityState<BlockRecord, BlockView>,
}

impl Block {
    /// Block with nothing loaded
    pub fn new(ctx: Arc<WikiContext>, id: BlockId) -> Self {
        Self {
            ctx,
            state: EntityState::new(id),
        }
    }

    /// Block holding one already-fetched record
    pub fn from_record(
        ctx: Arc<WikiContext>,
        record: BlockRecord,
        options: SetOptions,
    ) -> Result<Self> {
        let mut block = Self::new(ctx, record.entity_id());
        block.state.set_item(record, options)?;
        Ok(block)
    }

    /// Identity
    pub fn id(&self) -> &BlockId {
        self.state.id()
    }

    /// Add an already-fetched record
    pub fn insert_record(&mut self, record: BlockRecord, options: SetOptions) -> Result<()> {
        self.state.set_item(record, options)
    }

    /// Loaded record for a token
    pub fn record(&self, version: &VersionToken) -> Result<&BlockRecord> {
        self.state.item(version)
    }

    /// Build a new block and its first version
    ///
    /// Expired external entries in the request are fetched before the record
    /// is produced, so the persisted version starts fresh.
    pub async fn create(
        ctx: Arc<WikiContext>,
        document_id: &Droplet,
        request: &BlockRequest,
        write: BlockWrite<'_>,
    ) -> Result<(Self, Item)> {
        let data = request
            .data
            .clone()
            .ok_or_else(|| Error::validation("a new block requires data"))?;
        let id = ctx.ids.generate(write.now);
        let version = ctx.ids.generate(write.now);

        let external = match &request.external {
            ExternalRequest::Set(map) if !map.is_empty() => {
                Some(refresh_map(&ctx, write.collection_id, map, write.now).await?)
            }
            _ => None,
        };

        let attrib_actions = BlockAttribActions {
            data: AuditAction::Create,
            key_info: if request.key_info.is_some() {
                AuditAction::Create
            } else {
                AuditAction::NoChange
            },
            external: external
                .iter()
                .flat_map(|m| m.keys())
                .map(|f| (*f, AuditAction::Create))
                .collect(),
        };

        let record = BlockRecord {
            id,
            document_id: document_id.clone(),
            document_version: write.document_version.clone(),
            version,
            data,
            key_info: request.key_info.clone(),
            external,
            verification_count: Default::default(),
            block_action: AuditAction::Create,
            attrib_actions,
            audited_by: write.audited_by.to_string(),
            schema: SCHEMA_VERSION,
        };

        let mut block = Self::new(ctx, record.entity_id());
        let raw = block.to_raw_item(&record)?;
        debug!(block = %block.id(), version = %record.version, "block created");
        block.state.set_item(record, SetOptions::latest())?;
        Ok((block, raw))
    }

    /// Apply a request to the latest version
    ///
    /// Returns the new version's item, or `None` when the request changes
    /// nothing (no version is produced then).
    pub async fn update(
        &mut self,
        request: &BlockRequest,
        write: BlockWrite<'_>,
    ) -> Result<Option<Item>> {
        let current = self.state.item(&VersionToken::Latest)?.clone();
        if current.is_deleted() {
            return Err(Error::not_found(format!("block {} is deleted", self.id())));
        }

        let data = compare_block_data(request.data.as_ref(), &current.data);
        let key_info = compare_key_info(request.key_info.as_ref(), current.key_info.as_ref())?;
        let external = compare_external(&request.external, current.external.as_ref());

        if !data.action.is_change() && !key_info.action.is_change() && !external.has_changes() {
            return Ok(None);
        }

        let external_data = match external.data {
            Some(map) if write.collection_changed => {
                Some(refresh_map(&self.ctx, write.collection_id, &unfetched(&map), write.now).await?)
            }
            Some(map) if matches!(request.external, ExternalRequest::Set(_)) => {
                Some(refresh_map(&self.ctx, write.collection_id, &map, write.now).await?)
            }
            other => other,
        };

        let record = BlockRecord {
            id: current.id.clone(),
            document_id: current.document_id.clone(),
            document_version: write.document_version.clone(),
            version: self.ctx.ids.generate(write.now),
            data: data.data,
            key_info: key_info.data,
            external: external_data,
            verification_count: current.verification_count,
            block_action: AuditAction::Update,
            attrib_actions: BlockAttribActions {
                data: data.action,
                key_info: key_info.action,
                external: external.actions,
            },
            audited_by: write.audited_by.to_string(),
            schema: SCHEMA_VERSION,
        };

        let raw = self.to_raw_item(&record)?;
        debug!(block = %self.id(), version = %record.version, "block updated");
        self.state.set_item(record, SetOptions::latest())?;
        Ok(Some(raw))
    }

    /// Whether a request would produce a new version of the latest one
    ///
    /// Fails like [`Block::update`] on a key-info rename.
    pub fn changes(&self, request: &BlockRequest) -> Result<bool> {
        let current = self.state.item(&VersionToken::Latest)?;
        if current.is_deleted() {
            return Ok(true);
        }
        let data = compare_block_data(request.data.as_ref(), &current.data);
        let key_info = compare_key_info(request.key_info.as_ref(), current.key_info.as_ref())?;
        let external = compare_external(&request.external, current.external.as_ref());
        Ok(data.action.is_change() || key_info.action.is_change() || external.has_changes())
    }

    /// Produce a tombstone version of the latest version
    pub fn delete(&mut self, write: BlockWrite<'_>) -> Result<Item> {
        let current = self.state.item(&VersionToken::Latest)?.clone();
        let record = BlockRecord {
            document_version: write.document_version.clone(),
            version: self.ctx.ids.generate(write.now),
            block_action: AuditAction::Delete,
            attrib_actions: BlockAttribActions::uniform(AuditAction::Delete),
            audited_by: write.audited_by.to_string(),
            schema: SCHEMA_VERSION,
            ..current
        };
        let raw = self.to_raw_item(&record)?;
        debug!(block = %self.id(), version = %record.version, "block deleted");
        self.state.set_item(record, SetOptions::latest())?;
        Ok(raw)
    }

    /// Every stored version of this block, oldest first
    pub async fn history(&self) -> Result<Vec<BlockRecord>> {
        let id = self.id();
        let query = Query::partition(block_history_pk(&id.document_id))
            .on_index(BLOCK_HISTORY_INDEX)
            .begins_with(block_history_prefix(&id.block_id));
        let items = query_all(self.ctx.table.as_ref(), query).await?;
        items.iter().map(|raw| self.to_item(raw)).collect()
    }

    /// Re-fetch expired external entries of a loaded version
    ///
    /// The refreshed values live in memory only. Returns whether anything
    /// was refreshed.
    pub async fn refresh_external(
        &mut self,
        version: &VersionToken,
        collection_id: Option<&str>,
    ) -> Result<bool> {
        let Some(map) = self.state.item(version)?.external.clone() else {
            return Ok(false);
        };
        let now = self.ctx.now();
        let refreshed = self
            .ctx
            .external
            .refresh(self.ctx.relational.as_ref(), collection_id, &map, now)
            .await?;
        match refreshed {
            Some(map) => {
                self.state.item_mut(version)?.external = Some(map);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn refresh_map(
    ctx: &WikiContext,
    collection_id: Option<&str>,
    map: &ExternalMap,
    now: DateTime<Utc>,
) -> Result<ExternalMap> {
    Ok(ctx
        .external
        .refresh(ctx.relational.as_ref(), collection_id, map, now)
        .await?
        .unwrap_or_else(|| map.clone()))
}

/// Decode a block item, checking its sort key against the record
pub(crate) fn decode_block_item(raw: &Item) -> Result<BlockRecord> {
    let record: BlockRecord = raw.decode()?;
    let (document_version, block_id) = parse_block_sk(&raw.sort_key)?;
    if document_version != record.document_version || block_id != record.id {
        error!(
            sort_key = %raw.sort_key,
            block = %record.id,
            "block sort key disagrees with its record"
        );
        return Err(Error::invalid_key(format!(
            "sort key {} does not address block {} of document version {}",
            raw.sort_key, record.id, record.document_version
        )));
    }
    Ok(record)
}

#[async_trait]
impl VersionedEntity for Block {
    type RawItem = Item;
    type Item = BlockRecord;
    type Build = BlockView;

    fn state(&self) -> &EntityState<BlockRecord, BlockView> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EntityState<BlockRecord, BlockView> {
        &mut self.state
    }

    async fn load_item(&mut self, version: VersionToken, consistent: bool) -> Result<Droplet> {
        let id = self.id().clone();
        let base = Query::partition(block_history_pk(&id.document_id))
            .on_index(BLOCK_HISTORY_INDEX)
            .consistent(consistent);
        let (query, options) = match &version {
            VersionToken::Latest => (
                base.begins_with(block_history_prefix(&id.block_id))
                    .backward()
                    .limit(1),
                SetOptions::latest(),
            ),
            VersionToken::Selected | VersionToken::Version(_) => {
                let v = self.state.resolve_version(&version)?;
                (
                    base.equals(block_history_sk(&id.block_id, &v)),
                    SetOptions::selected(),
                )
            }
        };

        let page = self.ctx.table.query(&query).await?;
        let raw = page
            .items
            .first()
            .ok_or_else(|| Error::not_found(format!("block {} version {}", id, version)))?;
        let record = self.to_item(raw)?;
        let loaded = record.version.clone();
        self.state.set_item(record, options)?;
        Ok(loaded)
    }

    fn build(&mut self, version: &VersionToken) -> Result<BlockView> {
        if let Some(view) = self.state.cached_build(version) {
            return Ok(view.clone());
        }
        let record = self.state.item(version)?;
        let view = BlockView {
            id: record.id.clone(),
            document_id: record.document_id.clone(),
            version: record.version.clone(),
            document_version: record.document_version.clone(),
            block_type: record.block_type(),
            data: record.data.clone(),
            key_info: record.key_info.clone(),
            external: record
                .external
                .as_ref()
                .map(resolve_external)
                .unwrap_or_default(),
            verification_count: record.verification_count,
            action: record.block_action,
            children: Vec::new(),
        };
        self.state.set_build(view.clone(), SetOptions::default())?;
        Ok(view)
    }

    fn to_item(&self, raw: &Item) -> Result<BlockRecord> {
        decode_block_item(raw)
    }

    fn to_raw_item(&self, record: &BlockRecord) -> Result<Item> {
        Ok(Item::from_record(
            document_pk(&record.document_id),
            block_sk(&record.document_version, &record.id),
            record,
        )?
        .with_index(
            BLOCK_HISTORY_INDEX,
            block_history_pk(&record.document_id),
            block_history_sk(&record.id, &record.version),
        ))
    }
}
