//! Document entity
//!
//! A document version is an immutable record holding scalar attributes and
//! two trees of block references (key info and content). Every write
//! produces a new version item and then rewrites the mutable latest pointer:
//!
//! ```text
//! 1. batch write   Document::v_{version}  + changed block items
//! 2. put           Document::v_latest
//! ```
//!
//! The two steps are not atomic. A crash between them leaves a latest
//! pointer older than the newest version item; `check_latest` detects that
//! and `reconcile` rewrites the pointer.
//!
//! Snapshots are rebuilt from `build_version_range`: every block referenced
//! by a version last changed in a document version inside that range, so one
//! range query on the document partition fetches them all.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wikivc_core::diff::{
    compare_doc_type, compare_external, compare_optional, compare_structure, compare_tags,
    compare_title, StructureComparison,
};
use wikivc_core::keys::{
    block_range, document_pk, document_sk, document_sk_prefix, parse_document_pk,
    parse_document_sk, VersionSlot,
};
use wikivc_core::types::{resolve_external, walk_refs};
use wikivc_core::{
    AttributeDiff, AuditAction, BlockRecord, BlockRef, BlockRequest, BlockView,
    BuildVersionRange, CreateDocumentRequest, DeleteDocumentRequest, DocumentDiff,
    DocumentRecord, DocumentView, Droplet, Error, ExternalRequest, Result,
    StructureDiff, UpdateDocumentRequest, SCHEMA_VERSION,
};
use wikivc_storage::{batch_write_with_retry, query_all, Item, Query};

use crate::block::{decode_block_item, Block, BlockWrite};
use crate::context::WikiContext;
use crate::entity::{EntityState, SetOptions, Versioned, VersionedEntity, VersionToken};
use crate::external::unfetched;

impl Versioned for DocumentRecord {
    type Id = Droplet;

    fn entity_id(&self) -> Droplet {
        self.id.clone()
    }

    fn version(&self) -> &Droplet {
        &self.version
    }

    fn set_latest(&mut self, is_latest: bool) {
        self.is_latest = is_latest;
    }
}

impl Versioned for DocumentView {
    type Id = Droplet;

    fn entity_id(&self) -> Droplet {
        self.id.clone()
    }

    fn version(&self) -> &Droplet {
        &self.version
    }

    fn set_latest(&mut self, is_latest: bool) {
        self.is_latest = is_latest;
    }
}

// ============================================================================
// Latest pointer reconciliation
// ============================================================================

/// Versions seen by a latest-pointer check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatestCheck {
    /// Version the latest pointer refers to
    pub latest: Option<Droplet>,
    /// Newest version item in the partition
    pub newest: Option<Droplet>,
}

impl LatestCheck {
    /// Whether the pointer lags behind the newest version
    pub fn is_stale(&self) -> bool {
        match (&self.latest, &self.newest) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(latest), Some(newest)) => newest > latest,
        }
    }
}

// ============================================================================
// Document
// ============================================================================

#[derive(Default)]
struct CreatedTree {
    refs: Vec<BlockRef>,
    blocks: Vec<Block>,
    items: Vec<Item>,
}

/// One document and the versions of it loaded so far
#[derive(Debug)]
pub struct Document {
    ctx: Arc<WikiContext>,
    state: EntityState<DocumentRecord, DocumentView>,
    blocks: BTreeMap<Droplet, Block>,
    pending_write_back: Option<JoinHandle<Result<()>>>,
}

impl Document {
    /// Document with nothing loaded
    pub fn new(ctx: Arc<WikiContext>, id: Droplet) -> Self {
        Self {
            ctx,
            state: EntityState::new(id),
            blocks: BTreeMap::new(),
            pending_write_back: None,
        }
    }

    /// Document id
    pub fn id(&self) -> &Droplet {
        self.state.id()
    }

    /// Loaded record for a token
    pub fn record(&self, version: &VersionToken) -> Result<&DocumentRecord> {
        self.state.item(version)
    }

    /// Loaded block by id
    pub fn block(&self, block_id: &Droplet) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    /// Load one version with its blocks
    ///
    /// Expired external fields are refreshed; when the loaded record is the
    /// latest pointer, the refreshed cache is written back in the background
    /// (see [`Document::wait_for_write_back`]).
    pub async fn load(&mut self, version: VersionToken, consistent: bool) -> Result<()> {
        let loaded = self.load_item(version, consistent).await?;
        let token = VersionToken::Version(loaded);
        self.refresh_external(&token).await?;
        self.load_blocks(&token, consistent).await
    }

    /// Await the background cache write-back, if one is running
    pub async fn wait_for_write_back(&mut self) -> Result<()> {
        match self.pending_write_back.take() {
            None => Ok(()),
            Some(handle) => handle.await.map_err(|e| {
                Error::UpstreamTransient(format!("cache write-back task failed: {}", e))
            })?,
        }
    }

    /// Create a new document with its blocks
    pub async fn create(ctx: Arc<WikiContext>, request: CreateDocumentRequest) -> Result<Self> {
        validate_author(&request.audited_by)?;
        validate_title(&request.title)?;
        validate_key_info(&request.key_info, &HashMap::new())?;
        validate_new_blocks(&request.key_info)?;
        validate_new_blocks(&request.content)?;

        let now = ctx.now();
        let id = ctx.ids.generate(now);
        let version = ctx.ids.generate(now);

        ctx.relational
            .create_document_row(&id, request.doc_type, &request.title)
            .await?;
        for tag in &request.tags {
            let tag_id = ctx.relational.find_or_create_tag(tag).await?;
            ctx.relational.associate_tag(&id, tag_id).await?;
        }

        let write = BlockWrite {
            document_version: &version,
            audited_by: &request.audited_by,
            collection_id: request.collection_id.as_deref(),
            collection_changed: false,
            now,
        };
        let key_info = create_forest(ctx.clone(), &id, &request.key_info, write).await?;
        let content = create_forest(ctx.clone(), &id, &request.content, write).await?;

        let external = ctx
            .external
            .refresh(
                ctx.relational.as_ref(),
                request.collection_id.as_deref(),
                &request.external,
                now,
            )
            .await?
            .unwrap_or_else(|| request.external.clone());

        let created = |present: bool| {
            AttributeDiff::new(if present {
                AuditAction::Create
            } else {
                AuditAction::NoChange
            })
        };
        let diff = DocumentDiff {
            doc_type: created(true),
            title: created(true),
            collection_id: created(request.collection_id.is_some()),
            tags: created(!request.tags.is_empty()),
            key_info: created_structure(&key_info.refs),
            content: created_structure(&content.refs),
            external: external.keys().map(|f| (*f, AuditAction::Create)).collect(),
        };

        let record = DocumentRecord {
            id: id.clone(),
            version: version.clone(),
            is_latest: false,
            doc_type: request.doc_type,
            title: request.title,
            collection_id: request.collection_id,
            key_info: key_info.refs,
            content: content.refs,
            tags: request.tags,
            external,
            action: Some(AuditAction::Create),
            diff,
            audited_by: request.audited_by,
            audit_comment: request.audit_comment,
            build_version_range: BuildVersionRange::single(version.clone()),
            schema: SCHEMA_VERSION,
        };

        let mut document = Self::new(ctx, id);
        let block_items: Vec<Item> = key_info.items.into_iter().chain(content.items).collect();
        let block_count = block_items.len();
        document.write_version(record, block_items).await?;
        for block in key_info.blocks.into_iter().chain(content.blocks) {
            document.blocks.insert(block.id().block_id.clone(), block);
        }
        info!(document = %document.id(), version = %version, blocks = block_count, "document created");
        Ok(document)
    }

    /// Apply an update request to the latest version
    ///
    /// Returns `false` (and writes nothing) when the request changes nothing.
    pub async fn update(&mut self, request: UpdateDocumentRequest) -> Result<bool> {
        validate_author(&request.audited_by)?;
        if let Some(title) = &request.title {
            validate_title(title)?;
        }

        self.load(VersionToken::Latest, true).await?;
        if let Err(e) = self.wait_for_write_back().await {
            warn!(document = %self.id(), error = %e, "cache write-back failed");
        }
        let current = self.state.item(&VersionToken::Latest)?.clone();

        if let Some(requests) = &request.key_info {
            validate_key_info(requests, &self.key_info_names())?;
        }

        let doc_type = compare_doc_type(request.doc_type.as_ref(), &current.doc_type);
        let title = compare_title(request.title.as_ref(), &current.title);
        let collection =
            compare_optional(request.collection_id.as_ref(), current.collection_id.as_ref());
        let tags = compare_tags(request.tags.as_ref(), &current.tags);
        let external = compare_external(&request.external, Some(&current.external));

        let changed = doc_type.action.is_change()
            || title.action.is_change()
            || collection.action.is_change()
            || tags.action.is_change()
            || external.has_changes()
            || self.structure_changes(request.key_info.as_deref(), &current.key_info)?
            || self.structure_changes(request.content.as_deref(), &current.content)?;
        if !changed {
            debug!(document = %self.id(), "update changes nothing");
            return Ok(false);
        }

        let now = self.ctx.now();
        let version = self.ctx.ids.generate(now);
        let collection_changed = collection.action.is_change();
        let write = BlockWrite {
            document_version: &version,
            audited_by: &request.audited_by,
            collection_id: collection.data.as_deref(),
            collection_changed,
            now,
        };
        let mut block_items = Vec::new();
        let key_info = self
            .update_structure(request.key_info.as_deref(), &current.key_info, write, &mut block_items)
            .await?;
        let content = self
            .update_structure(request.content.as_deref(), &current.content, write, &mut block_items)
            .await?;

        let external_data = match external.data {
            Some(map) if collection_changed => {
                let reset = unfetched(&map);
                self.ctx
                    .external
                    .refresh(self.ctx.relational.as_ref(), collection.data.as_deref(), &reset, now)
                    .await?
                    .unwrap_or(reset)
            }
            Some(map) if matches!(request.external, ExternalRequest::Set(_)) => self
                .ctx
                .external
                .refresh(self.ctx.relational.as_ref(), collection.data.as_deref(), &map, now)
                .await?
                .unwrap_or(map),
            other => other.unwrap_or_default(),
        };

        if tags.action.is_change() {
            self.sync_tags(&current.tags, &tags.data).await?;
        }

        let build_version_range = self.build_version_range(&key_info.refs, &content.refs, &version)?;
        let record = DocumentRecord {
            id: current.id.clone(),
            version: version.clone(),
            is_latest: false,
            doc_type: doc_type.data,
            title: title.data,
            collection_id: collection.data,
            key_info: key_info.refs,
            content: content.refs,
            tags: tags.data,
            external: external_data,
            action: Some(AuditAction::Update),
            diff: DocumentDiff {
                doc_type: AttributeDiff::new(doc_type.action),
                title: AttributeDiff::new(title.action),
                collection_id: AttributeDiff::new(collection.action),
                tags: AttributeDiff::new(tags.action),
                key_info: key_info.diff,
                content: content.diff,
                external: external.actions,
            },
            audited_by: request.audited_by,
            audit_comment: request.audit_comment,
            build_version_range,
            schema: SCHEMA_VERSION,
        };

        self.write_version(record, block_items).await?;
        info!(document = %self.id(), version = %version, "document updated");
        Ok(true)
    }

    /// Write a tombstone version and point latest at it
    pub async fn delete(&mut self, request: DeleteDocumentRequest) -> Result<()> {
        validate_author(&request.audited_by)?;
        self.load(VersionToken::Latest, true).await?;
        if let Err(e) = self.wait_for_write_back().await {
            warn!(document = %self.id(), error = %e, "cache write-back failed");
        }
        let current = self.state.item(&VersionToken::Latest)?.clone();

        self.sync_tags(&current.tags, &BTreeSet::new()).await?;

        let version = self.ctx.next_id();
        let record = DocumentRecord {
            version: version.clone(),
            is_latest: false,
            action: Some(AuditAction::Delete),
            diff: DocumentDiff::default(),
            audited_by: request.audited_by,
            audit_comment: request.audit_comment,
            schema: SCHEMA_VERSION,
            ..current
        };
        self.write_version(record, Vec::new()).await?;
        info!(document = %self.id(), version = %version, "document deleted");
        Ok(())
    }

    /// Every version record, oldest first
    pub async fn history(&self) -> Result<Vec<DocumentRecord>> {
        let query = Query::partition(document_pk(self.id()))
            .begins_with(document_sk_prefix())
            .consistent(true);
        let items = query_all(self.ctx.table.as_ref(), query).await?;
        let mut records = Vec::with_capacity(items.len());
        for raw in &items {
            if let VersionSlot::Version(_) = parse_document_sk(&raw.sort_key)? {
                records.push(self.to_item(raw)?);
            }
        }
        Ok(records)
    }

    /// Compare the latest pointer with the newest version item
    pub async fn check_latest(&self) -> Result<LatestCheck> {
        // "latest" sorts after every digit, so a backward scan yields the
        // pointer first and then the newest version.
        let query = Query::partition(document_pk(self.id()))
            .begins_with(document_sk_prefix())
            .backward()
            .limit(2)
            .consistent(true);
        let page = self.ctx.table.query(&query).await?;

        let mut check = LatestCheck::default();
        for raw in &page.items {
            match parse_document_sk(&raw.sort_key)? {
                VersionSlot::Latest => check.latest = Some(self.to_item(raw)?.version),
                VersionSlot::Version(v) => {
                    if check.newest.is_none() {
                        check.newest = Some(v);
                    }
                }
            }
        }
        Ok(check)
    }

    /// Rewrite a stale latest pointer from the newest version item
    ///
    /// Returns whether a repair was written.
    pub async fn reconcile(&mut self) -> Result<bool> {
        let check = self.check_latest().await?;
        if !check.is_stale() {
            return Ok(false);
        }
        Ok(self.repair_latest(&check).await?.is_some())
    }

    async fn repair_latest(&self, check: &LatestCheck) -> Result<Option<Item>> {
        let Some(newest) = &check.newest else {
            return Ok(None);
        };
        let pk = document_pk(self.id());
        let raw = self
            .ctx
            .table
            .get(&pk, &document_sk(&VersionSlot::Version(newest.clone())), true)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {} version {}", self.id(), newest)))?;
        let mut record = self.to_item(&raw)?;
        record.is_latest = true;
        let repaired = self.to_raw_item(&record)?;
        self.ctx.table.put(repaired.clone()).await?;
        warn!(
            document = %self.id(),
            stale = ?check.latest,
            repaired = %newest,
            "latest pointer rewritten"
        );
        Ok(Some(repaired))
    }

    // ------------------------------------------------------------------------
    // Load helpers
    // ------------------------------------------------------------------------

    async fn refresh_external(&mut self, version: &VersionToken) -> Result<()> {
        let record = self.state.item(version)?;
        let refreshed = self
            .ctx
            .external
            .refresh(
                self.ctx.relational.as_ref(),
                record.collection_id.as_deref(),
                &record.external,
                self.ctx.now(),
            )
            .await?;
        let Some(map) = refreshed else {
            return Ok(());
        };

        let record = self.state.item_mut(version)?;
        record.external = map;
        if !record.is_latest {
            return Ok(());
        }

        let raw = self.to_raw_item(self.state.item(version)?)?;
        if let Err(e) = self.wait_for_write_back().await {
            warn!(document = %self.id(), error = %e, "cache write-back failed");
        }
        let table = self.ctx.table.clone();
        let document = self.id().clone();
        self.pending_write_back = Some(tokio::spawn(async move {
            let result = table.put(raw).await;
            if let Err(e) = &result {
                warn!(document = %document, error = %e, "cache write-back failed");
            }
            result
        }));
        Ok(())
    }

    async fn load_blocks(&mut self, version: &VersionToken, consistent: bool) -> Result<()> {
        let record = self.state.item(version)?.clone();
        let refs = record.all_refs();
        if refs.is_empty() {
            return Ok(());
        }

        let (lo, hi) = block_range(
            record.build_version_range.start(),
            record.build_version_range.end(),
        );
        let query = Query::partition(document_pk(self.id()))
            .between(lo, hi)
            .consistent(consistent);
        let items = query_all(self.ctx.table.as_ref(), query).await?;

        let mut fetched: HashMap<(Droplet, Droplet), BlockRecord> = HashMap::new();
        for raw in &items {
            let block = decode_block_item(raw)?;
            fetched.insert((block.id.clone(), block.version.clone()), block);
        }

        let options = if record.is_latest {
            SetOptions::latest()
        } else {
            SetOptions::selected()
        };
        for r in &refs {
            let block = fetched
                .remove(&(r.id.clone(), r.version.clone()))
                .ok_or_else(|| {
                    error!(document = %self.id(), block = %r.id, version = %r.version, "referenced block missing");
                    Error::not_found(format!("block {} version {}", r.id, r.version))
                })?;
            match self.blocks.get_mut(&r.id) {
                Some(existing) => existing.insert_record(block, options)?,
                None => {
                    let loaded = Block::from_record(self.ctx.clone(), block, options)?;
                    self.blocks.insert(r.id.clone(), loaded);
                }
            }
        }

        let collection = record.collection_id.as_deref();
        for r in &refs {
            if let Some(block) = self.blocks.get_mut(&r.id) {
                block
                    .refresh_external(&VersionToken::Version(r.version.clone()), collection)
                    .await?;
            }
        }
        debug!(document = %self.id(), blocks = refs.len(), fetched = items.len(), "blocks loaded");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Write helpers
    // ------------------------------------------------------------------------

    async fn write_version(&mut self, record: DocumentRecord, block_items: Vec<Item>) -> Result<()> {
        let mut items = Vec::with_capacity(block_items.len() + 1);
        items.push(self.to_raw_item(&record)?);
        items.extend(block_items);
        batch_write_with_retry(self.ctx.table.as_ref(), items, &self.ctx.retry).await?;

        let mut latest = record;
        latest.is_latest = true;
        self.ctx.table.put(self.to_raw_item(&latest)?).await?;
        self.state.set_item(latest, SetOptions::latest())
    }

    async fn sync_tags(&self, old: &BTreeSet<String>, new: &BTreeSet<String>) -> Result<()> {
        let relational = self.ctx.relational.as_ref();
        for tag in new.difference(old) {
            let tag_id = relational.find_or_create_tag(tag).await?;
            relational.associate_tag(self.id(), tag_id).await?;
        }
        for tag in old.difference(new) {
            let tag_id = relational.find_or_create_tag(tag).await?;
            relational.dissociate_tag(self.id(), tag_id).await?;
        }
        Ok(())
    }

    async fn update_structure(
        &mut self,
        requests: Option<&[BlockRequest]>,
        current: &[BlockRef],
        write: BlockWrite<'_>,
        items: &mut Vec<Item>,
    ) -> Result<StructureComparison> {
        let requested = match requests {
            None => unchanged_refs(current),
            Some(requests) => {
                let mut index = HashMap::new();
                walk_refs(current, &mut |r| {
                    index.insert(r.id.clone(), r.clone());
                });
                self.apply_requests(requests, &index, write, items).await?
            }
        };

        let comparison = compare_structure(&requested, current)?;
        for deleted in &comparison.deleted {
            let block = self
                .blocks
                .get_mut(&deleted.id)
                .ok_or_else(|| Error::NotLoaded(format!("block {}", deleted.id)))?;
            items.push(block.delete(write)?);
        }
        Ok(comparison)
    }

    /// Whether requests would change a block list, checked without writing
    fn structure_changes(
        &self,
        requests: Option<&[BlockRequest]>,
        current: &[BlockRef],
    ) -> Result<bool> {
        let Some(requests) = requests else {
            return Ok(false);
        };
        let mut index = HashMap::new();
        walk_refs(current, &mut |r| {
            index.insert(r.id.clone(), r.clone());
        });
        match self.planned_refs(requests, &index)? {
            None => Ok(true),
            Some(planned) => Ok(compare_structure(&planned, current)?.diff.has_changes()),
        }
    }

    // The refs `requests` resolve to when no block gets a new version, or
    // `None` as soon as one would be created or updated.
    fn planned_refs(
        &self,
        requests: &[BlockRequest],
        current: &HashMap<Droplet, BlockRef>,
    ) -> Result<Option<Vec<BlockRef>>> {
        let mut refs = Vec::with_capacity(requests.len());
        for request in requests {
            let Some(id) = &request.id else {
                return Ok(None);
            };
            let existing = current.get(id).ok_or_else(|| {
                Error::validation(format!("block {} is not part of this list", id))
            })?;
            let block = self
                .blocks
                .get(id)
                .ok_or_else(|| Error::NotLoaded(format!("block {}", id)))?;
            if block.changes(request)? {
                return Ok(None);
            }

            let mut block_ref =
                BlockRef::new(id.clone(), existing.version.clone(), AuditAction::NoChange);
            block_ref.children = match &request.children {
                Some(children) => match self.planned_refs(children, current)? {
                    None => return Ok(None),
                    Some(planned) => (!planned.is_empty()).then_some(planned),
                },
                None => existing.children.as_deref().map(unchanged_refs),
            };
            refs.push(block_ref);
        }
        Ok(Some(refs))
    }

    fn apply_requests<'a>(
        &'a mut self,
        requests: &'a [BlockRequest],
        current: &'a HashMap<Droplet, BlockRef>,
        write: BlockWrite<'a>,
        items: &'a mut Vec<Item>,
    ) -> BoxFuture<'a, Result<Vec<BlockRef>>> {
        async move {
            let mut refs = Vec::with_capacity(requests.len());
            for request in requests {
                let (mut block_ref, existing_children) = match &request.id {
                    None => {
                        let (block, item) =
                            Block::create(self.ctx.clone(), self.state.id(), request, write).await?;
                        items.push(item);
                        let record = block.record(&VersionToken::Latest)?;
                        let block_ref =
                            BlockRef::new(record.id.clone(), record.version.clone(), AuditAction::Create);
                        self.blocks.insert(record.id.clone(), block);
                        (block_ref, None)
                    }
                    Some(id) => {
                        let existing = current.get(id).ok_or_else(|| {
                            Error::validation(format!("block {} is not part of this list", id))
                        })?;
                        let block = self
                            .blocks
                            .get_mut(id)
                            .ok_or_else(|| Error::NotLoaded(format!("block {}", id)))?;
                        let block_ref = match block.update(request, write).await? {
                            Some(item) => {
                                items.push(item);
                                let version = block.record(&VersionToken::Latest)?.version.clone();
                                BlockRef::new(id.clone(), version, AuditAction::Update)
                            }
                            None => BlockRef::new(
                                id.clone(),
                                existing.version.clone(),
                                AuditAction::NoChange,
                            ),
                        };
                        (block_ref, existing.children.as_deref().map(unchanged_refs))
                    }
                };

                block_ref.children = match &request.children {
                    Some(children) => {
                        let built = self.apply_requests(children, current, write, items).await?;
                        (!built.is_empty()).then_some(built)
                    }
                    None => existing_children,
                };
                refs.push(block_ref);
            }
            Ok(refs)
        }
        .boxed()
    }

    fn build_version_range(
        &self,
        key_info: &[BlockRef],
        content: &[BlockRef],
        version: &Droplet,
    ) -> Result<BuildVersionRange> {
        let mut refs = Vec::new();
        walk_refs(key_info, &mut |r| refs.push(r));
        walk_refs(content, &mut |r| refs.push(r));

        let mut versions = Vec::with_capacity(refs.len());
        for r in refs {
            let block = self
                .blocks
                .get(&r.id)
                .ok_or_else(|| Error::NotLoaded(format!("block {}", r.id)))?;
            let record = block.record(&VersionToken::Version(r.version.clone()))?;
            versions.push(record.document_version.clone());
        }

        Ok(match (versions.iter().min(), versions.iter().max()) {
            (Some(min), Some(max)) => BuildVersionRange(min.clone(), max.clone()),
            _ => BuildVersionRange::single(version.clone()),
        })
    }

    fn key_info_names(&self) -> HashMap<Droplet, String> {
        self.blocks
            .iter()
            .filter_map(|(id, block)| {
                let record = block.record(&VersionToken::Latest).ok()?;
                Some((id.clone(), record.key_info.as_ref()?.name.clone()))
            })
            .collect()
    }

    fn build_refs(&mut self, refs: &[BlockRef]) -> Result<Vec<BlockView>> {
        let mut views = Vec::with_capacity(refs.len());
        for r in refs {
            let block = self
                .blocks
                .get_mut(&r.id)
                .ok_or_else(|| Error::NotLoaded(format!("block {}", r.id)))?;
            let mut view = block.build(&VersionToken::Version(r.version.clone()))?;
            view.action = r.action;
            view.children = self.build_refs(r.children())?;
            views.push(view);
        }
        Ok(views)
    }
}

#[async_trait]
impl VersionedEntity for Document {
    type RawItem = Item;
    type Item = DocumentRecord;
    type Build = DocumentView;

    fn state(&self) -> &EntityState<DocumentRecord, DocumentView> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EntityState<DocumentRecord, DocumentView> {
        &mut self.state
    }

    async fn load_item(&mut self, version: VersionToken, consistent: bool) -> Result<Droplet> {
        let pk = document_pk(self.id());
        let (raw, options) = match &version {
            VersionToken::Latest => {
                let mut raw = self
                    .ctx
                    .table
                    .get(&pk, &document_sk(&VersionSlot::Latest), consistent)
                    .await?;
                if consistent {
                    let check = self.check_latest().await?;
                    if check.is_stale() {
                        warn!(
                            document = %self.id(),
                            latest = ?check.latest,
                            newest = ?check.newest,
                            "latest pointer lags behind the newest version"
                        );
                        if self.ctx.repair_stale_latest {
                            if let Some(repaired) = self.repair_latest(&check).await? {
                                raw = Some(repaired);
                            }
                        }
                    }
                }
                (raw, SetOptions::latest())
            }
            VersionToken::Selected | VersionToken::Version(_) => {
                let v = self.state.resolve_version(&version)?;
                let raw = self
                    .ctx
                    .table
                    .get(&pk, &document_sk(&VersionSlot::Version(v)), consistent)
                    .await?;
                (raw, SetOptions::selected())
            }
        };

        let raw = raw.ok_or_else(|| {
            Error::not_found(format!("document {} version {}", self.id(), version))
        })?;
        let record = self.to_item(&raw)?;
        if version == VersionToken::Latest && record.is_deleted() {
            return Err(Error::not_found(format!("document {} is deleted", self.id())));
        }
        let loaded = record.version.clone();
        self.state.set_item(record, options)?;
        Ok(loaded)
    }

    fn build(&mut self, version: &VersionToken) -> Result<DocumentView> {
        if let Some(view) = self.state.cached_build(version) {
            return Ok(view.clone());
        }
        let record = self.state.item(version)?.clone();
        let key_info = self.build_refs(&record.key_info)?;
        let content = self.build_refs(&record.content)?;
        let view = DocumentView {
            id: record.id,
            version: record.version,
            is_latest: record.is_latest,
            doc_type: record.doc_type,
            title: record.title,
            collection_id: record.collection_id,
            key_info,
            content,
            tags: record.tags,
            external: resolve_external(&record.external),
            action: record.action,
            diff: record.diff,
            audited_by: record.audited_by,
            audit_comment: record.audit_comment,
            build_version_range: record.build_version_range,
        };
        self.state.set_build(view.clone(), SetOptions::default())?;
        Ok(view)
    }

    fn to_item(&self, raw: &Item) -> Result<DocumentRecord> {
        let record: DocumentRecord = raw.decode()?;
        let id = parse_document_pk(&raw.partition_key)?;
        let consistent_key = id == record.id
            && match parse_document_sk(&raw.sort_key)? {
                VersionSlot::Latest => true,
                VersionSlot::Version(v) => v == record.version,
            };
        if !consistent_key {
            error!(
                partition_key = %raw.partition_key,
                sort_key = %raw.sort_key,
                "document key disagrees with its record"
            );
            return Err(Error::invalid_key(format!(
                "{} / {} does not address document {} version {}",
                raw.partition_key, raw.sort_key, record.id, record.version
            )));
        }
        Ok(record)
    }

    fn to_raw_item(&self, record: &DocumentRecord) -> Result<Item> {
        let slot = if record.is_latest {
            VersionSlot::Latest
        } else {
            VersionSlot::Version(record.version.clone())
        };
        Item::from_record(document_pk(&record.id), document_sk(&slot), record)
    }
}

// ============================================================================
// Free helpers
// ============================================================================

fn create_forest<'a>(
    ctx: Arc<WikiContext>,
    document_id: &'a Droplet,
    requests: &'a [BlockRequest],
    write: BlockWrite<'a>,
) -> BoxFuture<'a, Result<CreatedTree>> {
    async move {
        let trees = try_join_all(
            requests
                .iter()
                .map(|request| create_subtree(ctx.clone(), document_id, request, write)),
        )
        .await?;

        let mut forest = CreatedTree::default();
        for tree in trees {
            forest.refs.extend(tree.refs);
            forest.blocks.extend(tree.blocks);
            forest.items.extend(tree.items);
        }
        Ok(forest)
    }
    .boxed()
}

async fn create_subtree<'a>(
    ctx: Arc<WikiContext>,
    document_id: &'a Droplet,
    request: &'a BlockRequest,
    write: BlockWrite<'a>,
) -> Result<CreatedTree> {
    let (block, item) = Block::create(ctx.clone(), document_id, request, write).await?;
    let record = block.record(&VersionToken::Latest)?;
    let mut block_ref = BlockRef::new(record.id.clone(), record.version.clone(), AuditAction::Create);

    let mut tree = CreatedTree {
        refs: Vec::new(),
        blocks: vec![block],
        items: vec![item],
    };
    if let Some(children) = request.children.as_deref().filter(|c| !c.is_empty()) {
        let sub = create_forest(ctx, document_id, children, write).await?;
        block_ref.children = Some(sub.refs);
        tree.blocks.extend(sub.blocks);
        tree.items.extend(sub.items);
    }
    tree.refs.push(block_ref);
    Ok(tree)
}

fn created_structure(refs: &[BlockRef]) -> StructureDiff {
    let mut diff = StructureDiff::default();
    walk_refs(refs, &mut |r| {
        diff.blocks.insert(r.id.clone(), AuditAction::Create);
    });
    diff
}

fn unchanged_refs(refs: &[BlockRef]) -> Vec<BlockRef> {
    refs.iter()
        .map(|r| BlockRef {
            id: r.id.clone(),
            version: r.version.clone(),
            action: AuditAction::NoChange,
            children: r.children.as_deref().map(unchanged_refs),
        })
        .collect()
}

fn validate_author(audited_by: &str) -> Result<()> {
    if audited_by.trim().is_empty() {
        return Err(Error::validation("audited_by must not be empty"));
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::validation("title must not be empty"));
    }
    Ok(())
}

/// Every block of a new document is new: it carries data and no id.
fn validate_new_blocks(requests: &[BlockRequest]) -> Result<()> {
    let mut stack: Vec<&BlockRequest> = requests.iter().collect();
    while let Some(request) = stack.pop() {
        if let Some(id) = &request.id {
            return Err(Error::validation(format!(
                "block {} does not belong to a new document",
                id
            )));
        }
        if request.data.is_none() {
            return Err(Error::validation("a new block requires data"));
        }
        if let Some(children) = &request.children {
            stack.extend(children.iter());
        }
    }
    Ok(())
}

/// Key-info blocks need a name, and names are unique within a document.
/// Blocks addressed by id without new key info keep their current name.
fn validate_key_info(
    requests: &[BlockRequest],
    current_names: &HashMap<Droplet, String>,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&BlockRequest> = requests.iter().collect();
    while let Some(request) = stack.pop() {
        let name = match (&request.key_info, &request.id) {
            (Some(info), _) => Some(info.name.as_str()),
            (None, Some(id)) => current_names.get(id).map(String::as_str),
            (None, None) => None,
        };
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation("key info blocks require a name"))?;
        if !seen.insert(name.to_string()) {
            return Err(Error::validation(format!(
                "duplicate key info name '{}'",
                name
            )));
        }
        if let Some(children) = &request.children {
            stack.extend(children.iter());
        }
    }
    Ok(())
}
