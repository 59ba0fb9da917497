//! Wiki: entry point of the engine
//!
//! Owns the shared `WikiContext` and hands out `Document` entities. Each
//! operation works on a fresh entity, so a `Wiki` can be shared freely
//! between tasks.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use wikivc_core::{
    BlockRecord, CreateDocumentRequest, DeleteDocumentRequest, DocumentRecord, DocumentView,
    Droplet, Result, UpdateDocumentRequest,
};
use wikivc_storage::KvTable;

use crate::block::{Block, BlockId};
use crate::config::WikiConfig;
use crate::context::WikiContext;
use crate::document::{Document, LatestCheck};
use crate::entity::{VersionedEntity, VersionToken};
use crate::relational::RelationalStore;

/// Version-control engine facade
#[derive(Debug, Clone)]
pub struct Wiki {
    ctx: Arc<WikiContext>,
}

impl Wiki {
    /// Engine over the given stores
    pub fn new(
        table: Arc<dyn KvTable>,
        relational: Arc<dyn RelationalStore>,
        config: &WikiConfig,
    ) -> Result<Self> {
        let ctx = WikiContext::new(table, relational, config)?;
        info!(machine_tag = ctx.ids.machine_tag(), "wiki engine ready");
        Ok(Self::with_context(ctx))
    }

    /// Engine configured from a `wikivc.toml` file
    pub fn open(
        table: Arc<dyn KvTable>,
        relational: Arc<dyn RelationalStore>,
        config_path: &Path,
    ) -> Result<Self> {
        let config = WikiConfig::from_file(config_path)?;
        Self::new(table, relational, &config)
    }

    /// Engine over a prepared context
    pub fn with_context(ctx: WikiContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<WikiContext> {
        &self.ctx
    }

    /// Create a document
    pub async fn create_document(&self, request: CreateDocumentRequest) -> Result<Document> {
        Document::create(self.ctx.clone(), request).await
    }

    /// Load one version of a document with its blocks
    pub async fn load_document(
        &self,
        id: &Droplet,
        version: VersionToken,
        consistent: bool,
    ) -> Result<Document> {
        let mut document = Document::new(self.ctx.clone(), id.clone());
        document.load(version, consistent).await?;
        Ok(document)
    }

    /// Load and build one version of a document
    pub async fn get_document(&self, id: &Droplet, version: VersionToken) -> Result<DocumentView> {
        let mut document = self.load_document(id, version, false).await?;
        document.build(&VersionToken::Selected)
    }

    /// Update a document; `false` when nothing changed
    pub async fn update_document(
        &self,
        id: &Droplet,
        request: UpdateDocumentRequest,
    ) -> Result<(bool, Document)> {
        let mut document = Document::new(self.ctx.clone(), id.clone());
        let changed = document.update(request).await?;
        Ok((changed, document))
    }

    /// Delete a document
    pub async fn delete_document(
        &self,
        id: &Droplet,
        request: DeleteDocumentRequest,
    ) -> Result<Document> {
        let mut document = Document::new(self.ctx.clone(), id.clone());
        document.delete(request).await?;
        Ok(document)
    }

    /// Every version record of a document, oldest first
    pub async fn document_history(&self, id: &Droplet) -> Result<Vec<DocumentRecord>> {
        Document::new(self.ctx.clone(), id.clone()).history().await
    }

    /// Every version record of a block, oldest first
    pub async fn block_history(
        &self,
        document_id: &Droplet,
        block_id: &Droplet,
    ) -> Result<Vec<BlockRecord>> {
        let id = BlockId::new(document_id.clone(), block_id.clone());
        Block::new(self.ctx.clone(), id).history().await
    }

    /// Compare a document's latest pointer with its newest version
    pub async fn check_latest(&self, id: &Droplet) -> Result<LatestCheck> {
        Document::new(self.ctx.clone(), id.clone()).check_latest().await
    }

    /// Rewrite a stale latest pointer; `true` when a repair was written
    pub async fn reconcile(&self, id: &Droplet) -> Result<bool> {
        Document::new(self.ctx.clone(), id.clone()).reconcile().await
    }
}
