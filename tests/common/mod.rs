//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use wikivc::keys::{document_pk, document_sk};
use wikivc::{
    BlockData, BlockRequest, CreateDocumentRequest, DeleteDocumentRequest, DocumentType, Droplet,
    DropletGenerator, Item, KeyInfo, KvTable, ManualClock, MemoryRelationalStore, MemoryTable,
    RetryConfig, VersionSlot, Wiki, WikiConfig, WikiContext,
};

pub const AUTHOR: &str = "alice";

/// Enable log output when RUST_LOG is set.
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

/// Retry policy that never sleeps long
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new().with_base_delay_ms(1).with_max_delay_ms(2)
}

// ============================================================================
// TestWiki - engine over in-memory stores with a manual clock
// ============================================================================

pub struct TestWiki {
    pub wiki: Wiki,
    pub table: Arc<MemoryTable>,
    pub relational: Arc<MemoryRelationalStore>,
    pub clock: Arc<ManualClock>,
}

impl TestWiki {
    pub fn new() -> Self {
        Self::with_config(WikiConfig::default())
    }

    pub fn with_config(mut config: WikiConfig) -> Self {
        setup_logging();
        config.retry = RetryConfig {
            max_retries: config.retry.max_retries,
            ..fast_retry()
        };
        let table = Arc::new(MemoryTable::new());
        let relational = Arc::new(MemoryRelationalStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let ctx = WikiContext::new(table.clone(), relational.clone(), &config)
            .unwrap()
            .with_clock(clock.clone())
            .with_generator(Arc::new(DropletGenerator::new(7)));
        Self {
            wiki: Wiki::with_context(ctx),
            table,
            relational,
            clock,
        }
    }

    /// Raw latest pointer item of a document
    pub async fn latest_item(&self, id: &Droplet) -> Option<Item> {
        self.table
            .get(&document_pk(id), &document_sk(&VersionSlot::Latest), true)
            .await
            .unwrap()
    }

    /// Drop the latest pointer item, simulating a lost put
    pub fn drop_latest(&self, id: &Droplet) -> Option<Item> {
        self.table
            .remove(&document_pk(id), &document_sk(&VersionSlot::Latest))
    }
}

// ============================================================================
// Request fixtures
// ============================================================================

pub fn paragraph(text: &str) -> BlockRequest {
    BlockRequest::new(BlockData::paragraph(text))
}

pub fn key_info(name: &str, value: &str) -> BlockRequest {
    BlockRequest::new(BlockData::key_value(value)).with_key_info(KeyInfo::new(name))
}

/// Collection page with one key-info block and one paragraph
pub fn collection_page(title: &str) -> CreateDocumentRequest {
    let mut request = CreateDocumentRequest::new(DocumentType::Collection, title, AUTHOR);
    request.key_info.push(key_info("supply", "10000"));
    request.content.push(paragraph("A generative art collection."));
    request
}

pub fn delete_request() -> DeleteDocumentRequest {
    DeleteDocumentRequest {
        audited_by: AUTHOR.to_string(),
        audit_comment: Some("spam".to_string()),
    }
}
