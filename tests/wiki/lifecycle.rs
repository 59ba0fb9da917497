//! Create / load / update / delete round trips

use std::collections::BTreeSet;

use wikivc::{
    AuditAction, BlockData, BlockRequest, BuildVersionRange, DocumentRecord, Error,
    UpdateDocumentRequest, VersionToken, VersionedEntity,
};

use crate::common::*;

fn tags(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn create_then_get_latest_resolves_every_block() {
    let t = TestWiki::new();
    let doc = t
        .wiki
        .create_document(collection_page("Chromie Squiggle"))
        .await
        .unwrap();

    // version item + 2 block items, then the latest pointer
    assert_eq!(t.table.len(), 4);
    assert_eq!(t.table.stats().puts, 1);

    let view = t
        .wiki
        .get_document(doc.id(), VersionToken::Latest)
        .await
        .unwrap();
    assert!(view.is_latest);
    assert_eq!(view.title, "Chromie Squiggle");
    assert_eq!(view.action, Some(AuditAction::Create));
    assert_eq!(view.diff.title.action, AuditAction::Create);
    assert_eq!(view.build_version_range, BuildVersionRange::single(view.version.clone()));

    assert_eq!(view.key_info.len(), 1);
    let supply = &view.key_info[0];
    assert_eq!(supply.key_info.as_ref().unwrap().name, "supply");
    assert_eq!(supply.data, BlockData::key_value("10000"));
    assert_eq!(supply.document_id, *doc.id());
    assert_eq!(supply.document_version, view.version);

    assert_eq!(view.content.len(), 1);
    assert_eq!(view.content[0].data, BlockData::paragraph("A generative art collection."));
    assert_eq!(view.content[0].action, AuditAction::Create);

    let row = t.relational.document_row(doc.id()).unwrap();
    assert_eq!(row.title, "Chromie Squiggle");
}

#[tokio::test]
async fn created_document_is_built_without_reload() {
    let t = TestWiki::new();
    let mut doc = t
        .wiki
        .create_document(collection_page("Fidenza"))
        .await
        .unwrap();
    t.table.reset_stats();

    let view = doc.build(&VersionToken::Latest).unwrap();
    assert_eq!(view.content.len(), 1);
    assert_eq!(t.table.stats().gets, 0);
    assert_eq!(t.table.stats().queries, 0);
}

#[tokio::test]
async fn title_only_update_writes_two_items() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Ringers")).await.unwrap();
    let v1 = doc.record(&VersionToken::Latest).unwrap().version.clone();
    t.table.reset_stats();

    let request = UpdateDocumentRequest {
        title: Some("Ringers by Dmitri Cherniak".into()),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, mut updated) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(changed);
    assert_eq!(t.table.stats().items_written, 2);

    let view = updated.build(&VersionToken::Latest).unwrap();
    assert_ne!(view.version, v1);
    assert_eq!(view.action, Some(AuditAction::Update));
    assert_eq!(view.diff.title.action, AuditAction::Update);
    assert_eq!(view.diff.doc_type.action, AuditAction::NoChange);
    assert!(!view.diff.content.has_changes());
    assert!(view
        .diff
        .content
        .blocks
        .values()
        .all(|a| *a == AuditAction::NoChange));
    assert_eq!(view.content[0].action, AuditAction::NoChange);
    assert_eq!(view.build_version_range, BuildVersionRange(v1.clone(), v1));
}

#[tokio::test]
async fn identical_update_writes_nothing() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Meridian")).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    t.table.reset_stats();
    let ctx = t.wiki.context();
    let before = ctx.ids.generate(ctx.now());

    let request = UpdateDocumentRequest {
        title: Some("Meridian".into()),
        content: Some(vec![BlockRequest::existing(view.content[0].id.clone())
            .with_data(BlockData::paragraph("A generative art collection."))]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, _) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(!changed);
    assert_eq!(t.table.stats().items_written, 0);
    assert_eq!(t.wiki.document_history(doc.id()).await.unwrap().len(), 1);

    // no id was drawn for the skipped version
    let after = ctx.ids.generate(ctx.now());
    assert_eq!(after.counter(), before.counter() + 1);
}

#[tokio::test]
async fn historical_version_stays_readable() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Archetype")).await.unwrap();
    let v1 = doc.record(&VersionToken::Latest).unwrap().version.clone();

    let request = UpdateDocumentRequest {
        title: Some("Archetype II".into()),
        content: Some(vec![paragraph("Rewritten from scratch.")]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    t.wiki.update_document(doc.id(), request).await.unwrap();

    let old = t
        .wiki
        .get_document(doc.id(), VersionToken::Version(v1.clone()))
        .await
        .unwrap();
    assert!(!old.is_latest);
    assert_eq!(old.version, v1);
    assert_eq!(old.title, "Archetype");
    assert_eq!(old.content[0].data, BlockData::paragraph("A generative art collection."));

    let latest = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(latest.title, "Archetype II");
    assert_eq!(latest.content.len(), 1);
    assert_eq!(latest.content[0].data, BlockData::paragraph("Rewritten from scratch."));
}

#[tokio::test]
async fn history_lists_versions_oldest_first() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Gazers")).await.unwrap();
    for title in ["Gazers I", "Gazers II"] {
        let request = UpdateDocumentRequest {
            title: Some(title.into()),
            ..UpdateDocumentRequest::new(AUTHOR)
        };
        t.wiki.update_document(doc.id(), request).await.unwrap();
    }

    let history: Vec<DocumentRecord> = t.wiki.document_history(doc.id()).await.unwrap();
    let titles: Vec<&str> = history.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec!["Gazers", "Gazers I", "Gazers II"]);
    assert!(history.iter().all(|r| !r.is_latest));
    assert!(history.windows(2).all(|w| w[0].version < w[1].version));
}

#[tokio::test]
async fn block_history_follows_content_changes() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Subscapes")).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    let block_id = view.content[0].id.clone();

    let request = UpdateDocumentRequest {
        content: Some(vec![
            BlockRequest::existing(block_id.clone()).with_data(BlockData::paragraph("Edited."))
        ]),
        ..UpdateDocumentRequest::new("bob")
    };
    t.wiki.update_document(doc.id(), request).await.unwrap();

    let history = t.wiki.block_history(doc.id(), &block_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].block_action, AuditAction::Create);
    assert_eq!(history[1].block_action, AuditAction::Update);
    assert_eq!(history[1].attrib_actions.data, AuditAction::Update);
    assert_eq!(history[1].attrib_actions.key_info, AuditAction::NoChange);
    assert_eq!(history[1].audited_by, "bob");
    assert_eq!(history[1].data, BlockData::paragraph("Edited."));
}

#[tokio::test]
async fn tags_follow_the_latest_version() {
    let t = TestWiki::new();
    let mut request = collection_page("Autoglyphs");
    request.tags = tags(&["art", "generative"]);
    let doc = t.wiki.create_document(request).await.unwrap();
    assert_eq!(t.relational.tags_of(doc.id()), tags(&["art", "generative"]));

    let request = UpdateDocumentRequest {
        tags: Some(tags(&["art", "onchain"])),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (_, mut updated) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert_eq!(t.relational.tags_of(doc.id()), tags(&["art", "onchain"]));
    let view = updated.build(&VersionToken::Latest).unwrap();
    assert_eq!(view.diff.tags.action, AuditAction::Update);
}

#[tokio::test]
async fn delete_hides_latest_but_keeps_history() {
    let t = TestWiki::new();
    let mut request = collection_page("Squiggles");
    request.tags = tags(&["art"]);
    let doc = t.wiki.create_document(request).await.unwrap();

    let deleted = t.wiki.delete_document(doc.id(), delete_request()).await.unwrap();
    let tombstone = deleted.record(&VersionToken::Latest).unwrap().clone();
    assert!(tombstone.is_deleted());
    assert_eq!(tombstone.title, "Squiggles");
    assert_eq!(tombstone.audit_comment.as_deref(), Some("spam"));
    assert!(!tombstone.diff.has_changes());
    assert!(t.relational.tags_of(doc.id()).is_empty());

    let err = t
        .wiki
        .get_document(doc.id(), VersionToken::Latest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let history = t.wiki.document_history(doc.id()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].action, Some(AuditAction::Delete));

    // the tombstone itself still builds
    let view = t
        .wiki
        .get_document(doc.id(), VersionToken::Version(tombstone.version.clone()))
        .await
        .unwrap();
    assert_eq!(view.action, Some(AuditAction::Delete));
    assert_eq!(view.content.len(), 1);
}

#[tokio::test]
async fn deleted_document_rejects_writes() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Nouns")).await.unwrap();
    t.wiki.delete_document(doc.id(), delete_request()).await.unwrap();

    let request = UpdateDocumentRequest {
        title: Some("Nouns DAO".into()),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let err = t.wiki.update_document(doc.id(), request).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = t
        .wiki
        .delete_document(doc.id(), delete_request())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
