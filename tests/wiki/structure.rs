//! Block trees: moves, deletes, nesting and build version ranges

use wikivc::{
    AuditAction, BlockData, BlockRequest, BuildVersionRange, CreateDocumentRequest, Document,
    DocumentType, DocumentView, Droplet, UpdateDocumentRequest, VersionToken, VersionedEntity,
};

use crate::common::*;

struct Fixture {
    t: TestWiki,
    doc: Droplet,
    v1: Droplet,
    first: Droplet,
    second: Droplet,
}

async fn two_paragraphs() -> Fixture {
    let t = TestWiki::new();
    let mut request = CreateDocumentRequest::new(DocumentType::Article, "Two blocks", AUTHOR);
    request.content = vec![paragraph("first"), paragraph("second")];
    let doc = t.wiki.create_document(request).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    t.table.reset_stats();
    Fixture {
        doc: doc.id().clone(),
        v1: view.version.clone(),
        first: view.content[0].id.clone(),
        second: view.content[1].id.clone(),
        t,
    }
}

async fn update(f: &Fixture, request: UpdateDocumentRequest) -> (bool, DocumentView) {
    let (changed, mut document): (bool, Document) =
        f.t.wiki.update_document(&f.doc, request).await.unwrap();
    (changed, document.build(&VersionToken::Latest).unwrap())
}

fn content(requests: Vec<BlockRequest>) -> UpdateDocumentRequest {
    UpdateDocumentRequest {
        content: Some(requests),
        ..UpdateDocumentRequest::new(AUTHOR)
    }
}

#[tokio::test]
async fn reordering_blocks_is_a_move() {
    let f = two_paragraphs().await;
    let (changed, view) = update(
        &f,
        content(vec![
            BlockRequest::existing(f.second.clone()),
            BlockRequest::existing(f.first.clone()),
        ]),
    )
    .await;

    assert!(changed);
    // no block content changed, so only the version and the pointer
    assert_eq!(f.t.table.stats().items_written, 2);
    assert!(view.diff.content.transposed);
    assert_eq!(view.diff.content.blocks[&f.first], AuditAction::Move);
    assert_eq!(view.diff.content.blocks[&f.second], AuditAction::Move);
    assert_eq!(view.content[0].id, f.second);
    assert_eq!(view.content[0].action, AuditAction::Move);
    assert_eq!(view.build_version_range, BuildVersionRange(f.v1.clone(), f.v1.clone()));
}

#[tokio::test]
async fn changed_block_widens_build_range() {
    let f = two_paragraphs().await;
    let (changed, view) = update(
        &f,
        content(vec![
            BlockRequest::existing(f.first.clone()),
            BlockRequest::existing(f.second.clone()).with_data(BlockData::paragraph("second, edited")),
        ]),
    )
    .await;

    assert!(changed);
    assert_eq!(f.t.table.stats().items_written, 3);
    assert!(!view.diff.content.transposed);
    assert_eq!(view.diff.content.blocks[&f.first], AuditAction::NoChange);
    assert_eq!(view.diff.content.blocks[&f.second], AuditAction::Update);
    assert_eq!(view.build_version_range, BuildVersionRange(f.v1.clone(), view.version.clone()));

    // a fresh load fetches both generations with one range query
    let reloaded = f.t.wiki.get_document(&f.doc, VersionToken::Latest).await.unwrap();
    assert_eq!(reloaded.content[0].data, BlockData::paragraph("first"));
    assert_eq!(reloaded.content[1].data, BlockData::paragraph("second, edited"));
    assert_eq!(reloaded.content[1].document_version, reloaded.version);
}

#[tokio::test]
async fn omitted_block_is_tombstoned() {
    let f = two_paragraphs().await;
    let (changed, view) = update(&f, content(vec![BlockRequest::existing(f.first.clone())])).await;

    assert!(changed);
    // version + tombstone + pointer
    assert_eq!(f.t.table.stats().items_written, 3);
    assert_eq!(view.content.len(), 1);
    assert_eq!(view.diff.content.blocks[&f.second], AuditAction::Delete);
    assert!(!view.diff.content.transposed);

    let history = f.t.wiki.block_history(&f.doc, &f.second).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[1].is_deleted());
    assert_eq!(history[1].attrib_actions.data, AuditAction::Delete);
    assert_eq!(history[1].data, BlockData::paragraph("second"));
}

#[tokio::test]
async fn emptying_every_list_collapses_the_range() {
    let f = two_paragraphs().await;
    let request = UpdateDocumentRequest {
        key_info: Some(Vec::new()),
        content: Some(Vec::new()),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, view) = update(&f, request).await;

    assert!(changed);
    assert!(view.content.is_empty());
    assert_eq!(view.build_version_range, BuildVersionRange::single(view.version.clone()));

    let reloaded = f.t.wiki.get_document(&f.doc, VersionToken::Latest).await.unwrap();
    assert!(reloaded.content.is_empty());
}

#[tokio::test]
async fn new_block_is_inserted_between_existing_ones() {
    let f = two_paragraphs().await;
    let (changed, view) = update(
        &f,
        content(vec![
            BlockRequest::existing(f.first.clone()),
            paragraph("middle"),
            BlockRequest::existing(f.second.clone()),
        ]),
    )
    .await;

    assert!(changed);
    assert_eq!(view.content.len(), 3);
    assert_eq!(view.content[1].action, AuditAction::Create);
    assert_eq!(view.content[1].data, BlockData::paragraph("middle"));
    // survivors keep their relative order
    assert!(!view.diff.content.transposed);
    assert_eq!(view.content[2].action, AuditAction::NoChange);
}

#[tokio::test]
async fn nested_blocks_round_trip() {
    let t = TestWiki::new();
    let mut request = CreateDocumentRequest::new(DocumentType::Project, "Nested", AUTHOR);
    request.content = vec![BlockRequest::new(BlockData::Heading {
        level: 2,
        text: "Roadmap".into(),
    })
    .with_children(vec![paragraph("phase one"), paragraph("phase two")])];
    let doc = t.wiki.create_document(request).await.unwrap();

    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(view.content.len(), 1);
    let children = &view.content[0].children;
    assert_eq!(children.len(), 2);
    assert_eq!(children[1].data, BlockData::paragraph("phase two"));
    assert_eq!(view.diff.content.blocks.len(), 3);

    // moving a child out of its parent is a transposition
    let heading = view.content[0].id.clone();
    let first_child = children[0].id.clone();
    let second_child = children[1].id.clone();
    let request = UpdateDocumentRequest {
        content: Some(vec![
            BlockRequest::existing(heading).with_children(vec![BlockRequest::existing(second_child)]),
            BlockRequest::existing(first_child.clone()),
        ]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, mut updated) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(changed);
    let view = updated.build(&VersionToken::Latest).unwrap();
    assert!(view.diff.content.transposed);
    assert_eq!(view.diff.content.blocks[&first_child], AuditAction::Move);
    assert_eq!(view.content[0].children.len(), 1);
    assert_eq!(view.content[1].id, first_child);
}

#[tokio::test]
async fn children_are_kept_when_not_addressed() {
    let t = TestWiki::new();
    let mut request = CreateDocumentRequest::new(DocumentType::Project, "Kept", AUTHOR);
    request.content = vec![paragraph("parent").with_children(vec![paragraph("child")])];
    let doc = t.wiki.create_document(request).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();

    let request = UpdateDocumentRequest {
        content: Some(vec![BlockRequest::existing(view.content[0].id.clone())
            .with_data(BlockData::paragraph("parent, edited"))]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, mut updated) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(changed);
    let view = updated.build(&VersionToken::Latest).unwrap();
    assert_eq!(view.content[0].children.len(), 1);
    assert_eq!(view.content[0].children[0].action, AuditAction::NoChange);
    assert_eq!(view.content[0].action, AuditAction::Update);
}
