//! Rejected requests leave the table untouched

use wikivc::{
    BlockData, BlockRequest, CreateDocumentRequest, DeleteDocumentRequest, DocumentType, Droplet,
    Error, KeyInfo, UpdateDocumentRequest, VersionToken,
};

use crate::common::*;

fn is_validation(err: Error) -> bool {
    matches!(err, Error::Validation(_))
}

#[tokio::test]
async fn blank_title_or_author_is_rejected() {
    let t = TestWiki::new();
    let err = t
        .wiki
        .create_document(CreateDocumentRequest::new(DocumentType::Article, "  ", AUTHOR))
        .await
        .unwrap_err();
    assert!(is_validation(err));

    let err = t
        .wiki
        .create_document(CreateDocumentRequest::new(DocumentType::Article, "Title", ""))
        .await
        .unwrap_err();
    assert!(is_validation(err));
    assert!(t.table.is_empty());
}

#[tokio::test]
async fn key_info_needs_unique_names() {
    let t = TestWiki::new();
    let mut request = CreateDocumentRequest::new(DocumentType::Collection, "Keys", AUTHOR);
    request.key_info = vec![BlockRequest::new(BlockData::key_value("x"))];
    assert!(is_validation(t.wiki.create_document(request).await.unwrap_err()));

    let mut request = CreateDocumentRequest::new(DocumentType::Collection, "Keys", AUTHOR);
    request.key_info = vec![key_info("supply", "1"), key_info("supply", "2")];
    assert!(is_validation(t.wiki.create_document(request).await.unwrap_err()));
    assert!(t.table.is_empty());
}

#[tokio::test]
async fn new_block_needs_data() {
    let t = TestWiki::new();
    let mut request = CreateDocumentRequest::new(DocumentType::Article, "Empty block", AUTHOR);
    request.tags = ["art".to_string()].into_iter().collect();
    request.content = vec![paragraph("fine"), BlockRequest::default()];
    assert!(is_validation(t.wiki.create_document(request).await.unwrap_err()));

    // nothing reached either store
    assert!(t.table.is_empty());
    assert_eq!(t.relational.document_count(), 0);
    assert_eq!(t.relational.tag_link_count(), 0);
}

#[tokio::test]
async fn new_document_cannot_name_existing_blocks() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Source")).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();

    let mut request = CreateDocumentRequest::new(DocumentType::Article, "Copy", AUTHOR);
    request.content = vec![BlockRequest::existing(view.content[0].id.clone())
        .with_data(BlockData::paragraph("borrowed"))];
    assert!(is_validation(t.wiki.create_document(request).await.unwrap_err()));

    // nested requests are checked too
    let mut request = CreateDocumentRequest::new(DocumentType::Article, "Copy", AUTHOR);
    request.content = vec![paragraph("parent").with_children(vec![BlockRequest::existing(
        Droplet::compose(5, 5, 5),
    )
    .with_data(BlockData::paragraph("child"))])];
    assert!(is_validation(t.wiki.create_document(request).await.unwrap_err()));
    assert_eq!(t.relational.document_count(), 1);
}

#[tokio::test]
async fn key_info_name_cannot_change() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Rename")).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    t.table.reset_stats();

    let request = UpdateDocumentRequest {
        key_info: Some(vec![BlockRequest::existing(view.key_info[0].id.clone())
            .with_key_info(KeyInfo::new("max_supply"))]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let err = t.wiki.update_document(doc.id(), request).await.unwrap_err();
    assert!(is_validation(err));
    assert_eq!(t.table.stats().items_written, 0);

    // relabelling keeps the name and is allowed
    let request = UpdateDocumentRequest {
        key_info: Some(vec![BlockRequest::existing(view.key_info[0].id.clone())
            .with_key_info(KeyInfo::new("supply").with_label("Total supply"))]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, _) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(changed);
}

#[tokio::test]
async fn block_ids_are_scoped_to_their_list() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Scoped")).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();

    // a key-info block cannot be moved into content
    let request = UpdateDocumentRequest {
        content: Some(vec![BlockRequest::existing(view.key_info[0].id.clone())]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    assert!(is_validation(
        t.wiki.update_document(doc.id(), request).await.unwrap_err()
    ));

    let request = UpdateDocumentRequest {
        content: Some(vec![
            BlockRequest::existing(view.content[0].id.clone()),
            BlockRequest::existing(view.content[0].id.clone()),
        ]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    assert!(is_validation(
        t.wiki.update_document(doc.id(), request).await.unwrap_err()
    ));
    assert_eq!(t.wiki.document_history(doc.id()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_documents_and_versions_are_not_found() {
    let t = TestWiki::new();
    let missing = Droplet::compose(1_000, 7, 1);

    let err = t
        .wiki
        .get_document(&missing, VersionToken::Latest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = t
        .wiki
        .update_document(&missing, UpdateDocumentRequest::new(AUTHOR))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let doc = t.wiki.create_document(collection_page("Known")).await.unwrap();
    let err = t
        .wiki
        .get_document(doc.id(), VersionToken::Version(missing))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn delete_requires_an_author() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(collection_page("Kept")).await.unwrap();
    let request = DeleteDocumentRequest {
        audited_by: " ".into(),
        audit_comment: None,
    };
    assert!(is_validation(
        t.wiki.delete_document(doc.id(), request).await.unwrap_err()
    ));
    assert!(t.wiki.get_document(doc.id(), VersionToken::Latest).await.is_ok());
}
