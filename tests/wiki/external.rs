//! Collection-sourced external fields

use chrono::Duration;
use serde_json::json;
use wikivc::{
    Aggregate, AggregateValue, AuditAction, BlockData, BlockRequest, CacheEntry,
    CreateDocumentRequest, DocumentRecord, DocumentType, ExternalField, ExternalMap,
    ExternalRequest, UpdateDocumentRequest, VersionToken, VersionedEntity,
};

use crate::common::*;

const COLLECTION: &str = "chromie-squiggle";

fn aggregate(floor: f64) -> Aggregate {
    Aggregate::default()
        .with("floor_price", AggregateValue::new(json!(floor), t0()))
        .with(
            "links",
            AggregateValue::new(json!({ "website": "https://artblocks.io", "twitter": null }), t0()),
        )
}

fn tracked(fields: &[ExternalField]) -> ExternalMap {
    fields
        .iter()
        .map(|f| (*f, CacheEntry::unfetched()))
        .collect()
}

fn linked_page() -> CreateDocumentRequest {
    let mut request = CreateDocumentRequest::new(DocumentType::Collection, "Chromie Squiggle", AUTHOR);
    request.collection_id = Some(COLLECTION.to_string());
    request.external = tracked(&[
        ExternalField::FloorPrice,
        ExternalField::Website,
        ExternalField::Twitter,
    ]);
    request
}

#[tokio::test]
async fn create_fetches_tracked_fields_once() {
    let t = TestWiki::new();
    t.relational.set_aggregate(COLLECTION, aggregate(1.5));

    let doc = t.wiki.create_document(linked_page()).await.unwrap();
    assert_eq!(t.relational.aggregate_loads(), 1);

    let record = doc.record(&VersionToken::Latest).unwrap();
    let floor = &record.external[&ExternalField::FloorPrice];
    assert_eq!(floor.cache, Some(json!(1.5)));
    assert_eq!(floor.cached_at, Some(t0()));
    assert_eq!(floor.updated_at, Some(t0()));
    // null upstream is fetched and absent
    let twitter = &record.external[&ExternalField::Twitter];
    assert!(twitter.is_fetched());
    assert_eq!(twitter.cache, None);
    assert_eq!(record.diff.external[&ExternalField::Website], AuditAction::Create);

    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(view.external[&ExternalField::Website], Some(json!("https://artblocks.io")));
    // still fresh, so no further upstream call
    assert_eq!(t.relational.aggregate_loads(), 1);
}

#[tokio::test]
async fn expired_field_is_refreshed_and_written_back() {
    let t = TestWiki::new();
    t.relational.set_aggregate(COLLECTION, aggregate(1.5));
    let doc = t.wiki.create_document(linked_page()).await.unwrap();

    // exactly at the TTL boundary the value is still fresh
    t.clock.advance(Duration::minutes(15));
    t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(t.relational.aggregate_loads(), 1);

    t.clock.advance(Duration::minutes(1));
    t.relational.set_aggregate(COLLECTION, aggregate(2.25));
    let mut loaded = t
        .wiki
        .load_document(doc.id(), VersionToken::Latest, false)
        .await
        .unwrap();
    assert_eq!(t.relational.aggregate_loads(), 2);
    loaded.wait_for_write_back().await.unwrap();

    let view = loaded.build(&VersionToken::Latest).unwrap();
    assert_eq!(view.external[&ExternalField::FloorPrice], Some(json!(2.25)));

    let pointer: DocumentRecord = t.latest_item(doc.id()).await.unwrap().decode().unwrap();
    let floor = &pointer.external[&ExternalField::FloorPrice];
    assert_eq!(floor.cache, Some(json!(2.25)));
    assert_eq!(floor.cached_at, Some(t0() + Duration::minutes(16)));
    // links have a day of TTL and were not refetched
    assert_eq!(pointer.external[&ExternalField::Website].cached_at, Some(t0()));

    // the version item keeps what was true when it was written
    let history = t.wiki.document_history(doc.id()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].external[&ExternalField::FloorPrice].cache, Some(json!(1.5)));
}

#[tokio::test]
async fn historical_load_refreshes_in_memory_only() {
    let t = TestWiki::new();
    t.relational.set_aggregate(COLLECTION, aggregate(1.5));
    let doc = t.wiki.create_document(linked_page()).await.unwrap();
    let v1 = doc.record(&VersionToken::Latest).unwrap().version.clone();
    t.table.reset_stats();

    t.clock.advance(Duration::hours(2));
    t.relational.set_aggregate(COLLECTION, aggregate(3.0));
    let mut loaded = t
        .wiki
        .load_document(doc.id(), VersionToken::Version(v1), false)
        .await
        .unwrap();
    loaded.wait_for_write_back().await.unwrap();

    let view = loaded.build(&VersionToken::Selected).unwrap();
    assert_eq!(view.external[&ExternalField::FloorPrice], Some(json!(3.0)));
    assert_eq!(t.table.stats().items_written, 0);
}

#[tokio::test]
async fn unknown_collection_records_fields_as_absent() {
    let t = TestWiki::new();
    let doc = t.wiki.create_document(linked_page()).await.unwrap();

    let record = doc.record(&VersionToken::Latest).unwrap();
    for field in [ExternalField::FloorPrice, ExternalField::Website] {
        assert!(record.external[&field].is_fetched());
        assert_eq!(record.external[&field].cache, None);
    }
}

#[tokio::test]
async fn document_without_collection_never_calls_upstream() {
    let t = TestWiki::new();
    let mut request = linked_page();
    request.collection_id = None;
    let doc = t.wiki.create_document(request).await.unwrap();
    t.clock.advance(Duration::days(2));
    t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(t.relational.aggregate_loads(), 0);
}

#[tokio::test]
async fn block_external_fields_follow_the_document_collection() {
    let t = TestWiki::new();
    t.relational.set_aggregate(
        COLLECTION,
        Aggregate::default().with("owner_count", AggregateValue::new(json!(3400), t0())),
    );
    let mut request = CreateDocumentRequest::new(DocumentType::Collection, "Owners", AUTHOR);
    request.collection_id = Some(COLLECTION.to_string());
    request.key_info.push(
        key_info("owners", "-").with_external(ExternalRequest::Set(tracked(&[ExternalField::OwnerCount]))),
    );
    let doc = t.wiki.create_document(request).await.unwrap();

    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(view.key_info[0].external[&ExternalField::OwnerCount], Some(json!(3400)));

    t.clock.advance(Duration::hours(2));
    t.relational.set_aggregate(
        COLLECTION,
        Aggregate::default().with("owner_count", AggregateValue::new(json!(3500), t0())),
    );
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    assert_eq!(view.key_info[0].external[&ExternalField::OwnerCount], Some(json!(3500)));

    // block refreshes are not persisted
    let history = t
        .wiki
        .block_history(doc.id(), &view.key_info[0].id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    let stored = history[0].external.as_ref().unwrap();
    assert_eq!(stored[&ExternalField::OwnerCount].cache, Some(json!(3400)));
}

#[tokio::test]
async fn clearing_external_fields_is_an_update() {
    let t = TestWiki::new();
    t.relational.set_aggregate(COLLECTION, aggregate(1.5));
    let doc = t.wiki.create_document(linked_page()).await.unwrap();

    let request = UpdateDocumentRequest {
        external: ExternalRequest::Clear,
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, mut updated) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(changed);
    let view = updated.build(&VersionToken::Latest).unwrap();
    assert!(view.external.is_empty());
    assert_eq!(view.diff.external[&ExternalField::FloorPrice], AuditAction::Delete);
}

#[tokio::test]
async fn block_data_change_keeps_external_cache() {
    let t = TestWiki::new();
    t.relational.set_aggregate(COLLECTION, aggregate(1.5));
    let mut request = linked_page();
    request.content.push(
        BlockRequest::new(BlockData::paragraph("floor"))
            .with_external(ExternalRequest::Set(tracked(&[ExternalField::FloorPrice]))),
    );
    let doc = t.wiki.create_document(request).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    let block_id = view.content[0].id.clone();

    let request = UpdateDocumentRequest {
        content: Some(vec![
            BlockRequest::existing(block_id.clone()).with_data(BlockData::paragraph("floor price"))
        ]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    t.wiki.update_document(doc.id(), request).await.unwrap();

    let history = t.wiki.block_history(doc.id(), &block_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].attrib_actions.data, AuditAction::Update);
    assert!(history[1].external.as_ref().unwrap()[&ExternalField::FloorPrice].is_fetched());
}

#[tokio::test]
async fn changing_collection_refetches_every_cached_field() {
    let t = TestWiki::new();
    t.relational.set_aggregate(COLLECTION, aggregate(1.5));
    t.relational.set_aggregate(
        "fidenza",
        Aggregate::default()
            .with("floor_price", AggregateValue::new(json!(99.0), t0()))
            .with(
                "links",
                AggregateValue::new(json!({ "website": "https://fidenza.art", "twitter": "@fidenza" }), t0()),
            ),
    );
    let mut request = linked_page();
    request.content.push(
        BlockRequest::new(BlockData::paragraph("floor"))
            .with_external(ExternalRequest::Set(tracked(&[ExternalField::FloorPrice]))),
    );
    let doc = t.wiki.create_document(request).await.unwrap();
    let view = t.wiki.get_document(doc.id(), VersionToken::Latest).await.unwrap();
    let block_id = view.content[0].id.clone();
    let loads = t.relational.aggregate_loads();

    // every cached value is still fresh when the collection changes
    let request = UpdateDocumentRequest {
        collection_id: Some("fidenza".into()),
        content: Some(vec![
            BlockRequest::existing(block_id.clone()).with_data(BlockData::paragraph("floor price"))
        ]),
        ..UpdateDocumentRequest::new(AUTHOR)
    };
    let (changed, mut updated) = t.wiki.update_document(doc.id(), request).await.unwrap();
    assert!(changed);
    assert!(t.relational.aggregate_loads() > loads);

    let view = updated.build(&VersionToken::Latest).unwrap();
    assert_eq!(view.collection_id.as_deref(), Some("fidenza"));
    assert_eq!(view.external[&ExternalField::FloorPrice], Some(json!(99.0)));
    assert_eq!(view.external[&ExternalField::Website], Some(json!("https://fidenza.art")));
    assert_eq!(view.external[&ExternalField::Twitter], Some(json!("@fidenza")));
    assert_eq!(view.content[0].external[&ExternalField::FloorPrice], Some(json!(99.0)));

    let pointer: DocumentRecord = t.latest_item(doc.id()).await.unwrap().decode().unwrap();
    assert_eq!(pointer.external[&ExternalField::FloorPrice].cache, Some(json!(99.0)));

    let history = t.wiki.block_history(doc.id(), &block_id).await.unwrap();
    let stored = history[1].external.as_ref().unwrap();
    assert_eq!(stored[&ExternalField::FloorPrice].cache, Some(json!(99.0)));
}
