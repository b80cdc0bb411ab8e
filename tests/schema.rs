mod common;

use assert_matches::assert_matches;
use common::{SEARCH_PATH, ScriptedCatalog, config, empty_page, push_sample};
use nvdb_sync::crawler::CatalogCrawler;
use nvdb_sync::domain::{GeometryKind, StorageType};
use nvdb_sync::error::SyncError;
use nvdb_sync::schema::{INFERRED_FIELD_ID, Schema, SchemaBuilder};
use nvdb_sync::store::MetadataStore;

fn crawled(catalog: &ScriptedCatalog) -> MetadataStore {
    let mut store = MetadataStore::new();
    CatalogCrawler::new(&config(), catalog, &mut store)
        .crawl()
        .unwrap();
    store
}

fn build() -> Schema {
    let config = config();
    let catalog = ScriptedCatalog::with_catalog();
    push_sample(&catalog);
    let mut store = crawled(&catalog);
    SchemaBuilder::new(&config, &catalog)
        .ensure(&mut store, 105)
        .unwrap()
}

#[test]
fn declared_fields_follow_the_catalog() {
    let schema = build();

    assert_eq!(schema.name, "Fartsgrense");
    assert_eq!(schema.geometry, GeometryKind::Line);
    assert_eq!(schema.catalog_version.as_deref(), Some("2.13"));
    let declared: Vec<(&str, StorageType, i64)> = schema
        .declared
        .iter()
        .map(|field| (field.name.as_str(), field.storage, field.remote_id))
        .collect();
    // The binary attribute has no storage mapping and is left out.
    assert_eq!(
        declared,
        vec![
            ("Fartsgrense", StorageType::Enum, 2021),
            ("Gyldig fra", StorageType::Date, 5127),
            ("Merknad", StorageType::Text, 9999),
        ]
    );
    assert_eq!(schema.declared[0].uri, "/vegobjekttyper/105/2021");
}

#[test]
fn sampled_extras_are_split_and_typed() {
    let schema = build();

    let defaults: Vec<(&str, StorageType)> = schema
        .default_extras
        .iter()
        .map(|field| (field.name.as_str(), field.storage))
        .collect();
    assert_eq!(
        defaults,
        vec![
            ("SHAPE@WKT", StorageType::Text),
            ("nvdb_id", StorageType::Long),
            ("nvdb_metadata_startdato", StorageType::Date),
            ("nvdb_metadata_versjon", StorageType::Long),
        ]
    );
    let extended: Vec<&str> = schema
        .extended_extras
        .iter()
        .map(|field| field.name.as_str())
        .collect();
    assert_eq!(extended, vec!["nvdb_lokasjon_kommuner"]);
    assert!(schema.default_extras.iter().all(|field| field.remote_id == INFERRED_FIELD_ID));
}

#[test]
fn field_order_is_stable_across_builds() {
    let first = build().fields(true);
    let second = build().fields(true);

    assert_eq!(first, second);
    let names: Vec<String> = first.iter().map(|field| field.column_name()).collect();
    let mut unique = names.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), names.len());
    assert_eq!(names.first().map(String::as_str), Some("Fartsgrense"));
    assert_eq!(names.last().map(String::as_str), Some("nvdb_metadata_versjon"));
}

#[test]
fn schema_is_built_once_per_session() {
    let config = config();
    let catalog = ScriptedCatalog::with_catalog();
    push_sample(&catalog);
    let mut store = crawled(&catalog);
    let builder = SchemaBuilder::new(&config, &catalog);

    let first = builder.ensure(&mut store, 105).unwrap();
    let requests = catalog.calls().len();
    let second = builder.ensure(&mut store, 105).unwrap();

    assert_eq!(first, second);
    assert_eq!(catalog.calls().len(), requests);
}

#[test]
fn empty_sample_is_retried_on_next_use() {
    let config = config();
    let catalog = ScriptedCatalog::with_catalog();
    catalog.push(SEARCH_PATH, Ok(empty_page()));
    let mut store = crawled(&catalog);
    let builder = SchemaBuilder::new(&config, &catalog);

    let schema = builder.ensure(&mut store, 105).unwrap();
    assert!(schema.default_extras.is_empty());
    assert_eq!(schema.declared.len(), 3);

    push_sample(&catalog);
    let schema = builder.ensure(&mut store, 105).unwrap();
    assert_eq!(schema.default_extras.len(), 4);
}

#[test]
fn unknown_object_type_is_not_found() {
    let config = config();
    let catalog = ScriptedCatalog::with_catalog();
    let mut store = crawled(&catalog);

    let result = SchemaBuilder::new(&config, &catalog).ensure(&mut store, 96);
    assert_matches!(result, Err(SyncError::NotFound(_)));
}
