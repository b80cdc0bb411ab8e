mod common;

use assert_matches::assert_matches;
use common::{ScriptedCatalog, config};
use nvdb_sync::app::{App, SilentProgress};
use nvdb_sync::domain::{GeometryKind, ObjectId, StorageType};
use nvdb_sync::error::SyncError;
use nvdb_sync::road_reference::{
    RoadCategory, RoadReferenceFilter, category_letter, status_letter, write_route_keys,
};
use nvdb_sync::sink::{CellValue, MemorySink, Row, Sink, TableSpec};

const TABLE: &str = "vegreferanse";

fn road_row(id: i64, county: i64, category: i64, status: i64, number: i64, part: i64) -> Row {
    Row::from([
        ("nvdb_id".to_string(), CellValue::Long(id)),
        ("Fylkesnummer".to_string(), CellValue::Long(county)),
        (
            "nvdb_lokasjon_kommuner".to_string(),
            CellValue::Text("[301,3020]".to_string()),
        ),
        ("Vegkategori".to_string(), CellValue::Long(category)),
        ("Vegstatus".to_string(), CellValue::Long(status)),
        ("Vegnummer".to_string(), CellValue::Long(number)),
        ("Hovedparsell".to_string(), CellValue::Long(part)),
    ])
}

/// E6 (existing), a municipal road, a cycle path along Rv4 and a row with an
/// unknown status code.
fn road_network() -> MemorySink {
    let mut sink = MemorySink::new();
    sink.create_table(&TableSpec {
        name: TABLE.to_string(),
        geometry: GeometryKind::Line,
        geometry_column: "SHAPE@WKT".to_string(),
        identity_column: "nvdb_id".to_string(),
    })
    .unwrap();
    for column in [
        "nvdb_id",
        "Fylkesnummer",
        "Vegkategori",
        "Vegstatus",
        "Vegnummer",
        "Hovedparsell",
    ] {
        sink.add_column(TABLE, column, StorageType::Long).unwrap();
    }
    sink.add_column(TABLE, "nvdb_lokasjon_kommuner", StorageType::Text)
        .unwrap();
    for row in [
        road_row(1, 3, 5492, 5499, 6, 1),
        road_row(2, 3, 5495, 5499, 1020, 1),
        road_row(3, 3, 5493, 12159, 4, 2),
        road_row(4, 3, 5492, 4242, 6, 2),
    ] {
        sink.insert_row(TABLE, row).unwrap();
    }
    sink
}

fn text(sink: &MemorySink, id: i64, column: &str) -> Option<String> {
    sink.row(TABLE, ObjectId(id))
        .and_then(|row| row.get(column))
        .and_then(CellValue::as_text)
        .map(str::to_string)
}

#[test]
fn code_tables_translate_catalog_codes() {
    assert_eq!(category_letter(5492), Some('E'));
    assert_eq!(category_letter(5494), Some('F'));
    assert_eq!(category_letter(5497), Some('S'));
    assert_eq!(status_letter(5499), Some('V'));
    assert_eq!(status_letter(12986), Some('Q'));
    assert_eq!(status_letter(7046), Some('E'));
    assert_eq!(status_letter(5492), None);
    assert_eq!(category_letter(5499), None);
}

#[test]
fn motor_road_filter_rejects_other_categories_and_paths() {
    let filter = RoadReferenceFilter::default();

    assert!(filter.allows('E', 'V'));
    assert!(filter.allows('F', 'P'));
    assert!(!filter.allows('K', 'V'));
    assert!(!filter.allows('R', 'G'));
    assert!(RoadReferenceFilter::foot_and_cycle().allows('K', 'G'));
    assert!(!RoadReferenceFilter::foot_and_cycle().allows('E', 'V'));
}

#[test]
fn route_keys_are_written_for_allowed_rows_only() {
    let mut sink = road_network();

    let outcome = write_route_keys(
        &mut sink,
        TABLE,
        &config().road_reference,
        &RoadReferenceFilter::default(),
    )
    .unwrap();

    assert_eq!(outcome.written, 1);
    // The municipal road and the cycle path.
    assert_eq!(outcome.filtered, 2);
    assert_eq!(outcome.invalid, 1);

    assert_eq!(text(&sink, 1, "HPID_A").as_deref(), Some("03 EV 6 1"));
    assert_eq!(text(&sink, 1, "HPID_B").as_deref(), Some("03 00 EV 6 1"));
    assert_eq!(text(&sink, 1, "HPID_C").as_deref(), Some("03 301 EV 6 1"));
    assert_eq!(text(&sink, 2, "HPID_A"), None);
    assert_eq!(text(&sink, 4, "HPID_C"), None);
    assert_eq!(sink.row_count(TABLE).unwrap(), 4);
}

#[test]
fn foot_and_cycle_filter_keys_paths() {
    let mut sink = road_network();

    let outcome = write_route_keys(
        &mut sink,
        TABLE,
        &config().road_reference,
        &RoadReferenceFilter::foot_and_cycle(),
    )
    .unwrap();

    assert_eq!(outcome.written, 1);
    assert_eq!(text(&sink, 3, "HPID_C").as_deref(), Some("03 301 RG 4 2"));
}

#[test]
fn existing_key_columns_are_reused() {
    let mut sink = road_network();
    let filter = RoadReferenceFilter::motor_roads(&[RoadCategory::Europaveg]);
    let columns = config().road_reference;

    write_route_keys(&mut sink, TABLE, &columns, &filter).unwrap();
    let outcome = write_route_keys(&mut sink, TABLE, &columns, &filter).unwrap();

    assert_eq!(outcome.written, 1);
    let key_columns = sink
        .columns(TABLE)
        .unwrap()
        .into_iter()
        .filter(|column| column.name.starts_with("HPID"))
        .count();
    assert_eq!(key_columns, 3);
}

#[test]
fn app_builds_route_keys_without_catalog_requests() {
    let catalog = ScriptedCatalog::new();
    let app = App::new(config(), &catalog);
    let mut sink = road_network();

    let outcome = app
        .build_route_keys(&mut sink, TABLE, &RoadReferenceFilter::default(), &SilentProgress)
        .unwrap();
    assert_eq!(outcome.table, TABLE);
    assert_eq!(outcome.written, 1);
    assert!(catalog.calls().is_empty());

    let missing = app.build_route_keys(
        &mut sink,
        "finnes_ikke",
        &RoadReferenceFilter::default(),
        &SilentProgress,
    );
    assert_matches!(missing, Err(SyncError::NotFound(_)));
}
