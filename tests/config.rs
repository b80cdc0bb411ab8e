use std::io::Write;

use assert_matches::assert_matches;
use nvdb_sync::config::{Config, ConfigLoader};
use nvdb_sync::domain::{GeometryKind, StorageType};
use nvdb_sync::error::SyncError;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn config_file_overrides_defaults() {
    let file = write_config(
        r#"{
            "base_url": "http://localhost:9000/les",
            "page_size": 500,
            "include_object_types": ["Fartsgrense"],
            "names": { "search_path": "sok/{id}" },
            "response_keys": { "objects": "resultater" },
            "geometry_types": { "Punkt": "point", "Linje": "line" },
            "search_params": { "inkluder": "alle" }
        }"#,
    );

    let config = ConfigLoader::resolve(file.path().to_str()).unwrap();

    assert_eq!(config.base_url, "http://localhost:9000/les");
    assert_eq!(config.page_size, 500);
    assert_eq!(config.search_path(105), "sok/105");
    assert_eq!(config.names.object_types, "vegobjekttyper");
    assert_eq!(config.response_keys.objects, "resultater");
    assert_eq!(config.response_keys.metadata, "metadata");
    assert_eq!(config.geometry_types.get("Linje"), Some(&GeometryKind::Line));
    assert_eq!(config.type_map.get("Heltall"), Some(&StorageType::Long));
    assert_eq!(config.search_params.get("inkluder").map(String::as_str), Some("alle"));
    assert!(!config.includes_object_type("Skilt", Some(96)));
}

#[test]
fn missing_file_is_a_read_error() {
    let result = ConfigLoader::resolve(Some("/nonexistent/nvdb-sync.json"));
    assert_matches!(result, Err(SyncError::ConfigRead(_)));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let file = write_config(r#"{ "page_size": "mange" }"#);
    let result = ConfigLoader::resolve(file.path().to_str());
    assert_matches!(result, Err(SyncError::ConfigParse(_)));
}

#[test]
fn enum_types_must_map_to_enum_storage() {
    let config = Config {
        enum_types: vec!["Tekst".to_string()],
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(SyncError::Configuration(_))
    );
}

#[test]
fn default_offset_must_be_less_than_a_day() {
    let config = Config {
        default_utc_offset_minutes: 24 * 60,
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(SyncError::Configuration(_))
    );
}

#[test]
fn endpoint_templates_take_the_object_type() {
    let config = Config::default();
    assert_eq!(config.search_path(581), "vegobjekter/581");
    assert_eq!(config.deleted_path(581), "endringer/objekttype/581/slettet");
}
