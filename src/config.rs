use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{GeometryKind, StorageType};
use crate::error::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "nvdb-sync.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: Option<u32>,
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    pub page_size: u64,
    pub max_response_bytes: u64,
    pub type_map: BTreeMap<String, StorageType>,
    pub enum_types: Vec<String>,
    pub geometry_types: BTreeMap<String, GeometryKind>,
    pub wkt_empty: String,
    pub srid: String,
    pub names: CatalogNames,
    pub include_object_types: Vec<String>,
    pub include_object_type_ids: Vec<i64>,
    pub exclude_by_name: Vec<String>,
    pub response_keys: ResponseKeys,
    pub object_exclude: Vec<String>,
    pub default_extras: DefaultExtras,
    pub name_lut: BTreeMap<String, String>,
    pub date_formats: Vec<String>,
    pub search_params: BTreeMap<String, String>,
    pub default_utc_offset_minutes: i32,
    pub modified_since: Option<String>,
    pub delete_transaction_type: String,
    pub deleted_rows_per_request: u64,
    pub text_max_len: usize,
    pub road_reference: RoadReferenceColumns,
}

/// Well-known catalog resource names and endpoint templates.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogNames {
    pub root: String,
    pub version: String,
    pub object_types: String,
    pub regions: String,
    pub counties: String,
    pub routes: String,
    pub search_path: String,
    pub deleted_path: String,
}

/// Every key name read from catalog responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponseKeys {
    pub resource_id: String,
    pub resource_uri: String,
    pub resource_name: String,
    pub version_catalog: String,
    pub version_number: String,
    pub version_date: String,
    pub object_type_id: String,
    pub object_type_name: String,
    pub attribute_types: String,
    pub attribute_id: String,
    pub attribute_name: String,
    pub attribute_type: String,
    pub geometry_type: String,
    pub area_name: String,
    pub area_number: String,
    pub area_description: String,
    pub route_period: String,
    pub objects: String,
    pub object_id: String,
    pub metadata: String,
    pub returned: String,
    pub next: String,
    pub next_start: String,
    pub properties: String,
    pub property_name: String,
    pub property_type: String,
    pub property_value: String,
    pub property_enum_value: String,
    pub geometry: String,
    pub geometry_wkt: String,
    pub domain_description: String,
    pub domain_id: String,
    pub domain_values: String,
    pub domain_value_id: String,
    pub domain_value_value: String,
    pub transactions: String,
    pub transaction_type: String,
    pub transaction_date: String,
    pub transaction_object: String,
    pub transactions_next: String,
}

/// Field names of the well-known extras inferred by sampling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultExtras {
    pub geometry: String,
    pub identity: String,
    pub version: String,
    pub valid_from: String,
    pub valid_to: String,
}

/// Columns read and written when deriving route keys from road references.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoadReferenceColumns {
    pub county: String,
    pub municipalities: String,
    pub category: String,
    pub status: String,
    pub number: String,
    pub part: String,
    pub route_keys: [String; 3],
}

impl DefaultExtras {
    pub fn names(&self) -> [&str; 5] {
        [
            &self.geometry,
            &self.identity,
            &self.version,
            &self.valid_from,
            &self.valid_to,
        ]
    }
}

impl Default for Config {
    fn default() -> Self {
        let type_map = [
            ("Tekst", StorageType::Text),
            ("Tall", StorageType::Double),
            ("Flyttall", StorageType::Double),
            ("Heltall", StorageType::Long),
            ("Dato", StorageType::Date),
            ("Kortdato", StorageType::Date),
            ("Klokkeslett", StorageType::Text),
            ("Tekstenum", StorageType::Enum),
            ("Tallenum", StorageType::Enum),
            ("Heltallenum", StorageType::Enum),
            ("Flyttallenum", StorageType::Enum),
        ]
        .into_iter()
        .map(|(code, storage)| (code.to_string(), storage))
        .collect();

        let geometry_types = [
            ("Punkt", GeometryKind::Point),
            ("Linje", GeometryKind::Line),
            ("Flate", GeometryKind::Polygon),
            ("Ingen", GeometryKind::None),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();

        Self {
            schema_version: None,
            base_url: "https://nvdbapiles-v3.atlas.vegvesen.no".to_string(),
            headers: [
                ("Accept".to_string(), "application/vnd.vegvesen.nvdb-v3-rev1+json".to_string()),
                ("X-Client".to_string(), "nvdb-sync".to_string()),
            ]
            .into_iter()
            .collect(),
            page_size: 10_000,
            max_response_bytes: 256 * 1024 * 1024,
            type_map,
            enum_types: default_enum_types(),
            geometry_types,
            wkt_empty: "EMPTY".to_string(),
            srid: "UTM33".to_string(),
            names: CatalogNames::default(),
            include_object_types: vec!["All".to_string()],
            include_object_type_ids: Vec::new(),
            exclude_by_name: Vec::new(),
            response_keys: ResponseKeys::default(),
            object_exclude: vec!["href".to_string(), "relasjoner".to_string()],
            default_extras: DefaultExtras::default(),
            name_lut: BTreeMap::new(),
            date_formats: vec![
                "%Y-%m-%dT%H:%M:%S+02:00".to_string(),
                "%Y-%m-%d".to_string(),
            ],
            search_params: BTreeMap::new(),
            default_utc_offset_minutes: 60,
            modified_since: None,
            delete_transaction_type: "Slettet".to_string(),
            deleted_rows_per_request: 10_000,
            text_max_len: 255,
            road_reference: RoadReferenceColumns::default(),
        }
    }
}

impl Default for CatalogNames {
    fn default() -> Self {
        Self {
            root: "root".to_string(),
            version: "versjon".to_string(),
            object_types: "vegobjekttyper".to_string(),
            regions: "regioner".to_string(),
            counties: "fylker".to_string(),
            routes: "riksvegruter".to_string(),
            search_path: "vegobjekter/{id}".to_string(),
            deleted_path: "endringer/objekttype/{id}/slettet".to_string(),
        }
    }
}

impl Default for ResponseKeys {
    fn default() -> Self {
        let key = |value: &str| value.to_string();
        Self {
            resource_id: key("id"),
            resource_uri: key("uri"),
            resource_name: key("name"),
            version_catalog: key("datakatalog"),
            version_number: key("versjon"),
            version_date: key("dato"),
            object_type_id: key("id"),
            object_type_name: key("navn"),
            attribute_types: key("egenskapstyper"),
            attribute_id: key("id"),
            attribute_name: key("navn"),
            attribute_type: key("datatype"),
            geometry_type: key("geometritype"),
            area_name: key("navn"),
            area_number: key("nummer"),
            area_description: key("beskrivelse"),
            route_period: key("periode"),
            objects: key("objekter"),
            object_id: key("id"),
            metadata: key("metadata"),
            returned: key("returnert"),
            next: key("neste"),
            next_start: key("start"),
            properties: key("egenskaper"),
            property_name: key("navn"),
            property_type: key("datatype"),
            property_value: key("verdi"),
            property_enum_value: key("enum_id"),
            geometry: key("geometri"),
            geometry_wkt: key("wkt"),
            domain_description: key("beskrivelse"),
            domain_id: key("id"),
            domain_values: key("tillatte_verdier"),
            domain_value_id: key("id"),
            domain_value_value: key("verdi"),
            transactions: key("transaksjoner"),
            transaction_type: key("type"),
            transaction_date: key("dato"),
            transaction_object: key("id"),
            transactions_next: key("next"),
        }
    }
}

impl Default for DefaultExtras {
    fn default() -> Self {
        Self {
            geometry: "SHAPE@WKT".to_string(),
            identity: "nvdb_id".to_string(),
            version: "nvdb_metadata_versjon".to_string(),
            valid_from: "nvdb_metadata_startdato".to_string(),
            valid_to: "nvdb_metadata_sluttdato".to_string(),
        }
    }
}

impl Default for RoadReferenceColumns {
    fn default() -> Self {
        Self {
            county: "Fylkesnummer".to_string(),
            municipalities: "nvdb_lokasjon_kommuner".to_string(),
            category: "Vegkategori".to_string(),
            status: "Vegstatus".to_string(),
            number: "Vegnummer".to_string(),
            part: "Hovedparsell".to_string(),
            route_keys: ["HPID_A".to_string(), "HPID_B".to_string(), "HPID_C".to_string()],
        }
    }
}

pub fn default_enum_types() -> Vec<String> {
    vec![
        "Tekstenum".to_string(),
        "Tallenum".to_string(),
        "Heltallenum".to_string(),
        "Flyttallenum".to_string(),
    ]
}

impl Config {
    pub fn is_enum_type(&self, remote_type: &str) -> bool {
        self.enum_types.iter().any(|value| value == remote_type)
    }

    pub fn search_path(&self, object_type: i64) -> String {
        self.names
            .search_path
            .replace("{id}", &object_type.to_string())
    }

    pub fn deleted_path(&self, object_type: i64) -> String {
        self.names
            .deleted_path
            .replace("{id}", &object_type.to_string())
    }

    /// True when the object type should be crawled for schema.
    pub fn includes_object_type(&self, name: &str, id: Option<i64>) -> bool {
        let by_name = self
            .include_object_types
            .iter()
            .any(|value| value == name || value == "All");
        let by_id = id
            .map(|id| self.include_object_type_ids.contains(&id))
            .unwrap_or(false);
        by_name || by_id
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<Config, SyncError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            return Self::resolve_config(Config::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("no", "nvdb", "nvdb-sync")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<Config, SyncError> {
        if config.base_url.trim().is_empty() {
            return Err(SyncError::Configuration("base_url is empty".to_string()));
        }
        if config.page_size == 0 {
            return Err(SyncError::Configuration(
                "page_size must be positive".to_string(),
            ));
        }
        if config.date_formats.iter().any(|fmt| fmt.trim().is_empty()) {
            return Err(SyncError::Configuration(
                "date_formats contains an empty format".to_string(),
            ));
        }
        if config.default_utc_offset_minutes.abs() >= 24 * 60 {
            return Err(SyncError::Configuration(format!(
                "default_utc_offset_minutes out of range: {}",
                config.default_utc_offset_minutes
            )));
        }
        for remote_type in &config.enum_types {
            if config.type_map.get(remote_type) != Some(&StorageType::Enum) {
                return Err(SyncError::Configuration(format!(
                    "enum type {remote_type} is not mapped to ENUM in type_map"
                )));
            }
        }
        Ok(config)
    }
}

/// Parallel lists (object types vs table names) must line up.
pub fn check_parallel_lists<A, B>(left: &[A], right: &[B], what: &str) -> Result<(), SyncError> {
    if left.len() != right.len() {
        return Err(SyncError::Configuration(format!(
            "length of {what} differs: {} vs {}",
            left.len(),
            right.len()
        )));
    }
    Ok(())
}
