//! Flattening of nested road-object JSON into flat attribute maps.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::config::Config;

/// One road object as `{field name -> value}`.
pub type Record = BTreeMap<String, Value>;

/// Prefix given to generic attributes of a road object.
pub const RECORD_PREFIX: &str = "nvdb";

static INVALID_FIELD_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9a-zA-Z_æøåÆØÅ]").unwrap());

/// Make a remote attribute name usable as a column name.
pub fn sanitize_field_name(name: &str) -> String {
    let replaced = INVALID_FIELD_CHARS.replace_all(name, "_");
    if replaced.starts_with(|ch: char| ch.is_ascii_digit()) {
        format!("F{replaced}")
    } else {
        replaced.into_owned()
    }
}

pub struct Flattener<'a> {
    config: &'a Config,
    exclude: Vec<String>,
}

impl<'a> Flattener<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            exclude: config.object_exclude.clone(),
        }
    }

    /// Skip an additional top-level response key.
    pub fn excluding(mut self, key: &str) -> Self {
        self.exclude.push(key.to_string());
        self
    }

    pub fn flatten(&self, object: &Value) -> Record {
        let mut out = Record::new();
        self.descend(object, RECORD_PREFIX, &mut out);
        self.normalize_names(out)
    }

    fn descend(&self, value: &Value, prefix: &str, out: &mut Record) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    self.visit(key, child, prefix, out);
                }
            }
            // List lengths are unknown up front, so they cannot map to fixed columns.
            Value::Array(_) => {
                out.insert(prefix.to_string(), Value::String(compact_json(value)));
            }
            scalar => {
                out.insert(prefix.to_string(), scalar.clone());
            }
        }
    }

    fn visit(&self, key: &str, value: &Value, prefix: &str, out: &mut Record) {
        let keys = &self.config.response_keys;
        if self.exclude.iter().any(|excluded| excluded == key) {
            return;
        }
        if key == keys.properties {
            self.visit_properties(value, out);
        } else if key == keys.geometry {
            out.insert(
                self.config.default_extras.geometry.clone(),
                Value::String(self.geometry_text(value)),
            );
        } else if let Some(number) = self.area_number(value) {
            out.insert(join_prefix(prefix, key), number.clone());
        } else {
            self.descend(value, &join_prefix(prefix, key), out);
        }
    }

    fn visit_properties(&self, value: &Value, out: &mut Record) {
        let keys = &self.config.response_keys;
        let Some(properties) = value.as_array() else {
            return;
        };
        for property in properties {
            let Some(name) = property.get(&keys.property_name).and_then(Value::as_str) else {
                continue;
            };
            let is_enum = property
                .get(&keys.property_type)
                .and_then(Value::as_str)
                .map(|remote_type| self.config.is_enum_type(remote_type))
                .unwrap_or(false);
            let value_key = if is_enum {
                &keys.property_enum_value
            } else {
                &keys.property_value
            };
            let value = property.get(value_key).cloned().unwrap_or(Value::Null);
            out.insert(sanitize_field_name(name), value);
        }
    }

    fn geometry_text(&self, value: &Value) -> String {
        match value {
            Value::String(text) => text.clone(),
            Value::Object(map) => map
                .get(&self.config.response_keys.geometry_wkt)
                .and_then(Value::as_str)
                .map(|wkt| wkt.to_string())
                .unwrap_or_else(|| compact_json(value)),
            other => compact_json(other),
        }
    }

    /// `{name, number}` objects are area references; only the number is kept.
    fn area_number<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        let keys = &self.config.response_keys;
        let map = value.as_object().filter(|map| map.len() == 2)?;
        map.contains_key(&keys.area_name)
            .then(|| map.get(&keys.area_number))
            .flatten()
    }

    fn normalize_names(&self, record: Record) -> Record {
        if self.config.name_lut.is_empty() {
            return record;
        }
        record
            .into_iter()
            .map(|(key, value)| match self.config.name_lut.get(&key) {
                Some(target) => (target.clone(), value),
                None => (key, value),
            })
            .collect()
    }
}


fn join_prefix(prefix: &str, key: &str) -> String {
    [prefix, key]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sanitize_replaces_and_prefixes() {
        assert_eq!(sanitize_field_name("Fartsgrense (km/t)"), "Fartsgrense__km_t_");
        assert_eq!(sanitize_field_name("3D-modell"), "F3D_modell");
        assert_eq!(sanitize_field_name("Høyde"), "Høyde");
    }

    #[test]
    fn nested_objects_join_with_underscore() {
        let config = Config::default();
        let record = Flattener::new(&config).flatten(&json!({
            "id": 1,
            "metadata": {"versjon": 3, "type": {"id": 105, "navn": "Fartsgrense"}},
            "lokasjon": {"kommuner": [1201, 1202], "fylker": [12]}
        }));
        assert_eq!(record["nvdb_id"], json!(1));
        assert_eq!(record["nvdb_metadata_versjon"], json!(3));
        assert_eq!(record["nvdb_metadata_type_id"], json!(105));
        assert_eq!(record["nvdb_lokasjon_kommuner"], json!("[1201,1202]"));
    }

    #[test]
    fn area_reference_keeps_number() {
        let config = Config::default();
        let record = Flattener::new(&config).flatten(&json!({
            "lokasjon": {"vegavdeling": {"navn": "Bergen", "nummer": 14}}
        }));
        assert_eq!(record["nvdb_lokasjon_vegavdeling"], json!(14));
        assert!(!record.contains_key("nvdb_lokasjon_vegavdeling_navn"));
    }

    #[test]
    fn area_reference_keys_follow_config() {
        let mut config = Config::default();
        config.response_keys.area_name = "name".to_string();
        config.response_keys.area_number = "number".to_string();
        let record = Flattener::new(&config).flatten(&json!({
            "lokasjon": {
                "vegavdeling": {"name": "Bergen", "number": 14},
                "kontrakt": {"navn": "Voss", "nummer": 9}
            }
        }));
        assert_eq!(record["nvdb_lokasjon_vegavdeling"], json!(14));
        assert_eq!(record["nvdb_lokasjon_kontrakt_nummer"], json!(9));
        assert_eq!(record["nvdb_lokasjon_kontrakt_navn"], json!("Voss"));
    }

    #[test]
    fn properties_map_by_name_and_resolve_enums() {
        let config = Config::default();
        let record = Flattener::new(&config).flatten(&json!({
            "egenskaper": [
                {"id": 2021, "navn": "Fartsgrense", "datatype": "Tallenum", "verdi": 80, "enum_id": 2738},
                {"id": 5, "navn": "Merknad (fri)", "datatype": "Tekst", "verdi": "ok"}
            ]
        }));
        assert_eq!(record["Fartsgrense"], json!(2738));
        assert_eq!(record["Merknad__fri_"], json!("ok"));
    }

    #[test]
    fn geometry_is_captured_verbatim() {
        let config = Config::default();
        let record = Flattener::new(&config).flatten(&json!({
            "geometri": {"wkt": "POINT Z (1 2 3)", "srid": 5973}
        }));
        assert_eq!(record["SHAPE@WKT"], json!("POINT Z (1 2 3)"));
        assert!(!record.contains_key("nvdb_geometri_srid"));
    }

    #[test]
    fn excluded_keys_and_name_lut_apply() {
        let mut config = Config::default();
        config
            .name_lut
            .insert("nvdb_metadata_versjon".to_string(), "versjon".to_string());
        let record = Flattener::new(&config).excluding("lokasjon").flatten(&json!({
            "href": "http://x",
            "metadata": {"versjon": 2},
            "lokasjon": {"fylker": [1]}
        }));
        assert_eq!(record.len(), 1);
        assert_eq!(record["versjon"], json!(2));
    }
}
