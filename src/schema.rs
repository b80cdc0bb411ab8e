//! Object-type schema: declared attributes from the catalog plus extras
//! inferred from a one-object sample.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{GeometryKind, RemoteId, StorageType};
use crate::error::SyncError;
use crate::flatten::{Flattener, Record, sanitize_field_name};
use crate::geometry::ensure_geometry;
use crate::http::CatalogClient;
use crate::store::{AttrValue, DatasetValues, MetadataStore, join_path};

pub const DECLARED_GROUP: &str = "egenskaper";
pub const DEFAULT_EXTRAS_GROUP: &str = "default_extras";
pub const EXTENDED_EXTRAS_GROUP: &str = "extended_extras";

/// Remote id given to fields that were inferred rather than declared.
pub const INFERRED_FIELD_ID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub storage: StorageType,
    pub remote_type: String,
    pub remote_id: i64,
    pub uri: String,
}

impl Field {
    pub fn column_name(&self) -> String {
        sanitize_field_name(&self.name)
    }

    pub fn is_inferred(&self) -> bool {
        self.remote_id == INFERRED_FIELD_ID
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    pub object_type: i64,
    pub name: String,
    pub path: String,
    pub geometry: GeometryKind,
    pub catalog_version: Option<String>,
    pub declared: Vec<Field>,
    pub default_extras: Vec<Field>,
    pub extended_extras: Vec<Field>,
}

impl Schema {
    /// Declared fields, then sorted extras; first occurrence of a column name wins.
    pub fn fields(&self, include_extended: bool) -> Vec<Field> {
        let mut extras: Vec<&Field> = self.default_extras.iter().collect();
        if include_extended {
            extras.extend(self.extended_extras.iter());
        }
        extras.sort_by(|a, b| a.name.cmp(&b.name));

        let mut seen = HashSet::new();
        self.declared
            .iter()
            .chain(extras)
            .filter(|field| seen.insert(field.column_name()))
            .cloned()
            .collect()
    }

    /// Read a schema previously persisted under the object type's group.
    pub fn load(store: &MetadataStore, path: &str) -> Result<Self, SyncError> {
        let group = store.group(path)?;
        let object_type = group
            .attrs
            .get("dbid")
            .and_then(AttrValue::as_int)
            .ok_or_else(|| SyncError::NotFound(format!("object type id at {path}")))?;
        let name = group
            .attrs
            .get("name")
            .and_then(AttrValue::as_str)
            .unwrap_or_default()
            .to_string();
        let geometry = group
            .attrs
            .get("geometry_type")
            .and_then(AttrValue::as_str)
            .map(str::parse::<GeometryKind>)
            .transpose()?
            .unwrap_or(GeometryKind::None);

        let load_group = |group: &str| -> Result<Vec<Field>, SyncError> {
            let group_path = join_path(path, group);
            if store.contains(&group_path) {
                load_fields(store, &group_path)
            } else {
                Ok(Vec::new())
            }
        };
        Ok(Self {
            object_type,
            name,
            path: path.to_string(),
            geometry,
            catalog_version: store.catalog_version(),
            declared: load_fields(store, &join_path(path, DECLARED_GROUP))?,
            default_extras: load_group(DEFAULT_EXTRAS_GROUP)?,
            extended_extras: load_group(EXTENDED_EXTRAS_GROUP)?,
        })
    }
}

/// Store path of a crawled object type.
pub fn object_type_path(store: &MetadataStore, object_type: i64) -> Result<String, SyncError> {
    store
        .lookup_by_id(&RemoteId::from(object_type))
        .or_else(|_| store.lookup_by_id(&RemoteId::Text(object_type.to_string())))
        .map(|entry| entry.path.clone())
        .map_err(|_| SyncError::NotFound(format!("object type {object_type}")))
}

pub struct SchemaBuilder<'a, C: CatalogClient> {
    config: &'a Config,
    client: &'a C,
}

impl<'a, C: CatalogClient> SchemaBuilder<'a, C> {
    pub fn new(config: &'a Config, client: &'a C) -> Self {
        Self { config, client }
    }

    /// Build whatever part of the schema is not yet in the store, then load it.
    pub fn ensure(&self, store: &mut MetadataStore, object_type: i64) -> Result<Schema, SyncError> {
        let path = object_type_path(store, object_type)?;
        store.ensure_group(&path)?;
        if !store.contains(&join_path(&path, DECLARED_GROUP)) {
            self.declared_pass(store, &path)?;
        }
        if !store.contains(&join_path(&path, DEFAULT_EXTRAS_GROUP)) {
            self.sampling_pass(store, &path, object_type)?;
        }
        Schema::load(store, &path)
    }

    fn declared_pass(&self, store: &mut MetadataStore, path: &str) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let response = self.client.get(path, &[])?;

        let geometry_name = response.get(&keys.geometry_type).and_then(Value::as_str);
        let geometry = match geometry_name.and_then(|name| self.config.geometry_types.get(name)) {
            Some(kind) => *kind,
            None => {
                warn!(path, geometry = ?geometry_name, "unknown geometry type");
                GeometryKind::None
            }
        };
        store.set_attr(path, "geometry_type", geometry.as_str())?;

        let attributes = response
            .get(&keys.attribute_types)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut fields = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            let Some(remote_type) = attribute.get(&keys.attribute_type).and_then(Value::as_str)
            else {
                continue;
            };
            let name = attribute
                .get(&keys.attribute_name)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(storage) = self.config.type_map.get(remote_type) else {
                debug!(name, remote_type, "unmapped attribute type");
                continue;
            };
            let remote_id = attribute
                .get(&keys.attribute_id)
                .and_then(Value::as_i64)
                .unwrap_or(INFERRED_FIELD_ID);
            fields.push(Field {
                name: name.to_string(),
                storage: *storage,
                remote_type: remote_type.to_string(),
                remote_id,
                uri: join_path(path, &remote_id.to_string()),
            });
        }
        debug!(path, fields = fields.len(), "declared schema");
        write_fields(store, &join_path(path, DECLARED_GROUP), &fields)
    }

    fn sampling_pass(
        &self,
        store: &mut MetadataStore,
        path: &str,
        object_type: i64,
    ) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let mut query = vec![("antall".to_string(), "1".to_string())];
        query.extend(
            self.config
                .search_params
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        let response = self.client.get(&self.config.search_path(object_type), &query)?;
        let Some(sample) = response
            .get(&keys.objects)
            .and_then(Value::as_array)
            .and_then(|objects| objects.first())
        else {
            info!(object_type, "no objects to sample, extended attributes unavailable");
            return Ok(());
        };

        let mut extended = Flattener::new(self.config)
            .excluding(&keys.properties)
            .flatten(sample);
        let mut defaults = Record::new();
        for name in self.config.default_extras.names() {
            if let Some(value) = extended.remove(name) {
                defaults.insert(name.to_string(), value);
            }
        }
        let geometry = store
            .attr(path, "geometry_type")
            .and_then(AttrValue::as_str)
            .map(str::parse::<GeometryKind>)
            .transpose()?
            .unwrap_or(GeometryKind::None);
        ensure_geometry(
            &mut defaults,
            &self.config.default_extras.geometry,
            geometry,
            &self.config.wkt_empty,
        );

        let formats = &self.config.date_formats;
        write_fields(store, &join_path(path, DEFAULT_EXTRAS_GROUP), &inferred_fields(&defaults, formats))?;
        write_fields(store, &join_path(path, EXTENDED_EXTRAS_GROUP), &inferred_fields(&extended, formats))
    }
}

fn inferred_fields(record: &Record, date_formats: &[String]) -> Vec<Field> {
    record
        .iter()
        .map(|(name, value)| {
            let (storage, remote_type) = infer_storage_type(value, date_formats);
            Field {
                name: name.clone(),
                storage,
                remote_type: remote_type.to_string(),
                remote_id: INFERRED_FIELD_ID,
                uri: String::new(),
            }
        })
        .collect()
}

/// Storage type of a sampled value: number, then date, then text.
pub fn infer_storage_type(value: &Value, date_formats: &[String]) -> (StorageType, &'static str) {
    if let Some(number) = parse_number(value) {
        let storage = if number.fract() == 0.0 {
            StorageType::Long
        } else {
            StorageType::Double
        };
        return (storage, "Tall");
    }
    if let Value::String(text) = value
        && parse_date(text, date_formats).is_some()
    {
        return (StorageType::Date, "Dato");
    }
    (StorageType::Text, "Tekst")
}

pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|number| number.is_finite())
}

/// Parse a date or datetime against the candidate formats, in order.
pub fn parse_date(text: &str, formats: &[String]) -> Option<NaiveDateTime> {
    formats.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(text, format).ok().or_else(|| {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
    })
}

fn write_fields(store: &mut MetadataStore, group: &str, fields: &[Field]) -> Result<(), SyncError> {
    store.ensure_group(group)?;
    let column = |f: fn(&Field) -> String| DatasetValues::Text(fields.iter().map(f).collect());
    store.write_dataset(&join_path(group, "navn"), column(|field| field.name.clone()))?;
    store.write_dataset(&join_path(group, "dt"), column(|field| field.storage.to_string()))?;
    store.write_dataset(&join_path(group, "nvdb_dt"), column(|field| field.remote_type.clone()))?;
    store.write_dataset(&join_path(group, "uri"), column(|field| field.uri.clone()))?;
    store.write_dataset(
        &join_path(group, "id"),
        DatasetValues::Int(fields.iter().map(|field| field.remote_id).collect()),
    )
}

fn load_fields(store: &MetadataStore, group: &str) -> Result<Vec<Field>, SyncError> {
    let names = store.text_values(&join_path(group, "navn"))?;
    let storage = store.text_values(&join_path(group, "dt"))?;
    let remote_types = store.text_values(&join_path(group, "nvdb_dt"))?;
    let uris = store.text_values(&join_path(group, "uri"))?;
    let ids = store.int_values(&join_path(group, "id"))?;
    names
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let missing = || SyncError::UnexpectedResponse(format!("ragged schema group {group}"));
            Ok(Field {
                name,
                storage: storage.get(index).ok_or_else(missing)?.parse()?,
                remote_type: remote_types.get(index).cloned().ok_or_else(missing)?,
                remote_id: ids.get(index).copied().ok_or_else(missing)?,
                uri: uris.get(index).cloned().ok_or_else(missing)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn formats() -> Vec<String> {
        Config::default().date_formats
    }

    #[test]
    fn numbers_dates_then_text() {
        let formats = formats();
        assert_eq!(infer_storage_type(&json!(3), &formats).0, StorageType::Long);
        assert_eq!(infer_storage_type(&json!("4.0"), &formats).0, StorageType::Long);
        assert_eq!(infer_storage_type(&json!(2.5), &formats).0, StorageType::Double);
        assert_eq!(infer_storage_type(&json!("2019-03-01"), &formats).0, StorageType::Date);
        assert_eq!(
            infer_storage_type(&json!("2019-03-01T10:00:00+02:00"), &formats).0,
            StorageType::Date
        );
        assert_eq!(infer_storage_type(&json!("Bergen"), &formats).0, StorageType::Text);
        assert_eq!(infer_storage_type(&Value::Null, &formats).0, StorageType::Text);
    }

    fn field(name: &str, remote_id: i64) -> Field {
        Field {
            name: name.to_string(),
            storage: StorageType::Text,
            remote_type: "Tekst".to_string(),
            remote_id,
            uri: String::new(),
        }
    }

    #[test]
    fn concatenation_is_declared_then_sorted_extras_without_duplicates() {
        let schema = Schema {
            object_type: 105,
            name: "Fartsgrense".to_string(),
            path: "/vegobjekttyper/105".to_string(),
            geometry: GeometryKind::Line,
            catalog_version: None,
            declared: vec![field("Fartsgrense", 2021), field("nvdb_id", 1)],
            default_extras: vec![field("SHAPE@WKT", -1), field("nvdb_id", -1)],
            extended_extras: vec![field("nvdb_lokasjon_kommuner", -1)],
        };
        let names: Vec<String> = schema.fields(true).into_iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            ["Fartsgrense", "nvdb_id", "SHAPE@WKT", "nvdb_lokasjon_kommuner"]
        );
        assert_eq!(schema.fields(false).len(), 3);
    }
}
