use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::domain::GeometryKind;
use crate::error::SyncError;
use crate::flatten::sanitize_field_name;
use crate::http::CatalogClient;
use crate::schema::{Field, Schema};
use crate::sink::{CodedValueDomain, Sink, TableSpec};

#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub overwrite: bool,
    pub include_extended: bool,
}

/// The primary table of an object type plus its sibling geometry tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSet {
    pub primary: String,
    pub siblings: BTreeMap<GeometryKind, String>,
}

impl TableSet {
    /// Table receiving records of `kind`, if any.
    pub fn for_kind(&self, kind: GeometryKind) -> Option<&str> {
        self.siblings.get(&kind).map(String::as_str)
    }
}

pub fn sibling_table_name(table: &str, kind: GeometryKind) -> Option<String> {
    kind.table_suffix().map(|suffix| format!("{table}_{suffix}"))
}

pub fn domain_name(field: &Field, catalog_version: Option<&str>) -> String {
    sanitize_field_name(&format!(
        "{}_{}_{}",
        field.column_name(),
        field.remote_id,
        catalog_version.unwrap_or("0")
    ))
}

pub struct TableBuilder<'a, C: CatalogClient> {
    config: &'a Config,
    client: &'a C,
}

impl<'a, C: CatalogClient> TableBuilder<'a, C> {
    pub fn new(config: &'a Config, client: &'a C) -> Self {
        Self { config, client }
    }

    /// Create (or reuse) the tables for `schema`, with columns and coded-value domains.
    pub fn create<S: Sink + ?Sized>(
        &self,
        sink: &mut S,
        schema: &Schema,
        table: &str,
        options: &TableOptions,
    ) -> Result<TableSet, SyncError> {
        let fields = schema.fields(options.include_extended);
        self.create_domains(sink, schema)?;
        self.create_one(sink, schema, &fields, table, schema.geometry, options)?;

        let mut siblings = BTreeMap::new();
        if schema.geometry != GeometryKind::None {
            for kind in GeometryKind::ALL {
                if kind == schema.geometry {
                    continue;
                }
                let Some(name) = sibling_table_name(table, kind) else {
                    continue;
                };
                self.create_one(sink, schema, &fields, &name, kind, options)?;
                siblings.insert(kind, name);
            }
        }
        Ok(TableSet {
            primary: table.to_string(),
            siblings,
        })
    }

    fn create_one<S: Sink + ?Sized>(
        &self,
        sink: &mut S,
        schema: &Schema,
        fields: &[Field],
        table: &str,
        geometry: GeometryKind,
        options: &TableOptions,
    ) -> Result<(), SyncError> {
        if sink.table_exists(table) {
            if !options.overwrite {
                debug!(table, "table exists, reusing");
                return Ok(());
            }
            sink.drop_table(table)?;
        }
        info!(table, geometry = %geometry, fields = fields.len(), "creating table");
        let extras = &self.config.default_extras;
        sink.create_table(&TableSpec {
            name: table.to_string(),
            geometry,
            geometry_column: extras.geometry.clone(),
            identity_column: sanitize_field_name(&extras.identity),
        })?;
        for field in fields {
            if field.name == extras.geometry {
                continue;
            }
            sink.add_column(table, &field.column_name(), field.storage)?;
        }
        let version = schema.catalog_version.as_deref();
        for field in fields.iter().filter(|field| self.is_coded(field)) {
            sink.assign_domain(table, &field.column_name(), &domain_name(field, version))?;
        }
        Ok(())
    }

    fn is_coded(&self, field: &Field) -> bool {
        !field.is_inferred() && self.config.is_enum_type(&field.remote_type)
    }

    fn create_domains<S: Sink + ?Sized>(&self, sink: &mut S, schema: &Schema) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let version = schema.catalog_version.as_deref();
        let coded: Vec<&Field> = schema
            .declared
            .iter()
            .filter(|field| self.is_coded(field))
            .collect();
        let missing: Vec<&Field> = coded
            .into_iter()
            .filter(|field| !sink.has_domain(&domain_name(field, version)))
            .collect();
        if !missing.is_empty() {
            info!(count = missing.len(), "creating coded-value domains");
        }
        for field in missing {
            let response = self.client.get(&field.uri, &[])?;
            let description = response
                .get(&keys.domain_description)
                .and_then(Value::as_str)
                .unwrap_or("Ingen beskrivelse")
                .to_string();
            let values = response
                .get(&keys.domain_values)
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|value| {
                            let code = value.get(&keys.domain_value_id).and_then(Value::as_i64)?;
                            let label = match value.get(&keys.domain_value_value)? {
                                Value::String(text) => text.clone(),
                                other => other.to_string(),
                            };
                            Some((code, label))
                        })
                        .collect()
                })
                .unwrap_or_default();
            sink.create_domain(CodedValueDomain {
                name: domain_name(field, version),
                description,
                storage: field.storage.column_type(),
                values,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StorageType;

    #[test]
    fn sibling_names_use_kind_suffix() {
        assert_eq!(
            sibling_table_name("skilt", GeometryKind::Point).as_deref(),
            Some("skilt_punktgeometri")
        );
        assert_eq!(sibling_table_name("skilt", GeometryKind::None), None);
    }

    #[test]
    fn domain_names_are_sanitised() {
        let field = Field {
            name: "Type (skilt)".to_string(),
            storage: StorageType::Enum,
            remote_type: "Tekstenum".to_string(),
            remote_id: 5530,
            uri: "/vegobjekttyper/96/5530".to_string(),
        };
        assert_eq!(domain_name(&field, Some("2.13")), "Type__skilt__5530_2_13");
    }
}
