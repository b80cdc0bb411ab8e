use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{AreaKind, NodeKind, RemoteId};
use crate::error::SyncError;
use crate::http::CatalogClient;
use crate::store::{AttrValue, DatasetValues, MetadataStore, ROOT_PATH, join_path, normalize_path};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    pub version: Option<String>,
    pub date: Option<String>,
    pub visited: usize,
    pub abandoned: usize,
    pub object_types: usize,
}

/// Walks the remote catalog from `/` and fills a [`MetadataStore`].
pub struct CatalogCrawler<'a, C: CatalogClient> {
    config: &'a Config,
    client: &'a C,
    store: &'a mut MetadataStore,
    summary: CrawlSummary,
}

impl<'a, C: CatalogClient> CatalogCrawler<'a, C> {
    pub fn new(config: &'a Config, client: &'a C, store: &'a mut MetadataStore) -> Self {
        Self {
            config,
            client,
            store,
            summary: CrawlSummary::default(),
        }
    }

    pub fn crawl(mut self) -> Result<CrawlSummary, SyncError> {
        info!("fetching catalog field names and data types");
        self.crawl_path(ROOT_PATH, NodeKind::Root)?;
        self.summary.version = self.store.catalog_version();
        self.summary.date = self
            .store
            .attr(ROOT_PATH, "date")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        info!(
            visited = self.summary.visited,
            abandoned = self.summary.abandoned,
            "catalog crawl finished"
        );
        Ok(self.summary)
    }

    fn crawl_path(&mut self, path: &str, kind: NodeKind) -> Result<(), SyncError> {
        let entry = self.store.lookup_by_path(path)?.clone();

        let response = match self.client.get(&entry.path, &[]) {
            Ok(response) => response,
            Err(err) if skips_subtree(&err) => {
                warn!(path = %entry.path, error = %err, "catalog request failed, skipping subtree");
                self.summary.abandoned += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.summary.visited += 1;

        let group = self.store.ensure_group(&entry.path)?;
        if kind != NodeKind::Root {
            group.kind = kind;
        }
        group.attrs.insert("dbid".to_string(), AttrValue::from(&entry.id));
        group.attrs.insert("name".to_string(), AttrValue::from(entry.name.as_str()));

        let config = self.config;
        let names = &config.names;
        if entry.name == names.version {
            return self.record_version(&entry.path, &response);
        }
        if [&names.regions, &names.counties, &names.routes].contains(&&entry.name) {
            let is_routes = entry.name == names.routes;
            return self.record_areas(&entry.path, &response, is_routes);
        }

        let Some(items) = response.as_array().filter(|items| !items.is_empty()) else {
            return Ok(());
        };
        if entry.name == names.object_types {
            self.record_object_types(&entry.path, items)
        } else if items[0].get(&config.response_keys.resource_id).is_some() {
            self.record_resources(items)
        } else {
            Ok(())
        }
    }

    fn record_version(&mut self, path: &str, response: &Value) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let catalog = response.get(&keys.version_catalog).ok_or_else(|| {
            SyncError::UnexpectedResponse(format!("missing {} in version resource", keys.version_catalog))
        })?;
        let version = catalog.get(&keys.version_number).map(scalar_text);
        let date = catalog.get(&keys.version_date).map(scalar_text);
        for target in [ROOT_PATH, path] {
            if let Some(version) = &version {
                self.store.set_attr(target, "version", version.clone())?;
            }
            if let Some(date) = &date {
                self.store.set_attr(target, "date", date.clone())?;
            }
        }
        Ok(())
    }

    fn record_areas(&mut self, path: &str, response: &Value, is_routes: bool) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let Some(items) = response.as_array() else {
            return Ok(());
        };
        let mut names = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        let mut descriptions = Vec::new();
        for item in items {
            let mut name = item.get(&keys.area_name).map(scalar_text).unwrap_or_default();
            if is_routes {
                if let Some(period) = item.get(&keys.route_period).map(scalar_text) {
                    name = format!("{name} {period}");
                }
                descriptions.push(
                    item.get(&keys.area_description)
                        .map(scalar_text)
                        .unwrap_or_default(),
                );
            }
            names.push(name);
            ids.push(item.get(&keys.area_number).cloned().unwrap_or(Value::Null));
        }

        self.store.ensure_group(path)?.kind = NodeKind::AreaGroup;
        self.store
            .write_dataset(&join_path(path, "navn"), DatasetValues::Text(names))?;
        self.store.write_dataset(&join_path(path, "id"), id_values(&ids))?;
        if is_routes {
            self.store
                .write_dataset(&join_path(path, "beskrivelse"), DatasetValues::Text(descriptions))?;
        }
        Ok(())
    }

    fn record_object_types(&mut self, path: &str, items: &[Value]) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let mut ids = Vec::with_capacity(items.len());
        let mut names = Vec::with_capacity(items.len());
        let mut to_crawl = Vec::new();
        for item in items {
            let Some(id) = item.get(&keys.object_type_id).and_then(RemoteId::from_json) else {
                debug!(?item, "object type without id");
                continue;
            };
            let name = item
                .get(&keys.object_type_name)
                .map(scalar_text)
                .unwrap_or_else(|| id.to_string());
            let child = join_path(path, &id.to_string());
            self.store.add(id.clone(), &name, &child)?;
            if self.config.includes_object_type(&name, id.as_int()) {
                to_crawl.push(child);
            }
            ids.push(Value::from(id.to_string()));
            names.push(name);
        }
        self.summary.object_types = names.len();
        self.store
            .write_dataset(&join_path(path, "id"), id_values(&ids))?;
        self.store
            .write_dataset(&join_path(path, "navn"), DatasetValues::Text(names))?;

        for child in to_crawl {
            self.crawl_path(&child, NodeKind::ObjectType)?;
        }
        Ok(())
    }

    fn record_resources(&mut self, items: &[Value]) -> Result<(), SyncError> {
        let keys = &self.config.response_keys;
        let mut to_crawl = Vec::new();
        for item in items {
            let Some(raw_id) = item.get(&keys.resource_id).map(scalar_text) else {
                continue;
            };
            let id = raw_id
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            let uri = item
                .get(&keys.resource_uri)
                .map(scalar_text)
                .unwrap_or_else(|| id.clone());
            let path = relative_path(&uri, &self.config.base_url);
            let name = item
                .get(&keys.resource_name)
                .map(scalar_text)
                .unwrap_or_else(|| id.clone())
                .to_lowercase();

            let id = RemoteId::Text(id);
            self.store.add(id.clone(), &name, &path)?;
            // Numeric ids are object instances, not collections.
            if !id.is_numeric() && !self.config.exclude_by_name.contains(&name) {
                to_crawl.push(path);
            }
        }
        for path in to_crawl {
            self.crawl_path(&path, NodeKind::Resource)?;
        }
        Ok(())
    }
}

/// Failures confined to one catalog resource, including oversized responses.
fn skips_subtree(error: &SyncError) -> bool {
    error.is_remote()
        || matches!(
            error,
            SyncError::UnexpectedResponse(_) | SyncError::MemoryPressure { .. }
        )
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn id_values(ids: &[Value]) -> DatasetValues {
    let ints = ids
        .iter()
        .map(|value| match value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        })
        .collect::<Option<Vec<i64>>>();
    match ints {
        Some(ints) => DatasetValues::Int(ints),
        None => DatasetValues::Text(ids.iter().map(scalar_text).collect()),
    }
}

/// Strip the base URL from a catalog href, leaving a store path.
pub fn relative_path(uri: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    normalize_path(uri.strip_prefix(base).unwrap_or(uri))
}

/// Resolve a region or county name to its catalog number.
pub fn area_id_by_name(
    store: &MetadataStore,
    config: &Config,
    kind: AreaKind,
    name: &str,
) -> Result<i64, SyncError> {
    let group_name = match kind {
        AreaKind::Region => &config.names.regions,
        AreaKind::County => &config.names.counties,
    };
    let path = store.lookup_by_name(group_name)?.path.clone();
    let names = store.text_values(&join_path(&path, "navn"))?;
    let ids = store.text_values(&join_path(&path, "id"))?;
    names
        .iter()
        .zip(ids.iter())
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name) || *candidate == name)
        .and_then(|(_, id)| id.parse().ok())
        .ok_or_else(|| SyncError::NotFound(format!("{} {name}", kind.search_key())))
}

/// Names of every crawled national route, including the period suffix.
pub fn route_names(store: &MetadataStore, config: &Config) -> Result<Vec<String>, SyncError> {
    let path = store.lookup_by_name(&config.names.routes)?.path.clone();
    store.text_values(&join_path(&path, "navn"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_base() {
        assert_eq!(
            relative_path("https://h/api/omrader/fylker", "https://h/api/"),
            "/omrader/fylker"
        );
        assert_eq!(relative_path("/vegobjekttyper", "https://h/api"), "/vegobjekttyper");
    }

    #[test]
    fn mixed_ids_fall_back_to_text() {
        let ids = vec![Value::from(1), Value::from("x")];
        assert_eq!(
            id_values(&ids),
            DatasetValues::Text(vec!["1".to_string(), "x".to_string()])
        );
        let ids = vec![Value::from(1), Value::from("2")];
        assert_eq!(id_values(&ids), DatasetValues::Int(vec![1, 2]));
    }
}
