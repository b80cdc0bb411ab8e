//! Paginated retrieval of road objects into a sink.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{GeometryKind, Location, ObjectId, ObjectTypeFilter, StorageType};
use crate::error::SyncError;
use crate::flatten::{Flattener, Record, compact_json};
use crate::geometry::{Wkt, empty_placeholder, ensure_geometry, repair_record};
use crate::http::{CatalogClient, Query};
use crate::schema::{Schema, parse_date, parse_number};
use crate::sink::{CellValue, ColumnSpec, Row, Sink};
use crate::tables::TableSet;

pub const MODIFIED_SINCE_PARAM: &str = "endret_etter";
pub const ROAD_REFERENCE_PARAM: &str = "vegreferanse";

/// What to search for, independent of paging.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub object_type: i64,
    pub property_filter: Option<String>,
    pub location: Option<Location>,
    pub modified_since: Option<String>,
    /// Allowed category and status pairs, e.g. `EV,RV`.
    pub road_reference: Option<String>,
}

impl SearchQuery {
    pub fn new(filter: &ObjectTypeFilter) -> Self {
        Self {
            object_type: filter.id,
            modified_since: filter.modified_since.clone(),
            ..Self::default()
        }
    }

    /// Query parameters for one page of `count` objects from `start`.
    pub fn to_query(&self, config: &Config, count: u64, start: Option<&str>) -> Query {
        let mut criteria = json!({ "objektTyper": [{ "id": self.object_type }] });
        if let Some(location) = self.location.as_ref().filter(|location| !location.is_empty()) {
            criteria["lokasjon"] = location.to_json();
        }
        let mut query: Query = config
            .search_params
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        query.push(("kriterie".to_string(), compact_json(&criteria)));
        query.push(("antall".to_string(), count.to_string()));
        if let Some(start) = start {
            query.push(("start".to_string(), start.to_string()));
        }
        if let Some(filter) = &self.property_filter {
            query.push(("egenskap".to_string(), filter.clone()));
        }
        if let Some(since) = &self.modified_since {
            query.push((MODIFIED_SINCE_PARAM.to_string(), since.clone()));
        }
        if let Some(road_reference) = &self.road_reference {
            query.push((ROAD_REFERENCE_PARAM.to_string(), road_reference.clone()));
        }
        query
    }
}

/// One page of a search response.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub returned: u64,
    pub next_start: Option<String>,
    pub objects: Vec<Value>,
}

impl Page {
    pub fn from_response(config: &Config, mut response: Value) -> Self {
        let keys = &config.response_keys;
        let metadata = response.get(&keys.metadata);
        let returned = metadata
            .and_then(|meta| meta.get(&keys.returned))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let next_start = metadata
            .and_then(|meta| meta.get(&keys.next))
            .and_then(|next| next.get(&keys.next_start))
            .and_then(|start| match start {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            });
        let objects = match response.get_mut(&keys.objects).map(Value::take) {
            Some(Value::Array(objects)) => objects,
            _ => Vec::new(),
        };
        Self {
            returned,
            next_start,
            objects,
        }
    }
}

/// Position of a paginated pull: how much is wanted, how much arrived,
/// where to resume, and the current page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCursor {
    pub target: Option<u64>,
    pub fetched: u64,
    pub next_start: Option<String>,
    pub page_size: u64,
}

impl FetchCursor {
    pub fn new(target: Option<u64>, start: Option<String>, page_size: u64) -> Self {
        Self {
            target,
            fetched: 0,
            next_start: start,
            page_size: page_size.max(1),
        }
    }

    pub fn is_done(&self) -> bool {
        self.target.is_some_and(|target| self.fetched >= target)
    }

    pub fn next_count(&self) -> u64 {
        match self.target {
            Some(target) => target.saturating_sub(self.fetched).min(self.page_size),
            None => self.page_size,
        }
    }

    /// Halve the page size; fails when it cannot shrink further.
    pub fn shrink(&mut self) -> bool {
        if self.page_size <= 1 {
            return false;
        }
        self.page_size /= 2;
        true
    }

    pub fn advance(&mut self, page: &Page) {
        self.fetched += page.returned;
        if page.next_start.is_some() {
            self.next_start = page.next_start.clone();
        }
    }
}

/// Request the page at the cursor, halving the page size on memory pressure.
/// The cursor position is not advanced.
pub fn request_page<C: CatalogClient + ?Sized>(
    client: &C,
    config: &Config,
    search: &SearchQuery,
    cursor: &mut FetchCursor,
) -> Result<Page, SyncError> {
    let path = config.search_path(search.object_type);
    loop {
        let query = search.to_query(config, cursor.next_count(), cursor.next_start.as_deref());
        match client.get(&path, &query) {
            Ok(response) => return Ok(Page::from_response(config, response)),
            Err(err @ SyncError::MemoryPressure { .. }) => {
                if !cursor.shrink() {
                    return Err(err);
                }
                warn!(page_size = cursor.page_size, "response too large, halving page size");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Turns remote objects into typed rows for a given table layout.
pub struct RowBuilder<'a> {
    config: &'a Config,
    geometry: GeometryKind,
    columns: Vec<ColumnSpec>,
}

impl<'a> RowBuilder<'a> {
    pub fn new(config: &'a Config, geometry: GeometryKind, columns: Vec<ColumnSpec>) -> Self {
        Self {
            config,
            geometry,
            columns,
        }
    }

    pub fn identity_column(&self) -> &str {
        &self.config.default_extras.identity
    }

    /// Flatten, fill in missing geometry, repair the tag and coerce to columns.
    pub fn build(&self, object: &Value) -> (Option<ObjectId>, Row) {
        let mut record = Flattener::new(self.config).flatten(object);
        let geometry_field = &self.config.default_extras.geometry;
        if ensure_geometry(&mut record, geometry_field, self.geometry, &self.config.wkt_empty) {
            repair_record(&mut record, geometry_field, &self.config.wkt_empty);
        }
        let identity = record
            .get(self.identity_column())
            .and_then(ObjectId::from_json);
        (identity, populate_row(self.config, &record, &self.columns, self.geometry))
    }
}

/// Coerce record values to the storage type of each column; absent values are null.
pub fn populate_row(
    config: &Config,
    record: &Record,
    columns: &[ColumnSpec],
    geometry: GeometryKind,
) -> Row {
    let mut row: Row = columns
        .iter()
        .map(|column| {
            let value = record
                .get(&column.name)
                .map(|value| coerce(config, value, column.storage))
                .unwrap_or(CellValue::Null);
            (column.name.clone(), value)
        })
        .collect();
    if geometry != GeometryKind::None {
        let geometry_field = &config.default_extras.geometry;
        let value = match record.get(geometry_field) {
            Some(Value::String(text)) => CellValue::Text(text.clone()),
            _ => CellValue::Null,
        };
        row.insert(geometry_field.clone(), value);
    }
    row
}

fn coerce(config: &Config, value: &Value, storage: StorageType) -> CellValue {
    if value.is_null() {
        return CellValue::Null;
    }
    match storage.column_type() {
        StorageType::Long => match value {
            Value::String(text) => text.trim().parse().map(CellValue::Long).unwrap_or(CellValue::Null),
            other => parse_number(other)
                .map(|number| CellValue::Long(number.trunc() as i64))
                .unwrap_or(CellValue::Null),
        },
        StorageType::Double => parse_number(value)
            .map(CellValue::Double)
            .unwrap_or(CellValue::Null),
        StorageType::Date => value
            .as_str()
            .and_then(|text| parse_date(text, &config.date_formats))
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        StorageType::Text | StorageType::Enum => {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            CellValue::Text(text.chars().take(config.text_max_len).collect())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub property_filter: Option<String>,
    pub location: Option<Location>,
    pub road_reference: Option<String>,
    pub page_size: Option<u64>,
    /// Retry failed inserts once with an empty geometry.
    pub store_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub fetched: u64,
    pub written: u64,
    pub secondary_tables: Vec<String>,
}

pub struct FetchEngine<'a, C: CatalogClient, S: Sink + ?Sized> {
    config: &'a Config,
    client: &'a C,
    sink: &'a mut S,
}

impl<'a, C: CatalogClient, S: Sink + ?Sized> FetchEngine<'a, C, S> {
    pub fn new(config: &'a Config, client: &'a C, sink: &'a mut S) -> Self {
        Self {
            config,
            client,
            sink,
        }
    }

    pub fn run(
        &mut self,
        schema: &Schema,
        tables: &TableSet,
        filter: &ObjectTypeFilter,
        options: &FetchOptions,
    ) -> Result<FetchOutcome, SyncError> {
        let search = SearchQuery {
            property_filter: options.property_filter.clone(),
            location: options.location.clone(),
            road_reference: options.road_reference.clone(),
            ..SearchQuery::new(filter)
        };
        let page_size = options.page_size.unwrap_or(self.config.page_size);
        let mut cursor = FetchCursor::new(filter.count, filter.start.clone(), page_size);
        let rows = RowBuilder::new(self.config, schema.geometry, self.sink.columns(&tables.primary)?);

        let mut outcome = FetchOutcome::default();
        let mut buffered: BTreeMap<GeometryKind, Vec<Row>> = BTreeMap::new();
        while !cursor.is_done() {
            let page = request_page(self.client, self.config, &search, &mut cursor)?;
            // Short pages are normal under server load; only an empty one ends the pull.
            if page.returned == 0 {
                break;
            }
            cursor.advance(&page);
            for object in &page.objects {
                let (_, row) = rows.build(object);
                outcome.written += self.write_row(schema.geometry, tables, row, options, &mut buffered);
            }
            outcome.fetched = cursor.fetched;
            info!(fetched = outcome.fetched, written = outcome.written, "page stored");
        }

        for (kind, pending) in buffered {
            let Some(table) = tables.for_kind(kind) else {
                continue;
            };
            for row in pending {
                match self.sink.insert_row(table, row) {
                    Ok(()) => outcome.written += 1,
                    Err(err) => warn!(table, error = %err, "insert into geometry table failed"),
                }
            }
        }
        outcome.secondary_tables = self.drop_empty_siblings(tables)?;
        info!(
            table = %tables.primary,
            fetched = outcome.fetched,
            written = outcome.written,
            "fetch finished"
        );
        Ok(outcome)
    }

    fn write_row(
        &mut self,
        geometry: GeometryKind,
        tables: &TableSet,
        mut row: Row,
        options: &FetchOptions,
        buffered: &mut BTreeMap<GeometryKind, Vec<Row>>,
    ) -> u64 {
        let geometry_field = &self.config.default_extras.geometry;
        if geometry != GeometryKind::None {
            let actual = row
                .get(geometry_field)
                .and_then(CellValue::as_text)
                .and_then(|text| Wkt::new(text).geometry_kind());
            if let Some(kind) = actual.filter(|kind| *kind != geometry)
                && tables.for_kind(kind).is_some()
            {
                buffered.entry(kind).or_default().push(row);
                return 0;
            }
        }
        let err = match self.sink.insert_row(&tables.primary, row.clone()) {
            Ok(()) => return 1,
            Err(err) => err,
        };
        if options.store_failed
            && let Some(placeholder) = empty_placeholder(geometry, &self.config.wkt_empty)
        {
            row.insert(geometry_field.clone(), CellValue::Text(placeholder));
            match self.sink.insert_row(&tables.primary, row) {
                Ok(()) => {
                    debug!(error = %err, "stored object with empty geometry");
                    return 1;
                }
                Err(retry) => warn!(error = %retry, "insert failed"),
            }
        } else {
            warn!(error = %err, "insert failed");
        }
        0
    }

    fn drop_empty_siblings(&mut self, tables: &TableSet) -> Result<Vec<String>, SyncError> {
        let mut kept = Vec::new();
        for table in tables.siblings.values() {
            if !self.sink.table_exists(table) {
                continue;
            }
            if self.sink.row_count(table)? == 0 {
                info!(table, "dropping empty geometry table");
                self.sink.drop_table(table)?;
            } else {
                kept.push(table.clone());
            }
        }
        Ok(kept)
    }
}
