#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use nvdb_sync::config::Config;
use nvdb_sync::domain::{ObjectId, StorageType};
use nvdb_sync::error::SyncError;
use nvdb_sync::http::{CatalogClient, Query};
use nvdb_sync::sink::{CellValue, CodedValueDomain, ColumnSpec, MemorySink, Row, Sink, TableSpec};
use serde_json::{Value, json};

pub const BASE_URL: &str = "https://nvdb.test/api";
pub const SEARCH_PATH: &str = "vegobjekter/105";
pub const DELETED_PATH: &str = "endringer/objekttype/105/slettet";

pub fn config() -> Config {
    Config {
        base_url: BASE_URL.to_string(),
        ..Config::default()
    }
}

/// Catalog answering from fixed routes, with per-path queues for paged endpoints.
pub struct ScriptedCatalog {
    routes: HashMap<String, Value>,
    queues: Mutex<HashMap<String, VecDeque<Result<Value, SyncError>>>>,
    calls: Mutex<Vec<(String, Query)>>,
}

impl ScriptedCatalog {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            queues: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Routes of the fixture catalog with one object type (105, line geometry).
    pub fn with_catalog() -> Self {
        let fixture: HashMap<String, Value> =
            serde_json::from_str(include_str!("../fixtures/catalog.json")).unwrap();
        let mut catalog = Self::new();
        catalog.routes = fixture;
        catalog
    }

    pub fn route(mut self, path: &str, response: Value) -> Self {
        self.routes.insert(key(path), response);
        self
    }

    pub fn push(&self, path: &str, response: Result<Value, SyncError>) {
        self.queues
            .lock()
            .unwrap()
            .entry(key(path))
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<(String, Query)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn requested(&self, path: &str) -> bool {
        let path = key(path);
        self.calls().iter().any(|(called, _)| *called == path)
    }

    /// Search requests, leaving out the one-object schema sample.
    pub fn searches(&self) -> Vec<Query> {
        self.calls()
            .into_iter()
            .filter(|(path, query)| path == SEARCH_PATH && param(query, "kriterie").is_some())
            .map(|(_, query)| query)
            .collect()
    }
}

impl CatalogClient for ScriptedCatalog {
    fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value, SyncError> {
        let path = key(path);
        self.calls.lock().unwrap().push((path.clone(), query.to_vec()));
        if let Some(queued) = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
        {
            return queued;
        }
        self.routes.get(&path).cloned().ok_or(SyncError::Status {
            status: 404,
            message: format!("no route for {path}"),
        })
    }
}

fn key(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

pub fn param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// A speed limit road object as returned by the search endpoint.
pub fn road_object(id: i64, wkt: &str) -> Value {
    json!({
        "id": id,
        "href": format!("{BASE_URL}/vegobjekter/105/{id}"),
        "metadata": { "versjon": 1, "startdato": "2020-01-31" },
        "geometri": { "wkt": wkt, "srid": 5973 },
        "egenskaper": [
            { "id": 2021, "navn": "Fartsgrense", "datatype": "Tallenum", "verdi": 80, "enum_id": 2728 },
            { "id": 9999, "navn": "Merknad", "datatype": "Tekst", "verdi": format!("objekt {id}") }
        ],
        "lokasjon": { "kommuner": [301] }
    })
}

pub fn line_object(id: i64) -> Value {
    road_object(id, "LINESTRING Z (10 20 1, 30 40 2)")
}

pub fn page(objects: Vec<Value>, next_start: Option<&str>) -> Value {
    let mut metadata = json!({ "returnert": objects.len() });
    if let Some(start) = next_start {
        metadata["neste"] = json!({ "start": start });
    }
    json!({ "objekter": objects, "metadata": metadata })
}

pub fn empty_page() -> Value {
    page(Vec::new(), None)
}

/// Queue the one-object sample the schema builder asks for.
pub fn push_sample(catalog: &ScriptedCatalog) {
    catalog.push(SEARCH_PATH, Ok(page(vec![line_object(1)], None)));
}

/// Sink refusing inserts of chosen identities and delegating everything else.
pub struct RejectingSink {
    pub inner: MemorySink,
    pub rejected: HashSet<i64>,
    pub attempts: usize,
}

impl RejectingSink {
    pub fn new(rejected: impl IntoIterator<Item = i64>) -> Self {
        Self {
            inner: MemorySink::new(),
            rejected: rejected.into_iter().collect(),
            attempts: 0,
        }
    }
}

impl Sink for RejectingSink {
    fn table_exists(&self, table: &str) -> bool {
        self.inner.table_exists(table)
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), SyncError> {
        self.inner.create_table(spec)
    }

    fn drop_table(&mut self, table: &str) -> Result<(), SyncError> {
        self.inner.drop_table(table)
    }

    fn table_spec(&self, table: &str) -> Result<TableSpec, SyncError> {
        self.inner.table_spec(table)
    }

    fn add_column(&mut self, table: &str, column: &str, storage: StorageType) -> Result<(), SyncError> {
        self.inner.add_column(table, column, storage)
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnSpec>, SyncError> {
        self.inner.columns(table)
    }

    fn has_domain(&self, name: &str) -> bool {
        self.inner.has_domain(name)
    }

    fn create_domain(&mut self, domain: CodedValueDomain) -> Result<(), SyncError> {
        self.inner.create_domain(domain)
    }

    fn assign_domain(&mut self, table: &str, column: &str, domain: &str) -> Result<(), SyncError> {
        self.inner.assign_domain(table, column, domain)
    }

    fn insert_row(&mut self, table: &str, row: Row) -> Result<(), SyncError> {
        self.attempts += 1;
        let identity = row.get("nvdb_id").and_then(CellValue::as_long);
        if identity.is_some_and(|id| self.rejected.contains(&id)) {
            return Err(SyncError::Sink(format!("row {identity:?} refused")));
        }
        self.inner.insert_row(table, row)
    }

    fn update_row(&mut self, table: &str, identity: ObjectId, row: Row) -> Result<(), SyncError> {
        self.inner.update_row(table, identity, row)
    }

    fn delete_row(&mut self, table: &str, identity: ObjectId) -> Result<(), SyncError> {
        self.inner.delete_row(table, identity)
    }

    fn read_row(&self, table: &str, identity: ObjectId) -> Result<Option<Row>, SyncError> {
        self.inner.read_row(table, identity)
    }

    fn existing_identities(&self, table: &str) -> Result<Vec<ObjectId>, SyncError> {
        self.inner.existing_identities(table)
    }

    fn row_count(&self, table: &str) -> Result<usize, SyncError> {
        self.inner.row_count(table)
    }
}
