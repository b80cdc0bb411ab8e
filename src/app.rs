use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, check_parallel_lists};
use crate::crawler::{CatalogCrawler, CrawlSummary, area_id_by_name};
use crate::domain::{AreaFilter, AreaKind, Location, ObjectTypeFilter};
use crate::error::SyncError;
use crate::fetch::{FetchEngine, FetchOptions, FetchOutcome};
use crate::http::CatalogClient;
use crate::reconcile::{ReconciliationResult, UpdateEngine, UpdateOptions};
use crate::road_reference::{RoadReferenceFilter, RouteKeyOutcome, write_route_keys};
use crate::schema::{Schema, SchemaBuilder};
use crate::sink::Sink;
use crate::store::MetadataStore;
use crate::tables::{TableBuilder, TableOptions, TableSet};

/// Location text meaning "no restriction".
pub const WHOLE_COUNTRY: &str = "Hele landet";

#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    pub fetch: FetchOptions,
    pub tables: TableOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulateResult {
    pub object_type: i64,
    pub table: String,
    pub tables: TableSet,
    #[serde(flatten)]
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub object_type: i64,
    pub table: String,
    #[serde(flatten)]
    pub result: ReconciliationResult,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Session context: configuration, the metadata built for this session and
/// the catalog client. Every operation goes through it.
pub struct App<C: CatalogClient> {
    config: Config,
    store: MetadataStore,
    client: C,
}

impl<C: CatalogClient> App<C> {
    pub fn new(config: Config, client: C) -> Self {
        Self {
            config,
            store: MetadataStore::new(),
            client,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Crawl the remote catalog into the metadata store.
    pub fn build_catalog(&mut self, progress: &dyn ProgressSink) -> Result<CrawlSummary, SyncError> {
        progress.event(ProgressEvent {
            message: "phase=Catalog; crawling catalog".to_string(),
            elapsed: None,
        });
        let start = Instant::now();
        let summary = CatalogCrawler::new(&self.config, &self.client, &mut self.store).crawl()?;
        progress.event(ProgressEvent {
            message: format!(
                "catalog version={} visited={} abandoned={}",
                summary.version.as_deref().unwrap_or("?"),
                summary.visited,
                summary.abandoned
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(summary)
    }

    fn ensure_catalog(&mut self, progress: &dyn ProgressSink) -> Result<(), SyncError> {
        if self.store.lookup_by_name(&self.config.names.object_types).is_err() {
            self.build_catalog(progress)?;
        }
        Ok(())
    }

    /// Schema of an object type, built on first use and reused afterwards.
    pub fn ensure_schema(&mut self, object_type: i64) -> Result<Schema, SyncError> {
        SchemaBuilder::new(&self.config, &self.client).ensure(&mut self.store, object_type)
    }

    /// Parse `Hele landet`, `Region <name>` or a county name into a location filter.
    pub fn resolve_location(&self, text: &str) -> Result<Option<Location>, SyncError> {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case(WHOLE_COUNTRY) {
            return Ok(None);
        }
        let (kind, name) = match text.split_once(' ') {
            Some((prefix, rest)) if prefix.eq_ignore_ascii_case("region") => {
                (AreaKind::Region, rest.trim())
            }
            _ => (AreaKind::County, text),
        };
        let id = area_id_by_name(&self.store, &self.config, kind, name)?;
        Ok(Some(Location {
            area: Some(AreaFilter::Areas {
                kind,
                ids: vec![id],
            }),
            routes: Vec::new(),
        }))
    }

    /// Create the table for one object type and fill it from the catalog.
    pub fn populate<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        table: &str,
        filters: &[ObjectTypeFilter],
        options: &PopulateOptions,
        progress: &dyn ProgressSink,
    ) -> Result<PopulateResult, SyncError> {
        let filter = ObjectTypeFilter::single(filters)?;
        self.ensure_catalog(progress)?;
        progress.event(ProgressEvent {
            message: format!("phase=Schema; object type {}", filter.id),
            elapsed: None,
        });
        let schema = self.ensure_schema(filter.id)?;
        let tables =
            TableBuilder::new(&self.config, &self.client).create(&mut *sink, &schema, table, &options.tables)?;

        progress.event(ProgressEvent {
            message: format!("phase=Fetch; {} into {table}", schema.name),
            elapsed: None,
        });
        let start = Instant::now();
        let outcome =
            FetchEngine::new(&self.config, &self.client, sink).run(&schema, &tables, filter, &options.fetch)?;
        progress.event(ProgressEvent {
            message: format!("fetched={} written={}", outcome.fetched, outcome.written),
            elapsed: Some(start.elapsed()),
        });
        Ok(PopulateResult {
            object_type: filter.id,
            table: table.to_string(),
            tables,
            outcome,
        })
    }

    /// Bring an existing table up to date.
    pub fn update<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        table: &str,
        filters: &[ObjectTypeFilter],
        options: &UpdateOptions,
        progress: &dyn ProgressSink,
    ) -> Result<UpdateResult, SyncError> {
        let filter = ObjectTypeFilter::single(filters)?;
        self.ensure_catalog(progress)?;
        let schema = self.ensure_schema(filter.id)?;
        progress.event(ProgressEvent {
            message: format!("phase=Update; {} in {table}", schema.name),
            elapsed: None,
        });
        let start = Instant::now();
        let result =
            UpdateEngine::new(&self.config, &self.client, sink).run(&schema, table, filter, options)?;
        progress.event(ProgressEvent {
            message: format!(
                "deleted={} updated={} inserted={}",
                result.deleted, result.updated, result.inserted
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(UpdateResult {
            object_type: filter.id,
            table: table.to_string(),
            result,
        })
    }

    /// Populate one table per object type. Unknown object types and remote
    /// API failures skip that object type only.
    pub fn populate_many<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        filters: &[ObjectTypeFilter],
        tables: &[String],
        options: &PopulateOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<PopulateResult>, SyncError> {
        check_parallel_lists(filters, tables, "object types and tables")?;
        let mut results = Vec::with_capacity(filters.len());
        for (filter, table) in filters.iter().zip(tables) {
            match self.populate(&mut *sink, table, std::slice::from_ref(filter), options, progress) {
                Ok(result) => results.push(result),
                Err(err) if skips_object_type(&err) => {
                    warn!(object_type = filter.id, table, error = %err, "object type skipped");
                }
                Err(err) => return Err(err),
            }
        }
        info!(count = results.len(), "batch populate finished");
        Ok(results)
    }

    /// Update one table per object type; tables that do not exist are skipped.
    pub fn update_many<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        filters: &[ObjectTypeFilter],
        tables: &[String],
        options: &UpdateOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<UpdateResult>, SyncError> {
        check_parallel_lists(filters, tables, "object types and tables")?;
        let mut results = Vec::with_capacity(filters.len());
        for (filter, table) in filters.iter().zip(tables) {
            if !sink.table_exists(table) {
                warn!(table, "table does not exist, skipping");
                continue;
            }
            match self.update(&mut *sink, table, std::slice::from_ref(filter), options, progress) {
                Ok(result) => results.push(result),
                Err(err) if skips_object_type(&err) => {
                    warn!(object_type = filter.id, table, error = %err, "object type skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    /// Derive route keys from the road reference columns of a populated table.
    pub fn build_route_keys<S: Sink + ?Sized>(
        &self,
        sink: &mut S,
        table: &str,
        filter: &RoadReferenceFilter,
        progress: &dyn ProgressSink,
    ) -> Result<RouteKeyOutcome, SyncError> {
        if !sink.table_exists(table) {
            return Err(SyncError::NotFound(format!("table {table}")));
        }
        progress.event(ProgressEvent {
            message: format!("phase=RouteKeys; {table}"),
            elapsed: None,
        });
        let start = Instant::now();
        let outcome = write_route_keys(sink, table, &self.config.road_reference, filter)?;
        progress.event(ProgressEvent {
            message: format!(
                "written={} filtered={} invalid={}",
                outcome.written, outcome.filtered, outcome.invalid
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(outcome)
    }
}

fn skips_object_type(error: &SyncError) -> bool {
    matches!(error, SyncError::NotFound(_) | SyncError::RemoteApi { .. })
}

/// Progress sink that discards events.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}
