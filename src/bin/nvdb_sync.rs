use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use nvdb_sync::app::{App, PopulateOptions};
use nvdb_sync::config::ConfigLoader;
use nvdb_sync::domain::{AreaFilter, BoundingBox, Location, ObjectTypeFilter};
use nvdb_sync::error::SyncError;
use nvdb_sync::fetch::FetchOptions;
use nvdb_sync::http::{CatalogClient, CatalogHttpClient};
use nvdb_sync::output::JsonOutput;
use nvdb_sync::reconcile::UpdateOptions;
use nvdb_sync::road_reference::{RoadCategory, RoadReferenceFilter};
use nvdb_sync::sink::MemorySink;
use nvdb_sync::tables::TableOptions;

#[derive(Parser)]
#[command(name = "nvdb-sync")]
#[command(about = "Mirror NVDB road-object types into typed local tables")]
#[command(version, author)]
struct Cli {
    /// Configuration file (default: ./nvdb-sync.json, then the user config dir)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Crawl the remote catalog and print a summary")]
    Catalog,
    #[command(about = "Create tables and fill them with road objects")]
    Fetch(FetchArgs),
    #[command(about = "Apply remote changes to existing tables")]
    Update(UpdateArgs),
    #[command(about = "Write route keys derived from road references into a table")]
    RouteKeys(RouteKeyArgs),
}

#[derive(Args, Clone)]
struct TargetArgs {
    /// Object type id; repeat together with --table for several types
    #[arg(long = "object-type", required = true)]
    object_types: Vec<i64>,

    /// Destination table name, one per --object-type
    #[arg(long = "table", required = true)]
    tables: Vec<String>,

    /// Dataset file holding the tables
    #[arg(long)]
    dataset: Utf8PathBuf,

    /// "Hele landet", "Region <name>" or a county name
    #[arg(long)]
    location: Option<String>,

    /// Bounding box "xmin,ymin,xmax,ymax" in the configured srid
    #[arg(long, conflicts_with = "location")]
    bbox: Option<BoundingBox>,

    /// National route name; may be repeated
    #[arg(long = "route")]
    routes: Vec<String>,

    #[arg(long)]
    count: Option<u64>,

    #[arg(long)]
    page_size: Option<u64>,
}

#[derive(Args, Clone)]
struct FetchArgs {
    #[command(flatten)]
    target: TargetArgs,

    #[arg(long)]
    property_filter: Option<String>,

    /// Include attributes inferred beyond the default extras
    #[arg(long)]
    extended: bool,

    /// Keep rows that fail to insert, with an empty geometry
    #[arg(long)]
    store_failed: bool,

    /// Append to existing tables instead of recreating them
    #[arg(long)]
    append: bool,

    #[command(flatten)]
    roads: RoadArgs,

    /// Send the --road-category or --foot-and-cycle selection as a search filter
    #[arg(long)]
    road_filter: bool,
}

#[derive(Args, Clone)]
struct RoadArgs {
    /// Road categories for motor roads; may be repeated
    #[arg(long = "road-category", value_enum, conflicts_with = "foot_and_cycle")]
    road_categories: Vec<RoadCategory>,

    /// Foot and cycle paths instead of motor roads
    #[arg(long)]
    foot_and_cycle: bool,
}

impl RoadArgs {
    fn filter(&self) -> RoadReferenceFilter {
        if self.foot_and_cycle {
            RoadReferenceFilter::foot_and_cycle()
        } else if self.road_categories.is_empty() {
            RoadReferenceFilter::default()
        } else {
            RoadReferenceFilter::motor_roads(&self.road_categories)
        }
    }
}

#[derive(Args, Clone)]
struct RouteKeyArgs {
    /// Dataset file holding the table
    #[arg(long)]
    dataset: Utf8PathBuf,

    /// Table populated with road references
    #[arg(long)]
    table: String,

    #[command(flatten)]
    roads: RoadArgs,
}

#[derive(Args, Clone)]
struct UpdateArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Watermark, e.g. 2024-01-31T00:00:00+01:00
    #[arg(long)]
    since: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::NotFound(_)
        | SyncError::Configuration(_)
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::InvalidTimestamp(_) => 2,
        SyncError::Http(_) | SyncError::Status { .. } | SyncError::RemoteApi { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let client = CatalogHttpClient::new(&config)?;
    let mut app = App::new(config, client);

    match cli.command {
        Commands::Catalog => {
            let summary = app.build_catalog(&JsonOutput)?;
            JsonOutput::print_catalog(&summary).into_diagnostic()
        }
        Commands::Fetch(args) => run_fetch(&mut app, args),
        Commands::Update(args) => run_update(&mut app, args),
        Commands::RouteKeys(args) => run_route_keys(&app, args),
    }
}

fn run_fetch<C: CatalogClient>(app: &mut App<C>, args: FetchArgs) -> miette::Result<()> {
    let filters = filters(&args.target, None);
    let mut sink = MemorySink::open(&args.target.dataset)?;
    app.build_catalog(&JsonOutput)?;
    let options = PopulateOptions {
        fetch: FetchOptions {
            property_filter: args.property_filter.clone(),
            location: location(app, &args.target)?,
            road_reference: args.road_filter.then(|| args.roads.filter().search_value()),
            page_size: args.target.page_size,
            store_failed: args.store_failed,
        },
        tables: TableOptions {
            overwrite: !args.append,
            include_extended: args.extended,
        },
    };
    let results = app.populate_many(&mut sink, &filters, &args.target.tables, &options, &JsonOutput)?;
    sink.save(&args.target.dataset)?;
    JsonOutput::print_populate(&results).into_diagnostic()
}

fn run_update<C: CatalogClient>(app: &mut App<C>, args: UpdateArgs) -> miette::Result<()> {
    let filters = filters(&args.target, args.since.clone());
    let mut sink = MemorySink::load(&args.target.dataset)?;
    app.build_catalog(&JsonOutput)?;
    let options = UpdateOptions {
        location: location(app, &args.target)?,
        page_size: args.target.page_size,
        modified_since: args.since.clone(),
    };
    let results = app.update_many(&mut sink, &filters, &args.target.tables, &options, &JsonOutput)?;
    sink.save(&args.target.dataset)?;
    JsonOutput::print_update(&results).into_diagnostic()
}

fn run_route_keys<C: CatalogClient>(app: &App<C>, args: RouteKeyArgs) -> miette::Result<()> {
    let mut sink = MemorySink::load(&args.dataset)?;
    let outcome = app.build_route_keys(&mut sink, &args.table, &args.roads.filter(), &JsonOutput)?;
    sink.save(&args.dataset)?;
    JsonOutput::print_route_keys(&outcome).into_diagnostic()
}

fn filters(target: &TargetArgs, since: Option<String>) -> Vec<ObjectTypeFilter> {
    target
        .object_types
        .iter()
        .map(|id| ObjectTypeFilter {
            count: target.count,
            modified_since: since.clone(),
            ..ObjectTypeFilter::new(*id)
        })
        .collect()
}

fn location<C: CatalogClient>(
    app: &App<C>,
    target: &TargetArgs,
) -> Result<Option<Location>, SyncError> {
    let mut location = match (&target.location, target.bbox) {
        (Some(text), _) => app.resolve_location(text)?.unwrap_or_default(),
        (None, Some(bbox)) => Location {
            area: Some(AreaFilter::BoundingBox {
                srid: app.config().srid.clone(),
                bbox,
            }),
            routes: Vec::new(),
        },
        (None, None) => Location::default(),
    };
    location.routes = target.routes.clone();
    Ok((!location.is_empty()).then_some(location))
}
