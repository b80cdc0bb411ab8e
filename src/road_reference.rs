//! Route keys for a measured road network, derived from the road reference
//! columns of an already populated table.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RoadReferenceColumns;
use crate::domain::StorageType;
use crate::error::SyncError;
use crate::sink::{CellValue, Row, Sink};

/// Codes of the road category domain and their one-letter abbreviations.
pub const ROAD_CATEGORY_CODES: [(i64, char); 6] = [
    (5492, 'E'),
    (5493, 'R'),
    (5494, 'F'),
    (5495, 'K'),
    (5496, 'P'),
    (5497, 'S'),
];

/// Codes of the road status domain and their one-letter abbreviations.
pub const ROAD_STATUS_CODES: [(i64, char); 14] = [
    (5499, 'V'),
    (5505, 'W'),
    (5502, 'T'),
    (5504, 'S'),
    (12159, 'G'),
    (12983, 'U'),
    (13707, 'B'),
    (5501, 'M'),
    (5500, 'X'),
    (7041, 'A'),
    (12160, 'H'),
    (7042, 'P'),
    (7046, 'E'),
    (12986, 'Q'),
];

/// Statuses of roads open to motor traffic, existing or planned.
pub const MOTOR_ROAD_STATUSES: [char; 10] = ['V', 'W', 'T', 'S', 'B', 'M', 'X', 'A', 'P', 'E'];

/// Statuses of foot and cycle paths.
pub const FOOT_AND_CYCLE_STATUSES: [char; 4] = ['G', 'U', 'H', 'Q'];

pub fn category_letter(code: i64) -> Option<char> {
    lookup(&ROAD_CATEGORY_CODES, code)
}

pub fn status_letter(code: i64) -> Option<char> {
    lookup(&ROAD_STATUS_CODES, code)
}

fn lookup(table: &[(i64, char)], code: i64) -> Option<char> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == code)
        .map(|(_, letter)| *letter)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RoadCategory {
    Europaveg,
    Riksveg,
    Fylkesveg,
    KommunalVeg,
    PrivatVeg,
    Skogsbilveg,
}

impl RoadCategory {
    pub const ALL: [RoadCategory; 6] = [
        RoadCategory::Europaveg,
        RoadCategory::Riksveg,
        RoadCategory::Fylkesveg,
        RoadCategory::KommunalVeg,
        RoadCategory::PrivatVeg,
        RoadCategory::Skogsbilveg,
    ];

    pub fn letter(&self) -> char {
        match self {
            RoadCategory::Europaveg => 'E',
            RoadCategory::Riksveg => 'R',
            RoadCategory::Fylkesveg => 'F',
            RoadCategory::KommunalVeg => 'K',
            RoadCategory::PrivatVeg => 'P',
            RoadCategory::Skogsbilveg => 'S',
        }
    }
}

/// Allowed category × status combinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoadReferenceFilter {
    categories: Vec<char>,
    statuses: Vec<char>,
}

impl RoadReferenceFilter {
    pub fn motor_roads(categories: &[RoadCategory]) -> Self {
        Self {
            categories: categories.iter().map(RoadCategory::letter).collect(),
            statuses: MOTOR_ROAD_STATUSES.to_vec(),
        }
    }

    /// Foot and cycle paths along roads of every category.
    pub fn foot_and_cycle() -> Self {
        Self {
            categories: RoadCategory::ALL.iter().map(RoadCategory::letter).collect(),
            statuses: FOOT_AND_CYCLE_STATUSES.to_vec(),
        }
    }

    pub fn allows(&self, category: char, status: char) -> bool {
        self.categories.contains(&category) && self.statuses.contains(&status)
    }

    /// Search parameter value listing every allowed pair, e.g. `EV,EW,...`.
    pub fn search_value(&self) -> String {
        self.categories
            .iter()
            .flat_map(|category| {
                self.statuses
                    .iter()
                    .map(move |status| format!("{category}{status}"))
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for RoadReferenceFilter {
    fn default() -> Self {
        Self::motor_roads(&[
            RoadCategory::Europaveg,
            RoadCategory::Riksveg,
            RoadCategory::Fylkesveg,
        ])
    }
}

/// The parts of a road reference a route key is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoadReference {
    pub county: i64,
    pub municipality: i64,
    pub category: char,
    pub status: char,
    pub number: i64,
    pub part: i64,
}

impl RoadReference {
    pub fn from_row(row: &Row, columns: &RoadReferenceColumns) -> Result<Self, SyncError> {
        let category_code = integer_column(row, &columns.category)?;
        let status_code = integer_column(row, &columns.status)?;
        let municipality = row
            .get(&columns.municipalities)
            .and_then(first_municipality)
            .ok_or_else(|| {
                SyncError::Sink(format!("column {} holds no municipality", columns.municipalities))
            })?;
        Ok(Self {
            county: integer_column(row, &columns.county)?,
            municipality,
            category: category_letter(category_code)
                .ok_or_else(|| SyncError::Sink(format!("unknown road category {category_code}")))?,
            status: status_letter(status_code)
                .ok_or_else(|| SyncError::Sink(format!("unknown road status {status_code}")))?,
            number: integer_column(row, &columns.number)?,
            part: integer_column(row, &columns.part)?,
        })
    }

    pub fn route_key(&self) -> RouteKey {
        let tail = format!("{}{} {} {}", self.category, self.status, self.number, self.part);
        RouteKey {
            county: format!("{:02} {tail}", self.county),
            county_wide: format!("{:02} 00 {tail}", self.county),
            municipal: format!("{:02} {:02} {tail}", self.county, self.municipality),
        }
    }
}

/// The three route keys: per county, per county with a zero municipality,
/// and per municipality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteKey {
    pub county: String,
    pub county_wide: String,
    pub municipal: String,
}

impl RouteKey {
    fn into_array(self) -> [String; 3] {
        [self.county, self.county_wide, self.municipal]
    }
}

fn integer_column(row: &Row, column: &str) -> Result<i64, SyncError> {
    row.get(column)
        .and_then(cell_integer)
        .ok_or_else(|| SyncError::Sink(format!("column {column} holds no integer")))
}

fn cell_integer(cell: &CellValue) -> Option<i64> {
    match cell {
        CellValue::Long(value) => Some(*value),
        CellValue::Double(value) if value.is_finite() && value.fract() == 0.0 => Some(*value as i64),
        CellValue::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Municipalities are stored as a JSON list; the first one is used.
fn first_municipality(cell: &CellValue) -> Option<i64> {
    match cell {
        CellValue::Text(text) => text
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .next()
            .and_then(|first| first.trim().parse().ok()),
        other => cell_integer(other),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteKeyOutcome {
    pub table: String,
    pub written: u64,
    /// Rows whose category and status pair the filter does not allow.
    pub filtered: u64,
    pub invalid: u64,
}

/// Write route keys into every row of `table` whose road reference passes
/// `filter`. Missing key columns are added as text.
pub fn write_route_keys<S: Sink + ?Sized>(
    sink: &mut S,
    table: &str,
    columns: &RoadReferenceColumns,
    filter: &RoadReferenceFilter,
) -> Result<RouteKeyOutcome, SyncError> {
    let existing = sink.columns(table)?;
    for column in &columns.route_keys {
        if !existing.iter().any(|spec| spec.name == *column) {
            sink.add_column(table, column, StorageType::Text)?;
        }
    }

    let mut outcome = RouteKeyOutcome {
        table: table.to_string(),
        ..RouteKeyOutcome::default()
    };
    for identity in sink.existing_identities(table)? {
        let Some(row) = sink.read_row(table, identity)? else {
            continue;
        };
        let reference = match RoadReference::from_row(&row, columns) {
            Ok(reference) => reference,
            Err(err) => {
                warn!(%identity, error = %err, "road reference skipped");
                outcome.invalid += 1;
                continue;
            }
        };
        if !filter.allows(reference.category, reference.status) {
            outcome.filtered += 1;
            continue;
        }
        let keys: Row = columns
            .route_keys
            .iter()
            .cloned()
            .zip(reference.route_key().into_array().map(CellValue::Text))
            .collect();
        sink.update_row(table, identity, keys)?;
        outcome.written += 1;
    }
    info!(
        table,
        written = outcome.written,
        filtered = outcome.filtered,
        invalid = outcome.invalid,
        "route keys written"
    );
    Ok(outcome)
}
