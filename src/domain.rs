use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SyncError;

/// Opaque catalog identifier. The catalog hands out both integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Int(i64),
    Text(String),
}

impl RemoteId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RemoteId::Int(value) => Some(*value),
            RemoteId::Text(value) => value.parse().ok(),
        }
    }

    /// Numeric-looking ids belong to object instances, not collections.
    pub fn is_numeric(&self) -> bool {
        match self {
            RemoteId::Int(_) => true,
            RemoteId::Text(value) => {
                !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
            }
        }
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(RemoteId::Int),
            Value::String(text) => Some(RemoteId::Text(text.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Int(value) => write!(f, "{value}"),
            RemoteId::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for RemoteId {
    fn from(value: i64) -> Self {
        RemoteId::Int(value)
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        RemoteId::Text(value.to_string())
    }
}

/// Stable identity of a road object across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub i64);

impl ObjectId {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(ObjectId),
            Value::String(text) => text.trim().parse().ok().map(ObjectId),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    AreaGroup,
    ObjectType,
    Resource,
}

/// Concrete column type a remote attribute is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageType {
    Long,
    Double,
    Text,
    Date,
    Enum,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Long => "LONG",
            StorageType::Double => "DOUBLE",
            StorageType::Text => "TEXT",
            StorageType::Date => "DATE",
            StorageType::Enum => "ENUM",
        }
    }

    /// Enum columns hold the integer code of the chosen value.
    pub fn column_type(&self) -> StorageType {
        match self {
            StorageType::Enum => StorageType::Long,
            other => *other,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LONG" => Ok(StorageType::Long),
            "DOUBLE" => Ok(StorageType::Double),
            "TEXT" | "STRING" => Ok(StorageType::Text),
            "DATE" => Ok(StorageType::Date),
            "ENUM" => Ok(StorageType::Enum),
            _ => Err(SyncError::Configuration(format!(
                "unknown storage type: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    None,
    Point,
    Line,
    Polygon,
}

impl GeometryKind {
    pub const ALL: [GeometryKind; 3] = [GeometryKind::Point, GeometryKind::Line, GeometryKind::Polygon];

    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::None => "none",
            GeometryKind::Point => "point",
            GeometryKind::Line => "line",
            GeometryKind::Polygon => "polygon",
        }
    }

    /// Base WKT keyword for the kind.
    pub fn wkt_tag(&self) -> Option<&'static str> {
        match self {
            GeometryKind::None => None,
            GeometryKind::Point => Some("POINT"),
            GeometryKind::Line => Some("LINESTRING"),
            GeometryKind::Polygon => Some("POLYGON"),
        }
    }

    pub fn from_wkt_tag(tag: &str) -> Option<Self> {
        match tag {
            "POINT" => Some(GeometryKind::Point),
            "LINESTRING" => Some(GeometryKind::Line),
            "POLYGON" => Some(GeometryKind::Polygon),
            _ => None,
        }
    }

    /// Suffix of the sibling table holding records of this kind.
    pub fn table_suffix(&self) -> Option<&'static str> {
        match self {
            GeometryKind::None => None,
            GeometryKind::Point => Some("punktgeometri"),
            GeometryKind::Line => Some("linjegeometri"),
            GeometryKind::Polygon => Some("flategeometri"),
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeometryKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(GeometryKind::None),
            "point" => Ok(GeometryKind::Point),
            "line" | "polyline" => Ok(GeometryKind::Line),
            "polygon" => Ok(GeometryKind::Polygon),
            _ => Err(SyncError::Configuration(format!(
                "unknown geometry kind: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AreaKind {
    Region,
    County,
}

impl AreaKind {
    /// Key used in the search `lokasjon` document.
    pub fn search_key(&self) -> &'static str {
        match self {
            AreaKind::Region => "region",
            AreaKind::County => "fylke",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl FromStr for BoundingBox {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SyncError::Configuration(format!("invalid bounding box: {value}")))?;
        match parts.as_slice() {
            [xmin, ymin, xmax, ymax] if xmin <= xmax && ymin <= ymax => Ok(Self {
                xmin: *xmin,
                ymin: *ymin,
                xmax: *xmax,
                ymax: *ymax,
            }),
            _ => Err(SyncError::Configuration(format!(
                "invalid bounding box: {value}"
            ))),
        }
    }
}

/// Location restriction applied to a search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub area: Option<AreaFilter>,
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AreaFilter {
    Areas { kind: AreaKind, ids: Vec<i64> },
    BoundingBox { srid: String, bbox: BoundingBox },
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.area.is_none() && self.routes.is_empty()
    }

    /// Render as the `lokasjon` part of a search criteria document.
    pub fn to_json(&self) -> Value {
        let mut doc = serde_json::Map::new();
        match &self.area {
            Some(AreaFilter::Areas { kind, ids }) => {
                doc.insert(kind.search_key().to_string(), json!(ids));
            }
            Some(AreaFilter::BoundingBox { srid, bbox }) => {
                doc.insert("srid".to_string(), json!(srid));
                doc.insert(
                    "kartutsnitt".to_string(),
                    json!(format!(
                        "{},{},{},{}",
                        bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax
                    )),
                );
            }
            None => {}
        }
        if !self.routes.is_empty() {
            let quoted = self
                .routes
                .iter()
                .map(|route| format!("\"{route}\""))
                .collect::<Vec<_>>();
            doc.insert("riksvegrute".to_string(), json!(quoted));
        }
        Value::Object(doc)
    }
}

/// One entry of the `objektTyper` list of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTypeFilter {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_since: Option<String>,
}

impl ObjectTypeFilter {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            count: None,
            start: None,
            modified_since: None,
        }
    }

    /// Exactly one object type per fetch; anything else is a configuration error.
    pub fn single(filters: &[ObjectTypeFilter]) -> Result<&ObjectTypeFilter, SyncError> {
        match filters {
            [only] => Ok(only),
            [] => Err(SyncError::Configuration(
                "an object type must be specified".to_string(),
            )),
            _ => Err(SyncError::Configuration(format!(
                "too many object types in search: {}",
                filters.len()
            ))),
        }
    }
}
