//! Destination tables for fetched road objects.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::Utf8Path;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::{GeometryKind, ObjectId, StorageType};
use crate::error::SyncError;
use crate::geometry::Wkt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellValue {
    Null,
    Long(i64),
    Double(f64),
    Text(String),
    Date(NaiveDateTime),
}

impl CellValue {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            CellValue::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Column name to value.
pub type Row = BTreeMap<String, CellValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub storage: StorageType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub geometry: GeometryKind,
    pub geometry_column: String,
    pub identity_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedValueDomain {
    pub name: String,
    pub description: String,
    pub storage: StorageType,
    pub values: BTreeMap<i64, String>,
}

/// Table operations the sync needs from its destination.
///
/// Rows are addressed by the stable object identity held in the table's
/// identity column.
pub trait Sink {
    fn table_exists(&self, table: &str) -> bool;
    fn create_table(&mut self, spec: &TableSpec) -> Result<(), SyncError>;
    fn drop_table(&mut self, table: &str) -> Result<(), SyncError>;
    fn table_spec(&self, table: &str) -> Result<TableSpec, SyncError>;
    fn add_column(&mut self, table: &str, column: &str, storage: StorageType) -> Result<(), SyncError>;
    fn columns(&self, table: &str) -> Result<Vec<ColumnSpec>, SyncError>;

    fn has_domain(&self, name: &str) -> bool;
    fn create_domain(&mut self, domain: CodedValueDomain) -> Result<(), SyncError>;
    fn assign_domain(&mut self, table: &str, column: &str, domain: &str) -> Result<(), SyncError>;

    fn insert_row(&mut self, table: &str, row: Row) -> Result<(), SyncError>;
    fn update_row(&mut self, table: &str, identity: ObjectId, row: Row) -> Result<(), SyncError>;
    fn delete_row(&mut self, table: &str, identity: ObjectId) -> Result<(), SyncError>;
    fn read_row(&self, table: &str, identity: ObjectId) -> Result<Option<Row>, SyncError>;
    fn existing_identities(&self, table: &str) -> Result<Vec<ObjectId>, SyncError>;
    fn row_count(&self, table: &str) -> Result<usize, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTable {
    pub spec: TableSpec,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub domains: BTreeMap<String, String>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn position(&self, identity: ObjectId) -> Option<usize> {
        let column = &self.spec.identity_column;
        self.rows
            .iter()
            .position(|row| row.get(column).and_then(CellValue::as_long) == Some(identity.0))
    }

    fn check_row(&self, row: &Row) -> Result<(), SyncError> {
        for column in row.keys() {
            let known = *column == self.spec.geometry_column
                || self.columns.iter().any(|spec| spec.name == *column);
            if !known {
                return Err(SyncError::Sink(format!(
                    "table {} has no column {column}",
                    self.spec.name
                )));
            }
        }
        if self.spec.geometry == GeometryKind::None {
            return Ok(());
        }
        let Some(text) = row.get(&self.spec.geometry_column).and_then(CellValue::as_text) else {
            return Ok(());
        };
        let wkt = Wkt::new(text);
        match wkt.geometry_kind() {
            Some(kind) if kind != self.spec.geometry => Err(SyncError::Sink(format!(
                "{} geometry does not fit {} table {}",
                kind, self.spec.geometry, self.spec.name
            ))),
            _ => wkt.is_consistent().and_then(|consistent| {
                if consistent {
                    Ok(())
                } else {
                    Err(SyncError::CorruptGeometry(text.to_string()))
                }
            }),
        }
    }
}

/// Sink held in memory and persisted as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySink {
    #[serde(default)]
    pub tables: BTreeMap<String, MemoryTable>,
    #[serde(default)]
    pub domains: BTreeMap<String, CodedValueDomain>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Utf8Path) -> Result<Self, SyncError> {
        let content = fs::read_to_string(path)
            .map_err(|err| SyncError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| SyncError::Filesystem(format!("parse {path}: {err}")))
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn open(path: &Utf8Path) -> Result<Self, SyncError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Write through a temporary file in the same directory, then rename.
    pub fn save(&self, path: &Utf8Path) -> Result<(), SyncError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".nvdb-sync")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.write_all(&bytes)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("write {path}: {}", err.error)))?;
        Ok(())
    }

    pub fn table(&self, table: &str) -> Result<&MemoryTable, SyncError> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::NotFound(format!("table {table}")))
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut MemoryTable, SyncError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NotFound(format!("table {table}")))
    }

    pub fn rows(&self, table: &str) -> Result<&[Row], SyncError> {
        Ok(&self.table(table)?.rows)
    }

    pub fn row(&self, table: &str, identity: ObjectId) -> Option<&Row> {
        let table = self.tables.get(table)?;
        table.position(identity).map(|index| &table.rows[index])
    }
}

impl Sink for MemorySink {
    fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), SyncError> {
        if self.tables.contains_key(&spec.name) {
            return Err(SyncError::AlreadyExists(format!("table {}", spec.name)));
        }
        self.tables.insert(
            spec.name.clone(),
            MemoryTable {
                spec: spec.clone(),
                columns: Vec::new(),
                domains: BTreeMap::new(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> Result<(), SyncError> {
        self.tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(format!("table {table}")))
    }

    fn table_spec(&self, table: &str) -> Result<TableSpec, SyncError> {
        Ok(self.table(table)?.spec.clone())
    }

    fn add_column(&mut self, table: &str, column: &str, storage: StorageType) -> Result<(), SyncError> {
        let table = self.table_mut(table)?;
        if table.columns.iter().any(|spec| spec.name == column) {
            return Err(SyncError::AlreadyExists(format!("column {column}")));
        }
        table.columns.push(ColumnSpec {
            name: column.to_string(),
            storage: storage.column_type(),
        });
        Ok(())
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnSpec>, SyncError> {
        Ok(self.table(table)?.columns.clone())
    }

    fn has_domain(&self, name: &str) -> bool {
        self.domains.contains_key(name)
    }

    fn create_domain(&mut self, domain: CodedValueDomain) -> Result<(), SyncError> {
        if self.domains.contains_key(&domain.name) {
            return Err(SyncError::AlreadyExists(format!("domain {}", domain.name)));
        }
        self.domains.insert(domain.name.clone(), domain);
        Ok(())
    }

    fn assign_domain(&mut self, table: &str, column: &str, domain: &str) -> Result<(), SyncError> {
        if !self.domains.contains_key(domain) {
            return Err(SyncError::NotFound(format!("domain {domain}")));
        }
        let table = self.table_mut(table)?;
        if !table.columns.iter().any(|spec| spec.name == column) {
            return Err(SyncError::NotFound(format!("column {column}")));
        }
        table.domains.insert(column.to_string(), domain.to_string());
        Ok(())
    }

    fn insert_row(&mut self, table: &str, row: Row) -> Result<(), SyncError> {
        let table = self.table_mut(table)?;
        table.check_row(&row)?;
        let identity = row
            .get(&table.spec.identity_column)
            .and_then(CellValue::as_long)
            .ok_or_else(|| SyncError::Sink(format!("row without {}", table.spec.identity_column)))?;
        if table.position(ObjectId(identity)).is_some() {
            return Err(SyncError::AlreadyExists(format!("object {identity}")));
        }
        table.rows.push(row);
        Ok(())
    }

    fn update_row(&mut self, table: &str, identity: ObjectId, row: Row) -> Result<(), SyncError> {
        let table = self.table_mut(table)?;
        table.check_row(&row)?;
        let index = table
            .position(identity)
            .ok_or_else(|| SyncError::NotFound(format!("object {identity}")))?;
        table.rows[index].extend(row);
        Ok(())
    }

    fn delete_row(&mut self, table: &str, identity: ObjectId) -> Result<(), SyncError> {
        let table = self.table_mut(table)?;
        let index = table
            .position(identity)
            .ok_or_else(|| SyncError::NotFound(format!("object {identity}")))?;
        table.rows.remove(index);
        Ok(())
    }

    fn read_row(&self, table: &str, identity: ObjectId) -> Result<Option<Row>, SyncError> {
        let table = self.table(table)?;
        Ok(table.position(identity).map(|index| table.rows[index].clone()))
    }

    fn existing_identities(&self, table: &str) -> Result<Vec<ObjectId>, SyncError> {
        let table = self.table(table)?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.get(&table.spec.identity_column).and_then(CellValue::as_long))
            .map(ObjectId)
            .collect())
    }

    fn row_count(&self, table: &str) -> Result<usize, SyncError> {
        Ok(self.table(table)?.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn line_table() -> MemorySink {
        let mut sink = MemorySink::new();
        sink.create_table(&TableSpec {
            name: "fartsgrense".to_string(),
            geometry: GeometryKind::Line,
            geometry_column: "SHAPE@WKT".to_string(),
            identity_column: "nvdb_id".to_string(),
        })
        .unwrap();
        sink.add_column("fartsgrense", "nvdb_id", StorageType::Long).unwrap();
        sink
    }

    fn row(id: i64, wkt: &str) -> Row {
        Row::from([
            ("nvdb_id".to_string(), CellValue::Long(id)),
            ("SHAPE@WKT".to_string(), CellValue::Text(wkt.to_string())),
        ])
    }

    #[test]
    fn rejects_wrong_geometry_kind_and_duplicates() {
        let mut sink = line_table();
        sink.insert_row("fartsgrense", row(1, "LINESTRING (1 2, 3 4)")).unwrap();
        assert_matches!(
            sink.insert_row("fartsgrense", row(2, "POINT (1 2)")),
            Err(SyncError::Sink(_))
        );
        assert_matches!(
            sink.insert_row("fartsgrense", row(1, "LINESTRING EMPTY")),
            Err(SyncError::AlreadyExists(_))
        );
        assert_eq!(sink.existing_identities("fartsgrense").unwrap(), vec![ObjectId(1)]);
    }

    #[test]
    fn update_and_delete_by_identity() {
        let mut sink = line_table();
        sink.insert_row("fartsgrense", row(7, "LINESTRING (1 2, 3 4)")).unwrap();
        sink.update_row("fartsgrense", ObjectId(7), row(7, "LINESTRING (5 6, 7 8)"))
            .unwrap();
        assert_eq!(
            sink.row("fartsgrense", ObjectId(7)).unwrap()["SHAPE@WKT"],
            CellValue::Text("LINESTRING (5 6, 7 8)".to_string())
        );
        sink.delete_row("fartsgrense", ObjectId(7)).unwrap();
        assert_eq!(sink.row_count("fartsgrense").unwrap(), 0);
    }

    #[test]
    fn save_and_load_through_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("data.json")).unwrap();
        let mut sink = line_table();
        sink.insert_row("fartsgrense", row(3, "LINESTRING (1 2, 3 4)")).unwrap();
        sink.save(&path).unwrap();
        assert_eq!(MemorySink::load(&path).unwrap(), sink);
    }
}
