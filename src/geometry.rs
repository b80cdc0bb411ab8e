//! WKT tag/dimension consistency.
//!
//! The remote service sometimes labels 3D coordinates as plain `POINT`, or
//! tags 2D coordinates with `Z`. [`repair_wkt`] rewrites the tag so that it
//! matches the coordinates, and leaves the text untouched when it cannot.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::GeometryKind;
use crate::error::SyncError;
use crate::flatten::Record;

static COORDINATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d*)?").unwrap());

const BASE_TAGS: [&str; 3] = ["POINT", "LINESTRING", "POLYGON"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wkt {
    text: String,
}

impl Wkt {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Everything before the first `(`, trimmed.
    pub fn tag(&self) -> &str {
        match self.text.split_once('(') {
            Some((tag, _)) => tag.trim(),
            None => self.text.trim(),
        }
    }

    fn coordinates(&self) -> &str {
        self.text
            .split_once('(')
            .map(|(_, rest)| rest)
            .unwrap_or_default()
    }

    fn tag_parts(&self) -> Vec<&str> {
        self.tag().split_whitespace().collect()
    }

    pub fn is_empty(&self, empty_marker: &str) -> bool {
        self.text.trim_end().ends_with(empty_marker)
    }

    pub fn has_known_geometry_type(&self) -> bool {
        self.geometry_kind().is_some()
    }

    pub fn geometry_kind(&self) -> Option<GeometryKind> {
        let base = self.tag_parts().first().copied()?;
        BASE_TAGS
            .iter()
            .rev()
            .find(|tag| base.contains(*tag))
            .and_then(|tag| GeometryKind::from_wkt_tag(tag))
    }

    /// Common number of values per coordinate tuple; `None` without coordinates.
    pub fn dimension(&self) -> Result<Option<usize>, SyncError> {
        let counts: BTreeSet<usize> = self
            .coordinates()
            .split(',')
            .filter(|tuple| !tuple.trim().is_empty())
            .map(|tuple| COORDINATE.find_iter(tuple).count())
            .collect();
        match counts.len() {
            0 => Ok(None),
            1 => Ok(counts.into_iter().next()),
            _ => Err(SyncError::CorruptGeometry(format!(
                "mixed coordinate dimensions {counts:?} in {}",
                self.text
            ))),
        }
    }

    /// Dimension implied by the tag: `POINT` is 2, `POINT Z` is 3, `POINT ZM` is 4.
    pub fn tag_dimension(&self) -> Result<usize, SyncError> {
        match self.tag_parts().as_slice() {
            [_] => Ok(2),
            [_, extra] => Ok(2 + extra.chars().count()),
            _ => Err(SyncError::CorruptGeometry(format!(
                "unparseable geometry tag {:?}",
                self.tag()
            ))),
        }
    }

    /// Suffix to append when the tag claims one dimension too few.
    pub fn next_extra(&self) -> Result<&'static str, SyncError> {
        match self.tag_dimension()? {
            2 => Ok(" Z"),
            3 => match self.tag_parts().get(1).copied() {
                Some("Z") => Ok("M"),
                _ => Ok("Z"),
            },
            _ => Err(SyncError::CorruptGeometry(format!(
                "no extra dimension left for {:?}",
                self.tag()
            ))),
        }
    }

    pub fn is_consistent(&self) -> Result<bool, SyncError> {
        match self.dimension()? {
            Some(dimension) => Ok(dimension == self.tag_dimension()?),
            None => Ok(true),
        }
    }

    fn repaired_tag(&self, dimension: usize) -> Result<Option<String>, SyncError> {
        let tag_dimension = self.tag_dimension()?;
        if !(2..=4).contains(&dimension) {
            info!(dimension, "geometry dimension out of range, tag left as is");
            return Ok(None);
        }
        let parts = self.tag_parts();
        let Some(base) = parts.first() else {
            return Ok(None);
        };
        if dimension > tag_dimension {
            return Ok(Some(format!("{}{}", self.tag(), self.next_extra()?)));
        }
        // Fewer values than the tag claims: drop the surplus letters.
        let tag = match (dimension, parts.get(1)) {
            (2, _) | (_, None) => base.to_string(),
            (_, Some(extra)) => {
                let keep: String = extra.chars().take(dimension - 2).collect();
                format!("{base} {keep}")
            }
        };
        Ok(Some(tag))
    }

    fn try_repair(&mut self) -> Result<(), SyncError> {
        let Some(dimension) = self.dimension()? else {
            return Ok(());
        };
        if dimension == self.tag_dimension()? {
            return Ok(());
        }
        let original = self.text.clone();
        let Some(tag) = self.repaired_tag(dimension)? else {
            return Ok(());
        };
        self.text = original.replacen(self.tag(), &tag, 1);
        if !matches!(self.is_consistent(), Ok(true)) {
            debug!(wkt = %original, "could not repair geometry");
            self.text = original;
        }
        Ok(())
    }

    /// Rewrite the tag to match the coordinates. Never fails; on any
    /// inconsistency that cannot be fixed the text is left unchanged.
    pub fn repair(&mut self) {
        let original = self.text.clone();
        if let Err(err) = self.try_repair() {
            debug!(wkt = %original, error = %err, "geometry left unrepaired");
            self.text = original;
        }
    }
}

/// Repair a WKT string, returning the original text when nothing applies.
pub fn repair_wkt(text: &str, empty_marker: &str) -> String {
    let mut wkt = Wkt::new(text);
    if wkt.is_empty(empty_marker) {
        return wkt.into_string();
    }
    wkt.repair();
    wkt.into_string()
}

/// Explicit empty geometry of the given kind, e.g. `POINT EMPTY`.
pub fn empty_placeholder(kind: GeometryKind, empty_marker: &str) -> Option<String> {
    kind.wkt_tag().map(|tag| format!("{tag} {empty_marker}"))
}

/// Ensure a record of a geometry-bearing type carries a geometry field.
/// Returns `false` for types without geometry.
pub fn ensure_geometry(
    record: &mut Record,
    geometry_field: &str,
    kind: GeometryKind,
    empty_marker: &str,
) -> bool {
    let Some(placeholder) = empty_placeholder(kind, empty_marker) else {
        return false;
    };
    let missing = matches!(record.get(geometry_field), None | Some(Value::Null));
    if missing {
        record.insert(geometry_field.to_string(), Value::String(placeholder));
    }
    true
}

/// Repair the geometry field of a record in place.
pub fn repair_record(record: &mut Record, geometry_field: &str, empty_marker: &str) {
    if let Some(Value::String(text)) = record.get_mut(geometry_field) {
        *text = repair_wkt(text, empty_marker);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    const EMPTY: &str = "EMPTY";

    #[test]
    fn point_with_three_values_gains_z() {
        assert_eq!(
            repair_wkt("POINT (-35727.49 6577178.65 11.1)", EMPTY),
            "POINT Z (-35727.49 6577178.65 11.1)"
        );
    }

    #[test]
    fn linestring_z_with_pairs_loses_z() {
        assert_eq!(
            repair_wkt("LINESTRING Z (-32206.59 6737377.3, -32207 6737378.9)", EMPTY),
            "LINESTRING (-32206.59 6737377.3, -32207 6737378.9)"
        );
        assert_eq!(
            repair_wkt("POINT Z (-35727.48 6577178.65)", EMPTY),
            "POINT (-35727.48 6577178.65)"
        );
    }

    #[test]
    fn z_then_m_are_added() {
        assert_eq!(repair_wkt("POINT Z (1 2 3 4)", EMPTY), "POINT ZM (1 2 3 4)");
    }

    #[test]
    fn consistent_geometry_is_idempotent() {
        for text in [
            "POINT (1 2)",
            "LINESTRING Z (1 2 3, 4 5 6)",
            "POLYGON ((1 2, 3 4, 5 6, 1 2))",
            "POINT EMPTY",
        ] {
            let once = repair_wkt(text, EMPTY);
            assert_eq!(once, text);
            assert_eq!(repair_wkt(&once, EMPTY), once);
        }
    }

    #[test]
    fn mixed_tuples_are_corrupt_and_untouched() {
        let text = "LINESTRING (1 2, 3 4 5)";
        assert_matches!(Wkt::new(text).dimension(), Err(SyncError::CorruptGeometry(_)));
        assert_eq!(repair_wkt(text, EMPTY), text);
    }

    #[test]
    fn malformed_tag_is_corrupt() {
        let wkt = Wkt::new("POINT Z M (1 2 3 4)");
        assert_matches!(wkt.tag_dimension(), Err(SyncError::CorruptGeometry(_)));
        assert_eq!(repair_wkt(wkt.as_str(), EMPTY), "POINT Z M (1 2 3 4)");
    }

    #[test]
    fn out_of_range_dimension_is_left_alone() {
        assert_eq!(repair_wkt("POINT (1 2 3 4 5)", EMPTY), "POINT (1 2 3 4 5)");
        assert_eq!(repair_wkt("POINT Z (1)", EMPTY), "POINT Z (1)");
    }

    #[test]
    fn geometry_kind_from_tag() {
        assert_eq!(Wkt::new("MULTIPOINT Z (1 2 3)").geometry_kind(), Some(GeometryKind::Point));
        assert_eq!(Wkt::new("LINESTRING (1 2, 3 4)").geometry_kind(), Some(GeometryKind::Line));
        assert!(!Wkt::new("CIRCLE (1 2)").has_known_geometry_type());
    }

    #[test]
    fn missing_geometry_gets_placeholder() {
        let mut record = Record::new();
        assert!(ensure_geometry(&mut record, "SHAPE@WKT", GeometryKind::Line, EMPTY));
        assert_eq!(record["SHAPE@WKT"], json!("LINESTRING EMPTY"));

        let mut record = Record::new();
        assert!(!ensure_geometry(&mut record, "SHAPE@WKT", GeometryKind::None, EMPTY));
        assert!(record.is_empty());
    }
}
