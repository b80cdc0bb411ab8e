//! Incremental update of an existing table: deletions from the remote change
//! log, then updates and inserts from a modified-since search.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{Location, ObjectId, ObjectTypeFilter};
use crate::error::SyncError;
use crate::fetch::{FetchCursor, RowBuilder, SearchQuery, request_page};
use crate::http::CatalogClient;
use crate::schema::Schema;
use crate::sink::{Row, Sink};

/// Parse a catalog timestamp and normalise it to UTC.
///
/// Accepts `YYYY-MM-DDTHH:MM:SS` (optionally with fractional seconds) or a
/// bare date, followed by `Z`, `±HHMM`, `±HH:MM` or nothing. Without a suffix
/// `default_offset_minutes` applies.
pub fn parse_timestamp(text: &str, default_offset_minutes: i32) -> Result<DateTime<Utc>, SyncError> {
    let invalid = || SyncError::InvalidTimestamp(text.to_string());
    let trimmed = text.trim();
    let (local, offset_minutes) = split_offset(trimmed).ok_or_else(invalid)?;
    let offset_minutes = offset_minutes.unwrap_or(default_offset_minutes);

    let naive = NaiveDateTime::parse_from_str(local, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(local, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(invalid)?;
    let offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(invalid)?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|instant| instant.with_timezone(&Utc))
        .ok_or_else(invalid)
}

/// Split off a zone suffix. `Some((local, None))` when there is none.
fn split_offset(text: &str) -> Option<(&str, Option<i32>)> {
    if let Some(local) = text.strip_suffix('Z') {
        return Some((local, Some(0)));
    }
    // Only look past the time separator; the date itself contains '-'.
    let Some(time_start) = text.find('T').or_else(|| text.find(' ')) else {
        return Some((text, None));
    };
    let Some(sign_at) = text[time_start..]
        .rfind(['+', '-'])
        .map(|index| index + time_start)
    else {
        return Some((text, None));
    };
    let sign = if text[sign_at..].starts_with('-') { -1 } else { 1 };
    let digits: String = text[sign_at + 1..].chars().filter(|ch| *ch != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some((&text[..sign_at], Some(sign * (hours * 60 + minutes))))
}

/// Identities deleted remotely at or after `since` (all deletions without a watermark).
pub fn fetch_deleted<C: CatalogClient + ?Sized>(
    client: &C,
    config: &Config,
    object_type: i64,
    since: Option<&str>,
) -> Result<HashSet<ObjectId>, SyncError> {
    let keys = &config.response_keys;
    let watermark = since
        .map(|since| parse_timestamp(since, config.default_utc_offset_minutes))
        .transpose()?;

    let mut deleted = HashSet::new();
    let mut path = config.deleted_path(object_type);
    let mut query = vec![(
        "rows".to_string(),
        config.deleted_rows_per_request.to_string(),
    )];
    loop {
        let response = client.get(&path, &query)?;
        let transactions = response
            .get(&keys.transactions)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for transaction in transactions {
            let kind = transaction.get(&keys.transaction_type).and_then(Value::as_str);
            if kind != Some(config.delete_transaction_type.as_str()) {
                continue;
            }
            let Some(id) = transaction
                .get(&keys.transaction_object)
                .and_then(ObjectId::from_json)
            else {
                continue;
            };
            if let Some(watermark) = watermark {
                let date = transaction
                    .get(&keys.transaction_date)
                    .and_then(Value::as_str)
                    .map(|date| parse_timestamp(date, config.default_utc_offset_minutes));
                match date {
                    Some(Ok(date)) if date >= watermark => {}
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(%id, error = %err, "deletion with unreadable date skipped");
                        continue;
                    }
                    None => continue,
                }
            }
            deleted.insert(id);
        }

        // A page without transactions ends the log even if it links onwards.
        if transactions.is_empty() {
            break;
        }
        let next = response
            .get(&keys.transactions_next)
            .and_then(Value::as_str)
            .filter(|next| !next.is_empty() && *next != path);
        match next {
            Some(next) => {
                path = next.to_string();
                // The next link carries its own query.
                query.clear();
            }
            None => break,
        }
    }
    debug!(object_type, count = deleted.len(), "remote deletions");
    Ok(deleted)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub deletes: Vec<ObjectId>,
    pub updates: Vec<(ObjectId, Row)>,
    pub inserts: Vec<(ObjectId, Row)>,
}

/// Sort a fetched batch against the local identities.
///
/// A local row in `deleted` is deleted and nothing else; otherwise a matching
/// fetched record updates it. Fetched records matching no local row are new.
pub fn classify(
    local: &[ObjectId],
    deleted: &HashSet<ObjectId>,
    batch: Vec<(ObjectId, Row)>,
) -> ReconcilePlan {
    let mut pending: BTreeMap<ObjectId, Row> = batch.into_iter().collect();
    let mut plan = ReconcilePlan::default();
    for id in local {
        if deleted.contains(id) {
            plan.deletes.push(*id);
            continue;
        }
        if let Some(row) = pending.remove(id) {
            plan.updates.push((*id, row));
        }
    }
    plan.inserts = pending.into_iter().collect();
    plan
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub deleted: u64,
    pub updated: u64,
    pub inserted: u64,
    pub inserted_ids: Vec<ObjectId>,
}

impl ReconciliationResult {
    pub fn merge(&mut self, other: ReconciliationResult) {
        self.deleted += other.deleted;
        self.updated += other.updated;
        self.inserted += other.inserted;
        self.inserted_ids.extend(other.inserted_ids);
    }
}

/// Apply a plan; a row the sink rejects is logged and skipped.
pub fn apply<S: Sink + ?Sized>(sink: &mut S, table: &str, plan: ReconcilePlan) -> ReconciliationResult {
    let mut result = ReconciliationResult::default();
    for id in plan.deletes {
        match sink.delete_row(table, id) {
            Ok(()) => result.deleted += 1,
            Err(err) => warn!(%id, error = %err, "delete failed"),
        }
    }
    for (id, row) in plan.updates {
        match sink.update_row(table, id, row) {
            Ok(()) => result.updated += 1,
            Err(err) => warn!(%id, error = %err, "update failed"),
        }
    }
    for (id, row) in plan.inserts {
        match sink.insert_row(table, row) {
            Ok(()) => {
                result.inserted += 1;
                result.inserted_ids.push(id);
            }
            Err(err) => warn!(%id, error = %err, "insert failed"),
        }
    }
    result
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub location: Option<Location>,
    pub page_size: Option<u64>,
    pub modified_since: Option<String>,
}

pub struct UpdateEngine<'a, C: CatalogClient, S: Sink + ?Sized> {
    config: &'a Config,
    client: &'a C,
    sink: &'a mut S,
}

impl<'a, C: CatalogClient, S: Sink + ?Sized> UpdateEngine<'a, C, S> {
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
        table: &str,
        filter: &ObjectTypeFilter,
        options: &UpdateOptions,
    ) -> Result<ReconciliationResult, SyncError> {
        if !self.sink.table_exists(table) {
            return Err(SyncError::NotFound(format!("table {table}")));
        }
        let since = options
            .modified_since
            .clone()
            .or_else(|| filter.modified_since.clone())
            .or_else(|| self.config.modified_since.clone());
        if let Some(since) = &since {
            parse_timestamp(since, self.config.default_utc_offset_minutes)?;
        }

        info!(table, since = ?since, "updating table");
        let mut deleted = fetch_deleted(self.client, self.config, schema.object_type, since.as_deref())?;
        let search = SearchQuery {
            location: options.location.clone(),
            modified_since: since,
            ..SearchQuery::new(filter)
        };
        let page_size = options.page_size.unwrap_or(self.config.page_size);
        let mut cursor = FetchCursor::new(filter.count, filter.start.clone(), page_size);
        let rows = RowBuilder::new(self.config, schema.geometry, self.sink.columns(table)?);

        let mut result = ReconciliationResult::default();
        loop {
            let page = request_page(self.client, self.config, &search, &mut cursor)?;
            let batch = page
                .objects
                .iter()
                .filter_map(|object| match rows.build(object) {
                    (Some(id), row) => Some((id, row)),
                    (None, _) => {
                        warn!("object without identity skipped");
                        None
                    }
                })
                .collect();
            let local = self.sink.existing_identities(table)?;
            let plan = classify(&local, &deleted, batch);
            result.merge(apply(&mut *self.sink, table, plan));
            // Deletions apply once per run, on the first page.
            deleted.clear();

            if page.returned == 0 {
                break;
            }
            cursor.advance(&page);
            if cursor.is_done() {
                break;
            }
        }
        info!(
            table,
            deleted = result.deleted,
            updated = result.updated,
            inserted = result.inserted,
            "update finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn utc(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    #[test]
    fn offsets_normalise_to_utc() {
        assert_eq!(
            parse_timestamp("2020-05-01T12:00:00+0200", 60).unwrap(),
            utc("2020-05-01T10:00:00Z")
        );
        assert_eq!(
            parse_timestamp("2020-05-01T12:00:00+02:00", 60).unwrap(),
            utc("2020-05-01T10:00:00Z")
        );
        assert_eq!(
            parse_timestamp("2020-05-01T12:00:00-01:30", 60).unwrap(),
            utc("2020-05-01T13:30:00Z")
        );
        assert_eq!(
            parse_timestamp("2020-05-01T12:00:00Z", 60).unwrap(),
            utc("2020-05-01T12:00:00Z")
        );
    }

    #[test]
    fn missing_suffix_uses_default_offset() {
        assert_eq!(
            parse_timestamp("2020-05-01T12:00:00", 60).unwrap(),
            utc("2020-05-01T11:00:00Z")
        );
        assert_eq!(parse_timestamp("2020-05-01", 0).unwrap(), utc("2020-05-01T00:00:00Z"));
    }

    #[test]
    fn malformed_timestamps_are_rejected() {
        assert_matches!(parse_timestamp("i går", 60), Err(SyncError::InvalidTimestamp(_)));
        assert_matches!(
            parse_timestamp("2020-05-01T12:00:00+2", 60),
            Err(SyncError::InvalidTimestamp(_))
        );
    }

    #[test]
    fn classify_splits_delete_update_insert() {
        let local = [ObjectId(1), ObjectId(2), ObjectId(3)];
        let deleted = HashSet::from([ObjectId(2)]);
        let batch = vec![(ObjectId(3), Row::new()), (ObjectId(4), Row::new())];
        let plan = classify(&local, &deleted, batch);
        assert_eq!(plan.deletes, vec![ObjectId(2)]);
        assert_eq!(plan.updates.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![ObjectId(3)]);
        assert_eq!(plan.inserts.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![ObjectId(4)]);
    }

    #[test]
    fn deleted_row_is_not_also_updated() {
        let local = [ObjectId(5)];
        let deleted = HashSet::from([ObjectId(5)]);
        let plan = classify(&local, &deleted, vec![(ObjectId(5), Row::new())]);
        assert_eq!(plan.deletes, vec![ObjectId(5)]);
        assert!(plan.updates.is_empty());
    }
}
