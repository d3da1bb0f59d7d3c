//! Bundled [`VersionStore`] implementations.
//!
//! [`MemoryStore`] is the reference semantics: plain rows behind a mutex,
//! used by tests and ephemeral workloads. [`RedbStore`] is the durable
//! store: one redb table holding every logical version table, composite
//! string keys, and flat JSON row values keyed by column name, the same
//! shape the rows would have in a relational version table.

use crate::{
    EntityKey, Result, TableDescriptor, TidemarkError, VersionRecord, VersionStore, VersionUpdate,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

impl From<redb::DatabaseError> for TidemarkError {
    fn from(e: redb::DatabaseError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for TidemarkError {
    fn from(e: redb::TransactionError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for TidemarkError {
    fn from(e: redb::TableError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for TidemarkError {
    fn from(e: redb::StorageError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for TidemarkError {
    fn from(e: redb::CommitError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}

/// Merge one computed patch into a stored row.
///
/// Boundary writes overwrite; flag writes are set-only (`true` never goes
/// back to absent/false through the backfill).
fn apply_update(record: &mut VersionRecord, update: &VersionUpdate) {
    if let Some(boundary) = update.end_transaction_id {
        record.end_transaction_id = Some(boundary);
    }
    for (column, set) in &update.change_flags {
        if *set {
            record.change_flags.insert(column.clone(), true);
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory version store.
///
/// Rows are kept in insertion order per logical table, so a broken write
/// path (duplicate transaction ids) is representable and surfaces through
/// the resolvers' integrity checks instead of being masked by a keyed map.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<VersionRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one version row, as the live write path would.
    pub fn insert_row(&self, table: &TableDescriptor, record: VersionRecord) -> Result<()> {
        if record.key.0.len() != table.key_columns.len() {
            return Err(TidemarkError::MalformedRow(format!(
                "entity key {} has {} parts but table {:?} declares {} key columns",
                record.key,
                record.key.0.len(),
                table.name,
                table.key_columns.len()
            )));
        }
        self.lock()?.entry(table.name.clone()).or_default().push(record);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<VersionRecord>>>> {
        self.tables
            .lock()
            .map_err(|_| TidemarkError::Storage("memory store lock poisoned".into()))
    }
}

impl VersionStore for MemoryStore {
    fn entity_keys(&self, table: &TableDescriptor) -> Result<Vec<EntityKey>> {
        let tables = self.lock()?;
        let keys: BTreeSet<EntityKey> = tables
            .get(&table.name)
            .map(|rows| rows.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default();
        Ok(keys.into_iter().collect())
    }

    fn ordered_versions(
        &self,
        table: &TableDescriptor,
        key: &EntityKey,
    ) -> Result<Vec<VersionRecord>> {
        let tables = self.lock()?;
        let mut versions: Vec<VersionRecord> = tables
            .get(&table.name)
            .map(|rows| rows.iter().filter(|r| r.key == *key).cloned().collect())
            .unwrap_or_default();
        // Stable sort: duplicate transaction ids stay adjacent and in
        // insertion order for the integrity check to report.
        versions.sort_by_key(|r| r.transaction_id);
        Ok(versions)
    }

    fn write_batch(&self, table: &TableDescriptor, updates: &[VersionUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tables = self.lock()?;
        let rows = tables.get_mut(&table.name).ok_or_else(|| {
            TidemarkError::Storage(format!("unknown table {:?}", table.name))
        })?;

        // Resolve every target before mutating anything: the batch fails as
        // a unit, leaving all rows untouched.
        let mut targets = Vec::with_capacity(updates.len());
        for update in updates {
            let index = rows
                .iter()
                .position(|r| r.key == update.key && r.transaction_id == update.transaction_id)
                .ok_or_else(|| {
                    TidemarkError::Storage(format!(
                        "no row with primary key {}@{} in table {:?}",
                        update.key, update.transaction_id, table.name
                    ))
                })?;
            targets.push(index);
        }
        for (index, update) in targets.into_iter().zip(updates) {
            apply_update(&mut rows[index], update);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// redb store
// ---------------------------------------------------------------------------

/// Composite string key: `"{table}\u{1f}{json(entity_key)}\u{1f}{tx:020}"`.
///
/// The entity key is JSON-encoded, and serde_json escapes control
/// characters inside strings, so the `\u{1f}` separator cannot collide with
/// key content. The zero-padded transaction id makes lexicographic order
/// equal numeric order, so redb's sorted iteration delivers each entity's
/// history ascending for free.
const VERSIONS: TableDefinition<&str, &str> = TableDefinition::new("versions");

const SEP: char = '\u{1f}';

/// Durable version store backed by `redb`.
///
/// All writes are ACID; `write_batch` applies one batch inside one write
/// transaction, so a failed batch rolls back as a unit. The database file
/// uses the `.tidemark` extension by convention.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(VERSIONS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Append one version row, as the live write path would.
    pub fn insert_row(&self, table: &TableDescriptor, record: VersionRecord) -> Result<()> {
        let storage_key = row_key(table, &record.key, record.transaction_id)?;
        let value = serde_json::to_string(&JsonValue::Object(row_to_json(table, &record)?))?;
        let write_txn = self.db.begin_write()?;
        {
            let mut versions = write_txn.open_table(VERSIONS)?;
            versions.insert(storage_key.as_str(), value.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl VersionStore for RedbStore {
    fn entity_keys(&self, table: &TableDescriptor) -> Result<Vec<EntityKey>> {
        let read_txn = self.db.begin_read()?;
        let versions = read_txn.open_table(VERSIONS)?;
        let prefix = table_prefix(table);
        let mut keys = BTreeSet::new();

        for entry in versions.iter()? {
            let (k, _v) = entry?;
            let raw = k.value();
            let Some(rest) = raw.strip_prefix(&prefix) else {
                continue;
            };
            let Some((encoded, _tx)) = rest.rsplit_once(SEP) else {
                return Err(TidemarkError::MalformedRow(format!(
                    "undecodable storage key {raw:?}"
                )));
            };
            keys.insert(serde_json::from_str::<EntityKey>(encoded)?);
        }

        Ok(keys.into_iter().collect())
    }

    fn ordered_versions(
        &self,
        table: &TableDescriptor,
        key: &EntityKey,
    ) -> Result<Vec<VersionRecord>> {
        let read_txn = self.db.begin_read()?;
        let versions = read_txn.open_table(VERSIONS)?;
        let prefix = entity_prefix(table, key)?;
        let mut out = Vec::new();

        // redb iterates keys in sorted order, which is ascending transaction
        // order within one entity prefix.
        for entry in versions.iter()? {
            let (k, v) = entry?;
            if k.value().starts_with(&prefix) {
                let row: JsonMap<String, JsonValue> = serde_json::from_str(v.value())?;
                out.push(row_from_json(table, &row)?);
            }
        }

        Ok(out)
    }

    fn write_batch(&self, table: &TableDescriptor, updates: &[VersionUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut versions = write_txn.open_table(VERSIONS)?;
            for update in updates {
                let storage_key = row_key(table, &update.key, update.transaction_id)?;
                let existing: Option<String> = versions
                    .get(storage_key.as_str())?
                    .map(|guard| guard.value().to_string());
                let Some(raw) = existing else {
                    // Dropping write_txn rolls the whole batch back.
                    return Err(TidemarkError::Storage(format!(
                        "no row with primary key {}@{} in table {:?}",
                        update.key, update.transaction_id, table.name
                    )));
                };
                let row: JsonMap<String, JsonValue> = serde_json::from_str(&raw)?;
                let mut record = row_from_json(table, &row)?;
                apply_update(&mut record, update);
                let value = serde_json::to_string(&JsonValue::Object(row_to_json(table, &record)?))?;
                versions.insert(storage_key.as_str(), value.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn table_prefix(table: &TableDescriptor) -> String {
    format!("{}{SEP}", table.name)
}

fn entity_prefix(table: &TableDescriptor, key: &EntityKey) -> Result<String> {
    Ok(format!(
        "{}{SEP}{}{SEP}",
        table.name,
        serde_json::to_string(key)?
    ))
}

fn row_key(table: &TableDescriptor, key: &EntityKey, transaction_id: u64) -> Result<String> {
    Ok(format!(
        "{}{transaction_id:020}",
        entity_prefix(table, key)?
    ))
}

/// Encode a record as a flat JSON row keyed by column names.
fn row_to_json(
    table: &TableDescriptor,
    record: &VersionRecord,
) -> Result<JsonMap<String, JsonValue>> {
    if record.key.0.len() != table.key_columns.len() {
        return Err(TidemarkError::MalformedRow(format!(
            "entity key {} has {} parts but table {:?} declares {} key columns",
            record.key,
            record.key.0.len(),
            table.name,
            table.key_columns.len()
        )));
    }
    let mut row = JsonMap::new();
    for (column, part) in table.key_columns.iter().zip(&record.key.0) {
        row.insert(column.clone(), serde_json::to_value(part)?);
    }
    row.insert(table.tx_column.clone(), JsonValue::from(record.transaction_id));
    row.insert(
        table.end_column.clone(),
        match record.end_transaction_id {
            Some(tx) => JsonValue::from(tx),
            None => JsonValue::Null,
        },
    );
    for (name, value) in &record.attributes {
        row.insert(name.clone(), serde_json::to_value(value)?);
    }
    for (column, set) in &record.change_flags {
        row.insert(column.clone(), JsonValue::Bool(*set));
    }
    Ok(row)
}

/// Decode a flat JSON row back into a record.
///
/// A boolean cell whose column name ends with the table's flag suffix is a
/// change flag; every other non-key, non-transaction cell is an attribute.
/// Attribute columns must therefore not combine a boolean type with a name
/// ending in the flag suffix.
fn row_from_json(
    table: &TableDescriptor,
    row: &JsonMap<String, JsonValue>,
) -> Result<VersionRecord> {
    let mut key_parts = Vec::with_capacity(table.key_columns.len());
    for column in &table.key_columns {
        let cell = row.get(column).ok_or_else(|| {
            TidemarkError::MalformedRow(format!("missing key column {column:?}"))
        })?;
        key_parts.push(serde_json::from_value(cell.clone())?);
    }

    let transaction_id = row
        .get(&table.tx_column)
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| {
            TidemarkError::MalformedRow(format!(
                "missing or non-integer column {:?}",
                table.tx_column
            ))
        })?;

    let end_transaction_id = match row.get(&table.end_column) {
        None | Some(JsonValue::Null) => None,
        Some(cell) => Some(cell.as_u64().ok_or_else(|| {
            TidemarkError::MalformedRow(format!(
                "non-integer value in column {:?}",
                table.end_column
            ))
        })?),
    };

    let mut attributes = BTreeMap::new();
    let mut change_flags = BTreeMap::new();
    for (name, cell) in row {
        if table.key_columns.contains(name) || *name == table.tx_column || *name == table.end_column
        {
            continue;
        }
        match cell.as_bool() {
            Some(flag) if name.ends_with(&table.flag_suffix) => {
                change_flags.insert(name.clone(), flag);
            }
            _ => {
                attributes.insert(name.clone(), serde_json::from_value(cell.clone())?);
            }
        }
    }

    Ok(VersionRecord {
        key: EntityKey(key_parts),
        transaction_id,
        end_transaction_id,
        attributes,
        change_flags,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn article_table() -> TableDescriptor {
        TableDescriptor::new("article_version", ["id"])
    }

    fn update(key: EntityKey, tx: u64, end: Option<u64>) -> VersionUpdate {
        VersionUpdate {
            key,
            transaction_id: tx,
            end_transaction_id: end,
            change_flags: BTreeMap::new(),
        }
    }

    #[test]
    fn memory_store_rejects_key_arity_mismatch() {
        let store = MemoryStore::new();
        let table = TableDescriptor::new("translation_version", ["id", "locale"]);
        let result = store.insert_row(&table, VersionRecord::new(EntityKey::single(1), 1));
        assert!(matches!(result, Err(TidemarkError::MalformedRow(_))));
    }

    #[test]
    fn memory_write_batch_fails_as_a_unit() {
        let store = MemoryStore::new();
        let table = article_table();
        store
            .insert_row(&table, VersionRecord::new(EntityKey::single(1), 1))
            .unwrap();

        let batch = vec![
            update(EntityKey::single(1), 1, Some(3)),
            update(EntityKey::single(99), 7, Some(8)), // no such row
        ];
        let err = store.write_batch(&table, &batch).unwrap_err();
        assert!(matches!(err, TidemarkError::Storage(_)));

        let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
        assert_eq!(
            rows[0].end_transaction_id, None,
            "the valid half of a failed batch must not be applied"
        );
    }

    #[test]
    fn redb_round_trips_attribute_types() {
        let store = RedbStore::open_in_memory().unwrap();
        let table = article_table();
        store
            .insert_row(
                &table,
                VersionRecord::new(EntityKey::single(1), 1)
                    .with_attribute("name", "A")
                    .with_attribute("rating", 4.5_f64)
                    .with_attribute("views", 10_i64)
                    .with_attribute("published", true)
                    .with_attribute("body", Value::Null),
            )
            .unwrap();

        let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attribute("name"), &Value::Text("A".into()));
        assert_eq!(rows[0].attribute("rating"), &Value::Float(4.5));
        assert_eq!(rows[0].attribute("views"), &Value::Int(10));
        assert_eq!(rows[0].attribute("published"), &Value::Boolean(true));
        assert_eq!(rows[0].attribute("body"), &Value::Null);
        assert_eq!(rows[0].attribute("missing"), &Value::Null);
    }

    #[test]
    fn redb_orders_versions_ascending() {
        let store = RedbStore::open_in_memory().unwrap();
        let table = article_table();
        // Insert out of order; iteration order must still be ascending.
        for tx in [7_u64, 1, 3] {
            store
                .insert_row(&table, VersionRecord::new(EntityKey::single(1), tx))
                .unwrap();
        }
        let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
        let txs: Vec<u64> = rows.iter().map(|r| r.transaction_id).collect();
        assert_eq!(txs, vec![1, 3, 7]);
    }

    #[test]
    fn redb_entity_keys_are_deduped_and_sorted() {
        let store = RedbStore::open_in_memory().unwrap();
        let table = article_table();
        for (id, tx) in [(2_i64, 1_u64), (1, 2), (2, 3), (1, 4)] {
            store
                .insert_row(&table, VersionRecord::new(EntityKey::single(id), tx))
                .unwrap();
        }
        let keys = store.entity_keys(&table).unwrap();
        assert_eq!(keys, vec![EntityKey::single(1), EntityKey::single(2)]);
    }

    #[test]
    fn redb_text_keys_with_separator_bytes_do_not_collide() {
        let store = RedbStore::open_in_memory().unwrap();
        let table = TableDescriptor::new("doc_version", ["slug"]);
        let hostile = EntityKey::single("a\u{1f}b:c");
        let plain = EntityKey::single("a");
        store
            .insert_row(&table, VersionRecord::new(hostile.clone(), 1))
            .unwrap();
        store
            .insert_row(&table, VersionRecord::new(plain.clone(), 2))
            .unwrap();

        let keys = store.entity_keys(&table).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(store.ordered_versions(&table, &hostile).unwrap().len(), 1);
        assert_eq!(store.ordered_versions(&table, &plain).unwrap().len(), 1);
    }

    #[test]
    fn redb_logical_tables_are_namespaced() {
        let store = RedbStore::open_in_memory().unwrap();
        let articles = article_table();
        let posts = TableDescriptor::new("post_version", ["id"]);
        store
            .insert_row(&articles, VersionRecord::new(EntityKey::single(1), 1))
            .unwrap();

        assert_eq!(store.entity_keys(&articles).unwrap().len(), 1);
        assert!(store.entity_keys(&posts).unwrap().is_empty());
        assert!(store
            .ordered_versions(&posts, &EntityKey::single(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn redb_write_batch_fails_as_a_unit() {
        let store = RedbStore::open_in_memory().unwrap();
        let table = article_table();
        store
            .insert_row(&table, VersionRecord::new(EntityKey::single(1), 1))
            .unwrap();

        let batch = vec![
            update(EntityKey::single(1), 1, Some(3)),
            update(EntityKey::single(99), 7, Some(8)),
        ];
        let err = store.write_batch(&table, &batch).unwrap_err();
        assert!(matches!(err, TidemarkError::Storage(_)));

        let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
        assert_eq!(
            rows[0].end_transaction_id, None,
            "a failed redb batch must roll back entirely"
        );
    }

    #[test]
    fn redb_flag_columns_round_trip_separately_from_attributes() {
        let store = RedbStore::open_in_memory().unwrap();
        let table = article_table();
        store
            .insert_row(
                &table,
                VersionRecord::new(EntityKey::single(1), 1)
                    .with_attribute("name", "A")
                    .with_attribute("published", true), // boolean attribute, not a flag
            )
            .unwrap();

        let mut flags = BTreeMap::new();
        flags.insert("name_mod".to_string(), true);
        store
            .write_batch(
                &table,
                &[VersionUpdate {
                    key: EntityKey::single(1),
                    transaction_id: 1,
                    end_transaction_id: None,
                    change_flags: flags,
                }],
            )
            .unwrap();

        let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
        assert!(rows[0].flag("name_mod"));
        assert!(!rows[0].attributes.contains_key("name_mod"));
        assert_eq!(rows[0].attribute("published"), &Value::Boolean(true));
        assert!(!rows[0].flag("published"));
    }

    #[test]
    fn redb_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history.tidemark");
        let path_str = path.to_str().unwrap();
        let table = article_table();

        {
            let store = RedbStore::open(path_str).unwrap();
            store
                .insert_row(
                    &table,
                    VersionRecord::new(EntityKey::single(1), 1).with_attribute("name", "A"),
                )
                .unwrap();
            store
                .write_batch(&table, &[update(EntityKey::single(1), 1, Some(3))])
                .unwrap();
        } // store dropped — file closed

        let store = RedbStore::open(path_str).unwrap();
        let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
        assert_eq!(rows.len(), 1, "rows must survive reopen");
        assert_eq!(rows[0].end_transaction_id, Some(3));
        assert_eq!(rows[0].attribute("name"), &Value::Text("A".into()));
    }
}
