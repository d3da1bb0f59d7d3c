//! Tidemark — validity-interval backfill for append-only version histories.
//!
//! A version table holds one row per committed change to an entity, ordered
//! by a strictly increasing transaction id. Tidemark derives the two pieces
//! of temporal metadata such tables usually lack:
//!
//! - **End boundary** (`end_transaction_id`): the transaction at which a
//!   version stopped being current. The latest version of an entity has no
//!   boundary; it is still current.
//! - **Change flags** (`<column>_mod`): one boolean per tracked column,
//!   true when the value differs from the immediately preceding version
//!   (or when there is no preceding version).
//!
//! Both are computed in a single ordered pass per entity and written back
//! as a batched, idempotent backfill. Re-running over unmodified data
//! writes nothing.
//!
//! # Quick start
//!
//! ```rust
//! use tidemark::store::MemoryStore;
//! use tidemark::{run_boundary_backfill, BackfillConfig, EntityKey, TableDescriptor, VersionRecord};
//!
//! let store = MemoryStore::new();
//! let table = TableDescriptor::new("article_version", ["id"]);
//!
//! // Rows normally come from the live write path; seed two versions here.
//! store
//!     .insert_row(&table, VersionRecord::new(EntityKey::single(1), 1).with_attribute("name", "A"))
//!     .unwrap();
//! store
//!     .insert_row(&table, VersionRecord::new(EntityKey::single(1), 3).with_attribute("name", "B"))
//!     .unwrap();
//!
//! let report = run_boundary_backfill(&store, &table, &BackfillConfig::default()).unwrap();
//! assert_eq!(report.rows_updated, 1); // only the older version gains a boundary
//! ```

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TidemarkError {
    /// The version history itself is inconsistent (duplicate or out-of-order
    /// transaction ids, an entity with no versions). Never retried and never
    /// silently repaired.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// An I/O failure in the underlying store. Treated as transient and
    /// retried up to the configured budget.
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored row that cannot be mapped onto the table descriptor.
    #[error("malformed row: {0}")]
    MalformedRow(String),
}

impl TidemarkError {
    /// Only storage I/O is worth retrying; everything else is deterministic.
    fn is_transient(&self) -> bool {
        matches!(self, TidemarkError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, TidemarkError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// One component of an entity key.
///
/// Version tables key their entities by integers, strings, or a composite of
/// both. The transaction column is never part of the entity key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Int(n)
    }
}
impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Text(s.to_string())
    }
}
impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Text(s)
    }
}

impl std::fmt::Display for KeyPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPart::Int(n) => write!(f, "{n}"),
            KeyPart::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Ordered composite key identifying one logical entity across its history.
///
/// Immutable for the life of the entity. All versions of the same entity
/// share the same key; the pair `(key, transaction_id)` is a row's primary
/// key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey(pub Vec<KeyPart>);

impl EntityKey {
    /// Key with a single component, the common non-composite case.
    pub fn single(part: impl Into<KeyPart>) -> Self {
        Self(vec![part.into()])
    }

    /// Key with multiple components, in column order.
    pub fn composite(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

/// A tracked attribute's value in one version row.
///
/// Maps 1:1 onto a JSON cell. `Null` equals `Null` and differs from every
/// non-null value; an attribute missing from a row compares as `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// One row of a version table: a committed state of an entity.
///
/// The live write path creates these with `attributes` and `transaction_id`
/// populated and the derived fields unset. The backfill fills in
/// `end_transaction_id` and `change_flags`; `change_flags` is keyed by the
/// persisted flag column name (attribute + suffix) and absence means false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: EntityKey,
    pub transaction_id: u64,
    pub end_transaction_id: Option<u64>,
    pub attributes: BTreeMap<String, Value>,
    pub change_flags: BTreeMap<String, bool>,
}

impl VersionRecord {
    pub fn new(key: EntityKey, transaction_id: u64) -> Self {
        Self {
            key,
            transaction_id,
            end_transaction_id: None,
            attributes: BTreeMap::new(),
            change_flags: BTreeMap::new(),
        }
    }

    /// Builder-style attribute assignment, mostly for seeding and tests.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Attribute value under null-aware semantics: missing reads as `Null`.
    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&Value::Null)
    }

    /// Stored change flag for a flag column; absence reads as false.
    pub fn flag(&self, column: &str) -> bool {
        self.change_flags.get(column).copied().unwrap_or(false)
    }
}

/// The write-back patch for one version row, keyed by the row's primary key
/// `(key, transaction_id)`.
///
/// `end_transaction_id = None` means "no boundary write": the backfill
/// never writes a null boundary. Only `true` flags are ever persisted;
/// stored flag columns default to false by absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionUpdate {
    pub key: EntityKey,
    pub transaction_id: u64,
    pub end_transaction_id: Option<u64>,
    pub change_flags: BTreeMap<String, bool>,
}

/// Table and column mapping for one version table.
///
/// Polymorphic hierarchies whose history is split across several tables are
/// handled as several descriptors run through the same backfill, each with
/// its own key and tracked columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Logical table name.
    pub name: String,
    /// Entity key columns, in order. Never includes the transaction column.
    pub key_columns: Vec<String>,
    /// Column holding the strictly increasing transaction id.
    pub tx_column: String,
    /// Nullable column holding the end boundary.
    pub end_column: String,
    /// Suffix appended to an attribute name to form its flag column name.
    pub flag_suffix: String,
}

impl TableDescriptor {
    /// Descriptor with the conventional column names: `transaction_id`,
    /// `end_transaction_id`, and the `_mod` flag suffix.
    pub fn new(
        name: impl Into<String>,
        key_columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            key_columns: key_columns.into_iter().map(Into::into).collect(),
            tx_column: "transaction_id".to_string(),
            end_column: "end_transaction_id".to_string(),
            flag_suffix: "_mod".to_string(),
        }
    }

    pub fn with_tx_column(mut self, column: impl Into<String>) -> Self {
        self.tx_column = column.into();
        self
    }

    pub fn with_end_column(mut self, column: impl Into<String>) -> Self {
        self.end_column = column.into();
        self
    }

    pub fn with_flag_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.flag_suffix = suffix.into();
        self
    }

    /// Flag column name for a tracked attribute.
    pub fn flag_column(&self, attribute: &str) -> String {
        format!("{attribute}{}", self.flag_suffix)
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Execution context for a backfill: anything that can enumerate entities,
/// deliver per-entity ordered histories, and apply keyed batch updates.
///
/// The backfill never discovers a store ambiently; a `VersionStore` is
/// always passed in explicitly.
///
/// Contract:
/// - `ordered_versions` returns the entity's complete history as of the
///   call, ascending by transaction id. A single call must observe a
///   consistent snapshot, never a half-visible set of in-flight commits.
/// - `write_batch` applies all updates atomically and fails as a unit; a
///   failed batch must leave every row in the batch untouched.
pub trait VersionStore {
    fn entity_keys(&self, table: &TableDescriptor) -> Result<Vec<EntityKey>>;
    fn ordered_versions(&self, table: &TableDescriptor, key: &EntityKey) -> Result<Vec<VersionRecord>>;
    fn write_batch(&self, table: &TableDescriptor, updates: &[VersionUpdate]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Check one entity's history before deriving anything from it.
///
/// The sequence must be non-empty and strictly increasing by transaction id.
/// A duplicate id is ambiguous (there is no correct tie-break), so it is
/// reported rather than resolved. Out-of-order rows mean the store broke the
/// `ordered_versions` contract and get the same treatment.
pub fn verify_history(key: &EntityKey, versions: &[VersionRecord]) -> Result<()> {
    if versions.is_empty() {
        return Err(TidemarkError::Integrity(format!(
            "entity {key} has no versions"
        )));
    }
    for pair in versions.windows(2) {
        let (a, b) = (pair[0].transaction_id, pair[1].transaction_id);
        if a == b {
            return Err(TidemarkError::Integrity(format!(
                "entity {key} has duplicate transaction id {a}"
            )));
        }
        if a > b {
            return Err(TidemarkError::Integrity(format!(
                "history for entity {key} is not in ascending transaction order ({a} before {b})"
            )));
        }
    }
    Ok(())
}

/// End boundary for each version of one entity.
///
/// A zip-with-successor over the ascending sequence: version `i` ends at the
/// transaction id of version `i + 1`; the last version is open-ended. One
/// linear pass, with no per-row correlated lookup, which matters on large
/// tables.
///
/// Callers must run [`verify_history`] first; this function assumes a
/// validated sequence.
pub fn end_boundaries(versions: &[VersionRecord]) -> Vec<Option<u64>> {
    let mut out = Vec::with_capacity(versions.len());
    for i in 0..versions.len() {
        out.push(versions.get(i + 1).map(|next| next.transaction_id));
    }
    out
}

/// Change flags for each version of one entity, keyed by attribute name.
///
/// A one-element lookbehind over the ascending sequence. A tracked attribute
/// is flagged when there is no preceding version (everything is new) or when
/// its value differs from the preceding version's. Null-aware: null vs null
/// is unchanged, null vs any non-null is a change. Untracked attributes are
/// never flagged.
pub fn change_flags(versions: &[VersionRecord], tracked: &[String]) -> Vec<BTreeMap<String, bool>> {
    let mut out = Vec::with_capacity(versions.len());
    let mut previous: Option<&VersionRecord> = None;
    for record in versions {
        let mut flags = BTreeMap::new();
        for attribute in tracked {
            let changed = match previous {
                None => true,
                Some(prev) => prev.attribute(attribute) != record.attribute(attribute),
            };
            flags.insert(attribute.clone(), changed);
        }
        out.push(flags);
        previous = Some(record);
    }
    out
}

// ---------------------------------------------------------------------------
// Backfill applier
// ---------------------------------------------------------------------------

/// Bounded retry budget for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub attempts: u32,
    /// Delay before the first retry; doubles after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Maximum updates per write transaction. Batches never span entities.
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one backfill invocation.
///
/// `rows_processed` counts every version row read; `rows_updated` counts
/// rows that actually received a write. A second run over unmodified data
/// reports zero updates.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub rows_processed: u64,
    pub rows_updated: u64,
    /// Entities whose reads or writes exhausted the retry budget. Work
    /// already committed for other entities is unaffected; re-running picks
    /// these up.
    pub failed_entities: Vec<EntityKey>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed_entities.is_empty()
    }
}

/// Backfill `end_transaction_id` for every row of a version table.
///
/// Reads and computes the whole table first, then writes in per-entity
/// batches, so an integrity violation anywhere aborts before a single write.
/// Idempotent: boundary writes that match the stored value are skipped, and
/// a stored boundary that disagrees with the computed one is overwritten
/// (which is what lets a re-run absorb tail versions appended since the
/// previous run).
///
/// Run this against a quiesced write path, or re-run it after writers stop:
/// a version that looks latest while writers are active may gain a successor
/// mid-run, and the algorithm does not resolve that internally.
pub fn run_boundary_backfill<S: VersionStore + ?Sized>(
    store: &S,
    table: &TableDescriptor,
    config: &BackfillConfig,
) -> Result<RunReport> {
    run_backfill(store, table, config, |_, versions| {
        plan_boundary_updates(versions)
    })
}

/// Backfill change-flag columns for the given tracked attributes.
///
/// Same pipeline and guarantees as [`run_boundary_backfill`]. Only `true`
/// flags are written; a stored `true` is never rewritten, so re-runs over
/// unmodified data write nothing.
pub fn run_change_flag_backfill<S: VersionStore + ?Sized>(
    store: &S,
    table: &TableDescriptor,
    tracked_columns: &[String],
    config: &BackfillConfig,
) -> Result<RunReport> {
    run_backfill(store, table, config, |table, versions| {
        plan_change_flag_updates(table, tracked_columns, versions)
    })
}

/// Read → Compute → Write, one pass.
///
/// Entity groups are independent units: a transient read failure skips just
/// that entity, and a batch write that exhausts its retries fails just the
/// entities in that batch. Integrity violations abort the whole run during
/// the read phase, strictly before any write.
fn run_backfill<S: VersionStore + ?Sized>(
    store: &S,
    table: &TableDescriptor,
    config: &BackfillConfig,
    plan: impl Fn(&TableDescriptor, &[VersionRecord]) -> Vec<VersionUpdate>,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let keys = with_retry(&config.retry, "entity key enumeration", || {
        store.entity_keys(table)
    })?;

    let mut rows_processed: u64 = 0;
    let mut failed_entities: Vec<EntityKey> = Vec::new();
    let mut planned: Vec<(EntityKey, Vec<VersionUpdate>)> = Vec::new();

    // Read + compute. Nothing is written until every readable entity has
    // passed its integrity check.
    for key in keys {
        let versions = match with_retry(&config.retry, "history read", || {
            store.ordered_versions(table, &key)
        }) {
            Ok(versions) => versions,
            Err(e) if e.is_transient() => {
                tracing::warn!(entity = %key, error = %e, "skipping entity after exhausted read retries");
                failed_entities.push(key);
                continue;
            }
            Err(e) => return Err(e),
        };
        verify_history(&key, &versions)?;
        rows_processed += versions.len() as u64;
        let updates = plan(table, &versions);
        if !updates.is_empty() {
            planned.push((key, updates));
        }
    }

    // Write, batched per entity. Each batch is atomic in the store and each
    // row's update depends only on its own primary key, so a crash between
    // batches leaves committed rows correct and the rest untouched.
    let mut rows_updated: u64 = 0;
    for (key, updates) in planned {
        let mut entity_failed = false;
        for batch in updates.chunks(config.batch_size.max(1)) {
            match with_retry(&config.retry, "batch write", || {
                store.write_batch(table, batch)
            }) {
                Ok(()) => rows_updated += batch.len() as u64,
                Err(e) => {
                    let primary_keys: Vec<String> = batch
                        .iter()
                        .map(|u| format!("{}@{}", u.key, u.transaction_id))
                        .collect();
                    tracing::error!(
                        entity = %key,
                        error = %e,
                        ?primary_keys,
                        "abandoning batch after exhausted write retries"
                    );
                    entity_failed = true;
                    break;
                }
            }
        }
        if entity_failed {
            failed_entities.push(key);
        }
    }

    Ok(RunReport {
        rows_processed,
        rows_updated,
        failed_entities,
        started_at,
        finished_at: Utc::now(),
    })
}

fn plan_boundary_updates(versions: &[VersionRecord]) -> Vec<VersionUpdate> {
    end_boundaries(versions)
        .into_iter()
        .zip(versions)
        .filter_map(|(boundary, record)| {
            let boundary = boundary?;
            if record.end_transaction_id == Some(boundary) {
                return None;
            }
            Some(VersionUpdate {
                key: record.key.clone(),
                transaction_id: record.transaction_id,
                end_transaction_id: Some(boundary),
                change_flags: BTreeMap::new(),
            })
        })
        .collect()
}

fn plan_change_flag_updates(
    table: &TableDescriptor,
    tracked: &[String],
    versions: &[VersionRecord],
) -> Vec<VersionUpdate> {
    change_flags(versions, tracked)
        .into_iter()
        .zip(versions)
        .filter_map(|(flags, record)| {
            let mut patch = BTreeMap::new();
            for (attribute, changed) in flags {
                if !changed {
                    continue;
                }
                let column = table.flag_column(&attribute);
                if !record.flag(&column) {
                    patch.insert(column, true);
                }
            }
            if patch.is_empty() {
                return None;
            }
            Some(VersionUpdate {
                key: record.key.clone(),
                transaction_id: record.transaction_id,
                end_transaction_id: None,
                change_flags: patch,
            })
        })
        .collect()
}

fn with_retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = policy.backoff;
    let mut attempt: u32 = 1;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                tracing::warn!(attempt, error = %e, "{what} failed, retrying");
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
