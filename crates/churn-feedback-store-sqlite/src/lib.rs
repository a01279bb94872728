#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use churn_feedback_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ChurnLabel, ChurnRecord, CustomerId,
    FeatureVector, FeedbackError, MispredictionEntry, MispredictionLedger, OutcomeCommit,
    PredictionWrite, RecordStore,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use ulid::Ulid;

pub const CHURN_MIGRATION_VERSION: i64 = 1;

/// How long a writer waits on a locked database before failing.
pub const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA_CHURN_V1: &str = r"
CREATE TABLE IF NOT EXISTS churn_records (
  customer_id INTEGER PRIMARY KEY,
  features_json TEXT NOT NULL,
  predicted_output INTEGER CHECK (predicted_output IN (0, 1) OR predicted_output IS NULL),
  actual_output INTEGER CHECK (actual_output IN (0, 1) OR actual_output IS NULL),
  coupons REAL,
  cashback REAL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  actual_recorded_at TEXT,
  write_seq INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_churn_records_actual_write_once
BEFORE UPDATE OF actual_output ON churn_records
WHEN OLD.actual_output IS NOT NULL AND NEW.actual_output IS NOT OLD.actual_output
BEGIN
  SELECT RAISE(FAIL, 'churn_records.actual_output is write-once');
END;

CREATE TRIGGER IF NOT EXISTS trg_churn_records_no_delete
BEFORE DELETE ON churn_records
BEGIN
  SELECT RAISE(FAIL, 'churn_records rows are never deleted');
END;

CREATE INDEX IF NOT EXISTS idx_churn_records_write_seq
  ON churn_records(write_seq);

CREATE TABLE IF NOT EXISTS misprediction_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  customer_id INTEGER NOT NULL UNIQUE,
  features_json TEXT NOT NULL,
  predicted_output INTEGER NOT NULL CHECK (predicted_output IN (0, 1)),
  actual_output INTEGER NOT NULL CHECK (actual_output IN (0, 1)),
  coupons REAL,
  cashback REAL,
  recorded_at TEXT NOT NULL,
  CHECK (predicted_output <> actual_output),
  FOREIGN KEY (customer_id) REFERENCES churn_records(customer_id)
);

CREATE TRIGGER IF NOT EXISTS trg_misprediction_entries_no_update
BEFORE UPDATE ON misprediction_entries
BEGIN
  SELECT RAISE(FAIL, 'misprediction_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_misprediction_entries_no_delete
BEFORE DELETE ON misprediction_entries
BEGIN
  SELECT RAISE(FAIL, 'misprediction_entries is append-only');
END;
";

const RECORD_COLUMNS: &str = "customer_id, features_json, predicted_output, actual_output,
    coupons, cashback, created_at, updated_at, actual_recorded_at";

const ENTRY_COLUMNS: &str = "entry_id, customer_id, features_json, predicted_output,
    actual_output, coupons, cashback, recorded_at";

/// SQLite-backed [`RecordStore`] and [`MispredictionLedger`].
///
/// Write-once and dedup rules are enforced by conditional SQL, so several
/// stores (or processes) sharing one database file stay consistent.
pub struct SqliteChurnStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteChurnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteChurnStore").finish_non_exhaustive()
    }
}

impl SqliteChurnStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_CHURN_V1)
            .context("failed to apply churn schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![CHURN_MIGRATION_VERSION, now],
        )
        .context("failed to register churn schema migration")?;

        tracing::debug!(version = CHURN_MIGRATION_VERSION, "churn schema migrated");
        Ok(())
    }

    /// Highest applied migration, or `None` on an unmigrated database.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.lock()?;
        if !table_exists(&conn, "schema_migrations")? {
            return Ok(None);
        }

        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to read schema version")
    }

    pub fn is_migrated(&self) -> Result<bool> {
        Ok(self
            .schema_version()?
            .is_some_and(|version| version >= CHURN_MIGRATION_VERSION))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn upsert_prediction_row(&self, write: &PredictionWrite) -> Result<ChurnRecord> {
        let features_json =
            serde_json::to_string(&write.features).context("failed to serialize features")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO churn_records(
                customer_id, features_json, predicted_output, actual_output,
                coupons, cashback, created_at, updated_at, actual_recorded_at, write_seq
             ) VALUES (
                ?1, ?2, ?3, NULL, ?4, ?5, ?6, ?6, NULL,
                (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM churn_records)
             )
             ON CONFLICT(customer_id) DO UPDATE SET
               features_json = excluded.features_json,
               predicted_output = excluded.predicted_output,
               coupons = excluded.coupons,
               cashback = excluded.cashback,
               updated_at = excluded.updated_at",
            params![
                write.customer_id,
                features_json,
                write.predicted_output.as_i64(),
                write.coupons,
                write.cashback,
                now,
            ],
        )
        .context("failed to upsert churn prediction")?;

        fetch_record(&conn, write.customer_id)?
            .ok_or_else(|| anyhow!("churn record {} vanished after upsert", write.customer_id))
    }

    fn save_features_row(
        &self,
        customer_id: CustomerId,
        features: &FeatureVector,
    ) -> Result<ChurnRecord> {
        let features_json =
            serde_json::to_string(features).context("failed to serialize features")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO churn_records(
                customer_id, features_json, created_at, updated_at, write_seq
             ) VALUES (
                ?1, ?2, ?3, ?3,
                (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM churn_records)
             )
             ON CONFLICT(customer_id) DO UPDATE SET
               features_json = excluded.features_json,
               updated_at = excluded.updated_at,
               write_seq = excluded.write_seq",
            params![customer_id, features_json, now],
        )
        .context("failed to save churn features")?;

        fetch_record(&conn, customer_id)?
            .ok_or_else(|| anyhow!("churn record {customer_id} vanished after save"))
    }

    fn record_actual_row(
        &self,
        customer_id: CustomerId,
        actual_output: ChurnLabel,
    ) -> Result<Option<OutcomeCommit>> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start outcome transaction")?;

        let changed = tx
            .execute(
                "UPDATE churn_records SET
                   actual_output = ?2,
                   actual_recorded_at = ?3,
                   updated_at = ?3
                 WHERE customer_id = ?1 AND actual_output IS NULL",
                params![customer_id, actual_output.as_i64(), now],
            )
            .context("failed to record actual output")?;

        let Some(record) = fetch_record(&tx, customer_id)? else {
            return Ok(None);
        };
        tx.commit().context("failed to commit outcome transaction")?;

        Ok(Some(OutcomeCommit {
            applied: changed == 1,
            record,
        }))
    }

    fn latest_row(&self) -> Result<Option<ChurnRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM churn_records ORDER BY write_seq DESC LIMIT 1"),
            [],
            parse_record_row,
        )
        .optional()
        .context("failed to load latest churn record")
    }

    fn append_entry_row(&self, entry: &MispredictionEntry) -> Result<bool> {
        let features_json =
            serde_json::to_string(&entry.features).context("failed to serialize features")?;
        let recorded_at =
            format_rfc3339(entry.recorded_at).map_err(|err| anyhow!(err.to_string()))?;

        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT INTO misprediction_entries(
                    entry_id, customer_id, features_json, predicted_output,
                    actual_output, coupons, cashback, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(customer_id) DO NOTHING",
                params![
                    entry.entry_id.to_string(),
                    entry.customer_id,
                    features_json,
                    entry.predicted_output.as_i64(),
                    entry.actual_output.as_i64(),
                    entry.coupons,
                    entry.cashback,
                    recorded_at,
                ],
            )
            .context("failed to append misprediction entry")?;

        Ok(inserted == 1)
    }

    fn count_entries(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM misprediction_entries", [], |row| {
                row.get(0)
            })
            .context("failed to count misprediction entries")?;
        u64::try_from(count).with_context(|| format!("invalid misprediction count: {count}"))
    }

    fn list_entries(&self, limit: Option<usize>) -> Result<Vec<MispredictionEntry>> {
        let limit = match limit {
            Some(value) => i64::try_from(value).context("ledger limit out of range")?,
            None => -1,
        };

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM misprediction_entries ORDER BY entry_seq ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], parse_entry_row)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(err) => panic!("sqlite connection lock poisoned: {err}"),
        }
    }
}

impl RecordStore for SqliteChurnStore {
    fn upsert_prediction(&self, write: &PredictionWrite) -> Result<ChurnRecord, FeedbackError> {
        write.validate()?;
        self.upsert_prediction_row(write).map_err(persistence)
    }

    fn save_features(
        &self,
        customer_id: CustomerId,
        features: &FeatureVector,
    ) -> Result<ChurnRecord, FeedbackError> {
        features.validate()?;
        self.save_features_row(customer_id, features)
            .map_err(persistence)
    }

    fn exists(&self, customer_id: CustomerId) -> Result<bool, FeedbackError> {
        let conn = self.lock().map_err(persistence)?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM churn_records WHERE customer_id = ?1)",
            params![customer_id],
            |row| row.get::<_, bool>(0),
        )
        .context("failed to check churn record existence")
        .map_err(persistence)
    }

    fn get(&self, customer_id: CustomerId) -> Result<ChurnRecord, FeedbackError> {
        let conn = self.lock().map_err(persistence)?;
        fetch_record(&conn, customer_id)
            .map_err(persistence)?
            .ok_or(FeedbackError::NotFound(customer_id))
    }

    fn record_actual_output(
        &self,
        customer_id: CustomerId,
        actual_output: ChurnLabel,
    ) -> Result<OutcomeCommit, FeedbackError> {
        self.record_actual_row(customer_id, actual_output)
            .map_err(persistence)?
            .ok_or(FeedbackError::NotFound(customer_id))
    }

    fn latest(&self) -> Result<Option<ChurnRecord>, FeedbackError> {
        self.latest_row().map_err(persistence)
    }
}

impl MispredictionLedger for SqliteChurnStore {
    fn append_if_absent(&self, entry: &MispredictionEntry) -> Result<bool, FeedbackError> {
        self.append_entry_row(entry).map_err(persistence)
    }

    fn count(&self) -> Result<u64, FeedbackError> {
        self.count_entries().map_err(persistence)
    }

    fn entries(&self, limit: Option<usize>) -> Result<Vec<MispredictionEntry>, FeedbackError> {
        self.list_entries(limit).map_err(persistence)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn persistence(err: anyhow::Error) -> FeedbackError {
    tracing::warn!(error = %format!("{err:#}"), "sqlite churn store operation failed");
    FeedbackError::Persistence(format!("{err:#}"))
}

fn fetch_record(conn: &Connection, customer_id: CustomerId) -> Result<Option<ChurnRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM churn_records WHERE customer_id = ?1"),
        params![customer_id],
        parse_record_row,
    )
    .optional()
    .with_context(|| format!("failed to load churn record {customer_id}"))
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChurnRecord> {
    let features_json: String = row.get(1)?;
    let predicted_raw: Option<i64> = row.get(2)?;
    let actual_raw: Option<i64> = row.get(3)?;
    let created_at_raw: String = row.get(6)?;
    let updated_at_raw: String = row.get(7)?;
    let actual_recorded_at_raw: Option<String> = row.get(8)?;

    Ok(ChurnRecord {
        customer_id: row.get(0)?,
        features: parse_features(1, &features_json)?,
        predicted_output: predicted_raw.map(|raw| parse_label(2, raw)).transpose()?,
        actual_output: actual_raw.map(|raw| parse_label(3, raw)).transpose()?,
        coupons: row.get(4)?,
        cashback: row.get(5)?,
        created_at: parse_timestamp(6, &created_at_raw)?,
        updated_at: parse_timestamp(7, &updated_at_raw)?,
        actual_recorded_at: actual_recorded_at_raw
            .map(|raw| parse_timestamp(8, &raw))
            .transpose()?,
    })
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MispredictionEntry> {
    let entry_id_raw: String = row.get(0)?;
    let features_json: String = row.get(2)?;
    let recorded_at_raw: String = row.get(7)?;

    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|err| {
        conversion_error(
            0,
            rusqlite::types::Type::Text,
            format!("invalid entry_id {entry_id_raw}: {err}"),
        )
    })?;

    Ok(MispredictionEntry {
        entry_id,
        customer_id: row.get(1)?,
        features: parse_features(2, &features_json)?,
        predicted_output: parse_label(3, row.get(3)?)?,
        actual_output: parse_label(4, row.get(4)?)?,
        coupons: row.get(5)?,
        cashback: row.get(6)?,
        recorded_at: parse_timestamp(7, &recorded_at_raw)?,
    })
}

fn parse_features(index: usize, raw: &str) -> rusqlite::Result<FeatureVector> {
    serde_json::from_str(raw).map_err(|err| {
        conversion_error(
            index,
            rusqlite::types::Type::Text,
            format!("invalid features_json: {err}"),
        )
    })
}

fn parse_label(index: usize, raw: i64) -> rusqlite::Result<ChurnLabel> {
    ChurnLabel::try_from(raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Integer, err.to_string()))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn conversion_error(
    index: usize,
    kind: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, bool>(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for {table_name}"))?;
    Ok(exists)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
