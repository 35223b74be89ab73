//! libSQL backend — async `RelayStore` implementation.
//!
//! Supports local file and in-memory databases. Lookups hit the per-direction
//! indexes created by the migrations; batch inserts run inside one
//! transaction so a fan-out is persisted all-or-nothing.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{MessageKey, NewRelayRecord, RelayRecord, RelayStore};

/// Column list shared by every SELECT so `row_to_record` can rely on order.
const RECORD_COLUMNS: &str = "record_id, source_message_id, source_instance, source_channel, \
     target_message_id, target_instance, target_channel, created_at";

/// libSQL relay store.
///
/// One connection shared by every call.
/// `libsql::Connection` is `Send + Sync`; writes are serialized so two
/// concurrent batches never interleave their transactions.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open or create the database file at `path`, then migrate it.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("cannot open {}: {e}", path.display())))?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        info!(path = %path.display(), "Relay database opened");
        Ok(store)
    }

    /// Throwaway in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("cannot open in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("connect: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn query_records(
        &self,
        direction: &str,
        key: &MessageKey,
    ) -> Result<Vec<RelayRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM relay_records \
             WHERE {direction}_message_id = ?1 AND {direction}_instance = ?2 AND {direction}_channel = ?3 \
             ORDER BY record_id ASC"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![
                    key.message_id.as_str(),
                    key.instance.as_str(),
                    key.channel.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_{direction}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_{direction}: {e}")))?
        {
            records.push(
                row_to_record(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("row parse: {e}")))?,
            );
        }
        Ok(records)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// `created_at` is written as RFC 3339; SQLite's own `datetime()` format is
/// accepted too.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a libsql Row to a RelayRecord. Column order matches `RECORD_COLUMNS`.
fn row_to_record(row: &libsql::Row) -> Result<RelayRecord, libsql::Error> {
    let created: String = row.get(7)?;
    Ok(RelayRecord {
        record_id: row.get(0)?,
        source: MessageKey {
            message_id: row.get(1)?,
            instance: row.get(2)?,
            channel: row.get(3)?,
        },
        target: MessageKey {
            message_id: row.get(4)?,
            instance: row.get(5)?,
            channel: row.get(6)?,
        },
        created_at: parse_datetime(&created),
    })
}

#[async_trait]
impl RelayStore for LibSqlStore {
    async fn find_by_source(&self, key: &MessageKey) -> Result<Vec<RelayRecord>, DatabaseError> {
        self.query_records("source", key).await
    }

    async fn find_by_target(&self, key: &MessageKey) -> Result<Vec<RelayRecord>, DatabaseError> {
        self.query_records("target", key).await
    }

    async fn upsert(&self, records: &[NewRelayRecord]) -> Result<usize, DatabaseError> {
        if records.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert begin: {e}")))?;

        let now = Utc::now().to_rfc3339();
        let mut inserted = 0usize;
        for record in records {
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO relay_records (
                        source_message_id, source_instance, source_channel,
                        target_message_id, target_instance, target_channel, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.source.message_id.as_str(),
                        record.source.instance.as_str(),
                        record.source.channel.as_str(),
                        record.target.message_id.as_str(),
                        record.target.instance.as_str(),
                        record.target.channel.as_str(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert: {e}")))?;
            inserted += changed as usize;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert commit: {e}")))?;

        debug!(inserted, batch = records.len(), "Relay records persisted");
        Ok(inserted)
    }
}
