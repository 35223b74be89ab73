//! Schema versioning for the relay database.
//!
//! Applied versions are tracked in `_migrations`. Each step runs in its own
//! transaction together with its version row, so a crash never leaves a step
//! half-applied and unrecorded.

use libsql::{Connection, params};
use tracing::info;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema steps. Only ever append.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "relay_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS relay_records (
                record_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_message_id VARCHAR(64) NOT NULL,
                source_instance VARCHAR(64) NOT NULL,
                source_channel VARCHAR(64) NOT NULL,
                target_message_id VARCHAR(64) NOT NULL,
                target_instance VARCHAR(64) NOT NULL,
                target_channel VARCHAR(64) NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (
                    source_message_id, source_instance, source_channel,
                    target_message_id, target_instance, target_channel
                )
            );
            CREATE INDEX IF NOT EXISTS idx_relay_source
                ON relay_records(source_message_id, source_instance, source_channel);
            CREATE INDEX IF NOT EXISTS idx_relay_target
                ON relay_records(target_message_id, target_instance, target_channel);
        "#,
    },
    Migration {
        version: 2,
        name: "relay_records_by_age",
        sql: "CREATE INDEX IF NOT EXISTS idx_relay_created ON relay_records(created_at);",
    },
];

fn migration_error(context: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_error("create _migrations", e))?;

    let applied = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        return Ok(());
    }

    for step in pending {
        info!(version = step.version, name = step.name, "Applying schema step");
        let tx = conn
            .transaction()
            .await
            .map_err(|e| migration_error("begin", e))?;
        tx.execute_batch(step.sql)
            .await
            .map_err(|e| migration_error(&format!("V{} {}", step.version, step.name), e))?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![step.version, step.name],
        )
        .await
        .map_err(|e| migration_error(&format!("record V{}", step.version), e))?;
        tx.commit()
            .await
            .map_err(|e| migration_error(&format!("commit V{}", step.version), e))?;
    }

    info!(version = current_version(conn).await?, "Relay schema up to date");
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| migration_error("read version", e))?;
    match rows.next().await.map_err(|e| migration_error("read version", e))? {
        Some(row) => row.get(0).map_err(|e| migration_error("parse version", e)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    #[tokio::test]
    async fn fresh_database_reaches_latest_version() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();

        assert_eq!(current_version(&conn).await.unwrap(), 2);
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_relay_%'"
            )
            .await,
            3
        );
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM _migrations").await, 2);
    }

    #[tokio::test]
    async fn partially_migrated_database_gets_remaining_steps() {
        let conn = fresh().await;
        conn.execute_batch(
            "CREATE TABLE _migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL,
                 applied_at TEXT NOT NULL DEFAULT (datetime('now')));",
        )
        .await
        .unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).await.unwrap();
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (1, 'relay_records')",
            (),
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();
        assert_eq!(current_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_pairs_are_rejected_by_schema() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();
        let insert = "INSERT INTO relay_records (source_message_id, source_instance, source_channel,
                          target_message_id, target_instance, target_channel)
                      VALUES ('m', 's', 'c', 't', 'i', 'd')";
        conn.execute(insert, ()).await.unwrap();
        assert!(conn.execute(insert, ()).await.is_err());
    }
}
