//! Forward-only migration runner. Each migration is idempotent SQL, applied
//! under its own transaction and recorded in `schema_migrations`.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};

use super::StoreResult;

const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("schema.sql"))];

pub fn apply(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version    INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL
         );",
    )?;

    for (version, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            params![version],
            |row| row.get(0),
        )?;
        if already_applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)],
        )?;
        tx.commit()?;
    }

    Ok(())
}
