//! Database migrations

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version
const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations
pub fn run_all(conn: &Connection) -> Result<()> {
    // databases written before versioning lack some columns
    evolve_legacy_tables(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!("running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("applying migration v1: initial schema");

    conn.execute_batch(r#"
        -- Configured video streams
        CREATE TABLE IF NOT EXISTS streams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            added_time TEXT,
            prompt_template TEXT DEFAULT 'DEFAULT_PROMPT_TEMPLATE'
        );

        -- One row per analysed frame
        CREATE TABLE IF NOT EXISTS analysis_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream_id INTEGER,
            timestamp TEXT NOT NULL,
            result TEXT NOT NULL,
            FOREIGN KEY (stream_id) REFERENCES streams(id) ON DELETE CASCADE
        );

        -- Re-identification memory
        CREATE TABLE IF NOT EXISTS person_features (
            id TEXT PRIMARY KEY,
            features TEXT,
            position TEXT,
            action TEXT,
            last_seen TEXT,
            created_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_results_stream ON analysis_results(stream_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_person_created ON person_features(created_at);
    "#)?;

    Ok(())
}

/// Add columns introduced after the first release to pre-existing tables
fn evolve_legacy_tables(conn: &Connection) -> Result<()> {
    if ensure_column(conn, "streams", "added_time", "TEXT")? {
        conn.execute(
            "UPDATE streams SET added_time = ?1 WHERE added_time IS NULL",
            [chrono::Utc::now().to_rfc3339()],
        )?;
    }
    ensure_column(
        conn,
        "streams",
        "prompt_template",
        "TEXT DEFAULT 'DEFAULT_PROMPT_TEMPLATE'",
    )?;

    ensure_column(conn, "person_features", "position", "TEXT")?;
    ensure_column(conn, "person_features", "action", "TEXT")?;
    if ensure_column(conn, "person_features", "created_at", "TEXT")? {
        conn.execute(
            "UPDATE person_features SET created_at = ?1 WHERE created_at IS NULL",
            [chrono::Utc::now().to_rfc3339()],
        )?;
    }

    Ok(())
}

/// Add `column` to `table` if the table exists without it.
///
/// Returns true if the column was added.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<bool> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() || columns.iter().any(|c| c == column) {
        return Ok(false);
    }

    info!("adding column {}.{}", table, column);
    conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, column, decl))?;
    Ok(true)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_legacy_tables_gain_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(r#"
            CREATE TABLE streams (id INTEGER PRIMARY KEY AUTOINCREMENT, url TEXT NOT NULL UNIQUE);
            CREATE TABLE person_features (id TEXT PRIMARY KEY, features TEXT, last_seen TEXT);
            INSERT INTO streams (url) VALUES ('rtsp://legacy/1');
            INSERT INTO person_features (id, features, last_seen) VALUES ('p1', '{}', '2024-01-01T00:00:00Z');
        "#).unwrap();

        run_all(&conn).unwrap();

        let streams = table_columns(&conn, "streams").unwrap();
        assert!(streams.contains(&"added_time".to_string()));
        assert!(streams.contains(&"prompt_template".to_string()));

        let people = table_columns(&conn, "person_features").unwrap();
        for column in ["position", "action", "created_at"] {
            assert!(people.contains(&column.to_string()), "missing {}", column);
        }

        let (added, template): (Option<String>, String) = conn
            .query_row("SELECT added_time, prompt_template FROM streams", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert!(added.is_some());
        assert_eq!(template, "DEFAULT_PROMPT_TEMPLATE");
    }

    #[test]
    fn test_missing_table_is_not_altered() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!ensure_column(&conn, "streams", "added_time", "TEXT").unwrap());
    }
}
