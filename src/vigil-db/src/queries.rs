//! Database query functions

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, Row};

use crate::error::DatabaseError;
use crate::schema::*;

/// Register a stream url, returning its new id
pub fn add_stream(conn: &Connection, url: &str, prompt_template: &str) -> Result<i64> {
    let inserted = conn.execute(
        "INSERT INTO streams (url, added_time, prompt_template) VALUES (?1, ?2, ?3)",
        params![url, timestamp(Utc::now()), prompt_template],
    );

    match inserted {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(DatabaseError::Duplicate(format!("stream {}", url)).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete a stream; returns false if the id was unknown
pub fn remove_stream(conn: &Connection, id: i64) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM streams WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

/// All configured streams in id order
pub fn get_all_streams(conn: &Connection) -> Result<Vec<StreamRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, url, added_time, prompt_template FROM streams ORDER BY id",
    )?;

    let streams = stmt
        .query_map([], row_to_stream)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(streams)
}

/// Get stream by ID
pub fn get_stream(conn: &Connection, id: i64) -> Result<Option<StreamRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, url, added_time, prompt_template FROM streams WHERE id = ?1",
    )?;

    match stmt.query_row(params![id], row_to_stream) {
        Ok(s) => Ok(Some(s)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reassign the prompt template of a stream
pub fn set_stream_prompt_template(conn: &Connection, id: i64, template: &str) -> Result<()> {
    let updated = conn.execute(
        "UPDATE streams SET prompt_template = ?1 WHERE id = ?2",
        params![template, id],
    )?;

    if updated == 0 {
        return Err(DatabaseError::NotFound(format!("stream {}", id)).into());
    }
    Ok(())
}

/// Append one analysis result
pub fn save_analysis_result(conn: &Connection, result: &NewAnalysisResult) -> Result<i64> {
    let json = serde_json::to_string(&result.result).map_err(DatabaseError::from)?;
    conn.execute(
        "INSERT INTO analysis_results (stream_id, timestamp, result) VALUES (?1, ?2, ?3)",
        params![result.stream_id, timestamp(result.timestamp), json],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent results, newest first, optionally for one stream
pub fn recent_analysis_results(
    conn: &Connection,
    stream_id: Option<i64>,
    limit: i64,
) -> Result<Vec<AnalysisRecord>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, stream_id, timestamp, result
           FROM analysis_results
           WHERE ?1 IS NULL OR stream_id = ?1
           ORDER BY timestamp DESC, id DESC
           LIMIT ?2"#,
    )?;

    let results = stmt
        .query_map(params![stream_id, limit], |row| {
            let raw: String = row.get(3)?;
            Ok(AnalysisRecord {
                id: row.get(0)?,
                stream_id: row.get(1)?,
                timestamp: parse_datetime(row, 2)?,
                // rows written by other tools may hold plain text
                result: serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(results)
}

/// Number of stored results for a stream
pub fn count_analysis_results(conn: &Connection, stream_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM analysis_results WHERE stream_id = ?1",
        params![stream_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Insert or replace the record for a person, stamping `created_at` now
pub fn save_person_features(conn: &Connection, person: &PersonFeatures) -> Result<()> {
    let features = serde_json::to_string(&person.features).map_err(DatabaseError::from)?;
    conn.execute(
        r#"INSERT OR REPLACE INTO person_features
           (id, features, position, action, last_seen, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        params![
            person.id,
            features,
            person.position,
            person.action,
            timestamp(person.last_seen),
            timestamp(person.created_at),
        ],
    )?;
    Ok(())
}

/// Live person records; anything older than the retention window is deleted first
pub fn get_person_features(conn: &Connection) -> Result<Vec<PersonFeatures>> {
    get_person_features_at(conn, Utc::now())
}

/// `get_person_features` evaluated at a given instant
pub fn get_person_features_at(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<PersonFeatures>> {
    let cutoff = now - Duration::seconds(PERSON_RETENTION_SECS);

    let mut stmt = conn.prepare(
        "SELECT id, features, position, action, last_seen, created_at FROM person_features ORDER BY id",
    )?;

    let rows = stmt
        .query_map([], |row| {
            let features: Option<String> = row.get(1)?;
            Ok(PersonFeatures {
                id: row.get(0)?,
                features: features
                    .and_then(|f| serde_json::from_str(&f).ok())
                    .unwrap_or(serde_json::Value::Null),
                position: row.get(2)?,
                action: row.get(3)?,
                last_seen: parse_datetime(row, 4)?,
                created_at: parse_datetime(row, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let (live, expired): (Vec<_>, Vec<_>) = rows.into_iter().partition(|p| p.created_at >= cutoff);

    if !expired.is_empty() {
        let tx = conn.unchecked_transaction()?;
        {
            let mut delete = tx.prepare_cached("DELETE FROM person_features WHERE id = ?1")?;
            for person in &expired {
                delete.execute(params![person.id])?;
            }
        }
        tx.commit()?;
        tracing::debug!("evicted {} expired person records", expired.len());
    }

    Ok(live)
}

// Helper functions

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_stream(row: &Row) -> rusqlite::Result<StreamRecord> {
    let template: Option<String> = row.get(3)?;
    Ok(StreamRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        added_time: parse_datetime(row, 2)?,
        prompt_template: template.unwrap_or_else(|| DEFAULT_TEMPLATE_NAME.to_string()),
    })
}

/// Accepts rfc3339, SQLite's datetime text, or unix seconds
fn parse_datetime(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let conversion_error = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(DatabaseError::InvalidData(msg)),
        )
    };

    match row.get_ref(idx)? {
        ValueRef::Null => Ok(DateTime::<Utc>::UNIX_EPOCH),
        ValueRef::Integer(secs) => DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| conversion_error(format!("timestamp {} out of range", secs))),
        ValueRef::Real(secs) => DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
            .ok_or_else(|| conversion_error(format!("timestamp {} out of range", secs))),
        ValueRef::Text(bytes) => {
            let s = String::from_utf8_lossy(bytes);
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| {
                    // Try SQLite datetime format
                    chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                        .map(|dt| dt.and_utc())
                })
                .map_err(|e| conversion_error(format!("'{}': {}", s, e)))
        }
        ValueRef::Blob(_) => Err(conversion_error("blob is not a timestamp".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::TimeZone;
    use serde_json::json;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn person(id: &str, created_at: DateTime<Utc>) -> PersonFeatures {
        PersonFeatures {
            id: id.to_string(),
            features: json!({"helmet": "yellow"}),
            position: Some("left".to_string()),
            action: Some("walking".to_string()),
            last_seen: created_at,
            created_at,
        }
    }

    #[test]
    fn test_stream_crud() {
        let db = db();
        let conn = db.connection();

        let a = add_stream(conn, "rtsp://cam/1", DEFAULT_TEMPLATE_NAME).unwrap();
        let b = add_stream(conn, "rtsp://cam/2", "HARDHAT").unwrap();
        assert_ne!(a, b);

        let all = get_all_streams(conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].prompt_template, "HARDHAT");

        set_stream_prompt_template(conn, a, "HARDHAT").unwrap();
        assert_eq!(get_stream(conn, a).unwrap().unwrap().prompt_template, "HARDHAT");

        assert!(remove_stream(conn, a).unwrap());
        assert!(!remove_stream(conn, a).unwrap());
        assert!(get_stream(conn, a).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_url_is_rejected() {
        let db = db();
        let conn = db.connection();
        add_stream(conn, "rtsp://cam/1", DEFAULT_TEMPLATE_NAME).unwrap();

        let err = add_stream(conn, "rtsp://cam/1", DEFAULT_TEMPLATE_NAME).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatabaseError>(),
            Some(DatabaseError::Duplicate(_))
        ));
    }

    #[test]
    fn test_set_template_on_unknown_stream() {
        let db = db();
        let err = set_stream_prompt_template(db.connection(), 99, "X").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatabaseError>(),
            Some(DatabaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_results_are_listed_newest_first() {
        let db = db();
        let conn = db.connection();
        let a = add_stream(conn, "rtsp://cam/1", DEFAULT_TEMPLATE_NAME).unwrap();
        let b = add_stream(conn, "rtsp://cam/2", DEFAULT_TEMPLATE_NAME).unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        for (i, stream_id) in [a, b, a].into_iter().enumerate() {
            save_analysis_result(
                conn,
                &NewAnalysisResult {
                    stream_id,
                    timestamp: t0 + Duration::seconds(i as i64),
                    result: json!({"violation_detected": false, "seq": i}),
                },
            )
            .unwrap();
        }

        assert_eq!(count_analysis_results(conn, a).unwrap(), 2);

        let all = recent_analysis_results(conn, None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].result["seq"], 2);

        let only_b = recent_analysis_results(conn, Some(b), 10).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].timestamp, t0 + Duration::seconds(1));
    }

    #[test]
    fn test_removing_stream_drops_its_results() {
        let db = db();
        let conn = db.connection();
        let id = add_stream(conn, "rtsp://cam/1", DEFAULT_TEMPLATE_NAME).unwrap();
        save_analysis_result(
            conn,
            &NewAnalysisResult {
                stream_id: id,
                timestamp: Utc::now(),
                result: json!({"raw_text": "ok"}),
            },
        )
        .unwrap();

        remove_stream(conn, id).unwrap();
        assert_eq!(count_analysis_results(conn, id).unwrap(), 0);
    }

    #[test]
    fn test_person_features_expire_after_two_hours() {
        let db = db();
        let conn = db.connection();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        save_person_features(conn, &person("p1", t)).unwrap();
        save_person_features(conn, &person("p2", t + Duration::minutes(30))).unwrap();

        let live = get_person_features_at(conn, t + Duration::minutes(119)).unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0], person("p1", t));

        let live = get_person_features_at(conn, t + Duration::minutes(121)).unwrap();
        assert_eq!(live.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["p2"]);

        // eviction is persistent
        let live = get_person_features_at(conn, t).unwrap();
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_person_features_replace_by_id() {
        let db = db();
        let conn = db.connection();
        let t = Utc::now();

        save_person_features(conn, &person("p1", t)).unwrap();
        let mut moved = person("p1", t);
        moved.position = Some("gate".to_string());
        save_person_features(conn, &moved).unwrap();

        let live = get_person_features(conn).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].position.as_deref(), Some("gate"));
    }

    #[test]
    fn test_legacy_unix_timestamps_are_read() {
        let db = db();
        let conn = db.connection();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO person_features (id, features, last_seen, created_at) VALUES ('old', '[]', ?1, ?2)",
            params![now.timestamp() as f64, now.timestamp() as f64 + 0.5],
        )
        .unwrap();

        let live = get_person_features(conn).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].created_at.timestamp(), now.timestamp());
    }
}
