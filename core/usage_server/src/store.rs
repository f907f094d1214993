use rusqlite::{types::ValueRef, Connection, OptionalExtension};
use std::collections::BTreeMap;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use usage_protocol::CumulativeRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The increment would push a stored total past what the column holds.
    #[error("Duration for key '{0}' would overflow the stored total")]
    Overflow(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// One stored `(encoded key, seconds)` pair. `None` when the stored value is
/// not a usable number.
pub type StoredEntry = (String, Option<u64>);

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_totals (
  user_id TEXT NOT NULL,
  domain_key TEXT NOT NULL,
  seconds INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (user_id, domain_key)
);
"#,
    )?;
    Ok(())
}

/// Adds every duration in `data` to the user's totals, creating the user on
/// first use. All keys are applied in one transaction: on error nothing is
/// written.
pub fn increment_usage(
    conn: &mut Connection,
    user_id: &str,
    data: &BTreeMap<String, i64>,
) -> Result<CumulativeRecord, StoreError> {
    let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    let tx = conn.transaction()?;
    tx.execute(
        r#"
INSERT INTO users (user_id, created_at, updated_at) VALUES (?1, ?2, ?2)
ON CONFLICT(user_id) DO UPDATE SET updated_at = excluded.updated_at
        "#,
        (user_id, &now),
    )?;
    {
        let mut current = tx.prepare(
            "SELECT seconds FROM usage_totals WHERE user_id = ?1 AND domain_key = ?2",
        )?;
        let mut upsert = tx.prepare(
            r#"
INSERT INTO usage_totals (user_id, domain_key, seconds) VALUES (?1, ?2, ?3)
ON CONFLICT(user_id, domain_key) DO UPDATE SET seconds = seconds + excluded.seconds
            "#,
        )?;
        for (key, seconds) in data {
            // SQLite turns an overflowing integer sum into a REAL instead of
            // failing, so the bound is checked here.
            let stored: Option<i64> = current
                .query_row((user_id, key), |row| match row.get_ref(0)? {
                    ValueRef::Integer(v) => Ok(Some(v)),
                    _ => Ok(None),
                })
                .optional()?
                .flatten();
            if stored.unwrap_or(0).checked_add(*seconds).is_none() {
                return Err(StoreError::Overflow(key.clone()));
            }
            upsert.execute((user_id, key, seconds))?;
        }
    }
    let entries = list_entries(&tx, user_id)?;
    tx.commit()?;

    Ok(CumulativeRecord {
        user_id: user_id.to_string(),
        data: entries
            .into_iter()
            .filter_map(|(key, seconds)| seconds.map(|s| (key, s)))
            .collect(),
    })
}

/// Stored entries for a user, or `None` when the user has never synced.
pub fn load_record(
    conn: &mut Connection,
    user_id: &str,
) -> rusqlite::Result<Option<Vec<StoredEntry>>> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM users WHERE user_id = ?1",
            [user_id],
            |_| Ok(()),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }
    list_entries(conn, user_id).map(Some)
}

fn list_entries(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<StoredEntry>> {
    let mut stmt = conn.prepare(
        "SELECT domain_key, seconds FROM usage_totals WHERE user_id = ?1 ORDER BY domain_key",
    )?;
    let rows = stmt.query_map([user_id], |row| {
        let key: String = row.get(0)?;
        let seconds = match row.get_ref(1)? {
            ValueRef::Integer(v) => u64::try_from(v).ok(),
            ValueRef::Real(v) if v.is_finite() && v >= 0.0 => Some(v as u64),
            _ => None,
        };
        Ok((key, seconds))
    })?;
    let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn
    }

    fn data(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn increment_creates_then_adds() {
        let mut conn = open();
        assert!(load_record(&mut conn, "u1").unwrap().is_none());

        let rec = increment_usage(&mut conn, "u1", &data(&[("github_com", 30)])).unwrap();
        assert_eq!(rec.user_id, "u1");
        assert_eq!(rec.data["github_com"], 30);

        let rec = increment_usage(
            &mut conn,
            "u1",
            &data(&[("github_com", 12), ("youtube_com", 5)]),
        )
        .unwrap();
        assert_eq!(rec.data["github_com"], 42);
        assert_eq!(rec.data["youtube_com"], 5);

        let stored = load_record(&mut conn, "u1").unwrap().unwrap();
        assert_eq!(
            stored,
            vec![
                ("github_com".to_string(), Some(42)),
                ("youtube_com".to_string(), Some(5)),
            ]
        );
    }

    #[test]
    fn users_are_isolated() {
        let mut conn = open();
        increment_usage(&mut conn, "a", &data(&[("x_com", 1)])).unwrap();
        increment_usage(&mut conn, "b", &data(&[("x_com", 2)])).unwrap();
        let a = load_record(&mut conn, "a").unwrap().unwrap();
        assert_eq!(a, vec![("x_com".to_string(), Some(1))]);
    }

    #[test]
    fn empty_increment_still_creates_record() {
        let mut conn = open();
        let rec = increment_usage(&mut conn, "u1", &BTreeMap::new()).unwrap();
        assert!(rec.data.is_empty());
        assert_eq!(load_record(&mut conn, "u1").unwrap(), Some(vec![]));
    }

    #[test]
    fn failed_increment_applies_nothing() {
        let mut conn = open();
        conn.execute_batch(
            r#"
CREATE TRIGGER reject_boom BEFORE INSERT ON usage_totals
WHEN NEW.domain_key = 'boom'
BEGIN SELECT RAISE(ABORT, 'boom'); END;
"#,
        )
        .unwrap();

        let err = increment_usage(&mut conn, "u1", &data(&[("a_com", 10), ("boom", 1)]));
        assert!(matches!(err, Err(StoreError::Sqlite(_))));
        assert!(load_record(&mut conn, "u1").unwrap().is_none());
    }

    #[test]
    fn non_numeric_values_load_as_none() {
        let mut conn = open();
        increment_usage(&mut conn, "u1", &data(&[("a_com", 10)])).unwrap();
        conn.execute(
            "INSERT INTO usage_totals (user_id, domain_key, seconds) VALUES ('u1', 'bad_com', 'oops')",
            [],
        )
        .unwrap();
        let stored = load_record(&mut conn, "u1").unwrap().unwrap();
        assert_eq!(
            stored,
            vec![("a_com".to_string(), Some(10)), ("bad_com".to_string(), None)]
        );
    }

    #[test]
    fn overflowing_increment_is_rejected_and_applies_nothing() {
        let mut conn = open();
        increment_usage(&mut conn, "u1", &data(&[("github_com", i64::MAX)])).unwrap();

        let err = increment_usage(
            &mut conn,
            "u1",
            &data(&[("a_com", 5), ("github_com", 1)]),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Overflow(ref key) if key == "github_com"));

        let stored = load_record(&mut conn, "u1").unwrap().unwrap();
        assert_eq!(
            stored,
            vec![("github_com".to_string(), Some(i64::MAX as u64))]
        );
    }
}
