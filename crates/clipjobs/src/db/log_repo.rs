//! Job log repository: append-only lines in the `job_logs` table.

use rusqlite::params;

use super::{Database, DatabaseError};

/// A raw log row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub id: i64,
    pub job_id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Appends a log line and returns its sequence number.
///
/// Fails with a constraint violation when `job_id` does not exist.
pub fn insert(
    db: &Database,
    job_id: &str,
    timestamp: &str,
    level: &str,
    message: &str,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_logs (job_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, timestamp, level, message],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Lists a job's log lines in append order.
pub fn list_for_job(
    db: &Database,
    job_id: &str,
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let offset = offset.unwrap_or(0) as i64;

        let mut stmt = conn.prepare(
            "SELECT id, job_id, timestamp, level, message FROM job_logs
             WHERE job_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![job_id, limit, offset], |row| {
                Ok(LogRow {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    level: row.get(3)?,
                    message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::{self, JobRow};

    fn db_with_job(id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        job_repo::insert(
            &db,
            &JobRow {
                id: id.to_string(),
                job_type: "analysis".to_string(),
                status: "running".to_string(),
                video_path: "/v/a.mp4".to_string(),
                video_name: "a.mp4".to_string(),
                config: "{}".to_string(),
                progress: "{}".to_string(),
                result: None,
                error: None,
                log_file: None,
                created_at: "t0".to_string(),
                started_at: None,
                completed_at: None,
                updated_at: "t0".to_string(),
            },
        )
        .unwrap();
        db
    }

    #[test]
    fn test_insert_assigns_increasing_seq() {
        let db = db_with_job("j1");
        let a = insert(&db, "j1", "t1", "info", "first").unwrap();
        let b = insert(&db, "j1", "t2", "error", "second").unwrap();
        assert!(b > a);
        assert_eq!(list_for_job(&db, "j1", None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_insert_for_missing_job_is_constraint_violation() {
        let db = db_with_job("j1");
        let err = insert(&db, "ghost", "t1", "info", "x").unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_list_in_order_with_paging() {
        let db = db_with_job("j1");
        for (i, msg) in ["a", "b", "c", "d"].iter().enumerate() {
            insert(&db, "j1", &format!("t{}", i), "info", msg).unwrap();
        }

        let all = list_for_job(&db, "j1", None, None).unwrap();
        let messages: Vec<_> = all.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c", "d"]);

        let page = list_for_job(&db, "j1", Some(2), Some(1)).unwrap();
        let messages: Vec<_> = page.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_same_timestamp_falls_back_to_insertion_order() {
        let db = db_with_job("j1");
        insert(&db, "j1", "t", "info", "one").unwrap();
        insert(&db, "j1", "t", "info", "two").unwrap();
        let rows = list_for_job(&db, "j1", None, None).unwrap();
        assert_eq!(rows[0].message, "one");
        assert_eq!(rows[1].message, "two");
    }
}
