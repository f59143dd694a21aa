//! Job repository: CRUD operations for the `jobs` table.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub video_path: String,
    pub video_name: String,
    pub config: String,
    pub progress: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub log_file: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("type")?,
            status: row.get("status")?,
            video_path: row.get("video_path")?,
            video_name: row.get("video_name")?,
            config: row.get("config")?,
            progress: row.get("progress")?,
            result: row.get("result")?,
            error: row.get("error")?,
            log_file: row.get("log_file")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Row-level filter for job listing. Empty vectors mean "any".
#[derive(Debug, Default, Clone)]
pub struct RowFilter {
    pub statuses: Vec<String>,
    pub types: Vec<String>,
    pub video_path: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A status change applied only if the row is currently in one of `from`.
#[derive(Debug, Clone, Default)]
pub struct Transition<'a> {
    pub id: &'a str,
    pub to: &'a str,
    pub from: &'a [&'a str],
    pub at: &'a str,
    /// Set `started_at` to `at` unless already set.
    pub stamp_started: bool,
    /// Set `completed_at` to `at` unless already set.
    pub stamp_completed: bool,
    pub log_file: Option<&'a str>,
    pub result: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Outcome of [`transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The update was applied; holds the row after the change.
    Applied(JobRow),
    /// No job with that id.
    Missing,
    /// The job exists but its status is not a legal predecessor.
    Rejected(JobRow),
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, type, status, video_path, video_name, config, progress,
             result, error, log_file, created_at, started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.job_type,
                job.status,
                job.video_path,
                job.video_name,
                job.config,
                job.progress,
                job.result,
                job.error,
                job.log_file,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

fn select_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| select_by_id(conn, id))
}

fn push_in_clause(
    column: &str,
    values: &[String],
    conditions: &mut Vec<String>,
    param_values: &mut Vec<Box<dyn ToSql>>,
) {
    if values.is_empty() {
        return;
    }
    let placeholders: Vec<String> = values
        .iter()
        .map(|value| {
            param_values.push(Box::new(value.clone()));
            format!("?{}", param_values.len())
        })
        .collect();
    conditions.push(format!("{} IN ({})", column, placeholders.join(", ")));
}

/// Queries jobs with filters, newest first, returning (rows, total_count).
pub fn query(db: &Database, filter: &RowFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

        push_in_clause("status", &filter.statuses, &mut conditions, &mut param_values);
        push_in_clause("type", &filter.types, &mut conditions, &mut param_values);
        if let Some(ref video_path) = filter.video_path {
            param_values.push(Box::new(video_path.clone()));
            conditions.push(format!("video_path = ?{}", param_values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        // rowid breaks ties so pagination is stable.
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Applies a conditional status change in a single statement.
pub fn transition(db: &Database, t: &Transition<'_>) -> Result<TransitionOutcome, DatabaseError> {
    db.with_conn(|conn| {
        if t.from.is_empty() {
            return Ok(match select_by_id(conn, t.id)? {
                Some(row) => TransitionOutcome::Rejected(row),
                None => TransitionOutcome::Missing,
            });
        }

        let mut param_values: Vec<Box<dyn ToSql>> = vec![
            Box::new(t.to.to_string()),
            Box::new(t.at.to_string()),
            Box::new(t.stamp_started),
            Box::new(t.stamp_completed),
            Box::new(t.log_file.map(|s| s.to_string())),
            Box::new(t.result.map(|s| s.to_string())),
            Box::new(t.error.map(|s| s.to_string())),
            Box::new(t.id.to_string()),
        ];
        let placeholders: Vec<String> = t
            .from
            .iter()
            .map(|status| {
                param_values.push(Box::new(status.to_string()));
                format!("?{}", param_values.len())
            })
            .collect();

        let sql = format!(
            "UPDATE jobs SET
               status = ?1,
               updated_at = ?2,
               started_at = CASE WHEN ?3 THEN COALESCE(started_at, ?2) ELSE started_at END,
               completed_at = CASE WHEN ?4 THEN COALESCE(completed_at, ?2) ELSE completed_at END,
               log_file = COALESCE(log_file, ?5),
               result = COALESCE(?6, result),
               error = COALESCE(?7, error)
             WHERE id = ?8 AND status IN ({})",
            placeholders.join(", ")
        );

        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let changed = conn.execute(&sql, params_ref.as_slice())?;

        let row = select_by_id(conn, t.id)?;
        Ok(match (changed, row) {
            (_, None) => TransitionOutcome::Missing,
            (0, Some(row)) => TransitionOutcome::Rejected(row),
            (_, Some(row)) => TransitionOutcome::Applied(row),
        })
    })
}

/// Read-modify-write of the progress column under one lock.
///
/// Returns the new progress JSON, or `None` if the job does not exist.
pub fn modify_progress<F>(
    db: &Database,
    id: &str,
    updated_at: &str,
    f: F,
) -> Result<Option<String>, DatabaseError>
where
    F: FnOnce(&str) -> String,
{
    db.with_conn(|conn| {
        let current: Option<String> = conn
            .query_row(
                "SELECT progress FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Ok(None);
        };

        let updated = f(&current);
        conn.execute(
            "UPDATE jobs SET progress = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, updated, updated_at],
        )?;
        Ok(Some(updated))
    })
}

/// Deletes a job; its log lines go with it. Returns false if absent.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            job_type: "analysis".to_string(),
            status: "queued".to_string(),
            video_path: "/v/clip.mp4".to_string(),
            video_name: "clip.mp4".to_string(),
            config: "{}".to_string(),
            progress: r#"{"percent":0,"steps":[]}"#.to_string(),
            result: None,
            error: None,
            log_file: None,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            started_at: None,
            completed_at: None,
            updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
        }
    }

    fn start(id: &str) -> Transition<'_> {
        Transition {
            id,
            to: "running",
            from: &["queued"],
            at: "2026-01-01T00:01:00.000000Z",
            stamp_started: true,
            log_file: Some("/logs/a.log"),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found, sample_job("job-1"));
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_transition_applies_from_legal_state() {
        let db = test_db();
        insert(&db, &sample_job("t1")).unwrap();

        let outcome = transition(&db, &start("t1")).unwrap();
        let TransitionOutcome::Applied(row) = outcome else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert_eq!(row.status, "running");
        assert_eq!(row.started_at.as_deref(), Some("2026-01-01T00:01:00.000000Z"));
        assert_eq!(row.log_file.as_deref(), Some("/logs/a.log"));
        assert!(row.completed_at.is_none());
    }

    #[test]
    fn test_transition_rejected_from_illegal_state() {
        let db = test_db();
        insert(&db, &sample_job("t2")).unwrap();
        transition(&db, &start("t2")).unwrap();

        // Second start must not re-stamp started_at.
        let mut again = start("t2");
        again.at = "2026-01-01T09:00:00.000000Z";
        let outcome = transition(&db, &again).unwrap();
        let TransitionOutcome::Rejected(row) = outcome else {
            panic!("expected rejection, got {:?}", outcome);
        };
        assert_eq!(row.started_at.as_deref(), Some("2026-01-01T00:01:00.000000Z"));
    }

    #[test]
    fn test_transition_missing_job() {
        let db = test_db();
        assert_eq!(
            transition(&db, &start("ghost")).unwrap(),
            TransitionOutcome::Missing
        );
    }

    #[test]
    fn test_transition_to_terminal_stores_payload() {
        let db = test_db();
        insert(&db, &sample_job("t3")).unwrap();
        transition(&db, &start("t3")).unwrap();

        let outcome = transition(
            &db,
            &Transition {
                id: "t3",
                to: "completed",
                from: &["running"],
                at: "2026-01-01T00:02:00.000000Z",
                stamp_completed: true,
                result: Some(r#"{"clips":[]}"#),
                ..Default::default()
            },
        )
        .unwrap();
        let TransitionOutcome::Applied(row) = outcome else {
            panic!("expected applied");
        };
        assert_eq!(row.status, "completed");
        assert_eq!(row.result.as_deref(), Some(r#"{"clips":[]}"#));
        assert!(row.error.is_none());
        assert_eq!(row.completed_at.as_deref(), Some("2026-01-01T00:02:00.000000Z"));
    }

    #[test]
    fn test_query_status_set() {
        let db = test_db();
        insert(&db, &sample_job("a")).unwrap();
        let mut running = sample_job("b");
        running.status = "running".to_string();
        insert(&db, &running).unwrap();
        let mut failed = sample_job("c");
        failed.status = "failed".to_string();
        insert(&db, &failed).unwrap();

        let (rows, total) = query(
            &db,
            &RowFilter {
                statuses: vec!["running".to_string(), "queued".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 2);
        assert!(rows.iter().all(|r| r.status == "running" || r.status == "queued"));
    }

    #[test]
    fn test_query_orders_newest_first_with_stable_pagination() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.created_at = format!("2026-01-{:02}T00:00:00.000000Z", i + 1);
            insert(&db, &job).unwrap();
        }

        let page = |offset| {
            query(
                &db,
                &RowFilter {
                    limit: Some(4),
                    offset: Some(offset),
                    ..Default::default()
                },
            )
            .unwrap()
        };

        let (first, total) = page(0);
        let (second, _) = page(4);
        assert_eq!(total, 10);
        let ids: Vec<_> = first.iter().chain(second.iter()).map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p9", "p8", "p7", "p6", "p5", "p4", "p3", "p2"]);
    }

    #[test]
    fn test_query_by_type_and_path() {
        let db = test_db();
        insert(&db, &sample_job("x")).unwrap();
        let mut other = sample_job("y");
        other.job_type = "scene".to_string();
        other.video_path = "/v/other.mp4".to_string();
        insert(&db, &other).unwrap();

        let (rows, _) = query(
            &db,
            &RowFilter {
                types: vec!["scene".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "y");

        let (rows, _) = query(
            &db,
            &RowFilter {
                video_path: Some("/v/clip.mp4".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "x");
    }

    #[test]
    fn test_modify_progress() {
        let db = test_db();
        insert(&db, &sample_job("m1")).unwrap();

        let updated = modify_progress(&db, "m1", "2026-01-01T00:05:00.000000Z", |old| {
            assert!(old.contains("percent"));
            r#"{"percent":10,"steps":[]}"#.to_string()
        })
        .unwrap();
        assert_eq!(updated.as_deref(), Some(r#"{"percent":10,"steps":[]}"#));

        let row = find_by_id(&db, "m1").unwrap().unwrap();
        assert_eq!(row.progress, r#"{"percent":10,"steps":[]}"#);
        assert_eq!(row.updated_at, "2026-01-01T00:05:00.000000Z");

        assert!(modify_progress(&db, "ghost", "t", |s| s.to_string())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_concurrent_modify_progress_loses_no_update() {
        let db = test_db();
        insert(&db, &sample_job("c1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        modify_progress(&db, "c1", "2026-01-01T00:05:00.000000Z", |old| {
                            let n: u64 = old.parse().unwrap_or(0);
                            (n + 1).to_string()
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let row = find_by_id(&db, "c1").unwrap().unwrap();
        assert_eq!(row.progress, "200");
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        insert(&db, &sample_job("d1")).unwrap();
        assert!(delete(&db, "d1").unwrap());
        assert!(!delete(&db, "d1").unwrap());
        assert!(find_by_id(&db, "d1").unwrap().is_none());
    }
}
