use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the issue database.
///
/// Wraps `IssueDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<IssueDb>>,
}

impl DbHandle {
    pub fn new(db: IssueDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut IssueDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct IssueDb {
    conn: Connection,
}

const ISSUE_COLUMNS: &str = "id, doc_id, text, issue_type, status, suggested_fix, explanation, location, \
     review_initiated_by, review_initiated_at, resolved_by, resolved_at, modified_fields, dismissal_feedback";

impl IssueDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // Every commit must be on disk before a store call returns.
        self.conn
            .execute_batch("PRAGMA synchronous = FULL;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS issues (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL,
                    doc_id TEXT NOT NULL,
                    text TEXT NOT NULL,
                    issue_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'not_reviewed',
                    suggested_fix TEXT NOT NULL DEFAULT '',
                    explanation TEXT NOT NULL DEFAULT '',
                    location TEXT,
                    review_initiated_by TEXT NOT NULL,
                    review_initiated_at TEXT NOT NULL,
                    resolved_by TEXT,
                    resolved_at TEXT,
                    modified_fields TEXT,
                    dismissal_feedback TEXT,
                    UNIQUE(doc_id, id)
                );

                CREATE INDEX IF NOT EXISTS idx_issues_doc ON issues(doc_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    /// All issues for a document in insertion order.
    pub fn list_issues(&self, doc_id: &str) -> Result<Vec<Issue>> {
        let sql = format!(
            "SELECT {} FROM issues WHERE doc_id = ?1 ORDER BY seq",
            ISSUE_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map(params![doc_id], IssueRow::from_row)
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            let r = row.context("Failed to read issue row")?;
            issues.push(r.into_issue()?);
        }
        Ok(issues)
    }

    pub fn get_issue(&self, doc_id: &str, issue_id: &str) -> Result<Option<Issue>> {
        let sql = format!(
            "SELECT {} FROM issues WHERE doc_id = ?1 AND id = ?2",
            ISSUE_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![doc_id, issue_id], IssueRow::from_row)
            .optional()
            .context("Failed to query issue")?;
        row.map(IssueRow::into_issue).transpose()
    }

    /// Insert or fully replace each issue keyed by `(doc_id, id)` in one
    /// transaction. Replacing keeps the original `seq`, so listing order is
    /// stable across updates.
    pub fn upsert_issues(&mut self, issues: &[Issue]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin upsert transaction")?;
        for issue in issues {
            Self::upsert_one(&tx, issue)?;
        }
        tx.commit().context("Failed to commit upserted issues")?;
        Ok(())
    }

    /// Read-merge-write one issue in a single transaction. Returns `None` when
    /// the issue does not exist.
    pub fn update_issue(
        &mut self,
        doc_id: &str,
        issue_id: &str,
        update: &IssueUpdate,
    ) -> Result<Option<Issue>> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin update transaction")?;
        let sql = format!(
            "SELECT {} FROM issues WHERE doc_id = ?1 AND id = ?2",
            ISSUE_COLUMNS
        );
        let current = tx
            .query_row(&sql, params![doc_id, issue_id], IssueRow::from_row)
            .optional()
            .context("Failed to query issue for update")?;
        let Some(row) = current else {
            return Ok(None);
        };
        let mut issue = row.into_issue()?;
        update.apply_to(&mut issue);
        Self::upsert_one(&tx, &issue)?;
        tx.commit().context("Failed to commit issue update")?;
        Ok(Some(issue))
    }

    fn upsert_one(conn: &Connection, issue: &Issue) -> Result<()> {
        conn.execute(
            "INSERT INTO issues (id, doc_id, text, issue_type, status, suggested_fix, explanation, location,
                                 review_initiated_by, review_initiated_at, resolved_by, resolved_at,
                                 modified_fields, dismissal_feedback)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(doc_id, id) DO UPDATE SET
                text = excluded.text,
                issue_type = excluded.issue_type,
                status = excluded.status,
                suggested_fix = excluded.suggested_fix,
                explanation = excluded.explanation,
                location = excluded.location,
                review_initiated_by = excluded.review_initiated_by,
                review_initiated_at = excluded.review_initiated_at,
                resolved_by = excluded.resolved_by,
                resolved_at = excluded.resolved_at,
                modified_fields = excluded.modified_fields,
                dismissal_feedback = excluded.dismissal_feedback",
            params![
                issue.id,
                issue.doc_id,
                issue.text,
                issue.issue_type.as_str(),
                issue.status.as_str(),
                issue.suggested_fix,
                issue.explanation,
                to_json_column(&issue.location)?,
                issue.review_initiated_by,
                issue.review_initiated_at.to_rfc3339(),
                issue.resolved_by,
                issue.resolved_at.map(|t| t.to_rfc3339()),
                to_json_column(&issue.modified_fields)?,
                to_json_column(&issue.dismissal_feedback)?,
            ],
        )
        .with_context(|| format!("Failed to upsert issue {}", issue.id))?;
        Ok(())
    }
}

#[cfg(test)]
impl IssueDb {
    fn count_issues(&self, doc_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM issues WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .context("Failed to count issues")
    }
}

fn to_json_column<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).context("Failed to serialize JSON column"))
        .transpose()
}

fn from_json_column<T: serde::de::DeserializeOwned>(
    value: Option<String>,
    column: &str,
) -> Result<Option<T>> {
    value
        .map(|s| {
            serde_json::from_str(&s).with_context(|| format!("Failed to parse {} column", column))
        })
        .transpose()
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

/// Raw column values, converted to an `Issue` outside the rusqlite row callback.
struct IssueRow {
    id: String,
    doc_id: String,
    text: String,
    issue_type: String,
    status: String,
    suggested_fix: String,
    explanation: String,
    location: Option<String>,
    review_initiated_by: String,
    review_initiated_at: String,
    resolved_by: Option<String>,
    resolved_at: Option<String>,
    modified_fields: Option<String>,
    dismissal_feedback: Option<String>,
}

impl IssueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            doc_id: row.get(1)?,
            text: row.get(2)?,
            issue_type: row.get(3)?,
            status: row.get(4)?,
            suggested_fix: row.get(5)?,
            explanation: row.get(6)?,
            location: row.get(7)?,
            review_initiated_by: row.get(8)?,
            review_initiated_at: row.get(9)?,
            resolved_by: row.get(10)?,
            resolved_at: row.get(11)?,
            modified_fields: row.get(12)?,
            dismissal_feedback: row.get(13)?,
        })
    }

    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            issue_type: IssueType::from_str(&self.issue_type).map_err(|e| anyhow::anyhow!(e))?,
            status: IssueStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            location: from_json_column(self.location, "location")?,
            review_initiated_at: parse_timestamp(&self.review_initiated_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
            modified_fields: from_json_column(self.modified_fields, "modified_fields")?,
            dismissal_feedback: from_json_column(self.dismissal_feedback, "dismissal_feedback")?,
            id: self.id,
            doc_id: self.doc_id,
            text: self.text,
            suggested_fix: self.suggested_fix,
            explanation: self.explanation,
            review_initiated_by: self.review_initiated_by,
            resolved_by: self.resolved_by,
        })
    }
}
