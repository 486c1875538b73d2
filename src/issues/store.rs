//! Issue persistence abstraction.
//!
//! `IssueStore` is the only way the rest of the crate reads or writes issues.
//! `SqliteIssueStore` is the production backend; `InMemoryIssueStore` backs
//! tests and ephemeral runs.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::db::{DbHandle, IssueDb};
use super::models::{Issue, IssueUpdate};
use crate::errors::{ReviewError, ReviewResult};

/// Keyed collection of issues, identified by `(doc_id, id)`.
///
/// Every operation is durable before it returns `Ok`.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Every issue for the document, in insertion order. Empty if none.
    async fn get_all(&self, doc_id: &str) -> ReviewResult<Vec<Issue>>;

    /// One issue, or `NotFound`.
    async fn get_one(&self, doc_id: &str, issue_id: &str) -> ReviewResult<Issue>;

    /// Insert or fully replace each issue keyed by `(doc_id, id)`.
    async fn upsert_many(&self, issues: &[Issue]) -> ReviewResult<()>;

    /// Merge `update` into the stored record and return the result, or `NotFound`.
    async fn update_fields(
        &self,
        doc_id: &str,
        issue_id: &str,
        update: IssueUpdate,
    ) -> ReviewResult<Issue>;
}

// ── SQLite ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteIssueStore {
    db: DbHandle,
}

impl SqliteIssueStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(IssueDb::new(path)?),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(IssueDb::new_in_memory()?),
        })
    }
}

#[async_trait]
impl IssueStore for SqliteIssueStore {
    async fn get_all(&self, doc_id: &str) -> ReviewResult<Vec<Issue>> {
        let owned = doc_id.to_string();
        let issues = self.db.call(move |db| db.list_issues(&owned)).await?;
        tracing::debug!(doc_id, count = issues.len(), "Retrieved issues");
        Ok(issues)
    }

    async fn get_one(&self, doc_id: &str, issue_id: &str) -> ReviewResult<Issue> {
        let (d, i) = (doc_id.to_string(), issue_id.to_string());
        self.db
            .call(move |db| db.get_issue(&d, &i))
            .await?
            .ok_or_else(|| ReviewError::not_found(doc_id, issue_id))
    }

    async fn upsert_many(&self, issues: &[Issue]) -> ReviewResult<()> {
        if issues.is_empty() {
            return Ok(());
        }
        let owned = issues.to_vec();
        let count = owned.len();
        self.db.call(move |db| db.upsert_issues(&owned)).await?;
        tracing::debug!(count, "Stored issues");
        Ok(())
    }

    async fn update_fields(
        &self,
        doc_id: &str,
        issue_id: &str,
        update: IssueUpdate,
    ) -> ReviewResult<Issue> {
        let (d, i) = (doc_id.to_string(), issue_id.to_string());
        let updated = self
            .db
            .call(move |db| db.update_issue(&d, &i, &update))
            .await?
            .ok_or_else(|| ReviewError::not_found(doc_id, issue_id))?;
        tracing::debug!(doc_id, issue_id, "Updated issue");
        Ok(updated)
    }
}

// ── In-memory ─────────────────────────────────────────────────────────

/// In-memory issue store.
///
/// Issues live in a per-document `Vec` behind a `RwLock`; all state is lost
/// on restart.
#[derive(Default)]
pub struct InMemoryIssueStore {
    docs: RwLock<HashMap<String, Vec<Issue>>>,
}

impl InMemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueStore for InMemoryIssueStore {
    async fn get_all(&self, doc_id: &str) -> ReviewResult<Vec<Issue>> {
        let docs = self.docs.read().await;
        Ok(docs.get(doc_id).cloned().unwrap_or_default())
    }

    async fn get_one(&self, doc_id: &str, issue_id: &str) -> ReviewResult<Issue> {
        let docs = self.docs.read().await;
        docs.get(doc_id)
            .and_then(|issues| issues.iter().find(|i| i.id == issue_id))
            .cloned()
            .ok_or_else(|| ReviewError::not_found(doc_id, issue_id))
    }

    async fn upsert_many(&self, issues: &[Issue]) -> ReviewResult<()> {
        let mut docs = self.docs.write().await;
        for issue in issues {
            let entry = docs.entry(issue.doc_id.clone()).or_default();
            match entry.iter_mut().find(|i| i.id == issue.id) {
                Some(existing) => *existing = issue.clone(),
                None => entry.push(issue.clone()),
            }
        }
        Ok(())
    }

    async fn update_fields(
        &self,
        doc_id: &str,
        issue_id: &str,
        update: IssueUpdate,
    ) -> ReviewResult<Issue> {
        let mut docs = self.docs.write().await;
        let issue = docs
            .get_mut(doc_id)
            .and_then(|issues| issues.iter_mut().find(|i| i.id == issue_id))
            .ok_or_else(|| ReviewError::not_found(doc_id, issue_id))?;
        update.apply_to(issue);
        Ok(issue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::models::{IssueStatus, IssueType, RawIssue, ReviewStamp};
    use chrono::Utc;

    fn tagged(doc_id: &str, text: &str) -> Issue {
        RawIssue {
            issue_type: IssueType::DefinitiveLanguage,
            location: None,
            text: text.to_string(),
            explanation: "Too absolute".to_string(),
            suggested_fix: "may".to_string(),
        }
        .tag(&ReviewStamp {
            doc_id: doc_id.to_string(),
            initiated_by: "user-1".to_string(),
            initiated_at: Utc::now(),
        })
    }

    fn stores() -> Vec<(&'static str, Box<dyn IssueStore>)> {
        vec![
            ("memory", Box::new(InMemoryIssueStore::new())),
            ("sqlite", Box::new(SqliteIssueStore::open_in_memory().unwrap())),
        ]
    }

    #[tokio::test]
    async fn test_get_all_on_unknown_document_is_empty() {
        for (name, store) in stores() {
            assert!(store.get_all("nothing").await.unwrap().is_empty(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_get_one_missing_is_not_found() {
        for (name, store) in stores() {
            let err = store.get_one("d1", "missing").await.unwrap_err();
            assert!(matches!(err, ReviewError::NotFound { .. }), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_upsert_many_is_idempotent() {
        for (name, store) in stores() {
            let issues = vec![tagged("d1", "always"), tagged("d1", "never")];
            store.upsert_many(&issues).await.unwrap();
            store.upsert_many(&issues).await.unwrap();
            assert_eq!(store.get_all("d1").await.unwrap(), issues, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_upsert_many_replaces_whole_record() {
        for (name, store) in stores() {
            let mut issue = tagged("d1", "always");
            store.upsert_many(std::slice::from_ref(&issue)).await.unwrap();
            issue.status = IssueStatus::Accepted;
            issue.explanation = "rewritten".into();
            store.upsert_many(std::slice::from_ref(&issue)).await.unwrap();
            let fetched = store.get_one("d1", &issue.id).await.unwrap();
            assert_eq!(fetched, issue, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_fields_merges_and_returns_record() {
        for (name, store) in stores() {
            let issue = tagged("d1", "always");
            store.upsert_many(std::slice::from_ref(&issue)).await.unwrap();
            let updated = store
                .update_fields(
                    "d1",
                    &issue.id,
                    IssueUpdate {
                        status: Some(IssueStatus::Dismissed),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(updated.status, IssueStatus::Dismissed, "{}", name);
            assert_eq!(updated.text, "always", "{}", name);
            assert_eq!(store.get_one("d1", &issue.id).await.unwrap(), updated, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_fields_missing_is_not_found() {
        for (name, store) in stores() {
            let err = store
                .update_fields("d1", "missing", IssueUpdate::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ReviewError::NotFound { .. }), "{}", name);
        }
    }
}
