//! Resolution lifecycle for persisted issues.
//!
//! Transitions are permissive: `accept` and `dismiss` are allowed from any
//! status and feedback can be attached regardless of status. The pure
//! functions below compute the field update; `IssueLifecycle` hands it to
//! `IssueStore::update_fields`, which reads, merges and writes the record in
//! one step, and returns the stored result.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::models::{DismissalFeedback, Issue, IssueStatus, IssueUpdate, ModifiedFields};
use super::store::IssueStore;
use crate::errors::ReviewResult;

/// Update for accepting an issue. Non-null sub-fields of `modified` are
/// merged over any previously recorded edits by the store.
pub fn accept_update(
    acting_user: &str,
    modified: Option<&ModifiedFields>,
    now: DateTime<Utc>,
) -> IssueUpdate {
    IssueUpdate {
        status: Some(IssueStatus::Accepted),
        resolved_by: Some(acting_user.to_string()),
        resolved_at: Some(now),
        modified_fields: modified.filter(|m| !m.is_empty()).cloned(),
        dismissal_feedback: None,
    }
}

pub fn dismiss_update(
    acting_user: &str,
    feedback: Option<&DismissalFeedback>,
    now: DateTime<Utc>,
) -> IssueUpdate {
    IssueUpdate {
        status: Some(IssueStatus::Dismissed),
        resolved_by: Some(acting_user.to_string()),
        resolved_at: Some(now),
        modified_fields: None,
        dismissal_feedback: feedback.cloned(),
    }
}

/// Feedback only: status and `resolved_*` are untouched.
pub fn feedback_update(feedback: &DismissalFeedback) -> IssueUpdate {
    IssueUpdate {
        dismissal_feedback: Some(feedback.clone()),
        ..Default::default()
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct IssueLifecycle {
    store: Arc<dyn IssueStore>,
    clock: Clock,
}

impl IssueLifecycle {
    pub fn new(store: Arc<dyn IssueStore>) -> Self {
        Self {
            store,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn accept(
        &self,
        doc_id: &str,
        issue_id: &str,
        acting_user: &str,
        modified: Option<&ModifiedFields>,
    ) -> ReviewResult<Issue> {
        let update = accept_update(acting_user, modified, (self.clock)());
        let issue = self.store.update_fields(doc_id, issue_id, update).await?;
        tracing::info!(doc_id, issue_id, acting_user, "Issue accepted");
        Ok(issue)
    }

    pub async fn dismiss(
        &self,
        doc_id: &str,
        issue_id: &str,
        acting_user: &str,
        feedback: Option<&DismissalFeedback>,
    ) -> ReviewResult<Issue> {
        let update = dismiss_update(acting_user, feedback, (self.clock)());
        let issue = self.store.update_fields(doc_id, issue_id, update).await?;
        tracing::info!(doc_id, issue_id, acting_user, "Issue dismissed");
        Ok(issue)
    }

    pub async fn add_feedback(
        &self,
        doc_id: &str,
        issue_id: &str,
        feedback: &DismissalFeedback,
    ) -> ReviewResult<Issue> {
        let issue = self
            .store
            .update_fields(doc_id, issue_id, feedback_update(feedback))
            .await?;
        if issue.status != IssueStatus::Dismissed {
            tracing::debug!(
                doc_id,
                issue_id,
                status = issue.status.as_str(),
                "Feedback attached to non-dismissed issue"
            );
        }
        tracing::info!(doc_id, issue_id, "Issue feedback recorded");
        Ok(issue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ReviewError;
    use crate::issues::models::{IssueType, RawIssue, ReviewStamp};
    use crate::issues::store::{InMemoryIssueStore, SqliteIssueStore};

    fn fixed_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    async fn seeded() -> (IssueLifecycle, Arc<InMemoryIssueStore>, Issue) {
        let store = Arc::new(InMemoryIssueStore::new());
        let issue = RawIssue {
            issue_type: IssueType::GrammarSpelling,
            location: None,
            text: "recieve".into(),
            explanation: "Spelling".into(),
            suggested_fix: "receive".into(),
        }
        .tag(&ReviewStamp {
            doc_id: "d1".into(),
            initiated_by: "reviewer".into(),
            initiated_at: fixed_time("2024-01-01T00:00:00Z"),
        });
        store.upsert_many(std::slice::from_ref(&issue)).await.unwrap();
        let lifecycle = IssueLifecycle::new(store.clone())
            .with_clock(Arc::new(|| fixed_time("2024-01-02T12:00:00Z")));
        (lifecycle, store, issue)
    }

    #[tokio::test]
    async fn test_accept_sets_status_and_audit_fields() {
        let (lifecycle, store, issue) = seeded().await;
        let accepted = lifecycle.accept("d1", &issue.id, "alice", None).await.unwrap();
        assert_eq!(accepted.status, IssueStatus::Accepted);
        assert_eq!(accepted.resolved_by.as_deref(), Some("alice"));
        assert_eq!(accepted.resolved_at, Some(fixed_time("2024-01-02T12:00:00Z")));
        assert!(accepted.modified_fields.is_none());
        assert_eq!(store.get_one("d1", &issue.id).await.unwrap(), accepted);
    }

    #[tokio::test]
    async fn test_accept_merges_only_provided_modified_fields() {
        let (lifecycle, _store, issue) = seeded().await;
        lifecycle
            .accept(
                "d1",
                &issue.id,
                "alice",
                Some(&ModifiedFields {
                    suggested_fix: None,
                    explanation: Some("Common misspelling".into()),
                }),
            )
            .await
            .unwrap();
        let accepted = lifecycle
            .accept(
                "d1",
                &issue.id,
                "alice",
                Some(&ModifiedFields {
                    suggested_fix: Some("X".into()),
                    explanation: None,
                }),
            )
            .await
            .unwrap();
        let fields = accepted.modified_fields.unwrap();
        assert_eq!(fields.suggested_fix.as_deref(), Some("X"));
        assert_eq!(fields.explanation.as_deref(), Some("Common misspelling"));
    }

    #[tokio::test]
    async fn test_accept_without_fields_keeps_previous_edits() {
        let (lifecycle, _store, issue) = seeded().await;
        let edits = ModifiedFields {
            suggested_fix: Some("receive".into()),
            explanation: None,
        };
        lifecycle.accept("d1", &issue.id, "alice", Some(&edits)).await.unwrap();
        let again = lifecycle.accept("d1", &issue.id, "bob", None).await.unwrap();
        assert_eq!(again.modified_fields, Some(edits));
        assert_eq!(again.resolved_by.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_dismiss_with_feedback() {
        let (lifecycle, _store, issue) = seeded().await;
        let feedback = DismissalFeedback {
            reason: Some("unclear".into()),
        };
        let dismissed = lifecycle
            .dismiss("d1", &issue.id, "alice", Some(&feedback))
            .await
            .unwrap();
        assert_eq!(dismissed.status, IssueStatus::Dismissed);
        assert_eq!(dismissed.dismissal_feedback, Some(feedback));
        assert_eq!(dismissed.resolved_by.as_deref(), Some("alice"));
        assert!(dismissed.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_feedback_does_not_touch_status_or_resolution() {
        let (lifecycle, _store, issue) = seeded().await;
        let dismissed = lifecycle.dismiss("d1", &issue.id, "alice", None).await.unwrap();
        let with_feedback = lifecycle
            .add_feedback(
                "d1",
                &issue.id,
                &DismissalFeedback {
                    reason: Some("duplicate".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(with_feedback.status, IssueStatus::Dismissed);
        assert_eq!(with_feedback.resolved_at, dismissed.resolved_at);
        assert_eq!(with_feedback.resolved_by, dismissed.resolved_by);
        assert_eq!(
            with_feedback.dismissal_feedback.unwrap().reason.as_deref(),
            Some("duplicate")
        );
    }

    #[tokio::test]
    async fn test_feedback_allowed_on_not_reviewed_issue() {
        let (lifecycle, _store, issue) = seeded().await;
        let updated = lifecycle
            .add_feedback("d1", &issue.id, &DismissalFeedback { reason: None })
            .await
            .unwrap();
        assert_eq!(updated.status, IssueStatus::NotReviewed);
        assert!(updated.resolved_at.is_none());
        assert!(updated.dismissal_feedback.is_some());
    }

    #[tokio::test]
    async fn test_operations_on_missing_issue_are_not_found() {
        let (lifecycle, _store, _issue) = seeded().await;
        let feedback = DismissalFeedback::default();
        assert!(matches!(
            lifecycle.accept("d1", "missing", "a", None).await,
            Err(ReviewError::NotFound { .. })
        ));
        assert!(matches!(
            lifecycle.dismiss("d1", "missing", "a", None).await,
            Err(ReviewError::NotFound { .. })
        ));
        assert!(matches!(
            lifecycle.add_feedback("other-doc", "missing", &feedback).await,
            Err(ReviewError::NotFound { .. })
        ));
    }

    #[test]
    fn test_accept_update_ignores_empty_modified_fields() {
        let update = accept_update("u", Some(&ModifiedFields::default()), Utc::now());
        assert!(update.modified_fields.is_none());
        assert_eq!(update.status, Some(IssueStatus::Accepted));
    }

    #[tokio::test]
    async fn test_concurrent_accepts_keep_both_edits() {
        let store = Arc::new(SqliteIssueStore::open_in_memory().unwrap());
        let issue = RawIssue {
            issue_type: IssueType::GrammarSpelling,
            location: None,
            text: "recieve".into(),
            explanation: "Spelling".into(),
            suggested_fix: "receive".into(),
        }
        .tag(&ReviewStamp {
            doc_id: "d1".into(),
            initiated_by: "reviewer".into(),
            initiated_at: Utc::now(),
        });
        store.upsert_many(std::slice::from_ref(&issue)).await.unwrap();
        let lifecycle = IssueLifecycle::new(store.clone());

        let fix = ModifiedFields {
            suggested_fix: Some("receive".into()),
            explanation: None,
        };
        let explanation = ModifiedFields {
            suggested_fix: None,
            explanation: Some("i before e".into()),
        };
        let (a, b) = tokio::join!(
            lifecycle.accept("d1", &issue.id, "alice", Some(&fix)),
            lifecycle.accept("d1", &issue.id, "bob", Some(&explanation)),
        );
        a.unwrap();
        b.unwrap();

        let stored = store.get_one("d1", &issue.id).await.unwrap();
        let fields = stored.modified_fields.unwrap();
        assert_eq!(fields.suggested_fix.as_deref(), Some("receive"));
        assert_eq!(fields.explanation.as_deref(), Some("i before e"));
    }
}
