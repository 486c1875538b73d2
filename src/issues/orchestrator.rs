//! Review orchestration: replay stored issues or run the backend.
//!
//! `get_or_review` returns a `ReviewStream` of `ReviewEvent`s that always
//! ends with exactly one `Complete` or `Error`. On the compute path each
//! backend batch is tagged, persisted and only then emitted, so every issue a
//! caller sees can be referenced by the lifecycle operations.
//!
//! The compute path runs in a spawned task holding the document's lock from
//! `DocumentLocks`. After taking the lock the store is read again, so a
//! request that queued behind another run for the same document replays that
//! run's issues instead of invoking the backend a second time. Dropping the
//! stream stops the task at its next suspension point and closes the
//! backend run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use super::documents::validate_doc_id;
use super::inference::{BatchSource, InferenceStreamAdapter};
use super::locks::DocumentLocks;
use super::models::{Issue, ReviewStamp};
use super::store::IssueStore;
use crate::errors::{ReviewError, ReviewResult};

const RETRY_HINT: &str = "Try again later.";

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewEvent {
    Issues(Vec<Issue>),
    Complete,
    Error(String),
}

impl ReviewEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }
}

/// Receiving half of a review run.
pub struct ReviewStream {
    rx: mpsc::Receiver<ReviewEvent>,
}

impl ReviewStream {
    pub async fn next(&mut self) -> Option<ReviewEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event.
    pub async fn collect_all(mut self) -> Vec<ReviewEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = ReviewEvent> + Send + 'static {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

#[derive(Clone)]
pub struct ReviewOrchestrator {
    store: Arc<dyn IssueStore>,
    adapter: Arc<dyn InferenceStreamAdapter>,
    locks: DocumentLocks,
}

enum RunOutcome {
    Finished,
    Failed(String),
    Cancelled,
}

impl ReviewOrchestrator {
    pub fn new(store: Arc<dyn IssueStore>, adapter: Arc<dyn InferenceStreamAdapter>) -> Self {
        Self {
            store,
            adapter,
            locks: DocumentLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn IssueStore> {
        &self.store
    }

    /// Stream the document's issues, reviewing it first if nothing is stored.
    ///
    /// Invalid input and a failed initial store read are returned as `Err`
    /// before any event is produced. Everything after that is reported
    /// inside the stream.
    pub async fn get_or_review(
        &self,
        doc_id: &str,
        initiating_user: &str,
        timestamp: DateTime<Utc>,
    ) -> ReviewResult<ReviewStream> {
        validate_doc_id(doc_id)?;
        if initiating_user.trim().is_empty() {
            return Err(ReviewError::Validation(
                "initiating user must not be empty".to_string(),
            ));
        }

        let existing = self.store.get_all(doc_id).await?;
        if !existing.is_empty() {
            tracing::info!(doc_id, count = existing.len(), "Replaying stored issues");
            let (tx, rx) = mpsc::channel(2);
            // Capacity covers both events, so neither send can fail or wait.
            let _ = tx.try_send(ReviewEvent::Issues(existing));
            let _ = tx.try_send(ReviewEvent::Complete);
            return Ok(ReviewStream { rx });
        }

        let (tx, rx) = mpsc::channel(1);
        let stamp = ReviewStamp {
            doc_id: doc_id.to_string(),
            initiated_by: initiating_user.to_string(),
            initiated_at: timestamp,
        };
        let this = self.clone();
        tokio::spawn(async move { this.compute(stamp, tx).await });
        Ok(ReviewStream { rx })
    }

    async fn compute(&self, stamp: ReviewStamp, tx: mpsc::Sender<ReviewEvent>) {
        let doc_id = stamp.doc_id.as_str();
        let _guard = tokio::select! {
            guard = self.locks.acquire(doc_id) => guard,
            _ = tx.closed() => {
                tracing::debug!(doc_id, "Caller left while waiting for document lock");
                return;
            }
        };

        match self.store.get_all(doc_id).await {
            Ok(existing) if !existing.is_empty() => {
                tracing::info!(
                    doc_id,
                    count = existing.len(),
                    "Review finished by concurrent request, replaying"
                );
                if tx.send(ReviewEvent::Issues(existing)).await.is_ok() {
                    let _ = tx.send(ReviewEvent::Complete).await;
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(doc_id, error = %e, "Failed to re-read issues");
                let _ = tx.send(ReviewEvent::Error(error_message(&e))).await;
                return;
            }
        }

        tracing::info!(doc_id, initiated_by = %stamp.initiated_by, "Starting review");
        let mut source = match self.adapter.review(doc_id).await {
            Ok(source) => source,
            Err(e) if e.is_retryable() => {
                tracing::warn!(doc_id, error = %e, "Backend not ready");
                let _ = tx.send(ReviewEvent::Error(error_message(&e))).await;
                return;
            }
            Err(e) => {
                tracing::error!(doc_id, error = %e, "Backend run failed to start");
                let _ = tx.send(ReviewEvent::Error(error_message(&e))).await;
                return;
            }
        };

        let outcome = self.pump(source.as_mut(), &stamp, &tx).await;
        source.close().await;

        match outcome {
            RunOutcome::Finished => {
                tracing::info!(doc_id, "Review complete");
                let _ = tx.send(ReviewEvent::Complete).await;
            }
            RunOutcome::Failed(message) => {
                tracing::warn!(doc_id, error = %message, "Review ended with error");
                let _ = tx.send(ReviewEvent::Error(message)).await;
            }
            RunOutcome::Cancelled => {
                tracing::info!(doc_id, "Review cancelled by caller");
            }
        }
    }

    async fn pump(
        &self,
        source: &mut dyn BatchSource,
        stamp: &ReviewStamp,
        tx: &mpsc::Sender<ReviewEvent>,
    ) -> RunOutcome {
        let mut emitted = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => return RunOutcome::Cancelled,
                next = source.next_batch() => next,
            };

            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => return RunOutcome::Finished,
                Err(e) => {
                    let doc_id = stamp.doc_id.as_str();
                    if e.is_retryable() {
                        tracing::warn!(doc_id, emitted, error = %e, "Backend not ready");
                    } else {
                        tracing::error!(doc_id, emitted, error = %e, "Backend batch failed");
                    }
                    return RunOutcome::Failed(error_message(&e));
                }
            };
            if batch.is_empty() {
                continue;
            }

            let tagged: Vec<Issue> = batch.into_iter().map(|raw| raw.tag(stamp)).collect();
            if let Err(e) = self.store.upsert_many(&tagged).await {
                tracing::error!(doc_id = %stamp.doc_id, error = %e, "Failed to persist batch");
                return RunOutcome::Failed(error_message(&e));
            }
            emitted += tagged.len();
            tracing::debug!(
                doc_id = %stamp.doc_id,
                batch = tagged.len(),
                emitted,
                "Batch persisted"
            );

            if tx.send(ReviewEvent::Issues(tagged)).await.is_err() {
                return RunOutcome::Cancelled;
            }
        }
    }
}

/// Message for an `Error` event. Transient backend failures carry a hint
/// that the same request can be retried.
fn error_message(e: &ReviewError) -> String {
    if e.is_retryable() {
        format!("{e}. {RETRY_HINT}")
    } else {
        e.to_string()
    }
}
