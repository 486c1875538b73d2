//! Inference backend contract.
//!
//! A review run is pulled one batch at a time from a `BatchSource`. The
//! consumer decides when to stop and must call `close` once it is done, so
//! backend resources are released on completion, failure and cancellation
//! alike.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::models::IssueBatch;
use crate::errors::{ReviewError, ReviewResult};

/// One in-flight backend run. Not restartable.
#[async_trait]
pub trait BatchSource: Send {
    /// The next batch, or `Ok(None)` once the run is finished. An `Err`
    /// terminates the run; batches already returned stay valid.
    async fn next_batch(&mut self) -> ReviewResult<Option<IssueBatch>>;

    /// Release backend resources.
    async fn close(&mut self) {}
}

#[async_trait]
pub trait InferenceStreamAdapter: Send + Sync {
    /// Start a fresh, independent backend run for the document.
    async fn review(&self, doc_id: &str) -> ReviewResult<Box<dyn BatchSource>>;
}

// ── Scripted adapter ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Batch(IssueBatch),
    Unavailable(String),
    Fail(String),
    /// Never yields. Used to exercise cancellation.
    Stall,
}

/// Adapter that replays a fixed script on every run and counts how it is used.
#[derive(Clone, Default)]
pub struct ScriptedAdapter {
    script: Vec<ScriptStep>,
    invocations: Arc<AtomicUsize>,
    pulls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn batches(batches: Vec<IssueBatch>) -> Self {
        Self::new(batches.into_iter().map(ScriptStep::Batch).collect())
    }

    /// Number of times `review` was called.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of `next_batch` calls across all runs.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Number of runs that were closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceStreamAdapter for ScriptedAdapter {
    async fn review(&self, doc_id: &str) -> ReviewResult<Box<dyn BatchSource>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(doc_id, steps = self.script.len(), "Starting scripted review");
        Ok(Box::new(ScriptedSource {
            steps: self.script.iter().cloned().collect(),
            pulls: Arc::clone(&self.pulls),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ScriptedSource {
    steps: VecDeque<ScriptStep>,
    pulls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BatchSource for ScriptedSource {
    async fn next_batch(&mut self) -> ReviewResult<Option<IssueBatch>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            None => Ok(None),
            Some(ScriptStep::Batch(batch)) => Ok(Some(batch)),
            Some(ScriptStep::Unavailable(msg)) => Err(ReviewError::BackendUnavailable(msg)),
            Some(ScriptStep::Fail(msg)) => Err(ReviewError::BackendError(msg)),
            Some(ScriptStep::Stall) => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
