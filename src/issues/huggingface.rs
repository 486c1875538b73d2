//! Hugging Face text-generation adapter.
//!
//! Each backend iteration covers `batch_size` paragraphs: one agent call per
//! issue type, optionally followed by a consolidator call that scores and
//! filters the agent's findings.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::documents::{DocumentSource, Paragraph};
use super::inference::{BatchSource, InferenceStreamAdapter};
use super::models::{
    ConsolidatorVerdict, IssueBatch, IssueType, Location, RawIssue, SingleShotIssue, combine,
};
use super::prompts;
use crate::config::BackendSettings;
use crate::errors::{ReviewError, ReviewResult};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
    temperature: f64,
    do_sample: bool,
    return_full_text: bool,
}

#[derive(Serialize)]
struct GenerateOptions {
    wait_for_model: bool,
}

#[derive(Deserialize)]
struct GeneratedText {
    generated_text: String,
}

#[derive(Deserialize)]
struct BackendErrorBody {
    error: String,
    #[serde(default)]
    estimated_time: Option<f64>,
}

/// One finding as the model reports it.
#[derive(Debug, Deserialize)]
struct AgentFinding {
    #[serde(default)]
    comment_id: Option<String>,
    para_index: i64,
    #[serde(default)]
    source_sentence: String,
    text: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    suggested_fix: String,
}

/// Thin client over the text-generation endpoint.
struct HfClient {
    http: reqwest::Client,
    settings: BackendSettings,
}

impl HfClient {
    async fn generate(&self, prompt: &str) -> ReviewResult<String> {
        let body = GenerateRequest {
            inputs: prompt,
            parameters: GenerateParameters {
                max_new_tokens: self.settings.max_new_tokens,
                temperature: self.settings.temperature,
                do_sample: self.settings.temperature > 0.0,
                return_full_text: false,
            },
            options: GenerateOptions {
                wait_for_model: self.settings.wait_for_model,
            },
        };

        let mut request = self.http.post(self.settings.model_url()).json(&body);
        if let Some(token) = &self.settings.api_token {
            request = request.bearer_auth(token);
        }
        if let Some(timeout) = self.settings.call_timeout() {
            request = request.timeout(timeout);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ReviewError::BackendUnavailable(format!("Backend did not respond in time: {}", e))
            } else {
                ReviewError::BackendError(format!("Request to backend failed: {}", e))
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            ReviewError::BackendError(format!("Failed to read backend response: {}", e))
        })?;

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            let detail = serde_json::from_str::<BackendErrorBody>(&text).ok();
            let message = match detail {
                Some(BackendErrorBody {
                    estimated_time: Some(secs),
                    error,
                }) => format!("{} (ready in about {:.0}s)", error, secs),
                Some(body) => body.error,
                None => "Model is currently loading. Please try again in a few minutes.".into(),
            };
            return Err(ReviewError::BackendUnavailable(message));
        }
        if !status.is_success() {
            return Err(ReviewError::BackendError(format!(
                "Backend returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let generated: Vec<GeneratedText> = serde_json::from_str(&text)
            .map_err(|e| ReviewError::BackendError(format!("Malformed backend response: {}", e)))?;
        generated
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .ok_or_else(|| ReviewError::BackendError("Backend returned no generations".into()))
    }
}

/// Return the outermost `[...]` span of `text`, if any.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (start < end).then(|| &text[start..=end])
}

fn parse_json_array<T: serde::de::DeserializeOwned>(
    generated: &str,
    what: &str,
) -> ReviewResult<Vec<T>> {
    let json = extract_json_array(generated).ok_or_else(|| {
        ReviewError::BackendError(format!("No JSON array in {} output", what))
    })?;
    serde_json::from_str(json)
        .map_err(|e| ReviewError::BackendError(format!("Malformed {} output: {}", what, e)))
}

/// Attach locations to findings. Findings pointing at paragraphs outside the
/// batch are dropped.
fn to_single_shot(
    issue_type: IssueType,
    findings: Vec<AgentFinding>,
    paragraphs: &[Paragraph],
) -> Vec<SingleShotIssue> {
    findings
        .into_iter()
        .enumerate()
        .filter_map(|(n, f)| {
            let Some(paragraph) = paragraphs.iter().find(|p| p.para_index == f.para_index) else {
                tracing::warn!(
                    para_index = f.para_index,
                    "Dropping finding for paragraph outside batch"
                );
                return None;
            };
            let source_sentence = if f.source_sentence.is_empty() {
                paragraph.text.clone()
            } else {
                f.source_sentence
            };
            Some(SingleShotIssue {
                comment_id: f.comment_id.unwrap_or_else(|| format!("c{}", n)),
                issue: RawIssue {
                    issue_type,
                    location: Some(Location {
                        source_sentence,
                        page_num: paragraph.page_num,
                        bounding_box: [0.0; 4],
                        para_index: paragraph.para_index,
                    }),
                    text: f.text,
                    explanation: f.explanation,
                    suggested_fix: f.suggested_fix,
                },
            })
        })
        .collect()
}

pub struct HuggingFaceAdapter {
    client: Arc<HfClient>,
    documents: Arc<dyn DocumentSource>,
}

impl HuggingFaceAdapter {
    pub fn new(
        settings: BackendSettings,
        documents: Arc<dyn DocumentSource>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("docreview/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client: Arc::new(HfClient { http, settings }),
            documents,
        })
    }
}

#[async_trait]
impl InferenceStreamAdapter for HuggingFaceAdapter {
    async fn review(&self, doc_id: &str) -> ReviewResult<Box<dyn BatchSource>> {
        let document = self.documents.load(doc_id).await?;
        let batch_size = self.client.settings.batch_size.max(1);
        let chunks: VecDeque<Vec<Paragraph>> = document
            .paragraphs
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        tracing::info!(
            doc_id,
            model = %self.client.settings.model_name,
            batches = chunks.len(),
            "Starting backend review"
        );
        Ok(Box::new(HfBatchSource {
            client: Arc::clone(&self.client),
            doc_id: doc_id.to_string(),
            chunks,
            batch: 0,
        }))
    }
}

struct HfBatchSource {
    client: Arc<HfClient>,
    doc_id: String,
    chunks: VecDeque<Vec<Paragraph>>,
    batch: usize,
}

impl HfBatchSource {
    async fn review_chunk(
        &self,
        issue_type: IssueType,
        paragraphs: &[Paragraph],
    ) -> ReviewResult<Vec<RawIssue>> {
        let generated = self
            .client
            .generate(&prompts::agent_prompt(issue_type, paragraphs))
            .await?;
        let findings = to_single_shot(
            issue_type,
            parse_json_array::<AgentFinding>(&generated, "agent")?,
            paragraphs,
        );
        if !self.client.settings.consolidate || findings.is_empty() {
            return Ok(findings.into_iter().map(|f| f.issue).collect());
        }

        let generated = self
            .client
            .generate(&prompts::consolidator_prompt(issue_type, &findings))
            .await?;
        let verdicts = parse_json_array::<ConsolidatorVerdict>(&generated, "consolidator")?;
        let min_score = self.client.settings.min_consolidator_score;
        Ok(combine(findings, &verdicts)
            .into_iter()
            .filter(|c| c.verdict.keeps(min_score))
            .map(|c| c.finding.issue)
            .collect())
    }
}

#[async_trait]
impl BatchSource for HfBatchSource {
    async fn next_batch(&mut self) -> ReviewResult<Option<IssueBatch>> {
        let Some(paragraphs) = self.chunks.pop_front() else {
            return Ok(None);
        };
        self.batch += 1;
        let mut batch = Vec::new();
        for issue_type in IssueType::ALL {
            batch.extend(self.review_chunk(issue_type, &paragraphs).await?);
        }
        tracing::debug!(
            doc_id = %self.doc_id,
            batch = self.batch,
            paragraphs = paragraphs.len(),
            count = batch.len(),
            "Backend batch complete"
        );
        Ok(Some(batch))
    }

    async fn close(&mut self) {
        if !self.chunks.is_empty() {
            tracing::debug!(
                doc_id = %self.doc_id,
                remaining = self.chunks.len(),
                "Abandoning backend run"
            );
        }
        self.chunks.clear();
    }
}
