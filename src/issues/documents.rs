//! Document loading for the inference adapter.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{ReviewError, ReviewResult};

/// One paragraph of a document with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Paragraph {
    pub page_num: i64,
    pub para_index: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub doc_id: String,
    pub paragraphs: Vec<Paragraph>,
}

impl Document {
    /// Split raw text into pages on form feed and paragraphs on blank lines.
    /// Page numbers start at 1; paragraph indices run across the whole document.
    pub fn parse(doc_id: &str, raw: &str) -> Self {
        let mut paragraphs = Vec::new();
        let mut para_index = 0;
        for (page_idx, page) in raw.split('\u{000C}').enumerate() {
            let mut current: Vec<&str> = Vec::new();
            for line in page.lines().chain(std::iter::once("")) {
                if line.trim().is_empty() {
                    if !current.is_empty() {
                        paragraphs.push(Paragraph {
                            page_num: page_idx as i64 + 1,
                            para_index,
                            text: current.join(" "),
                        });
                        para_index += 1;
                        current.clear();
                    }
                } else {
                    current.push(line.trim());
                }
            }
        }
        Self {
            doc_id: doc_id.to_string(),
            paragraphs,
        }
    }
}

/// Resolves a `doc_id` to document content.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self, doc_id: &str) -> ReviewResult<Document>;
}

/// Reject ids that could escape the documents directory.
pub fn validate_doc_id(doc_id: &str) -> ReviewResult<()> {
    if doc_id.trim().is_empty() {
        return Err(ReviewError::Validation("Document id must not be empty".into()));
    }
    if doc_id.contains(['/', '\\', '\0']) || doc_id.contains("..") {
        return Err(ReviewError::Validation(format!("Invalid document id '{}'", doc_id)));
    }
    Ok(())
}

/// Reads `<dir>/<doc_id>` as UTF-8 text.
pub struct FsDocumentSource {
    dir: PathBuf,
}

impl FsDocumentSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn load(&self, doc_id: &str) -> ReviewResult<Document> {
        validate_doc_id(doc_id)?;
        let path = self.dir.join(doc_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReviewError::DocumentNotFound {
                    doc_id: doc_id.to_string(),
                });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read document {}", path.display()))
                    .into());
            }
        };
        let document = Document::parse(doc_id, &raw);
        tracing::debug!(doc_id, paragraphs = document.paragraphs.len(), "Loaded document");
        Ok(document)
    }
}

/// Serves documents from memory.
#[derive(Default)]
pub struct StaticDocumentSource {
    docs: std::collections::HashMap<String, String>,
}

impl StaticDocumentSource {
    pub fn with(mut self, doc_id: &str, text: &str) -> Self {
        self.docs.insert(doc_id.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn load(&self, doc_id: &str) -> ReviewResult<Document> {
        validate_doc_id(doc_id)?;
        self.docs
            .get(doc_id)
            .map(|raw| Document::parse(doc_id, raw))
            .ok_or_else(|| ReviewError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            })
    }
}
