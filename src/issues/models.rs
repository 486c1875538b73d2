use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where in the source document an issue was found.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub source_sentence: String,
    pub page_num: i64,
    pub bounding_box: [f64; 4],
    pub para_index: i64,
}

/// Category of finding. Each variant has its own backend prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IssueType {
    #[serde(rename = "Grammar & Spelling")]
    GrammarSpelling,
    #[serde(rename = "Definitive Language")]
    DefinitiveLanguage,
}

impl IssueType {
    pub const ALL: [IssueType; 2] = [IssueType::GrammarSpelling, IssueType::DefinitiveLanguage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GrammarSpelling => "Grammar & Spelling",
            Self::DefinitiveLanguage => "Definitive Language",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Grammar & Spelling" => Ok(Self::GrammarSpelling),
            "Definitive Language" => Ok(Self::DefinitiveLanguage),
            _ => Err(format!("Invalid issue type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    NotReviewed,
    Accepted,
    Dismissed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReviewed => "not_reviewed",
            Self::Accepted => "accepted",
            Self::Dismissed => "dismissed",
        }
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_reviewed" => Ok(Self::NotReviewed),
            "accepted" => Ok(Self::Accepted),
            "dismissed" => Ok(Self::Dismissed),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// Caller edits recorded when an issue is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModifiedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ModifiedFields {
    /// Overlay the non-null sub-fields of `other` onto `self`.
    pub fn merged_with(mut self, other: &ModifiedFields) -> Self {
        if let Some(fix) = &other.suggested_fix {
            self.suggested_fix = Some(fix.clone());
        }
        if let Some(explanation) = &other.explanation {
            self.explanation = Some(explanation.clone());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.suggested_fix.is_none() && self.explanation.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DismissalFeedback {
    #[serde(default)]
    pub reason: Option<String>,
}

/// A persisted issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: String,
    pub doc_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub status: IssueStatus,
    pub suggested_fix: String,
    pub explanation: String,
    #[serde(default)]
    pub location: Option<Location>,
    pub review_initiated_by: String,
    pub review_initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_fields: Option<ModifiedFields>,
    #[serde(default)]
    pub dismissal_feedback: Option<DismissalFeedback>,
}

/// An issue as discovered by the backend, before identity and audit tagging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    #[serde(default)]
    pub location: Option<Location>,
    pub text: String,
    pub explanation: String,
    pub suggested_fix: String,
}

/// Ordered group of raw issues produced by one backend iteration.
pub type IssueBatch = Vec<RawIssue>;

/// Audit metadata stamped onto every issue of a review run.
#[derive(Debug, Clone)]
pub struct ReviewStamp {
    pub doc_id: String,
    pub initiated_by: String,
    pub initiated_at: DateTime<Utc>,
}

impl RawIssue {
    /// Assign a fresh identity and the run's audit fields.
    pub fn tag(self, stamp: &ReviewStamp) -> Issue {
        Issue {
            id: uuid::Uuid::new_v4().to_string(),
            doc_id: stamp.doc_id.clone(),
            text: self.text,
            issue_type: self.issue_type,
            status: IssueStatus::NotReviewed,
            suggested_fix: self.suggested_fix,
            explanation: self.explanation,
            location: self.location,
            review_initiated_by: stamp.initiated_by.clone(),
            review_initiated_at: stamp.initiated_at,
            resolved_by: None,
            resolved_at: None,
            modified_fields: None,
            dismissal_feedback: None,
        }
    }
}

/// Partial update applied by `IssueStore::update_fields`. `None` leaves the
/// stored value untouched. `modified_fields` is merged over the stored edits
/// sub-field by sub-field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueUpdate {
    pub status: Option<IssueStatus>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub modified_fields: Option<ModifiedFields>,
    pub dismissal_feedback: Option<DismissalFeedback>,
}

impl IssueUpdate {
    pub fn apply_to(&self, issue: &mut Issue) {
        if let Some(status) = self.status {
            issue.status = status;
        }
        if let Some(by) = &self.resolved_by {
            issue.resolved_by = Some(by.clone());
        }
        if let Some(at) = self.resolved_at {
            issue.resolved_at = Some(at);
        }
        if let Some(fields) = &self.modified_fields {
            let merged = issue.modified_fields.take().unwrap_or_default().merged_with(fields);
            issue.modified_fields = Some(merged);
        }
        if let Some(feedback) = &self.dismissal_feedback {
            issue.dismissal_feedback = Some(feedback.clone());
        }
    }
}

// Consolidation models

/// An agent finding carrying the id the consolidator refers back to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleShotIssue {
    #[serde(flatten)]
    pub issue: RawIssue,
    pub comment_id: String,
}

/// The consolidator's judgement on one agent finding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidatorVerdict {
    pub comment_id: String,
    pub score: i64,
    pub suggested_action: String,
    #[serde(default)]
    pub reason_for_suggested_action: String,
}

impl ConsolidatorVerdict {
    pub fn keeps(&self, min_score: i64) -> bool {
        self.score >= min_score && !self.suggested_action.eq_ignore_ascii_case("dismiss")
    }
}

/// A finding paired with its verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedIssue {
    pub finding: SingleShotIssue,
    pub verdict: ConsolidatorVerdict,
}

/// Join findings to verdicts by `comment_id`. Findings without a verdict are
/// dropped, as are verdicts that name no finding.
pub fn combine(
    findings: Vec<SingleShotIssue>,
    verdicts: &[ConsolidatorVerdict],
) -> Vec<CombinedIssue> {
    findings
        .into_iter()
        .filter_map(|finding| {
            verdicts
                .iter()
                .find(|v| v.comment_id == finding.comment_id)
                .map(|verdict| CombinedIssue {
                    finding,
                    verdict: verdict.clone(),
                })
        })
        .collect()
}
