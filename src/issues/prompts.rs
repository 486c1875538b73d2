//! Prompt rendering for the text-generation backend.

use serde::Serialize;

use super::documents::Paragraph;
use super::models::{IssueType, SingleShotIssue};

const GRAMMAR_GUIDELINES: &str = "\
- Flag spelling mistakes, typos, wrong word forms and agreement errors.
- Flag punctuation that changes or obscures the meaning of a sentence.
- Do not flag stylistic preferences, regional spelling variants or proper nouns.
- `text` must be the exact erroneous span and `suggested_fix` its corrected form.";

const DEFINITIVE_LANGUAGE_GUIDELINES: &str = "\
- Flag absolute or overconfident wording such as \"always\", \"never\", \"guarantees\", \"will certainly\".
- Flag claims stated as fact that the document cannot support with evidence.
- Do not flag definitions, quoted material or statements of legal obligation.
- `suggested_fix` must soften the claim while keeping the original meaning.";

fn guidelines(issue_type: IssueType) -> &'static str {
    match issue_type {
        IssueType::GrammarSpelling => GRAMMAR_GUIDELINES,
        IssueType::DefinitiveLanguage => DEFINITIVE_LANGUAGE_GUIDELINES,
    }
}

#[derive(Serialize)]
struct PromptParagraph<'a> {
    para_index: i64,
    page_num: i64,
    text: &'a str,
}

/// Ask the model for findings of one issue type in a run of paragraphs.
pub fn agent_prompt(issue_type: IssueType, paragraphs: &[Paragraph]) -> String {
    let input: Vec<PromptParagraph<'_>> = paragraphs
        .iter()
        .map(|p| PromptParagraph {
            para_index: p.para_index,
            page_num: p.page_num,
            text: &p.text,
        })
        .collect();
    let input = serde_json::to_string_pretty(&input).unwrap_or_else(|_| "[]".to_string());

    format!(
        "You are reviewing a document for {kind} issues.\n\
         \n\
         Guidelines:\n{guidelines}\n\
         \n\
         Paragraphs (JSON):\n{input}\n\
         \n\
         Respond with only a JSON array. Each element must be an object with the keys \
         \"comment_id\" (a short unique string), \"para_index\" (the paragraph the issue is in), \
         \"source_sentence\" (the full sentence containing the issue), \"text\", \"explanation\" \
         and \"suggested_fix\". Respond with [] if there are no issues.",
        kind = issue_type,
        guidelines = guidelines(issue_type),
        input = input,
    )
}

#[derive(Serialize)]
struct PromptFinding<'a> {
    comment_id: &'a str,
    text: &'a str,
    explanation: &'a str,
    suggested_fix: &'a str,
}

/// Ask the model to score a set of agent findings.
pub fn consolidator_prompt(issue_type: IssueType, findings: &[SingleShotIssue]) -> String {
    let input: Vec<PromptFinding<'_>> = findings
        .iter()
        .map(|f| PromptFinding {
            comment_id: &f.comment_id,
            text: &f.issue.text,
            explanation: &f.issue.explanation,
            suggested_fix: &f.issue.suggested_fix,
        })
        .collect();
    let input = serde_json::to_string_pretty(&input).unwrap_or_else(|_| "[]".to_string());

    format!(
        "You are checking proposed {kind} comments on a document.\n\
         \n\
         Guidelines the comments were written against:\n{guidelines}\n\
         \n\
         Comments (JSON):\n{input}\n\
         \n\
         Respond with only a JSON array with one object per comment, with the keys \
         \"comment_id\", \"score\" (integer 1-5, how useful the comment is), \
         \"suggested_action\" (\"keep\" or \"dismiss\") and \"reason_for_suggested_action\".",
        kind = issue_type,
        guidelines = guidelines(issue_type),
        input = input,
    )
}
