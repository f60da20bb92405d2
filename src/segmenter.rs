//! Reply Segmenter
//!
//! Splits the agent's free-form reply into restatement, query text and result
//! description, and flags analytical requests. Never fails.

use crate::model::{AgentReply, SegmentedReply};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?is)```[ \t]*sql\b(?:[ \t]*\n|[ \t]+)(.*?)```").unwrap();
    static ref ANY_FENCE: Regex = Regex::new(r"```[A-Za-z0-9_+-]*").unwrap();
    static ref LEADING_ONE: Regex = Regex::new(r"^(?:\*\*)?1[.)](?:\*\*)?[ \t]*").unwrap();
    static ref TRAILING_TWO: Regex = Regex::new(r"(?:^|\n)[ \t]*(?:\*\*)?2[.)][^\n]*$").unwrap();
    static ref LEADING_THREE: Regex = Regex::new(r"^(?:\*\*)?3[.)](?:\*\*)?[ \t]*").unwrap();
}

/// Closed vocabulary of analytical cues, matched case-insensitively as substrings.
pub const ANALYTICAL_CUES: &[&str] = &[
    "how many",
    "average",
    "to determine",
    "i'll run",
    "i will run",
    "let me run",
    "count of",
    "total number",
    "percentage",
    "distribution",
    "compare",
    "statistics",
    "most common",
    "sum of",
];

/// Swappable reply parser. Callers only ever see [`SegmentedReply`].
pub trait ReplyParser: Send + Sync {
    fn parse(&self, reply: &AgentReply, prompt: &str) -> SegmentedReply;
}

/// Fenced-block segmentation only.
#[derive(Debug, Default, Clone, Copy)]
pub struct FencedSegmenter;

impl ReplyParser for FencedSegmenter {
    fn parse(&self, reply: &AgentReply, prompt: &str) -> SegmentedReply {
        segment_with_prompt(&reply.raw_text, prompt)
    }
}

/// Reads a JSON reply with named fields when the agent produced one, and falls back
/// to fenced-block segmentation otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredFirstParser;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredReply {
    #[serde(default)]
    restatement: String,
    #[serde(alias = "query", alias = "queryText")]
    sql: String,
    #[serde(default, alias = "resultDescription")]
    description: String,
    #[serde(default)]
    is_analytical: Option<bool>,
}

impl ReplyParser for StructuredFirstParser {
    fn parse(&self, reply: &AgentReply, prompt: &str) -> SegmentedReply {
        let trimmed = strip_json_fence(reply.raw_text.trim());
        if trimmed.starts_with('{') {
            if let Ok(structured) = serde_json::from_str::<StructuredReply>(trimmed) {
                let restatement = structured.restatement.trim().to_string();
                let query_text = structured.sql.trim().to_string();
                // nothing to run without a query
                let is_analytical = !query_text.is_empty()
                    && structured
                        .is_analytical
                        .unwrap_or_else(|| is_analytical(&restatement, prompt));
                return SegmentedReply {
                    restatement,
                    query_text,
                    description: structured.description.trim().to_string(),
                    is_analytical,
                };
            }
        }
        segment_with_prompt(&reply.raw_text, prompt)
    }
}

fn strip_json_fence(text: &str) -> &str {
    text.strip_prefix("```json")
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(text)
}

/// Segment a reply without the original prompt.
pub fn segment(raw_text: &str) -> SegmentedReply {
    segment_with_prompt(raw_text, "")
}

pub fn segment_with_prompt(raw_text: &str, prompt: &str) -> SegmentedReply {
    let Some(captures) = SQL_FENCE.captures(raw_text) else {
        return SegmentedReply {
            restatement: raw_text.trim().to_string(),
            query_text: String::new(),
            description: String::new(),
            is_analytical: false,
        };
    };

    let (Some(block), Some(inner)) = (captures.get(0), captures.get(1)) else {
        return SegmentedReply {
            restatement: raw_text.trim().to_string(),
            ..Default::default()
        };
    };

    let before = &raw_text[..block.start()];
    let after = &raw_text[block.end()..];

    let restatement = clean_restatement(before);
    let description = clean_description(after);
    let is_analytical = is_analytical(&restatement, prompt);

    SegmentedReply {
        restatement,
        query_text: inner.as_str().trim().to_string(),
        description,
        is_analytical,
    }
}

fn clean_restatement(text: &str) -> String {
    let text = remove_fences(text);
    let text = text.trim();
    let text = LEADING_ONE.replace(text, "");
    let text = TRAILING_TWO.replace(text.trim(), "");
    text.trim().to_string()
}

fn clean_description(text: &str) -> String {
    let text = remove_fences(text);
    let text = LEADING_THREE.replace(text.trim(), "");
    text.trim().to_string()
}

fn remove_fences(text: &str) -> String {
    ANY_FENCE.replace_all(text, "").into_owned()
}

/// Heuristic classification; false positives and negatives are expected.
pub fn is_analytical(restatement: &str, prompt: &str) -> bool {
    let restatement = restatement.to_lowercase();
    let prompt = prompt.to_lowercase();
    ANALYTICAL_CUES
        .iter()
        .any(|cue| restatement.contains(cue) || prompt.contains(cue))
}
