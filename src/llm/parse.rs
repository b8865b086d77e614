//! JSON extraction from model output
//!
//! Models wrap JSON in prose or code fences. Candidates are tried from most
//! to least specific; the first one that parses wins.

use serde_json::Value;

/// Find the JSON value in a model response
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    let candidates = [
        fenced(trimmed, "```json"),
        fenced(trimmed, "```"),
        Some(trimmed),
        outer_object(trimmed),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|candidate| serde_json::from_str(candidate.trim()).ok())
}

/// Body of the first code fence opened by `marker`
fn fenced<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// Span from the first `{` to the last `}`
fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
