//! Reviewer agent
//!
//! Scores a Worker result and, when asked, turns a review into concrete
//! improvement instructions. Review extraction fails softly: unreadable
//! output becomes a zero score with the raw text as feedback.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::{decode, requirement_list, respond};
use crate::core::{Config, ExecutionResult, Message, QuillError, Result, ReviewResult, Task};
use crate::llm::{extract_json, GenerationOutcome, ModelGateway, Variables};

static SCORE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)score\s*[:=]?\s*(\d+(?:\.\d+)?)\s*(/\s*10\b)?")
        .expect("score pattern is valid")
});

#[derive(Debug, Deserialize)]
struct ReviewParams {
    task: Task,
    result: ExecutionResult,
}

#[derive(Debug, Deserialize)]
struct ImprovementParams {
    task: Task,
    result: ExecutionResult,
    review: ReviewResult,
}

pub struct Reviewer {
    gateway: ModelGateway,
    config: Arc<Config>,
}

impl Reviewer {
    pub fn new(gateway: ModelGateway, config: Arc<Config>) -> Self {
        Self { gateway, config }
    }

    pub(crate) async fn handle(&self, action: &str, message: &Message) -> Result<Vec<Message>> {
        match action {
            "review" => {
                let params: ReviewParams = decode(message)?;
                let review = self.review(&params.task, &params.result).await?;
                Ok(vec![respond(message, &review)?])
            }
            "suggest_improvements" => {
                let params: ImprovementParams = decode(message)?;
                let improvements = self
                    .suggest_improvements(&params.task, &params.result, &params.review)
                    .await?;
                Ok(vec![respond(message, &improvements)?])
            }
            other => Err(QuillError::UnknownCommand(other.to_string())),
        }
    }

    /// Score `result` against `task`
    pub async fn review(&self, task: &Task, result: &ExecutionResult) -> Result<ReviewResult> {
        let template_id = self
            .gateway
            .templates()
            .resolve("reviewer", &task.task_type(), "review");

        let mut vars = Variables::new();
        vars.insert("task_title".into(), json!(task.title));
        vars.insert("task_description".into(), json!(task.description));
        vars.insert("requirements".into(), requirement_list(&task.requirements));
        vars.insert(
            "unmet_requirements".into(),
            requirement_list(&result.unmet_requirements),
        );
        vars.insert("content".into(), json!(result.content));

        let params = self.gateway.params(self.config.temperatures.reviewer);
        let outcome = self
            .gateway
            .generate_with_template(&template_id, &vars, &params)
            .await?;

        let review = match outcome {
            GenerationOutcome::Success(text) => parse_review(&task.id, &text),
            GenerationOutcome::Failed { last_error, .. } => {
                tracing::warn!(task = %task.id, error = %last_error, "review generation degraded");
                ReviewResult::unparsed(&task.id, format!("review unavailable: {}", last_error))
            }
        };

        tracing::info!(task = %task.id, score = review.score, "reviewed");
        Ok(review)
    }

    /// Improvement instructions: unmet requirements first, then the model's list
    pub async fn suggest_improvements(
        &self,
        task: &Task,
        result: &ExecutionResult,
        review: &ReviewResult,
    ) -> Result<Vec<String>> {
        let mut improvements: Vec<String> = result
            .unmet_requirements
            .iter()
            .map(|r| format!("Satisfy the requirement: {}", r))
            .collect();

        let template_id = self
            .gateway
            .templates()
            .resolve("reviewer", &task.task_type(), "improvement");

        let mut vars = Variables::new();
        vars.insert("task_title".into(), json!(task.title));
        vars.insert("score".into(), json!(format!("{:.2}", review.score)));
        vars.insert("feedback".into(), json!(review.feedback));
        vars.insert("suggestions".into(), requirement_list(&review.suggestions));
        vars.insert("content".into(), json!(result.content));

        let params = self.gateway.params(self.config.temperatures.reviewer);
        let generated = match self
            .gateway
            .generate_with_template(&template_id, &vars, &params)
            .await?
        {
            GenerationOutcome::Success(text) => parse_improvements(&text),
            GenerationOutcome::Failed { last_error, .. } => {
                tracing::warn!(task = %task.id, error = %last_error, "using review suggestions");
                Vec::new()
            }
        };

        let extra = if generated.is_empty() {
            review.suggestions.clone()
        } else {
            generated
        };
        for item in extra {
            if !improvements.contains(&item) {
                improvements.push(item);
            }
        }

        if improvements.is_empty() && !review.feedback.trim().is_empty() {
            improvements.push(format!("Address the review feedback: {}", review.feedback.trim()));
        }

        Ok(improvements)
    }
}

/// Scores reported out of ten are scaled down; everything lands in [0, 1]
pub fn normalize_score(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    let score = if score > 1.0 { score / 10.0 } else { score };
    score.clamp(0.0, 1.0)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Strings from a list of strings or of `{"suggestion": ..}` objects
fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(map) => ["suggestion", "text", "description"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Bullet lines (`-`, `*` or `1.`) of free text
fn bullets(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| {
                    let digits = line.find(|c: char| !c.is_ascii_digit())?;
                    (digits > 0)
                        .then(|| line[digits..].strip_prefix(". "))
                        .flatten()
                })?;
            let rest = rest.trim();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect()
}

/// Turn reviewer output into a `ReviewResult`, never failing
pub fn parse_review(task_id: &str, text: &str) -> ReviewResult {
    if let Some(Value::Object(map)) = extract_json(text) {
        if let Some(score) = map.get("score").and_then(number) {
            let metrics: BTreeMap<String, f64> = map
                .get("metrics")
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| {
                            number(v)
                                .filter(|n| n.is_finite())
                                .map(|n| (k.clone(), n))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let feedback = match map.get("feedback") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(_)) => string_list(map.get("feedback")).join("\n"),
                _ => String::new(),
            };

            return ReviewResult {
                task_id: task_id.to_string(),
                score: normalize_score(score),
                feedback,
                suggestions: string_list(map.get("suggestions")),
                metrics,
            };
        }
    }

    if let Some(caps) = SCORE_LINE.captures(text) {
        if let Ok(raw) = caps[1].parse::<f64>() {
            let score = if caps.get(2).is_some() { raw / 10.0 } else { raw };
            return ReviewResult {
                task_id: task_id.to_string(),
                score: normalize_score(score),
                feedback: text.trim().to_string(),
                suggestions: bullets(text),
                metrics: BTreeMap::new(),
            };
        }
    }

    tracing::warn!(task = %task_id, "review output not understood, scoring 0");
    ReviewResult::unparsed(task_id, text)
}

/// Improvement list from JSON (`{"improvements": [..]}` or a bare array) or bullets
pub fn parse_improvements(text: &str) -> Vec<String> {
    match extract_json(text) {
        Some(Value::Object(map)) => {
            let key = ["improvements", "suggestions"]
                .iter()
                .find(|k| map.contains_key(**k))
                .copied()
                .unwrap_or("improvements");
            string_list(map.get(key))
        }
        Some(array @ Value::Array(_)) => string_list(Some(&array)),
        _ => bullets(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support;
    use crate::llm::MockGenerator;

    #[test]
    fn test_parse_json_review() {
        let text = r#"{"score": 0.4, "feedback": "No dragon", "suggestions": ["Add a dragon", {"priority": "high", "suggestion": "Raise stakes"}], "metrics": {"coherence": 8}}"#;
        let review = parse_review("S1", text);
        assert_eq!(review.score, 0.4);
        assert_eq!(review.feedback, "No dragon");
        assert_eq!(review.suggestions, vec!["Add a dragon", "Raise stakes"]);
        assert_eq!(review.metrics["coherence"], 8.0);
    }

    #[test]
    fn test_metrics_keep_their_reported_values() {
        let text = r#"{"score": 9, "metrics": {"word_count": 500, "coherence": 0.7, "pacing": "3"}}"#;
        let review = parse_review("S1", text);
        assert_eq!(review.score, 0.9);
        assert_eq!(review.metrics["word_count"], 500.0);
        assert_eq!(review.metrics["coherence"], 0.7);
        assert_eq!(review.metrics["pacing"], 3.0);
    }

    #[test]
    fn test_ten_point_scores_are_normalized() {
        assert_eq!(parse_review("S1", r#"{"score": 8}"#).score, 0.8);
        assert_eq!(parse_review("S1", r#"{"score": "7.5"}"#).score, 0.75);
        assert_eq!(normalize_score(42.0), 1.0);
        assert_eq!(normalize_score(-1.0), 0.0);
        assert_eq!(normalize_score(f64::NAN), 0.0);
    }

    #[test]
    fn test_scrape_free_text_review() {
        let text = "Overall decent.\nScore: 6/10\nSuggestions:\n- Tighten the ending\n2. Name the dragon";
        let review = parse_review("S1", text);
        assert!((review.score - 0.6).abs() < 1e-9);
        assert_eq!(review.suggestions, vec!["Tighten the ending", "Name the dragon"]);
    }

    #[test]
    fn test_unreadable_review_fails_softly() {
        let review = parse_review("S1", "I liked it a lot!");
        assert_eq!(review.score, 0.0);
        assert_eq!(review.feedback, "I liked it a lot!");
        assert!(review.suggestions.is_empty());
    }

    #[test]
    fn test_parse_improvements() {
        assert_eq!(
            parse_improvements(r#"{"improvements": ["a", "b"]}"#),
            vec!["a", "b"]
        );
        assert_eq!(parse_improvements(r#"["x"]"#), vec!["x"]);
        assert_eq!(parse_improvements("- one\n- two"), vec!["one", "two"]);
    }

    fn execution(content: &str, unmet: &[&str]) -> ExecutionResult {
        ExecutionResult {
            task_id: "S1".into(),
            content: content.into(),
            requirements_met: unmet.is_empty(),
            unmet_requirements: unmet.iter().map(|s| s.to_string()).collect(),
            generation_error: None,
        }
    }

    #[tokio::test]
    async fn test_review_uses_reviewer_temperature() {
        let mock = Arc::new(MockGenerator::new().respond("REVIEW", r#"{"score": 0.9}"#));
        let config = Arc::new(Config::default());
        let reviewer = Reviewer::new(test_support::gateway(mock.clone()), config.clone());

        let review = reviewer
            .review(&Task::new("S1", "Opening", ""), &execution("text", &[]))
            .await
            .unwrap();
        assert_eq!(review.score, 0.9);
        assert_eq!(mock.calls()[0].params.temperature, config.temperatures.reviewer);
    }

    #[tokio::test]
    async fn test_suggestions_put_unmet_requirements_first() {
        let mock = Arc::new(
            MockGenerator::new().respond("SUGGEST", r#"{"improvements": ["Give the dragon a name"]}"#),
        );
        let reviewer = Reviewer::new(test_support::gateway(mock), Arc::new(Config::default()));
        let review = ReviewResult::unparsed("S1", "weak");

        let improvements = reviewer
            .suggest_improvements(
                &Task::new("S1", "Opening", ""),
                &execution("a village", &["include a dragon"]),
                &review,
            )
            .await
            .unwrap();
        assert_eq!(
            improvements,
            vec![
                "Satisfy the requirement: include a dragon",
                "Give the dragon a name"
            ]
        );
    }

    #[tokio::test]
    async fn test_suggestions_fall_back_to_review() {
        let mock = Arc::new(MockGenerator::new().fail("SUGGEST", "Ollama API error (500): boom"));
        let reviewer = Reviewer::new(test_support::gateway(mock), Arc::new(Config::default()));
        let mut review = ReviewResult::unparsed("S1", "flat");
        review.suggestions = vec!["Add tension".into()];

        let improvements = reviewer
            .suggest_improvements(&Task::new("S1", "Opening", ""), &execution("x", &[]), &review)
            .await
            .unwrap();
        assert_eq!(improvements, vec!["Add tension"]);
    }
}
