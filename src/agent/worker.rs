//! Worker agent
//!
//! Writes one subtask at the session mode's temperature, folding in the
//! results of completed dependencies and any improvements from a review
//! cycle, then checks the text against the task's requirements.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::agent::{decode, requirement_list, respond, status, SessionContext};
use crate::core::{Config, ExecutionContext, ExecutionResult, Message, QuillError, Result, Task};
use crate::llm::{GenerationOutcome, ModelGateway, Variables};

static WORD_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(at least|no fewer than|minimum of|at most|no more than|maximum of)\s+(\d+)\s+words?\b")
        .expect("word limit pattern is valid")
});

const DIRECTIVES: &[&str] = &[
    "include", "includes", "including", "mention", "mentions", "contain", "contains", "feature",
    "features", "use", "uses", "have", "has", "with",
];
const ARTICLES: &[&str] = &["a", "an", "the", "some"];

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    task: Task,
    #[serde(default)]
    context: ExecutionContext,
    #[serde(default)]
    session: SessionContext,
}

pub struct Worker {
    gateway: ModelGateway,
    config: Arc<Config>,
}

impl Worker {
    pub fn new(gateway: ModelGateway, config: Arc<Config>) -> Self {
        Self { gateway, config }
    }

    pub(crate) async fn handle(&self, action: &str, message: &Message) -> Result<Vec<Message>> {
        match action {
            "execute" => {
                let params: ExecuteParams = decode(message)?;
                let result = self
                    .execute(&params.task, &params.context, &params.session)
                    .await?;

                let mut replies = Vec::new();
                if let Some(ref error) = result.generation_error {
                    replies.push(status(
                        message,
                        json!({"task_id": result.task_id, "degraded": true, "error": error}),
                    ));
                }
                replies.push(respond(message, &result)?);
                Ok(replies)
            }
            other => Err(QuillError::UnknownCommand(other.to_string())),
        }
    }

    /// Produce content for `task`.
    ///
    /// A generation that keeps failing is not an error: the result carries
    /// the previous content (or nothing) and `generation_error`.
    pub async fn execute(
        &self,
        task: &Task,
        context: &ExecutionContext,
        session: &SessionContext,
    ) -> Result<ExecutionResult> {
        let template_id = self
            .gateway
            .templates()
            .resolve("worker", &task.task_type(), "execution");

        let related = if context.related_results.is_empty() {
            "(none)".to_string()
        } else {
            context
                .related_results
                .iter()
                .map(|r| format!("### {}\n{}", r.title, r.content))
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        let mut vars = Variables::new();
        vars.insert("task_title".into(), json!(task.title));
        vars.insert("task_description".into(), json!(task.description));
        vars.insert("requirements".into(), requirement_list(&task.requirements));
        vars.insert("mode".into(), json!(session.mode.to_string()));
        vars.insert("related_results".into(), json!(related));
        vars.insert(
            "previous_content".into(),
            json!(context.previous_content.clone().unwrap_or_default()),
        );
        vars.insert("improvements".into(), json!(context.improvements));

        let temperature = self.config.worker_temperature(session.mode);
        tracing::info!(
            task = %task.id,
            template = %template_id,
            temperature,
            improving = !context.improvements.is_empty(),
            "executing"
        );

        let params = self.gateway.params(temperature);
        let outcome = self
            .gateway
            .generate_with_template(&template_id, &vars, &params)
            .await?;

        let (content, generation_error) = match outcome {
            GenerationOutcome::Success(text) => (text.trim().to_string(), None),
            GenerationOutcome::Failed { last_error, .. } => {
                tracing::warn!(task = %task.id, error = %last_error, "worker generation degraded");
                (
                    context.previous_content.clone().unwrap_or_default(),
                    Some(last_error),
                )
            }
        };

        let unmet_requirements = unmet_requirements(&task.requirements, &content);

        Ok(ExecutionResult {
            task_id: task.id.clone(),
            requirements_met: unmet_requirements.is_empty(),
            unmet_requirements,
            content,
            generation_error,
        })
    }
}

/// Requirements `content` does not satisfy, in order
pub fn unmet_requirements(requirements: &[String], content: &str) -> Vec<String> {
    requirements
        .iter()
        .filter(|r| !requirement_met(r, content))
        .cloned()
        .collect()
}

/// Presence and shape check of one requirement.
///
/// "include a dragon" needs "dragon" in the text, "at most 300 words" is a
/// length bound, anything else only needs non-empty content.
pub fn requirement_met(requirement: &str, content: &str) -> bool {
    if content.trim().is_empty() {
        return false;
    }

    if let Some(caps) = WORD_LIMIT.captures(requirement) {
        let limit: usize = caps[2].parse().unwrap_or(0);
        let words = content.split_whitespace().count();
        return match caps[1].to_lowercase().as_str() {
            "at most" | "no more than" | "maximum of" => words <= limit,
            _ => words >= limit,
        };
    }

    match directive_term(requirement) {
        Some(term) => content.to_lowercase().contains(&term),
        None => true,
    }
}

/// Term a directive requirement asks for, lowercased
fn directive_term(requirement: &str) -> Option<String> {
    let lower = requirement.trim().to_lowercase();
    let mut words = lower.split_whitespace().peekable();

    let first = words.next()?;
    if !DIRECTIVES.contains(&first) {
        return None;
    }
    if words.peek().is_some_and(|w| ARTICLES.contains(w)) {
        words.next();
    }

    let term = words
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string();
    (!term.is_empty()).then_some(term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support;
    use crate::core::{Mode, RelatedResult};
    use crate::llm::MockGenerator;

    fn reqs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_directive_requirements() {
        assert!(requirement_met("include a dragon", "The Dragon slept."));
        assert!(!requirement_met("include a dragon", "The knight slept."));
        assert!(requirement_met("Mention the old lighthouse.", "near the old lighthouse"));
        assert!(requirement_met("be suspenseful", "anything"));
        assert!(!requirement_met("be suspenseful", "   "));
    }

    #[test]
    fn test_word_limits() {
        let text = "one two three four five";
        assert!(requirement_met("at least 5 words", text));
        assert!(!requirement_met("at least 6 words", text));
        assert!(requirement_met("Keep it at most 5 words", text));
        assert!(!requirement_met("no more than 4 words", text));
    }

    #[test]
    fn test_unmet_keeps_order() {
        let unmet = unmet_requirements(
            &reqs(&["include a knight", "include a dragon", "at least 1 word"]),
            "a small village",
        );
        assert_eq!(unmet, reqs(&["include a knight", "include a dragon"]));
    }

    fn worker(mock: Arc<MockGenerator>) -> Worker {
        Worker::new(test_support::gateway(mock), Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_temperature_follows_mode() {
        let mock = Arc::new(MockGenerator::new().respond("EXECUTE", "text"));
        let worker = worker(mock.clone());
        let task = Task::new("S1", "Opening", "");
        let config = Config::default();

        for mode in [Mode::Creative, Mode::Coding, Mode::Research] {
            let session = SessionContext {
                id: "s1".into(),
                title: String::new(),
                mode,
            };
            worker
                .execute(&task, &ExecutionContext::default(), &session)
                .await
                .unwrap();
        }

        let temps: Vec<f32> = mock.calls().iter().map(|c| c.params.temperature).collect();
        assert_eq!(
            temps,
            vec![
                config.worker_temperature(Mode::Creative),
                config.worker_temperature(Mode::Coding),
                config.worker_temperature(Mode::Research),
            ]
        );
    }

    #[tokio::test]
    async fn test_improvements_and_related_results_reach_prompt() {
        let mock = Arc::new(MockGenerator::new().respond("EXECUTE", "  A dragon appears.  "));
        let worker = worker(mock.clone());
        let task = Task::new("S2", "Payoff", "").with_requirements(["include a dragon"]);
        let context = ExecutionContext {
            improvements: vec!["Add the dragon".into()],
            previous_content: Some("No beast here.".into()),
            related_results: vec![RelatedResult {
                task_id: "S1".into(),
                title: "Setup".into(),
                content: "The village".into(),
            }],
        };

        let result = worker
            .execute(&task, &context, &SessionContext::default())
            .await
            .unwrap();
        assert_eq!(result.content, "A dragon appears.");
        assert!(result.requirements_met);

        let prompt = &mock.calls()[0].prompt;
        assert!(prompt.contains("IMPROVE - Add the dragon"));
        assert!(prompt.contains("PREVIOUS No beast here."));
        assert!(prompt.contains("### Setup\nThe village"));
    }

    #[tokio::test]
    async fn test_failed_generation_is_degraded_answer() {
        let mock = Arc::new(MockGenerator::new().fail("EXECUTE", "Ollama API error (500): boom"));
        let worker = worker(mock);
        let task = Task::new("S1", "Opening", "");
        let msg = Message::command(
            crate::core::Component::Engine,
            crate::core::Component::Worker,
            "execute",
            serde_json::from_value(json!({"task": task})).unwrap(),
            "s1",
        )
        .unwrap();

        let replies = worker.handle("execute", &msg).await.unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind(), crate::core::MessageKind::Status);
        let result: ExecutionResult =
            serde_json::from_value(replies[1].payload()["result"].clone()).unwrap();
        assert!(result.content.is_empty());
        assert!(result.generation_error.is_some());
    }
}
