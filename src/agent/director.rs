//! Director agent
//!
//! Merges the completed subtask results into the final text. When the
//! model cannot be reached the parts are concatenated in plan order and
//! the result is flagged as degraded.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::agent::{decode, requirement_list, respond, status};
use crate::core::{Config, IntegrationResult, Message, QuillError, RelatedResult, Result, Task};
use crate::llm::{GenerationOutcome, ModelGateway, Variables};

#[derive(Debug, Deserialize)]
struct IntegrateParams {
    task: Task,
    results: Vec<RelatedResult>,
}

pub struct Director {
    gateway: ModelGateway,
    config: Arc<Config>,
}

impl Director {
    pub fn new(gateway: ModelGateway, config: Arc<Config>) -> Self {
        Self { gateway, config }
    }

    pub(crate) async fn handle(&self, action: &str, message: &Message) -> Result<Vec<Message>> {
        match action {
            "integrate_results" => {
                let params: IntegrateParams = decode(message)?;
                let integration = self.integrate(&params.task, &params.results).await?;

                let mut replies = Vec::new();
                if integration.degraded {
                    replies.push(status(
                        message,
                        json!({"task_id": integration.task_id, "degraded": true}),
                    ));
                }
                replies.push(respond(message, &integration)?);
                Ok(replies)
            }
            other => Err(QuillError::UnknownCommand(other.to_string())),
        }
    }

    /// Merge `results` (plan order) into one text for `task`
    pub async fn integrate(
        &self,
        task: &Task,
        results: &[RelatedResult],
    ) -> Result<IntegrationResult> {
        if results.is_empty() {
            return Err(QuillError::Other(format!(
                "nothing to integrate for task '{}'",
                task.id
            )));
        }

        let template_id = self
            .gateway
            .templates()
            .resolve("director", &task.task_type(), "integration");

        let parts = results
            .iter()
            .map(|r| format!("## {}\n{}", r.title, r.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut vars = Variables::new();
        vars.insert("task_title".into(), json!(task.title));
        vars.insert("task_description".into(), json!(task.description));
        vars.insert("requirements".into(), requirement_list(&task.requirements));
        vars.insert("results".into(), json!(parts));

        tracing::info!(task = %task.id, parts = results.len(), "integrating");

        let params = self.gateway.params(self.config.temperatures.director);
        let outcome = self
            .gateway
            .generate_with_template(&template_id, &vars, &params)
            .await?;

        let (content, degraded) = match outcome {
            GenerationOutcome::Success(text) if !text.trim().is_empty() => {
                (text.trim().to_string(), false)
            }
            GenerationOutcome::Success(_) => {
                tracing::warn!(task = %task.id, "empty integration, concatenating parts");
                (concatenate(results), true)
            }
            GenerationOutcome::Failed { last_error, .. } => {
                tracing::warn!(task = %task.id, error = %last_error, "integration degraded, concatenating parts");
                (concatenate(results), true)
            }
        };

        Ok(IntegrationResult {
            task_id: task.id.clone(),
            content,
            degraded,
        })
    }
}

/// Plain join of the parts, in order
fn concatenate(results: &[RelatedResult]) -> String {
    results
        .iter()
        .map(|r| r.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
