//! Planner agent
//!
//! Decomposes a top-level task into subtasks at temperature 0 and turns the
//! model's JSON into a validated `PlanResult`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::agent::{decode, requirement_list, respond, SessionContext};
use crate::core::{Config, Message, PlanResult, QuillError, Result, Task};
use crate::llm::{extract_json, ModelGateway, Variables};

#[derive(Debug, Deserialize)]
struct PlanParams {
    task: Task,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default)]
    session: SessionContext,
}

/// Planner output before validation
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    strategy: String,
    subtasks: Vec<RawSubtask>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawSubtask {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default, alias = "dependencies")]
    depends_on: Vec<String>,
    #[serde(default, rename = "type")]
    task_type: Option<String>,
}

pub struct Planner {
    gateway: ModelGateway,
    config: Arc<Config>,
}

impl Planner {
    pub fn new(gateway: ModelGateway, config: Arc<Config>) -> Self {
        Self { gateway, config }
    }

    pub(crate) async fn handle(&self, action: &str, message: &Message) -> Result<Vec<Message>> {
        match action {
            "plan" => {
                let params: PlanParams = decode(message)?;
                let plan = self
                    .plan(&params.task, &params.requirements, &params.session)
                    .await?;
                Ok(vec![respond(message, &plan)?])
            }
            other => Err(QuillError::UnknownCommand(other.to_string())),
        }
    }

    /// Decompose `task`; `requirements` override the task's own when non-empty
    pub async fn plan(
        &self,
        task: &Task,
        requirements: &[String],
        session: &SessionContext,
    ) -> Result<PlanResult> {
        let requirements = if requirements.is_empty() {
            task.requirements.as_slice()
        } else {
            requirements
        };

        let task_type = task.task_type();
        let template_id = self
            .gateway
            .templates()
            .resolve("planner", &task_type, "plan");

        let mut vars = Variables::new();
        vars.insert("task_id".into(), json!(task.id));
        vars.insert("task_title".into(), json!(task.title));
        vars.insert("task_description".into(), json!(task.description));
        vars.insert("requirements".into(), requirement_list(requirements));
        vars.insert("mode".into(), json!(session.mode.to_string()));
        vars.insert("session_title".into(), json!(session.title));

        tracing::info!(task = %task.id, template = %template_id, "planning");

        let params = self.gateway.params(self.config.temperatures.planner);
        let text = self
            .gateway
            .generate_with_template(&template_id, &vars, &params)
            .await?
            .into_result()?;

        let mut plan = parse_plan(task, requirements, &text)?;
        plan.metadata
            .insert("template".to_string(), json!(template_id));
        plan.metadata.insert("task_type".to_string(), json!(task_type));

        tracing::info!(task = %task.id, subtasks = plan.subtasks.len(), "plan ready");
        Ok(plan)
    }
}

/// Strictly parse and validate planner output
pub fn parse_plan(parent: &Task, requirements: &[String], text: &str) -> Result<PlanResult> {
    let value = extract_json(text)
        .ok_or_else(|| QuillError::plan_parse("no JSON object in planner response"))?;
    let raw: RawPlan = serde_json::from_value(value)
        .map_err(|e| QuillError::plan_parse(format!("unexpected plan shape: {}", e)))?;

    if raw.subtasks.is_empty() {
        return Err(QuillError::plan_parse("plan has no subtasks"));
    }

    let mut seen = BTreeSet::new();
    for sub in &raw.subtasks {
        let id = sub.id.trim();
        if id.is_empty() {
            return Err(QuillError::plan_parse("subtask with empty id"));
        }
        if id == parent.id {
            return Err(QuillError::plan_parse(format!(
                "subtask id '{}' is the parent's id",
                id
            )));
        }
        if !seen.insert(id.to_string()) {
            return Err(QuillError::plan_parse(format!("duplicate subtask id '{}'", id)));
        }
    }

    let mut subtasks = Vec::with_capacity(raw.subtasks.len());
    let mut dependencies = BTreeMap::new();

    for sub in raw.subtasks {
        let id = sub.id.trim().to_string();
        let depends_on: BTreeSet<String> =
            sub.depends_on.iter().map(|d| d.trim().to_string()).collect();

        if let Some(unknown) = depends_on.iter().find(|d| !seen.contains(*d) || **d == id) {
            return Err(QuillError::plan_parse(format!(
                "subtask '{}' depends on unknown task '{}'",
                id, unknown
            )));
        }

        let task_requirements = if sub.requirements.is_empty() {
            requirements.to_vec()
        } else {
            sub.requirements
        };

        let mut task = Task::new(id.clone(), sub.title, sub.description)
            .with_requirements(task_requirements);
        task.depends_on = depends_on.clone();
        task.task_type = sub.task_type.or_else(|| parent.task_type.clone());
        task.parent_id = Some(parent.id.clone());
        // same input, same plan: stamp with the parent's time
        task.updated_at = parent.updated_at;

        dependencies.insert(id, depends_on);
        subtasks.push(task);
    }

    if let Some(id) = find_cycle(&dependencies) {
        return Err(QuillError::plan_parse(format!(
            "dependency cycle through '{}'",
            id
        )));
    }

    // ids are session-wide: `{parent}/{local}`
    let scoped = |local: &str| scoped_id(&parent.id, local);
    for task in &mut subtasks {
        task.id = scoped(&task.id);
        task.depends_on = task.depends_on.iter().map(|d| scoped(d)).collect();
    }
    let dependencies: BTreeMap<String, BTreeSet<String>> = dependencies
        .into_iter()
        .map(|(id, deps)| (scoped(&id), deps.iter().map(|d| scoped(d)).collect()))
        .collect();

    Ok(PlanResult {
        task_id: parent.id.clone(),
        subtasks,
        dependencies,
        strategy: raw.strategy,
        metadata: raw.metadata,
    })
}

/// Session-wide id of plan-local subtask `local` under `parent_id`
pub fn scoped_id(parent_id: &str, local: &str) -> String {
    format!("{}/{}", parent_id, local)
}

/// A task on a dependency cycle, if any (Kahn's algorithm)
fn find_cycle(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Option<String> {
    let mut remaining: HashMap<&str, usize> = dependencies
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();
    let mut ready: Vec<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();

    while let Some(done) = ready.pop() {
        remaining.remove(done);
        for (id, deps) in dependencies {
            if deps.contains(done) {
                if let Some(n) = remaining.get_mut(id.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(id.as_str());
                    }
                }
            }
        }
    }

    remaining.keys().min().map(|id| id.to_string())
}
