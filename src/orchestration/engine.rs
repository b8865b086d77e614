//! Orchestration engine
//!
//! Drives one top-level task through plan → execute → review → improve →
//! integrate. Subtasks run as soon as their dependencies are COMPLETED, up
//! to `engine.max_parallel_subtasks` at a time; review and improvement of a
//! subtask always follow its own execution. A subtask scoring below the
//! review threshold gets exactly one improvement round.
//!
//! Nothing escapes `run`: every failure ends up in the `FinalResult`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{
    Config, ExecutionContext, ExecutionResult, FinalResult, IntegrationResult, Mode, Payload,
    PlanResult, QuillError, RelatedResult, Result, ReviewResult, RunStatus, SubtaskOutcome, Task,
    TaskStatus,
};
use crate::orchestration::dispatcher::CommandDispatcher;
use crate::orchestration::state::{ProcessState, RunState};
use crate::session::{SessionHandle, SessionStore, DEFAULT_OWNER};

/// A request to run one top-level task
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task: Task,
    /// Session to run in; a new id is generated when absent
    pub session_id: Option<String>,
    pub owner: Option<String>,
    /// Overrides the session's mode
    pub mode: Option<Mode>,
}

impl RunRequest {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            session_id: None,
            owner: None,
            mode: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

async fn dispatch<T: DeserializeOwned>(
    dispatcher: &CommandDispatcher,
    session: &SessionHandle,
    command: &str,
    params: Value,
) -> Result<T> {
    dispatcher
        .execute(command, session, into_payload(params))
        .await
        .decode()
}

async fn set_status(session: &SessionHandle, task_id: &str, status: TaskStatus) {
    session.lock().await.update_task_status(task_id, status);
}

async fn fail_task(session: &SessionHandle, task_id: &str, error: &str) {
    let mut session = session.lock().await;
    if let Some(task) = session.task_mut(task_id) {
        if !task.status.is_terminal() {
            task.set_status(TaskStatus::Failed);
            task.error = Some(error.to_string());
        }
    }
}

/// Execute → review → (improve → execute → review) for one subtask
#[derive(Clone)]
struct SubtaskPipeline {
    dispatcher: Arc<CommandDispatcher>,
    session: SessionHandle,
    threshold: f64,
}

impl SubtaskPipeline {
    async fn run(self, task: Task, related: Vec<RelatedResult>) -> SubtaskOutcome {
        match self.drive(&task, related).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(task = %task.id, error = %error, "subtask failed");
                fail_task(&self.session, &task.id, &error).await;
                SubtaskOutcome::failed(&task, error)
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, command: &str, params: Value) -> Result<T> {
        dispatch(&self.dispatcher, &self.session, command, params).await
    }

    async fn drive(&self, task: &Task, related: Vec<RelatedResult>) -> Result<SubtaskOutcome> {
        set_status(&self.session, &task.id, TaskStatus::Executing).await;
        let context = ExecutionContext {
            related_results: related,
            ..Default::default()
        };

        let first: ExecutionResult = self
            .call("execute", json!({"task": task, "context": &context}))
            .await?;
        if first.content.trim().is_empty() {
            return Err(QuillError::Other(
                first
                    .generation_error
                    .unwrap_or_else(|| "worker produced no content".to_string()),
            ));
        }

        set_status(&self.session, &task.id, TaskStatus::Reviewing).await;
        let review: ReviewResult = self
            .call("review", json!({"task": task, "result": &first}))
            .await?;

        let mut accepted = first;
        let mut score = review.score;
        let mut rounds = 0;

        if review.score < self.threshold {
            rounds = 1;
            tracing::info!(
                task = %task.id,
                score = review.score,
                threshold = self.threshold,
                "below threshold, improving"
            );

            let improvements: Vec<String> = match self
                .call(
                    "suggest_improvements",
                    json!({"task": task, "result": &accepted, "review": &review}),
                )
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "no improvement list, using review suggestions");
                    review.suggestions.clone()
                }
            };

            set_status(&self.session, &task.id, TaskStatus::Executing).await;
            let retry_context = ExecutionContext {
                improvements,
                previous_content: Some(accepted.content.clone()),
                related_results: context.related_results.clone(),
            };

            match self
                .call::<ExecutionResult>("execute", json!({"task": task, "context": &retry_context}))
                .await
            {
                Ok(improved)
                    if improved.generation_error.is_none()
                        && !improved.content.trim().is_empty() =>
                {
                    set_status(&self.session, &task.id, TaskStatus::Reviewing).await;
                    match self
                        .call::<ReviewResult>("review", json!({"task": task, "result": &improved}))
                        .await
                    {
                        Ok(second) => score = second.score,
                        Err(e) => {
                            tracing::warn!(task = %task.id, error = %e, "re-review failed")
                        }
                    }
                    accepted = improved;
                }
                Ok(_) => {
                    tracing::warn!(task = %task.id, "improvement produced nothing, keeping first result")
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "improvement failed, keeping first result")
                }
            }
        }

        {
            let mut session = self.session.lock().await;
            if let Some(t) = session.task_mut(&task.id) {
                t.result = Some(accepted.content.clone());
            }
            session.update_task_status(&task.id, TaskStatus::Completed);
        }
        tracing::info!(task = %task.id, score, rounds, "subtask completed");

        Ok(SubtaskOutcome {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: TaskStatus::Completed,
            content: Some(accepted.content),
            score: Some(score),
            improvement_rounds: rounds,
            error: None,
        })
    }
}

/// What the scheduling loop produced
struct SubtaskReport {
    /// Outcomes in plan order
    outcomes: Vec<SubtaskOutcome>,
    /// Completed results in plan order
    results: Vec<RelatedResult>,
    cancelled: bool,
}

/// The control loop over a session store and dispatcher
pub struct Engine {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<CommandDispatcher>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        Self {
            config,
            sessions,
            dispatcher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Run a top-level task to completion
    pub async fn run(&self, request: RunRequest) -> FinalResult {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a top-level task, stopping at subtask boundaries once `cancel` fires
    pub async fn run_with_cancel(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> FinalResult {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let owner = request.owner.as_deref().unwrap_or(DEFAULT_OWNER);
        let task_id = request.task.id.clone();

        let handle = match self.sessions.get_or_create_for(owner, &session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "session unavailable");
                return FinalResult::failed(task_id, session_id, e.to_string());
            }
        };

        {
            let mut session = handle.lock().await;
            if session.task(&task_id).is_some() {
                let error = format!(
                    "task '{}' already exists in session '{}'",
                    task_id, session_id
                );
                tracing::error!(task = %task_id, session = %session_id, "duplicate task id");
                return FinalResult::failed(task_id, session_id, error);
            }
            if session.title.is_empty() {
                session.title = request.task.title.clone();
            }
            if let Some(mode) = request.mode {
                session.mode = mode;
            }
            let mut task = request.task;
            task.set_status(TaskStatus::Pending);
            task.result = None;
            task.error = None;
            session.add_task(task);
        }

        let mut result = self.execute_process(&handle, &task_id, &cancel).await;

        let session = handle.lock().await;
        if let Err(e) = self.sessions.save(&session).await {
            tracing::error!(session = %session.id, error = %e, "failed to persist session");
            result.error = Some(match result.error.take() {
                Some(previous) => format!("{}; {}", previous, e),
                None => e.to_string(),
            });
        }

        result
    }

    /// The control loop for a task already stored in the session
    pub async fn execute_process(
        &self,
        handle: &SessionHandle,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> FinalResult {
        let (task, session_id) = {
            let session = handle.lock().await;
            (session.task(task_id).cloned(), session.id.clone())
        };
        let Some(task) = task else {
            return FinalResult::failed(
                task_id,
                session_id,
                format!("task '{}' not found in session", task_id),
            );
        };

        let mut run = RunState::new(&task.id);

        if cancel.is_cancelled() {
            run.advance(ProcessState::Cancelled);
            set_status(handle, &task.id, TaskStatus::Cancelled).await;
            return FinalResult {
                status: RunStatus::Cancelled,
                ..FinalResult::failed(&task.id, session_id, "run cancelled before planning")
            };
        }

        set_status(handle, &task.id, TaskStatus::Planning).await;
        let plan: PlanResult = match dispatch(
            &self.dispatcher,
            handle,
            "plan",
            json!({"task": &task, "requirements": &task.requirements}),
        )
        .await
        {
            Ok(plan) => plan,
            Err(e) => {
                let error = format!("planning failed: {}", e);
                tracing::error!(task = %task.id, error = %error, "run failed");
                run.advance(ProcessState::Failed);
                fail_task(handle, &task.id, &error).await;
                return FinalResult::failed(&task.id, session_id, error);
            }
        };

        {
            let mut session = handle.lock().await;
            if let Some(taken) = plan.subtasks.iter().find(|t| session.task(&t.id).is_some()) {
                let error = format!(
                    "planning failed: subtask id '{}' already exists in session",
                    taken.id
                );
                tracing::error!(task = %task.id, error = %error, "run failed");
                drop(session);
                run.advance(ProcessState::Failed);
                fail_task(handle, &task.id, &error).await;
                return FinalResult::failed(&task.id, session_id, error);
            }
            for subtask in &plan.subtasks {
                session.add_task(subtask.clone());
            }
            session.update_task_status(&task.id, TaskStatus::Executing);
        }
        run.advance(ProcessState::ExecutingSubtasks);

        let report = self.execute_subtasks(handle, &plan, &mut run, cancel).await;

        let mut result = FinalResult {
            task_id: task.id.clone(),
            session_id,
            status: RunStatus::Failed,
            content: None,
            subtasks: report.outcomes,
            error: None,
        };

        if report.cancelled {
            run.advance(ProcessState::Cancelled);
            set_status(handle, &task.id, TaskStatus::Cancelled).await;
            result.status = RunStatus::Cancelled;
            result.error = Some("run cancelled".to_string());
            tracing::info!(task = %task.id, summary = %run.summary(), "run cancelled");
            return result;
        }

        if report.results.is_empty() {
            let error = "no subtask completed".to_string();
            tracing::error!(task = %task.id, summary = %run.summary(), "run failed");
            run.advance(ProcessState::Failed);
            fail_task(handle, &task.id, &error).await;
            result.error = Some(error);
            return result;
        }

        run.advance(ProcessState::Integrating);
        let integration: Result<IntegrationResult> = dispatch(
            &self.dispatcher,
            handle,
            "integrate_results",
            json!({"task": &task, "results": &report.results}),
        )
        .await;

        match integration {
            Ok(integration) => {
                run.advance(ProcessState::Completed);
                {
                    let mut session = handle.lock().await;
                    if let Some(t) = session.task_mut(&task.id) {
                        t.result = Some(integration.content.clone());
                    }
                    session.update_task_status(&task.id, TaskStatus::Completed);
                }

                result.status = if result.completed_count() == result.subtasks.len() {
                    RunStatus::Completed
                } else {
                    RunStatus::Partial
                };
                result.content = Some(integration.content);
                tracing::info!(task = %task.id, status = %result.status, summary = %run.summary(), "run finished");
            }
            Err(e) => {
                let error = format!("integration failed: {}", e);
                tracing::error!(task = %task.id, error = %error, "run failed");
                run.advance(ProcessState::Failed);
                fail_task(handle, &task.id, &error).await;
                result.error = Some(error);
            }
        }

        result
    }

    /// Fails unless every dependency of `task` is COMPLETED in the session
    pub async fn ensure_dependencies_met(&self, handle: &SessionHandle, task: &Task) -> Result<()> {
        let session = handle.lock().await;
        let missing: Vec<String> = task
            .depends_on
            .iter()
            .filter(|dep| {
                session
                    .task(dep)
                    .map_or(true, |t| t.status != TaskStatus::Completed)
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(QuillError::DependencyUnsatisfied {
                task_id: task.id.clone(),
                missing,
            })
        }
    }

    async fn execute_subtasks(
        &self,
        handle: &SessionHandle,
        plan: &PlanResult,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> SubtaskReport {
        let limit = self.config.engine.max_parallel_subtasks.max(1);
        let pipeline = SubtaskPipeline {
            dispatcher: self.dispatcher.clone(),
            session: handle.clone(),
            threshold: self.config.review.threshold,
        };

        let mut waiting: Vec<&Task> = plan.subtasks.iter().collect();
        let mut outcomes: HashMap<String, SubtaskOutcome> = HashMap::new();
        let mut results: HashMap<String, RelatedResult> = HashMap::new();
        let mut in_flight: JoinSet<SubtaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                tracing::info!(task = %plan.task_id, in_flight = in_flight.len(), "cancellation observed, dispatching stops");
            }

            if !cancelled {
                // anything behind a dependency that did not complete can never run
                loop {
                    let blocked: Vec<(usize, String)> = waiting
                        .iter()
                        .enumerate()
                        .filter_map(|(i, t)| {
                            t.depends_on
                                .iter()
                                .find(|d| {
                                    outcomes
                                        .get(*d)
                                        .is_some_and(|o| o.status != TaskStatus::Completed)
                                })
                                .map(|d| (i, d.clone()))
                        })
                        .collect();
                    if blocked.is_empty() {
                        break;
                    }
                    for (i, dep) in blocked.into_iter().rev() {
                        let task = waiting.remove(i);
                        let error = format!("dependency '{}' did not complete", dep);
                        fail_task(handle, &task.id, &error).await;
                        outcomes.insert(task.id.clone(), SubtaskOutcome::failed(task, error));
                        run.failed += 1;
                    }
                }

                while in_flight.len() < limit {
                    let Some(pos) = waiting
                        .iter()
                        .position(|t| t.depends_on.iter().all(|d| results.contains_key(d)))
                    else {
                        break;
                    };
                    let task = waiting.remove(pos);

                    if let Err(e) = self.ensure_dependencies_met(handle, task).await {
                        let error = e.to_string();
                        tracing::error!(task = %task.id, error = %error, "refusing to dispatch");
                        fail_task(handle, &task.id, &error).await;
                        outcomes.insert(task.id.clone(), SubtaskOutcome::failed(task, error));
                        run.failed += 1;
                        continue;
                    }

                    let related: Vec<RelatedResult> = plan
                        .subtasks
                        .iter()
                        .filter(|t| task.depends_on.contains(&t.id))
                        .filter_map(|t| results.get(&t.id).cloned())
                        .collect();

                    tracing::debug!(task = %task.id, related = related.len(), "dispatching subtask");
                    let abort = in_flight.spawn(pipeline.clone().run(task.clone(), related));
                    running.insert(abort.id(), task.id.clone());
                    run.dispatched += 1;
                }
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };

            let outcome = match joined {
                Ok((id, outcome)) => {
                    running.remove(&id);
                    outcome
                }
                Err(e) => {
                    let task_id = running.remove(&e.id()).unwrap_or_default();
                    let error = format!("subtask aborted: {}", e);
                    fail_task(handle, &task_id, &error).await;
                    match plan.subtasks.iter().find(|t| t.id == task_id) {
                        Some(task) => SubtaskOutcome::failed(task, error),
                        None => continue,
                    }
                }
            };

            if outcome.status == TaskStatus::Completed {
                run.completed += 1;
                run.improvement_rounds += outcome.improvement_rounds;
                let title = outcome.title.clone();
                results.insert(
                    outcome.task_id.clone(),
                    RelatedResult {
                        task_id: outcome.task_id.clone(),
                        title,
                        content: outcome.content.clone().unwrap_or_default(),
                    },
                );
            } else {
                run.failed += 1;
            }
            outcomes.insert(outcome.task_id.clone(), outcome);
        }

        for task in waiting {
            if cancelled {
                set_status(handle, &task.id, TaskStatus::Cancelled).await;
                outcomes.insert(task.id.clone(), SubtaskOutcome::cancelled(task));
            } else {
                let missing: Vec<String> = task
                    .depends_on
                    .iter()
                    .filter(|d| !results.contains_key(*d))
                    .cloned()
                    .collect();
                let error = QuillError::DependencyUnsatisfied {
                    task_id: task.id.clone(),
                    missing,
                }
                .to_string();
                fail_task(handle, &task.id, &error).await;
                outcomes.insert(task.id.clone(), SubtaskOutcome::failed(task, error));
                run.failed += 1;
            }
        }

        SubtaskReport {
            outcomes: plan
                .subtasks
                .iter()
                .filter_map(|t| outcomes.remove(&t.id))
                .collect(),
            results: plan
                .subtasks
                .iter()
                .filter_map(|t| results.remove(&t.id))
                .collect(),
            cancelled,
        }
    }
}
