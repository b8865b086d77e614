//! End-to-end runs of the control loop against a scripted backend
//!
//! Templates are reduced to a leading keyword plus the variables, so each
//! scripted reply can be routed by operation and subtask title.

use std::sync::Arc;

use async_trait::async_trait;
use quill::core::{Config, RunStatus, Task, TaskStatus};
use quill::llm::{GenerationParams, MockGenerator, MockReply, TemplateStore, TextGenerator};
use quill::orchestration::{Engine, RunRequest};
use quill::session::SessionStore;
use tokio_util::sync::CancellationToken;

const DRAGON_PLAN: &str = r#"```json
{
  "strategy": "opening first, then the finale",
  "subtasks": [
    {"id": "S1", "title": "Opening", "description": "Set the scene"},
    {"id": "S2", "title": "Finale", "description": "Resolve the story", "depends_on": ["S1"]}
  ]
}
```"#;

const SPLIT_PLAN: &str = r#"{
  "subtasks": [
    {"id": "S1", "title": "Works", "description": "Part that succeeds"},
    {"id": "S2", "title": "Broken", "description": "Part that fails"}
  ]
}"#;

fn templates() -> TemplateStore {
    let mut t = TemplateStore::new();
    t.register(
        "planner/generic_plan",
        "PLAN {task_id} {task_title} {task_description} {requirements} {mode} {session_title}",
    );
    t.register(
        "worker/generic_execution",
        "EXECUTE {task_title} {task_description} {requirements} {mode}\nRELATED {related_results}\nPREVIOUS {previous_content}\nIMPROVE {improvements}",
    );
    t.register(
        "reviewer/generic_review",
        "REVIEW {task_title} {task_description} {requirements} {unmet_requirements} {content}",
    );
    t.register(
        "reviewer/generic_improvement",
        "SUGGEST {task_title} {score} {feedback} {suggestions} {content}",
    );
    t.register(
        "director/generic_integration",
        "INTEGRATE {task_title} {task_description} {requirements}\n{results}",
    );
    t
}

fn config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 1;
    config.review.threshold = 0.7;
    config.engine.max_parallel_subtasks = 1;
    config.session.storage_dir = None;
    config.templates.dir = None;
    config
}

fn engine_with(config: Config, generator: Arc<dyn TextGenerator>) -> Engine {
    Engine::builder()
        .config(config)
        .generator(generator)
        .templates(templates())
        .build()
        .unwrap()
}

fn dragon_task() -> Task {
    Task::new("task-1", "A dragon tale", "A short story for children")
        .with_requirements(["include a dragon"])
}

fn review(score: f64) -> String {
    format!(
        r#"{{"score": {}, "feedback": "needs more fire", "suggestions": ["Bring in the dragon early"]}}"#,
        score
    )
}

fn dragon_mock() -> MockGenerator {
    MockGenerator::new()
        .respond("PLAN", DRAGON_PLAN)
        .respond_seq(
            "EXECUTE Opening",
            vec![
                MockReply::text("A quiet village wakes at dawn."),
                MockReply::text("A dragon circles the quiet village at dawn."),
            ],
        )
        .respond_seq(
            "REVIEW Opening",
            vec![MockReply::text(review(0.4)), MockReply::text(review(0.8))],
        )
        .respond("EXECUTE Finale", "The dragon lands and everyone shares breakfast.")
        .respond("REVIEW Finale", review(0.9))
        .respond("SUGGEST", r#"{"improvements": ["Show the dragon in the first line"]}"#)
        .respond("INTEGRATE", "Once upon a time a dragon came for breakfast.")
}

fn position(calls: &[quill::llm::mock::MockCall], needle: &str, last: bool) -> usize {
    let mut matching = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.prompt.contains(needle))
        .map(|(i, _)| i);
    let found = if last { matching.last() } else { matching.next() };
    found.unwrap_or_else(|| panic!("no call containing {:?}", needle))
}

#[tokio::test]
async fn test_low_score_gets_one_improvement_round() {
    let mock = Arc::new(dragon_mock());
    let engine = engine_with(config(), mock.clone());

    let result = engine.run(RunRequest::new(dragon_task())).await;

    assert_eq!(result.status, RunStatus::Completed, "{:?}", result.error);
    assert_eq!(
        result.content.as_deref(),
        Some("Once upon a time a dragon came for breakfast.")
    );
    assert_eq!(result.subtasks.len(), 2);

    let opening = &result.subtasks[0];
    assert_eq!(opening.task_id, "task-1/S1");
    assert_eq!(opening.status, TaskStatus::Completed);
    assert_eq!(opening.improvement_rounds, 1);
    assert_eq!(opening.score, Some(0.8));
    assert!(opening.content.as_deref().unwrap().contains("dragon"));

    let finale = &result.subtasks[1];
    assert_eq!(finale.task_id, "task-1/S2");
    assert_eq!(finale.improvement_rounds, 0);

    assert_eq!(mock.calls_matching("EXECUTE Opening").len(), 2);
    assert_eq!(mock.calls_matching("REVIEW Opening").len(), 2);
    assert_eq!(mock.calls_matching("SUGGEST").len(), 1);

    // the retry carries the improvement list and the unmet requirement
    let retry = &mock.calls_matching("EXECUTE Opening")[1].prompt;
    assert!(retry.contains("Show the dragon in the first line"));
    assert!(retry.contains("Satisfy the requirement: include a dragon"));
    assert!(retry.contains("A quiet village wakes at dawn."));

    // S2 only starts once S1 has been fully reviewed
    let calls = mock.calls();
    assert!(position(&calls, "EXECUTE Finale", false) > position(&calls, "REVIEW Opening", true));

    // the finale sees the improved opening
    let finale_prompt = &mock.calls_matching("EXECUTE Finale")[0].prompt;
    assert!(finale_prompt.contains("A dragon circles the quiet village at dawn."));
}

#[tokio::test]
async fn test_passing_score_skips_improvement() {
    let mock = Arc::new(
        MockGenerator::new()
            .respond("PLAN", DRAGON_PLAN)
            .respond("EXECUTE", "A dragon naps in the sun.")
            .respond("REVIEW", review(0.7))
            .respond("INTEGRATE", "All done."),
    );
    let engine = engine_with(config(), mock.clone());

    let result = engine.run(RunRequest::new(dragon_task())).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.subtasks.iter().all(|s| s.improvement_rounds == 0));
    assert!(mock.calls_matching("SUGGEST").is_empty());
    assert_eq!(mock.calls_matching("EXECUTE").len(), 2);
}

#[tokio::test]
async fn test_one_failed_subtask_gives_partial_result() {
    let mock = Arc::new(
        MockGenerator::new()
            .respond("PLAN", SPLIT_PLAN)
            .fail("EXECUTE Broken", "model exploded")
            .respond("EXECUTE Works", "Solid paragraph.")
            .respond("REVIEW", review(0.9))
            .respond("INTEGRATE", "Solid paragraph, integrated."),
    );
    let engine = engine_with(config(), mock.clone());

    let task = Task::new("task-1", "Essay", "Two parts");
    let result = engine.run(RunRequest::new(task)).await;

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.content.as_deref(), Some("Solid paragraph, integrated."));
    assert_eq!(result.completed_count(), 1);

    let broken = result.subtasks.iter().find(|s| s.task_id == "task-1/S2").unwrap();
    assert_eq!(broken.status, TaskStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("model exploded"));

    // non-transient errors are not retried
    assert_eq!(mock.calls_matching("EXECUTE Broken").len(), 1);

    // only the completed part reaches integration
    let integrate = &mock.calls_matching("INTEGRATE")[0].prompt;
    assert!(integrate.contains("Solid paragraph."));
    assert!(!integrate.contains("## Broken"));
}

#[tokio::test]
async fn test_no_completed_subtask_fails_run() {
    let mock = Arc::new(
        MockGenerator::new()
            .respond("PLAN", SPLIT_PLAN)
            .fail("EXECUTE", "model exploded"),
    );
    let engine = engine_with(config(), mock.clone());

    let result = engine
        .run(RunRequest::new(Task::new("task-1", "Essay", "Two parts")))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("no subtask completed"));
    assert!(result.content.is_none());
    assert!(mock.calls_matching("INTEGRATE").is_empty());
}

#[tokio::test]
async fn test_dependent_of_failed_subtask_never_runs() {
    let mock = Arc::new(
        MockGenerator::new()
            .respond("PLAN", DRAGON_PLAN)
            .fail("EXECUTE Opening", "model exploded"),
    );
    let engine = engine_with(config(), mock.clone());

    let result = engine.run(RunRequest::new(dragon_task())).await;

    assert_eq!(result.status, RunStatus::Failed);
    let finale = &result.subtasks[1];
    assert_eq!(finale.status, TaskStatus::Failed);
    assert!(finale.error.as_deref().unwrap().contains("S1"));
    assert!(mock.calls_matching("EXECUTE Finale").is_empty());
}

#[tokio::test]
async fn test_unparseable_plan_fails_run() {
    let mock = Arc::new(MockGenerator::new().respond("PLAN", "I would rather write a poem."));
    let engine = engine_with(config(), mock.clone());

    let result = engine.run(RunRequest::new(dragon_task())).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.subtasks.is_empty());
    assert!(result.error.as_deref().unwrap().starts_with("planning failed"));
    assert!(mock.calls_matching("EXECUTE").is_empty());
}

#[tokio::test]
async fn test_cancel_before_start() {
    let mock = Arc::new(dragon_mock());
    let engine = engine_with(config(), mock.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine
        .run_with_cancel(RunRequest::new(dragon_task()), cancel)
        .await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(mock.calls().is_empty());
}

/// Delegates to a mock and fires the token on the first prompt matching `needle`
struct CancelOn {
    inner: Arc<MockGenerator>,
    needle: &'static str,
    token: CancellationToken,
}

#[async_trait]
impl TextGenerator for CancelOn {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> quill::Result<String> {
        if prompt.contains(self.needle) {
            self.token.cancel();
        }
        self.inner.generate(prompt, params).await
    }

    fn name(&self) -> &str {
        "cancel-on"
    }
}

#[tokio::test]
async fn test_cancel_mid_run_finishes_in_flight_subtask() {
    let mock = Arc::new(dragon_mock());
    let cancel = CancellationToken::new();
    let generator = Arc::new(CancelOn {
        inner: mock.clone(),
        needle: "EXECUTE Opening",
        token: cancel.clone(),
    });
    let engine = engine_with(config(), generator);

    let result = engine
        .run_with_cancel(RunRequest::new(dragon_task()), cancel)
        .await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.subtasks[0].status, TaskStatus::Completed);
    assert_eq!(result.subtasks[1].status, TaskStatus::Cancelled);
    assert!(mock.calls_matching("EXECUTE Finale").is_empty());
    assert!(mock.calls_matching("INTEGRATE").is_empty());
}

#[tokio::test]
async fn test_parallel_subtasks_all_complete() {
    let mock = Arc::new(
        MockGenerator::new()
            .respond("PLAN", SPLIT_PLAN)
            .respond("EXECUTE", "Some text.")
            .respond("REVIEW", review(0.9))
            .respond("INTEGRATE", "Both parts."),
    );
    let mut config = config();
    config.engine.max_parallel_subtasks = 4;
    let engine = engine_with(config, mock);

    let result = engine
        .run(RunRequest::new(Task::new("task-1", "Essay", "Two parts")))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let ids: Vec<&str> = result.subtasks.iter().map(|s| s.task_id.as_str()).collect();
    assert_eq!(ids, vec!["task-1/S1", "task-1/S2"]);
}

#[tokio::test]
async fn test_session_records_tasks_and_history() {
    let engine = engine_with(config(), Arc::new(dragon_mock()));

    let result = engine
        .run(RunRequest::new(dragon_task()).in_session("story-1"))
        .await;
    assert_eq!(result.session_id, "story-1");

    let handle = engine.sessions().get_or_create("story-1").await.unwrap();
    let session = handle.lock().await;
    assert_eq!(session.title, "A dragon tale");

    let top = session.task("task-1").unwrap();
    assert_eq!(top.status, TaskStatus::Completed);
    assert_eq!(top.result, result.content);
    assert_eq!(session.task("task-1/S1").unwrap().parent_id.as_deref(), Some("task-1"));

    // one command plus at least one reply per dispatch
    assert!(session.history.len() >= 2 * 8);
}

#[tokio::test]
async fn test_sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.session.storage_dir = Some(dir.path().to_path_buf());

    let first = engine_with(config.clone(), Arc::new(dragon_mock()));
    let result = first
        .run(RunRequest::new(dragon_task()).in_session("story-1"))
        .await;
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.error.is_none());
    drop(first);

    let second = engine_with(config, Arc::new(MockGenerator::new()));
    let handle = second.sessions().get_or_create("story-1").await.unwrap();
    let session = handle.lock().await;
    assert_eq!(session.task("task-1").unwrap().status, TaskStatus::Completed);
    assert_eq!(session.task("task-1/S2").unwrap().status, TaskStatus::Completed);
    assert!(!session.history.is_empty());
}

#[tokio::test]
async fn test_shared_store_between_engines() {
    let sessions = Arc::new(SessionStore::from_config(&config()));
    let engine = Engine::builder()
        .config(config())
        .generator(Arc::new(dragon_mock()))
        .templates(templates())
        .sessions(sessions.clone())
        .build()
        .unwrap();

    engine
        .run(RunRequest::new(dragon_task()).in_session("shared").owner("ana"))
        .await;

    assert_eq!(sessions.active_count("ana"), 1);
}

#[tokio::test]
async fn test_improved_result_below_threshold_is_not_improved_again() {
    let mock = Arc::new(
        MockGenerator::new()
            .respond("PLAN", r#"{"subtasks": [{"id": "S1", "title": "Opening"}]}"#)
            .respond("EXECUTE", "A dragon sleeps.")
            .respond_seq(
                "REVIEW",
                vec![MockReply::text(review(0.4)), MockReply::text(review(0.5))],
            )
            .respond("SUGGEST", r#"["Wake the dragon"]"#)
            .respond("INTEGRATE", "A dragon sleeps."),
    );
    let engine = engine_with(config(), mock.clone());

    let result = engine.run(RunRequest::new(dragon_task())).await;

    assert_eq!(result.status, RunStatus::Completed);
    let opening = &result.subtasks[0];
    assert_eq!(opening.improvement_rounds, 1);
    assert_eq!(opening.score, Some(0.5));
    assert_eq!(mock.calls_matching("EXECUTE").len(), 2);
    assert_eq!(mock.calls_matching("REVIEW").len(), 2);
    assert_eq!(mock.calls_matching("SUGGEST").len(), 1);
}

fn single_part_mock() -> MockGenerator {
    MockGenerator::new()
        .respond("PLAN", r#"{"subtasks": [{"id": "S1", "title": "Part"}]}"#)
        .respond("EXECUTE", "Some text.")
        .respond("REVIEW", review(0.9))
        .respond("INTEGRATE", "Integrated text.")
}

#[tokio::test]
async fn test_second_run_keeps_first_run_tasks() {
    let engine = engine_with(config(), Arc::new(single_part_mock()));

    let first = engine
        .run(RunRequest::new(Task::new("T1", "First", "One")).in_session("s"))
        .await;
    let second = engine
        .run(RunRequest::new(Task::new("T2", "Second", "Two")).in_session("s"))
        .await;
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(first.subtasks[0].task_id, "T1/S1");
    assert_eq!(second.subtasks[0].task_id, "T2/S1");

    let handle = engine.sessions().get_or_create("s").await.unwrap();
    let session = handle.lock().await;
    let mut ids: Vec<&str> = session.tasks.keys().map(String::as_str).collect();
    ids.sort();
    assert_eq!(ids, vec!["T1", "T1/S1", "T2", "T2/S1"]);

    let earlier = session.task("T1/S1").unwrap();
    assert_eq!(earlier.status, TaskStatus::Completed);
    assert_eq!(earlier.parent_id.as_deref(), Some("T1"));
    assert_eq!(earlier.result.as_deref(), Some("Some text."));
}

#[tokio::test]
async fn test_reused_task_id_is_refused() {
    let mock = Arc::new(single_part_mock());
    let engine = engine_with(config(), mock.clone());

    let first = engine
        .run(RunRequest::new(Task::new("T1", "First", "One")).in_session("s"))
        .await;
    assert_eq!(first.status, RunStatus::Completed);
    let calls_after_first = mock.calls().len();

    let again = engine
        .run(RunRequest::new(Task::new("T1", "Other", "Different")).in_session("s"))
        .await;
    assert_eq!(again.status, RunStatus::Failed);
    assert!(again.error.as_deref().unwrap().contains("already exists"));
    assert_eq!(mock.calls().len(), calls_after_first);

    let handle = engine.sessions().get_or_create("s").await.unwrap();
    let session = handle.lock().await;
    let kept = session.task("T1").unwrap();
    assert_eq!(kept.title, "First");
    assert_eq!(kept.status, TaskStatus::Completed);
    assert_eq!(kept.result, first.content);
}
