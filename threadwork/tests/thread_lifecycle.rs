//! End-to-end thread scenarios: a scripted model drives real turns against a
//! temporary git repository, with the in-process isolation runtime standing
//! in for containers.

use std::sync::Arc;

use serde_json::json;
use threadwork::Engine;
use threadwork::core::types::{
    Content, FailureReason, Message, Role, Thread, ThreadStatus, ToolErrorKind, ToolStatus,
};
use threadwork::domain::MergeOutcome;
use threadwork::error::EngineError;
use threadwork::io::config::EngineConfig;
use threadwork::sandbox::{IsolationRuntime, StartSpec};
use threadwork::stream::{StreamEvent, StreamSink};
use threadwork::test_support::{FakeRuntime, ScriptedModel, ScriptedReply, TestRepo, tool_call};
use tokio_util::sync::CancellationToken;

fn engine(config: EngineConfig, model: Arc<ScriptedModel>, runtime: Arc<FakeRuntime>) -> Engine {
    Engine::new(config, model, runtime).expect("engine")
}

fn tool_results(thread: &Thread) -> Vec<(String, ToolStatus)> {
    thread
        .transcript
        .messages()
        .iter()
        .filter_map(|m| m.as_tool_result())
        .map(|r| (r.correlation_id.clone(), r.status))
        .collect()
}

/// The notes scenario: append through the sandbox, commit, fast-forward main.
#[tokio::test]
async fn appended_note_is_merged_into_main() {
    let repo = TestRepo::new().expect("repo");
    repo.commit_file("notes.txt", "first\n", "add notes")
        .expect("commit notes");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Calls(vec![tool_call(
            "c1",
            "write_file",
            json!({"path": "notes.txt", "content": "second\n", "append": true}),
        )]),
        ScriptedReply::Text("Added the note.".to_string()),
    ]));
    let runtime = Arc::new(FakeRuntime::available());
    let engine = engine(repo.engine_config(), model.clone(), runtime.clone());

    let id = engine.create_thread(None).await.expect("create");
    let outcome = engine
        .send(&id, "append 'second' to notes.txt", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(outcome.status, ThreadStatus::Completed);
    assert_eq!(outcome.reply, "Added the note.");
    assert_eq!(outcome.steps, 2);
    assert_eq!(runtime.started(), 1);
    assert_eq!(runtime.stopped(), 1, "sandbox released at end of turn");

    let thread = engine.thread(&id).await.expect("thread");
    assert!(!thread.unsandboxed);
    assert_eq!(tool_results(&thread), vec![("c1".to_string(), ToolStatus::Ok)]);
    assert_eq!(
        repo.show("main", "notes.txt").expect("main notes"),
        "first\n",
        "main untouched before finish"
    );

    let before = repo.rev("main").expect("main rev");
    let merged = engine.finish(&id).await.expect("finish");
    let MergeOutcome::FastForward { commit } = &merged else {
        panic!("expected fast-forward, got {merged:?}");
    };
    assert_ne!(commit.0, before);
    assert_eq!(repo.rev("main").expect("main rev"), commit.0);
    assert_eq!(
        repo.show("main", "notes.txt").expect("main notes"),
        "first\nsecond\n"
    );

    let thread = engine.thread(&id).await.expect("thread");
    assert_eq!(thread.status, ThreadStatus::Merged);
    assert!(thread.worktree.is_none());

    // Asking again replays the recorded outcome, also from a new process.
    assert_eq!(engine.finish(&id).await.expect("finish again"), merged);
    let restarted = engine_with(repo.engine_config(), Arc::new(ScriptedModel::new(Vec::new())));
    assert_eq!(restarted.finish(&id).await.expect("finish after restart"), merged);
    assert_eq!(
        restarted.thread(&id).await.expect("thread").merge,
        Some(merged)
    );
}

#[tokio::test]
async fn unavailable_sandbox_falls_back_to_worktree() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Calls(vec![tool_call(
            "c1",
            "run_command",
            json!({"command": "echo hi > hello.txt && cat hello.txt"}),
        )]),
        ScriptedReply::Text("done".to_string()),
    ]));
    let runtime = Arc::new(FakeRuntime::unavailable());
    let engine = engine(repo.engine_config(), model, runtime.clone());

    let id = engine.create_thread(Some("notes")).await.expect("create");
    let outcome = engine
        .send(&id, "say hi", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(outcome.status, ThreadStatus::Completed);
    assert_eq!(runtime.started(), 0);

    let thread = engine.thread(&id).await.expect("thread");
    assert!(thread.unsandboxed);
    let result = thread
        .transcript
        .find_tool_result("c1")
        .expect("result recorded");
    assert!(result.is_ok());
    assert!(result.output.contains("exit code: 0"));

    let changes = engine.changes(&id).await.expect("changes");
    let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, vec!["hello.txt"]);
}

#[tokio::test]
async fn step_limit_fails_thread_and_keeps_transcript() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(
        ScriptedModel::new(Vec::new()).with_fallback(ScriptedReply::Calls(vec![tool_call(
            "",
            "current_time",
            json!({}),
        )])),
    );
    let config = EngineConfig {
        max_steps: 5,
        ..repo.engine_config()
    };
    let engine = engine(config, model.clone(), Arc::new(FakeRuntime::available()));

    let id = engine.create_thread(None).await.expect("create");
    let err = engine
        .send(&id, "loop forever", StreamSink::discard(), CancellationToken::new())
        .await
        .expect_err("step limit");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::StepLimitExceeded { limit: 5 })
    ));
    assert_eq!(model.calls(), 5);

    let thread = engine.thread(&id).await.expect("thread");
    assert_eq!(thread.status, ThreadStatus::Failed);
    assert_eq!(
        thread.failure,
        Some(FailureReason::StepLimitExceeded { steps: 5 })
    );
    assert_eq!(thread.steps, 5);
    // user message, then a call and its result per step
    assert_eq!(thread.transcript.len(), 11);
    let ids: Vec<String> = tool_results(&thread).into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, (1..=5).map(|s| format!("call-{s}-0")).collect::<Vec<_>>());

    let closed = engine
        .send(&id, "again", StreamSink::discard(), CancellationToken::new())
        .await
        .expect_err("closed");
    assert!(matches!(
        closed.downcast_ref::<EngineError>(),
        Some(EngineError::ThreadClosed { .. })
    ));
}

#[tokio::test]
async fn results_are_appended_in_call_order() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Calls(vec![
            tool_call("slow", "run_command", json!({"command": "sleep 0.3; echo slow"})),
            tool_call("fast", "current_time", json!({})),
            tool_call("bad", "write_file", json!({"path": "x.txt"})),
            tool_call("nope", "format_disk", json!({})),
        ]),
        ScriptedReply::Text("finished".to_string()),
    ]));
    let engine = engine(
        repo.engine_config(),
        model.clone(),
        Arc::new(FakeRuntime::available()),
    );

    let id = engine.create_thread(None).await.expect("create");
    engine
        .send(&id, "do four things", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("turn");

    let thread = engine.thread(&id).await.expect("thread");
    assert_eq!(
        tool_results(&thread),
        vec![
            ("slow".to_string(), ToolStatus::Ok),
            ("fast".to_string(), ToolStatus::Ok),
            ("bad".to_string(), ToolStatus::Error),
            ("nope".to_string(), ToolStatus::Error),
        ]
    );
    let kinds: Vec<Option<ToolErrorKind>> = thread
        .transcript
        .messages()
        .iter()
        .filter_map(|m| m.as_tool_result())
        .map(|r| r.error_kind)
        .collect();
    assert_eq!(kinds[2], Some(ToolErrorKind::InvalidArguments));
    assert_eq!(kinds[3], Some(ToolErrorKind::UnknownTool));

    // The second model call saw every result.
    let views = model.views();
    assert_eq!(views.len(), 2);
    let seen = views[1]
        .iter()
        .filter(|m| m.as_tool_result().is_some())
        .count();
    assert_eq!(seen, 4);
    assert_eq!(views[0][0].role, Role::System);
    assert_eq!(views[0].last().map(|m| m.text_content()), Some("do four things"));
}

#[tokio::test]
async fn generation_is_retried_then_fails() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Fail("provider overloaded".to_string()),
        ScriptedReply::Truncated("partial".to_string()),
        ScriptedReply::Text("recovered".to_string()),
    ]));
    let engine = Arc::new(engine(
        repo.engine_config(),
        model.clone(),
        Arc::new(FakeRuntime::available()),
    ));

    let id = engine.create_thread(None).await.expect("create");
    let mut turn = engine.start_turn(&id, "hello");
    let mut deltas = Vec::new();
    let mut retries = Vec::new();
    while let Some(event) = turn.reader.next().await {
        match event {
            StreamEvent::Delta { text } => deltas.push(text),
            StreamEvent::Retry {
                attempt,
                discard_bytes,
            } => retries.push((attempt, discard_bytes)),
            _ => {}
        }
    }
    let outcome = turn.handle.await.expect("join").expect("turn");
    assert_eq!(outcome.reply, "recovered");
    assert!(deltas.len() >= 3, "text streams as it arrives: {deltas:?}");
    assert_eq!(deltas.concat(), "partialrecovered");
    assert_eq!(retries, vec![(3, 7)], "only the attempt that streamed is voided");
    assert_eq!(turn.reader.text(), "recovered");
    assert_eq!(turn.reader.cursor(), "recovered".len());
    assert_eq!(model.calls(), 3);

    let failing = Arc::new(
        ScriptedModel::new(Vec::new())
            .with_fallback(ScriptedReply::Fail("provider down".to_string())),
    );
    let mut config = repo.engine_config();
    config.generation.max_retries = 2;
    config.data_dir = repo.data_dir().join("second");
    let engine = engine_with(config, failing.clone());
    let id = engine.create_thread(None).await.expect("create");
    let err = engine
        .send(&id, "hello", StreamSink::discard(), CancellationToken::new())
        .await
        .expect_err("generation failure");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Generation { attempts: 3, .. })
    ));
    assert_eq!(failing.calls(), 3);
    let thread = engine.thread(&id).await.expect("thread");
    assert!(matches!(
        thread.failure,
        Some(FailureReason::GenerationError { .. })
    ));
}

fn engine_with(config: EngineConfig, model: Arc<ScriptedModel>) -> Engine {
    engine(config, model, Arc::new(FakeRuntime::available()))
}

#[tokio::test]
async fn cancelled_turn_is_recorded_and_can_continue() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Hang,
        ScriptedReply::Text("back again".to_string()),
    ]));
    let engine = Arc::new(engine_with(repo.engine_config(), model.clone()));

    let id = engine.create_thread(None).await.expect("create");
    let mut turn = engine.start_turn(&id, "think hard");
    while model.calls() == 0 {
        tokio::task::yield_now().await;
    }
    turn.reader.cancel();
    assert_eq!(
        turn.reader.next().await,
        Some(StreamEvent::Done {
            status: ThreadStatus::Cancelled
        })
    );
    let err = turn.handle.await.expect("join").expect_err("cancelled");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Cancelled)
    ));
    let thread = engine.thread(&id).await.expect("thread");
    assert_eq!(thread.status, ThreadStatus::Cancelled);

    let outcome = engine
        .send(&id, "try again", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("second turn");
    assert_eq!(outcome.reply, "back again");
}

#[tokio::test]
async fn resume_answers_interrupted_calls() {
    let repo = TestRepo::new().expect("repo");
    let config = repo.engine_config();
    let first = engine_with(config.clone(), Arc::new(ScriptedModel::new(Vec::new())));
    let id = first.create_thread(None).await.expect("create");

    // Simulate a crash while a call was running.
    let mut record = first.thread(&id).await.expect("thread");
    record.status = ThreadStatus::AwaitingTool;
    record
        .transcript
        .append(threadwork::core::types::Message::user("list files"));
    record.transcript.append(threadwork::core::types::Message::tool_calls(
        "",
        vec![tool_call("lost", "list_directory", json!({}))],
    ));
    let path = config.threads_dir().join(format!("{id}.json"));
    std::fs::write(&path, serde_json::to_vec(&record).expect("json")).expect("write record");
    drop(first);

    let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Text(
        "it was interrupted".to_string(),
    )]));
    let engine = engine_with(config, model.clone());
    let outcome = engine
        .resume(&id, StreamSink::discard(), CancellationToken::new())
        .await
        .expect("resume");
    assert_eq!(outcome.status, ThreadStatus::Completed);

    let thread = engine.thread(&id).await.expect("thread");
    let lost = thread.transcript.find_tool_result("lost").expect("answered");
    assert_eq!(lost.error_kind, Some(ToolErrorKind::Interrupted));
    let last = thread.transcript.last().expect("last message");
    assert!(matches!(&last.content, Content::Text { text } if text == "it was interrupted"));

    let not_in_flight = engine
        .resume(&id, StreamSink::discard(), CancellationToken::new())
        .await;
    assert!(not_in_flight.is_err());
}

#[tokio::test]
async fn discard_removes_branch_and_is_repeatable() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Calls(vec![tool_call(
            "c1",
            "write_file",
            json!({"path": "draft.md", "content": "wip\n"}),
        )]),
        ScriptedReply::Text("drafted".to_string()),
    ]));
    let runtime = Arc::new(FakeRuntime::available());
    let engine = engine(repo.engine_config(), model, runtime);

    let id = engine.create_thread(None).await.expect("create");
    engine
        .send(&id, "draft", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("turn");
    let thread = engine.thread(&id).await.expect("thread");
    let branch = thread.branch.clone().expect("branch recorded");
    let worktree = thread.worktree.clone().expect("worktree recorded");
    assert!(worktree.join("draft.md").exists());

    engine.discard(&id).await.expect("discard");
    engine.discard(&id).await.expect("discard again");
    assert!(!worktree.exists());
    let branches = std::process::Command::new("git")
        .args(["branch", "--list", &branch])
        .current_dir(repo.root())
        .output()
        .expect("git branch");
    assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());

    let thread = engine.thread(&id).await.expect("thread");
    assert_eq!(thread.status, ThreadStatus::Failed);
    assert_eq!(thread.failure, Some(FailureReason::Discarded));
    let err = engine.finish(&id).await.expect_err("closed");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ThreadClosed { .. })
    ));
}

#[tokio::test]
async fn tiny_budget_overflows_context() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        context_budget_tokens: 1,
        ..repo.engine_config()
    };
    let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Text("x".to_string())]));
    let engine = engine_with(config, model.clone());

    let id = engine.create_thread(None).await.expect("create");
    let err = engine
        .send(&id, "hello", StreamSink::discard(), CancellationToken::new())
        .await
        .expect_err("overflow");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ContextOverflow(_))
    ));
    assert_eq!(model.calls(), 0);
    let thread = engine.thread(&id).await.expect("thread");
    assert!(matches!(
        thread.failure,
        Some(FailureReason::ContextOverflow { budget: 1, .. })
    ));
}

#[tokio::test]
async fn domain_selection_rules() {
    let repo = TestRepo::new().expect("repo");
    let other = TestRepo::new().expect("other repo");
    let mut config = repo.engine_config();
    config.domains.push(other.domain_config("code"));
    let engine = engine_with(config, Arc::new(ScriptedModel::new(Vec::new())));

    let err = engine.create_thread(None).await.expect_err("ambiguous");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::DomainSelection(_))
    ));
    let err = engine.create_thread(Some("docs")).await.expect_err("unknown");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::DomainSelection(_))
    ));
    let id = engine.create_thread(Some("code")).await.expect("explicit");
    assert_eq!(engine.thread(&id).await.expect("thread").domain, "code");
    assert_eq!(engine.list_threads().await.expect("list").len(), 1);
}

#[tokio::test]
async fn correlation_ids_stay_unique_across_turns() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Calls(vec![tool_call(
            "c1",
            "run_command",
            json!({"command": "echo FIRST"}),
        )]),
        ScriptedReply::Text("one".to_string()),
        ScriptedReply::Calls(vec![tool_call(
            "c1",
            "run_command",
            json!({"command": "echo SECOND"}),
        )]),
        ScriptedReply::Calls(vec![tool_call(
            "r1",
            "read_tool_output",
            json!({"correlation_id": "c1"}),
        )]),
        ScriptedReply::Text("two".to_string()),
        ScriptedReply::Calls(vec![tool_call("", "current_time", json!({}))]),
        ScriptedReply::Text("three".to_string()),
    ]));
    let engine = engine_with(repo.engine_config(), model);

    let id = engine.create_thread(None).await.expect("create");
    for text in ["first", "second", "third"] {
        engine
            .send(&id, text, StreamSink::discard(), CancellationToken::new())
            .await
            .expect("turn");
    }

    let thread = engine.thread(&id).await.expect("thread");
    let ids: Vec<String> = tool_results(&thread).into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["c1", "call-3-0", "r1", "call-6-0"]);
    let paged = thread.transcript.find_tool_result("r1").expect("paged result");
    assert!(paged.output.contains("FIRST"), "{}", paged.output);
    assert!(!paged.output.contains("SECOND"), "{}", paged.output);
}

/// A record as left by a process that died with a sandbox running.
async fn crashed_thread(
    engine: &Engine,
    config: &EngineConfig,
    runtime: &FakeRuntime,
    repo: &TestRepo,
) -> (threadwork::core::types::ThreadId, String) {
    let id = engine.create_thread(None).await.expect("create");
    let sandbox_id = runtime
        .start(&StartSpec {
            thread_id: id.clone(),
            host_path: repo.root().to_path_buf(),
            mount_path: "/workspace".to_string(),
        })
        .await
        .expect("start");
    let mut record = engine.thread(&id).await.expect("thread");
    record.status = ThreadStatus::Running;
    record.sandbox_id = Some(sandbox_id.clone());
    record.transcript.append(Message::user("run something"));
    let path = config.threads_dir().join(format!("{id}.json"));
    std::fs::write(&path, serde_json::to_vec(&record).expect("json")).expect("write record");
    (id, sandbox_id)
}

#[tokio::test]
async fn leftover_sandbox_is_stopped_on_resume_and_discard() {
    let repo = TestRepo::new().expect("repo");
    let config = repo.engine_config();
    let runtime = Arc::new(FakeRuntime::available());
    let first = engine(
        config.clone(),
        Arc::new(ScriptedModel::new(Vec::new())),
        runtime.clone(),
    );
    let (resumed, _) = crashed_thread(&first, &config, &runtime, &repo).await;
    let (discarded, _) = crashed_thread(&first, &config, &runtime, &repo).await;
    drop(first);
    assert_eq!(runtime.started(), 2);

    let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Text(
        "picked up".to_string(),
    )]));
    let engine = engine(config, model, runtime.clone());
    engine
        .resume(&resumed, StreamSink::discard(), CancellationToken::new())
        .await
        .expect("resume");
    assert_eq!(runtime.stopped(), 1);
    assert!(engine.thread(&resumed).await.expect("thread").sandbox_id.is_none());

    engine.discard(&discarded).await.expect("discard");
    assert_eq!(runtime.stopped(), 2);
    assert_eq!(runtime.started(), 2, "no sandbox was provisioned again");
}

#[tokio::test]
async fn diverged_merge_gets_generated_summary() {
    let repo = TestRepo::new().expect("repo");
    let write = |id: &str, path: &str| {
        ScriptedReply::Calls(vec![tool_call(
            id,
            "write_file",
            json!({"path": path, "content": "draft\n"}),
        )])
    };
    let model = Arc::new(ScriptedModel::new(vec![
        write("c1", "a.md"),
        ScriptedReply::Text("wrote a".to_string()),
        write("c2", "b.md"),
        ScriptedReply::Text("wrote b".to_string()),
        ScriptedReply::Text("Add draft for a.md\nextra detail".to_string()),
    ]));
    let engine = engine_with(repo.engine_config(), model.clone());

    let first = engine.create_thread(None).await.expect("create");
    let second = engine.create_thread(None).await.expect("create");
    for (id, text) in [(&first, "write a"), (&second, "write b")] {
        engine
            .send(id, text, StreamSink::discard(), CancellationToken::new())
            .await
            .expect("turn");
    }
    repo.commit_file("main.txt", "main\n", "Touch main")
        .expect("main commit");

    let merged = engine.finish(&first).await.expect("finish first");
    assert!(matches!(merged, MergeOutcome::Merged { .. }), "{merged:?}");
    assert_eq!(repo.subject("main").expect("subject"), "Add draft for a.md");
    let views = model.views();
    let request = views[4][0].text_content();
    assert!(request.contains("File: a.md"), "{request}");
    assert!(request.contains("Touch main"), "{request}");

    // The script is exhausted, so the summary falls back.
    let merged = engine.finish(&second).await.expect("finish second");
    assert!(matches!(merged, MergeOutcome::Merged { .. }), "{merged:?}");
    assert_eq!(
        repo.subject("main").expect("subject"),
        format!("Merge thread {second}")
    );
}

#[tokio::test]
async fn describe_generates_title_once() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Text("Hi there.".to_string()),
        ScriptedReply::Text("\"Greeting the assistant\"\n".to_string()),
    ]));
    let engine = engine_with(repo.engine_config(), model.clone());

    let empty = engine.create_thread(None).await.expect("create");
    assert_eq!(engine.describe(&empty).await.expect("describe"), None);
    assert_eq!(model.calls(), 0);

    let id = engine.create_thread(None).await.expect("create");
    engine
        .send(&id, "hello", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("turn");
    let title = engine.describe(&id).await.expect("describe");
    assert_eq!(title.as_deref(), Some("Greeting the assistant"));
    assert_eq!(model.calls(), 2);
    let request = &model.views()[1];
    assert!(request[1].text_content().contains("user: hello"));
    assert!(request[1].text_content().contains("assistant: Hi there."));

    assert_eq!(engine.describe(&id).await.expect("describe again"), title);
    assert_eq!(model.calls(), 2, "cached title needs no model call");
    assert_eq!(engine.thread(&id).await.expect("thread").title, title);
}

#[tokio::test]
async fn retried_request_is_sanitized() {
    let repo = TestRepo::new().expect("repo");
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedReply::Fail("invalid request body".to_string()),
        ScriptedReply::Text("ok".to_string()),
    ]));
    let engine = engine_with(repo.engine_config(), model.clone());

    let id = engine.create_thread(None).await.expect("create");
    engine
        .send(&id, "odd\u{0}input", StreamSink::discard(), CancellationToken::new())
        .await
        .expect("turn");

    let views = model.views();
    assert_eq!(views.len(), 2);
    let last_text = |view: &Vec<Message>| view.last().map(|m| m.text_content().to_string());
    assert_eq!(last_text(&views[0]).as_deref(), Some("odd\u{0}input"));
    assert_eq!(last_text(&views[1]).as_deref(), Some("oddinput"));
    let thread = engine.thread(&id).await.expect("thread");
    assert_eq!(thread.transcript.messages()[0].text_content(), "odd\u{0}input");
}
