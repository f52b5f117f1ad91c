//! Cross-instance behavior: a pause taken by one service instance must be
//! resumable by another, and concurrent discovery must converge.

use taskhelm::engine::{ResumeAction, TurnOutcome};
use taskhelm::llm::CompletionSettings;
use taskhelm::model::TaskStatus;
use taskhelm::testing::{TestHarness, TestHarnessBuilder, tool_call};
use taskhelm::tools::{InterventionPolicy, RiskLevel};

fn request(id: &str) -> taskhelm::engine::TaskRequest {
    taskhelm::engine::TaskRequest {
        request_id: id.to_string(),
        session_id: "session-1".to_string(),
        user_id: "user-1".to_string(),
        prompt: "do something risky".to_string(),
        settings: CompletionSettings::default(),
    }
}

fn approval_policy() -> InterventionPolicy {
    InterventionPolicy::new(RiskLevel::Low).with_rule("deploy.apply", RiskLevel::RequiresApproval)
}

#[tokio::test]
async fn pause_on_one_instance_resumes_on_another() {
    let first = TestHarnessBuilder::new().with_policy(approval_policy()).build();
    first
        .completion
        .push_tool_calls(vec![tool_call("c1", "deploy", "apply")]);

    let outcome = first.engine.execute(request("req-x")).await.expect("execute");
    assert!(matches!(outcome, TurnOutcome::Paused(_)));

    // A different instance over the same store picks up the resume. Its own
    // completion stub supplies the continued turn.
    let second = TestHarnessBuilder::new()
        .with_policy(approval_policy())
        .with_shared(first.shared.clone())
        .build();
    second.completion.push_text("Deployed.");

    let outcome = second
        .engine
        .resume("req-x", ResumeAction::Approve)
        .await
        .expect("resume");
    match outcome {
        TurnOutcome::Completed { answer, .. } => assert_eq!(answer, "Deployed."),
        other => panic!("expected completion, got {:?}", other),
    }

    // The second instance executed the approved call; the first saw nothing
    // after its pause.
    assert_eq!(second.invoker.invocations().len(), 1);
    assert!(first.invoker.invocations().is_empty());

    let task = first
        .tasks
        .load_by_request_id("req-x")
        .await
        .expect("load")
        .expect("present");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn resume_race_on_two_instances_settles_once() {
    let first = TestHarnessBuilder::new().with_policy(approval_policy()).build();
    first
        .completion
        .push_tool_calls(vec![tool_call("c1", "deploy", "apply")]);
    first.engine.execute(request("req-y")).await.expect("execute");

    // One instance rejects first; a late approval on another instance must
    // fail the state check instead of reviving the canceled task.
    let second = TestHarnessBuilder::new()
        .with_policy(approval_policy())
        .with_shared(first.shared.clone())
        .build();

    first
        .engine
        .resume("req-y", ResumeAction::Reject)
        .await
        .expect("reject");

    let err = second
        .engine
        .resume("req-y", ResumeAction::Approve)
        .await
        .expect_err("already canceled");
    assert!(matches!(
        err,
        taskhelm::error::EngineError::InvalidTaskState { .. }
    ));
    assert!(second.invoker.invocations().is_empty());
}

#[tokio::test]
async fn concurrent_discovery_converges() {
    let first = TestHarnessBuilder::new()
        .with_server(TestHarness::server("alpha"))
        .build();
    let second = TestHarnessBuilder::new()
        .with_server(TestHarness::server("alpha"))
        .with_shared(first.shared.clone())
        .build();
    first.completion.push_text("a");
    second.completion.push_text("b");

    let (a, b) = tokio::join!(
        first.engine.execute(request("req-da")),
        second.engine.execute(request("req-db")),
    );
    assert!(matches!(a.expect("first"), TurnOutcome::Completed { .. }));
    assert!(matches!(b.expect("second"), TurnOutcome::Completed { .. }));

    let state = first
        .discovery_store()
        .load("user-1", "session-1")
        .await
        .expect("load")
        .expect("record");
    assert!(state.discovery_completed);
    assert!(state.servers.contains_key("alpha"));
    assert!(state.failed_servers.is_empty());
}

#[tokio::test]
async fn status_notice_shown_by_exactly_one_instance() {
    let first = TestHarnessBuilder::new()
        .with_server(TestHarness::server("alpha"))
        .build();
    let second = TestHarnessBuilder::new()
        .with_server(TestHarness::server("alpha"))
        .with_shared(first.shared.clone())
        .build();
    first.completion.push_text("a");
    second.completion.push_text("b");

    let a = first.engine.execute(request("req-na")).await.expect("first");
    let b = second.engine.execute(request("req-nb")).await.expect("second");

    let notices = [a, b]
        .into_iter()
        .filter_map(|outcome| match outcome {
            TurnOutcome::Completed { session_notice, .. } => session_notice,
            _ => None,
        })
        .count();
    assert_eq!(notices, 1, "the notice is store-backed, not per-process");
}
