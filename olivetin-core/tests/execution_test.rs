//! End-to-end runs through the execution chain with real child processes

#![cfg(unix)]

mod common;

use common::{app_from_yaml, run_and_wait, start, wait_for_entry};
use olivetin_core::acl::AuthenticatedUser;
use olivetin_core::events::Event;
use olivetin_core::executor::{DEFAULT_EXIT_CODE_NOT_EXECUTED, MAX_TRIGGER_DEPTH};
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};

const TICKLE: &str = r#"
actions:
  - title: Tickle
    id: tickle
    shell: "echo 'Tickling {{ person }}'"
    arguments:
      - name: person
        type: ascii
"#;

#[tokio::test]
async fn test_happy_path_streams_events_in_order() {
    let (_dir, app) = app_from_yaml(TICKLE).await;
    let cfg = app.executor().config().await;
    let mut subscription = app.events().subscribe(AuthenticatedUser::guest(&cfg)).await;

    let entry = run_and_wait(app.executor(), "tickle", &[("person", "Fred")]).await;

    assert_eq!(entry.exit_code, 0);
    assert_eq!(entry.output, "Tickling Fred\n");
    assert!(entry.execution_started);
    assert!(!entry.blocked);

    let mut events = Vec::new();
    while let Ok(event) = subscription.rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(Event::ExecutionStarted { .. })));

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            Event::OutputChunk { output, .. } => Some(output.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Tickling Fred\n");

    match events.last() {
        Some(Event::ExecutionFinished { log_entry }) => {
            assert_eq!(log_entry.exit_code, 0);
            assert_eq!(log_entry.output, "Tickling Fred\n");
            assert!(log_entry.execution_finished);
        }
        other => panic!("expected ExecutionFinished last, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_argument_is_not_executed() {
    let (_dir, app) = app_from_yaml(TICKLE).await;

    let entry = run_and_wait(app.executor(), "tickle", &[("person", "Fred!")]).await;

    assert_eq!(entry.exit_code, DEFAULT_EXIT_CODE_NOT_EXECUTED);
    assert!(entry.output.contains("invalid argument person, doesn't match ascii"));
    assert!(!entry.execution_started);
    assert!(entry.execution_finished);
}

#[tokio::test]
async fn test_timeout_kills_the_process() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Sleepy
    id: sleepy
    shell: sleep 10
    timeout: 3
"#,
    )
    .await;

    let began = Instant::now();
    let entry = run_and_wait(app.executor(), "sleepy", &[]).await;

    assert!(began.elapsed() < Duration::from_secs(8));
    assert!(entry.timed_out);
    assert!(entry.output.contains("timed out after 3 seconds"));
}

#[tokio::test]
async fn test_concurrency_limit_blocks_second_start() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Slow
    id: slow
    shell: sleep 1
    maxConcurrent: 1
"#,
    )
    .await;
    let executor = app.executor();

    let first = start(executor, "slow", &[]).await;
    let second = start(executor, "slow", &[]).await;

    let second = wait_for_entry(executor, &second).await;
    assert!(second.blocked);
    assert_eq!(second.output, "Blocked from executing due to concurrency limit");

    let first = wait_for_entry(executor, &first).await;
    assert!(!first.blocked);
    assert_eq!(first.exit_code, 0);
}

#[tokio::test]
async fn test_rate_limit_blocks_third_start() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Limited
    id: limited
    shell: "true"
    maxRate:
      - limit: 2
        duration: 1m
"#,
    )
    .await;
    let executor = app.executor();

    let first = run_and_wait(executor, "limited", &[]).await;
    let second = run_and_wait(executor, "limited", &[]).await;
    let third = run_and_wait(executor, "limited", &[]).await;

    assert!(!first.blocked);
    assert!(!second.blocked);
    assert!(third.blocked);
    assert_eq!(third.output, "Blocked from executing due to rate limit");

    let binding = executor.find_binding_by_id("limited").await.unwrap();
    assert!(executor.get_time_until_available(&binding).await > 0);
}

#[tokio::test]
async fn test_unrepresentable_rate_window_does_not_block() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Forever limited
    id: forever-limited
    shell: "true"
    maxRate:
      - limit: 1
        duration: 99999999999999999999h
"#,
    )
    .await;
    let executor = app.executor();

    let first = run_and_wait(executor, "forever-limited", &[]).await;
    let second = run_and_wait(executor, "forever-limited", &[]).await;

    for entry in [&first, &second] {
        assert!(entry.execution_finished);
        assert!(!entry.blocked);
        assert_eq!(entry.exit_code, 0);
    }

    let binding = executor.find_binding_by_id("forever-limited").await.unwrap();
    assert_eq!(executor.get_time_until_available(&binding).await, 0);
}

#[tokio::test]
async fn test_acl_gate_blocks_without_exec_permission() {
    let (_dir, app) = app_from_yaml(
        r#"
defaultPermissions:
  view: true
  exec: false
actions:
  - title: Reboot
    id: reboot
    shell: echo rebooting
"#,
    )
    .await;

    let entry = run_and_wait(app.executor(), "reboot", &[]).await;

    assert!(entry.blocked);
    assert!(!entry.execution_started);
    assert_eq!(entry.output, "ACL check failed. Blocked from executing.");
    assert_eq!(entry.exit_code, DEFAULT_EXIT_CODE_NOT_EXECUTED);
}

#[tokio::test]
async fn test_shell_after_completed_sees_output_and_exit_code() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Report
    id: report
    shell: echo hello
    shellAfterCompleted: "echo after {{ exitCode }} {{ output }}"
"#,
    )
    .await;

    let entry = run_and_wait(app.executor(), "report", &[]).await;

    let expected = [
        "hello\n",
        "\n",
        "OliveTin::shellAfterCompleted stdout\n",
        "after 0 hello\n",
        "OliveTin::shellAfterCompleted stderr\n",
        "OliveTin::shellAfterCompleted errors and summary\n",
        "Your shellAfterCompleted exited with code 0\n",
        "OliveTin::shellAfterCompleted output complete\n",
    ]
    .concat();

    assert_eq!(entry.exit_code, 0);
    assert_eq!(entry.output, expected);
}

#[tokio::test]
async fn test_self_trigger_stops_at_max_depth() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Again
    id: again
    shell: echo again
    triggers: [again]
"#,
    )
    .await;
    let executor = app.executor();

    run_and_wait(executor, "again", &[]).await;

    let expected_runs = MAX_TRIGGER_DEPTH as usize + 1;
    let mut entries = Vec::new();
    for _ in 0..200 {
        entries.clear();
        for handle in executor.logs().by_binding("again").await {
            entries.push(handle.read().await.clone());
        }
        if entries.len() >= expected_runs && entries.iter().all(|e| e.execution_finished) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Nothing is started beyond the cap, even after a grace period.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executor.logs().by_binding("again").await.len(), expected_runs);

    let mut depths: Vec<u32> = entries.iter().map(|e| e.trigger_depth).collect();
    depths.sort_unstable();
    assert_eq!(depths, (0..=MAX_TRIGGER_DEPTH).collect::<Vec<_>>());

    let notice = "OliveTin::trigger - this action reached maximum trigger depth of 10";
    for entry in &entries {
        assert_eq!(
            entry.output.contains(notice),
            entry.trigger_depth == MAX_TRIGGER_DEPTH,
            "depth {} output {:?}",
            entry.trigger_depth,
            entry.output
        );
    }
}

#[tokio::test]
async fn test_trigger_chain_runs_child_with_depth_one() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Parent
    id: parent
    shell: echo parent
    triggers: [child]
  - title: Child
    id: child
    shell: echo child
"#,
    )
    .await;
    let executor = app.executor();

    let parent = run_and_wait(executor, "parent", &[]).await;
    assert_eq!(parent.exit_code, 0);

    let children = executor.logs().by_binding("child").await;
    assert_eq!(children.len(), 1);

    let child_id = children[0].read().await.execution_tracking_id.clone();
    let child = wait_for_entry(executor, &child_id).await;

    assert_eq!(child.tags, vec!["trigger".to_string()]);
    assert_eq!(child.trigger_depth, 1);
    assert_eq!(child.output, "child\n");
    assert_eq!(executor.logs().len().await, 2);
}

#[tokio::test]
async fn test_logs_are_paged_newest_first() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Quick
    id: quick
    shell: "true"
"#,
    )
    .await;
    let executor = app.executor();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(run_and_wait(executor, "quick", &[]).await.execution_tracking_id);
    }

    let cfg = executor.config().await;
    let guest = AuthenticatedUser::guest(&cfg);

    let mut seen = Vec::new();
    let mut offset = 0;
    loop {
        let (page, paging) = executor.get_log_tracking_ids_acl(&guest, offset, 2, "").await;
        assert_eq!(paging.total_count, 5);
        seen.extend(page.into_iter().map(|e| (e.index, e.execution_tracking_id)));

        match paging.next_offset() {
            Some(next) => offset = next as i64,
            None => break,
        }
    }

    let expected: Vec<(usize, String)> = ids.into_iter().enumerate().rev().collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_kill_stops_running_process() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Forever
    id: forever
    shell: sleep 30
    timeout: 60
"#,
    )
    .await;
    let executor = app.executor();
    let cfg = executor.config().await;
    let guest = AuthenticatedUser::guest(&cfg);

    let tracking_id = start(executor, "forever", &[]).await;

    let handle = executor.logs().get(&tracking_id).await.unwrap();
    for _ in 0..100 {
        if handle.read().await.pid.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let began = Instant::now();
    let result = executor.kill(&tracking_id, &guest).await;
    assert!(result.found);
    assert!(result.killed);

    let entry = wait_for_entry(executor, &tracking_id).await;
    assert!(began.elapsed() < Duration::from_secs(10));
    assert!(!entry.timed_out);
    assert_ne!(entry.exit_code, 0);

    let again = executor.kill(&tracking_id, &guest).await;
    assert!(again.found);
    assert!(!again.killed);
    assert!(again.already_completed);

    let missing = executor.kill("no-such-id", &guest).await;
    assert!(!missing.found);
}

#[tokio::test]
async fn test_startup_actions_run_once_with_tag() {
    let (_dir, app) = app_from_yaml(
        r#"
actions:
  - title: Warm up
    id: warmup
    shell: echo warm
    execOnStartup: true
  - title: Idle
    id: idle
    shell: echo idle
"#,
    )
    .await;

    let handles = olivetin_core::triggers::startup::execute(app.executor()).await;
    assert_eq!(handles.len(), 1);

    let tracking_id = handles[0].tracking_id.clone();
    let entry = wait_for_entry(app.executor(), &tracking_id).await;

    assert_eq!(entry.output, "warm\n");
    assert_eq!(entry.tags, vec!["startup".to_string()]);
    assert_eq!(entry.username, "startup-user");
    assert_eq!(app.executor().logs().len().await, 1);
}
