//! Process runner tests against real child processes
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use sortie_tasks::{
    ProcessError, ProcessRunner, ShellOutcome, ShellRequest, ShellSignal, TaskRegistry, TaskStatus,
};

fn runner() -> (TaskRegistry, Arc<ProcessRunner>) {
    let registry = TaskRegistry::new();
    let runner = ProcessRunner::new(registry.clone())
        .with_kill_grace(Duration::from_millis(100))
        .with_stdin_settle(Duration::from_millis(200));
    (registry, Arc::new(runner))
}

async fn wait_for_status(registry: &TaskRegistry, id: uuid::Uuid, status: TaskStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if registry.get(id).map(|t| t.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {} never reached {}", id, status);
}

/// Poll until the accumulated stdout contains `needle`
async fn collect_until(runner: &ProcessRunner, id: uuid::Uuid, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut collected = String::new();
    while Instant::now() < deadline {
        collected.push_str(&runner.read_output(id).unwrap().stdout);
        if collected.contains(needle) {
            return collected;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("never saw {:?}, got {:?}", needle, collected);
}

// ========== Sync/Async Race Tests ==========

#[tokio::test]
async fn test_fast_command_returns_sync() {
    let (registry, runner) = runner();

    let outcome = runner
        .start(ShellRequest::new("echo hello", Duration::from_millis(500)))
        .await;

    match outcome {
        ShellOutcome::Sync {
            stdout,
            exit_code,
            error,
            ..
        } => {
            assert_eq!(stdout, "hello\n");
            assert_eq!(exit_code, Some(0));
            assert!(error.is_none());
        }
        other => panic!("expected sync outcome, got {:?}", other),
    }

    let tasks = registry.get_tasks(None);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert!(tasks[0].end_time.is_some());
}

#[tokio::test]
async fn test_nonzero_exit_marks_error() {
    let (registry, runner) = runner();

    let outcome = runner
        .start(ShellRequest::new("echo oops >&2; exit 3", Duration::from_secs(2)))
        .await;

    match outcome {
        ShellOutcome::Sync {
            stderr, exit_code, ..
        } => {
            assert_eq!(stderr, "oops\n");
            assert_eq!(exit_code, Some(3));
        }
        other => panic!("expected sync outcome, got {:?}", other),
    }

    let task = &registry.get_tasks(None)[0];
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.metadata["exit_code"], 3);
}

#[tokio::test]
async fn test_zero_timeout_forces_async() {
    let (registry, runner) = runner();

    let outcome = runner
        .start(ShellRequest::new("echo hi", Duration::ZERO))
        .await;

    let ShellOutcome::Async {
        task_id,
        stdout: mut output,
        ..
    } = outcome
    else {
        panic!("expected async outcome");
    };
    assert!(registry.get(task_id).is_some());

    if !output.contains("hi") {
        output.push_str(&collect_until(&runner, task_id, "hi").await);
    }
    assert_eq!(output, "hi\n");
    wait_for_status(&registry, task_id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_slow_command_goes_background() {
    let (registry, runner) = runner();

    let outcome = runner
        .start(ShellRequest::new("sleep 30", Duration::from_millis(100)))
        .await;

    let ShellOutcome::Async { task_id, .. } = outcome else {
        panic!("expected async outcome");
    };
    assert_eq!(registry.get(task_id).unwrap().status, TaskStatus::Running);
    assert!(runner.tracked().contains(&task_id));

    runner.send_signal(task_id, ShellSignal::Kill).unwrap();
    assert_eq!(registry.get(task_id).unwrap().status, TaskStatus::Terminated);
}

#[tokio::test]
async fn test_initial_stdin_passes_through_unescaped() {
    let (_registry, runner) = runner();
    let input = "it's \"quoted\" $HOME `whoami`\nline two\n";

    let outcome = runner
        .start(ShellRequest::new("cat", Duration::from_secs(2)).with_stdin(input))
        .await;

    match outcome {
        ShellOutcome::Sync {
            stdout, exit_code, ..
        } => {
            assert_eq!(stdout, input);
            assert_eq!(exit_code, Some(0));
        }
        other => panic!("expected sync outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spawn_in_missing_directory_fails_sync() {
    let (registry, runner) = runner();

    let outcome = runner
        .start(
            ShellRequest::new("echo never", Duration::from_secs(1))
                .in_dir("/definitely/not/a/real/dir"),
        )
        .await;

    match outcome {
        ShellOutcome::Sync {
            error, exit_code, ..
        } => {
            assert!(error.unwrap().contains("SPAWN FAILED"));
            assert_eq!(exit_code, None);
        }
        other => panic!("expected sync outcome, got {:?}", other),
    }
    assert_eq!(registry.get_tasks(None)[0].status, TaskStatus::Error);
}

// ========== Interaction Tests ==========

#[tokio::test]
async fn test_reads_drain_buffer() {
    let (_registry, runner) = runner();

    let outcome = runner
        .start(ShellRequest::new("printf first; sleep 30", Duration::ZERO))
        .await;
    let ShellOutcome::Async { task_id, stdout, .. } = outcome else {
        panic!("expected async outcome");
    };

    let mut seen = stdout;
    if !seen.contains("first") {
        seen.push_str(&collect_until(&runner, task_id, "first").await);
    }
    assert_eq!(seen, "first");

    let second = runner.read_output(task_id).unwrap();
    assert!(second.stdout.is_empty());
    assert!(!second.completed);
    assert_eq!(second.status, Some(TaskStatus::Running));

    runner.send_signal(task_id, ShellSignal::Term).unwrap();
}

#[tokio::test]
async fn test_interactive_input() {
    let (registry, runner) = runner();

    let outcome = runner
        .start(ShellRequest::new(
            "read line; echo \"got $line\"",
            Duration::ZERO,
        ))
        .await;
    let ShellOutcome::Async { task_id, .. } = outcome else {
        panic!("expected async outcome");
    };

    let first = runner.send_input(task_id, "hello\n").await.unwrap();
    let mut seen = first.stdout;
    if !seen.contains("got hello") {
        seen.push_str(&collect_until(&runner, task_id, "got hello").await);
    }
    assert_eq!(seen, "got hello\n");

    wait_for_status(&registry, task_id, TaskStatus::Completed).await;
    let err = runner.send_input(task_id, "again\n").await.unwrap_err();
    assert!(matches!(err, ProcessError::Exited(id) if id == task_id));
}

#[tokio::test]
async fn test_show_stdin_echoes_input() {
    let (_registry, runner) = runner();

    let mut request = ShellRequest::new("read line; sleep 30", Duration::ZERO);
    request.show_stdin = true;
    let ShellOutcome::Async { task_id, .. } = runner.start(request).await else {
        panic!("expected async outcome");
    };

    let output = runner.send_input(task_id, "secret\n").await.unwrap();
    assert!(output.stdout.contains("secret"));

    runner.send_signal(task_id, ShellSignal::Kill).unwrap();
}

#[tokio::test]
async fn test_unknown_task_is_rejected() {
    let (_registry, runner) = runner();
    let id = uuid::Uuid::new_v4();

    assert!(matches!(
        runner.read_output(id),
        Err(ProcessError::UnknownTask(_))
    ));
    assert!(matches!(
        runner.send_signal(id, ShellSignal::Term),
        Err(ProcessError::UnknownTask(_))
    ));
}

// ========== Signal Tests ==========

#[tokio::test]
async fn test_signal_marks_signaled_and_terminated() {
    let (registry, runner) = runner();

    let ShellOutcome::Async { task_id, .. } = runner
        .start(ShellRequest::new("sleep 30", Duration::ZERO))
        .await
    else {
        panic!("expected async outcome");
    };

    runner.send_signal(task_id, ShellSignal::Term).unwrap();
    let task = registry.get(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.metadata["signal"], "SIGTERM");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let output = runner.read_output(task_id).unwrap();
        assert!(output.signaled);
        if output.completed {
            break;
        }
        assert!(Instant::now() < deadline, "process ignored SIGTERM");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // the exit record does not overwrite the signal transition
    assert_eq!(registry.get(task_id).unwrap().metadata["signal"], "SIGTERM");
}

#[tokio::test]
async fn test_non_terminating_signal_keeps_running() {
    let (registry, runner) = runner();

    let ShellOutcome::Async { task_id, .. } = runner
        .start(ShellRequest::new("trap '' USR1; sleep 30", Duration::from_millis(100)))
        .await
    else {
        panic!("expected async outcome");
    };

    runner.send_signal(task_id, ShellSignal::Usr1).unwrap();
    assert_eq!(registry.get(task_id).unwrap().status, TaskStatus::Running);
    assert!(runner.read_output(task_id).unwrap().signaled);

    runner.send_signal(task_id, ShellSignal::Kill).unwrap();
}

// ========== Cleanup Tests ==========

#[tokio::test]
async fn test_cleanup_reclaims_background_shells() {
    let (registry, runner) = runner();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let ShellOutcome::Async { task_id, .. } = runner
            .start(ShellRequest::new("sleep 30", Duration::ZERO))
            .await
        else {
            panic!("expected async outcome");
        };
        ids.push(task_id);
    }

    let report = registry.cleanup().await;
    assert_eq!(report.total(), 3);
    assert_eq!(registry.running_count(), 0);

    for id in ids {
        assert_eq!(registry.get(id).unwrap().status, TaskStatus::Terminated);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !runner.read_output(id).unwrap().completed {
            assert!(Instant::now() < deadline, "shell survived cleanup");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test]
async fn test_cleanup_escalates_to_sigkill() {
    let (registry, runner) = runner();

    let ShellOutcome::Async { task_id, .. } = runner
        .start(ShellRequest::new("trap '' TERM; sleep 30", Duration::from_millis(150)))
        .await
    else {
        panic!("expected async outcome");
    };

    let started = Instant::now();
    registry.cleanup().await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !runner.read_output(task_id).unwrap().completed {
        assert!(Instant::now() < deadline, "SIGTERM-immune shell survived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(registry.get(task_id).unwrap().status, TaskStatus::Terminated);
}

#[tokio::test]
async fn test_force_kill_all() {
    let (registry, runner) = runner();

    let ShellOutcome::Async { task_id, .. } = runner
        .start(ShellRequest::new("sleep 30", Duration::ZERO))
        .await
    else {
        panic!("expected async outcome");
    };

    registry.force_kill_all();
    wait_for_status(&registry, task_id, TaskStatus::Terminated).await;
}

#[tokio::test]
async fn test_cleanup_reclaims_shell_that_survived_sigint() {
    let (registry, runner) = runner();

    let ShellOutcome::Async { task_id, .. } = runner
        .start(ShellRequest::new(
            "trap 'echo got-int' INT; echo ready; while true; do sleep 0.1; done",
            Duration::ZERO,
        ))
        .await
    else {
        panic!("expected async outcome");
    };
    collect_until(&runner, task_id, "ready").await;

    runner.send_signal(task_id, ShellSignal::Int).unwrap();
    assert_eq!(registry.get(task_id).unwrap().status, TaskStatus::Terminated);
    collect_until(&runner, task_id, "got-int").await;
    assert!(!runner.read_output(task_id).unwrap().completed);

    let report = registry.cleanup().await;
    assert_eq!(report.terminated, 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !runner.read_output(task_id).unwrap().completed {
        assert!(Instant::now() < deadline, "shell outlived cleanup");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let task = registry.get(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.metadata["signal"], "SIGINT");
}

#[tokio::test]
async fn test_force_kill_all_reaches_shell_that_survived_sigint() {
    let (_registry, runner) = runner();

    let ShellOutcome::Async { task_id, .. } = runner
        .start(ShellRequest::new(
            "trap '' INT; echo ready; while true; do sleep 0.1; done",
            Duration::ZERO,
        ))
        .await
    else {
        panic!("expected async outcome");
    };
    collect_until(&runner, task_id, "ready").await;
    runner.send_signal(task_id, ShellSignal::Int).unwrap();

    runner.registry().force_kill_all();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !runner.read_output(task_id).unwrap().completed {
        assert!(Instant::now() < deadline, "shell outlived force kill");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ========== Tracking Tests ==========

#[tokio::test]
async fn test_exited_and_drained_processes_are_pruned() {
    let registry = TaskRegistry::new();
    let runner = ProcessRunner::new(registry.clone()).with_max_tracked(1);

    let ShellOutcome::Async { task_id: first, .. } = runner
        .start(ShellRequest::new("echo done", Duration::ZERO))
        .await
    else {
        panic!("expected async outcome");
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while !runner.read_output(first).unwrap().completed {
        assert!(Instant::now() < deadline, "echo never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_for_status(&registry, first, TaskStatus::Completed).await;
    // let the waiter publish the exit after recording it
    tokio::time::sleep(Duration::from_millis(100)).await;
    runner.read_output(first).unwrap();

    let ShellOutcome::Async { task_id: second, .. } = runner
        .start(ShellRequest::new("sleep 30", Duration::ZERO))
        .await
    else {
        panic!("expected async outcome");
    };

    assert_eq!(runner.tracked(), vec![second]);
    assert!(matches!(
        runner.read_output(first),
        Err(ProcessError::UnknownTask(id)) if id == first
    ));
    // the record itself outlives the runner's handle
    assert_eq!(registry.get(first).unwrap().status, TaskStatus::Completed);

    registry.cleanup().await;
}
