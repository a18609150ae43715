//! Execution integration tests.
//!
//! Runs real subprocesses through the coordinator, using `sh` as both the
//! interpreter and a stand-in toolchain so the tests need nothing beyond a
//! POSIX shell.
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use uuid::Uuid;
use weave_collab::broadcast::BroadcastGroup;
use weave_collab::config::ExecutionConfig;
use weave_collab::exec::{ExecPhase, ExecutionCoordinator, LanguageSpec, EMPTY_OUTPUT, TRUNCATED_MARKER};
use weave_collab::protocol::{ExecutionRequest, ServerEvent, TerminalEvent, TerminalKind};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec::interpreted("shell", &["sh"], "sh", &["sh", "{file}"]),
        // "Compiles" by copying the source to <entry>.class, then runs it
        LanguageSpec::toolchain(
            "shellc",
            &[],
            "sh",
            r"public\s+class\s+([a-zA-Z0-9_]+)",
            &["sh", "-c", "cp {file} {entry}.class"],
            &["sh", "{dir}/{entry}.class"],
        ),
        LanguageSpec::toolchain(
            "broken",
            &[],
            "sh",
            r"public\s+class\s+([a-zA-Z0-9_]+)",
            &["sh", "-c", "echo 'syntax error on line 1' >&2; exit 1"],
            &["sh", "{entry}.class"],
        ),
        LanguageSpec::toolchain(
            "noisy",
            &[],
            "sh",
            r"public\s+class\s+([a-zA-Z0-9_]+)",
            &["sh", "-c", "echo 'warning: deprecated' >&2"],
            &["sh", "-c", "echo never"],
        ),
    ]
}

fn config(work_dir: &Path) -> ExecutionConfig {
    ExecutionConfig {
        work_dir: work_dir.to_path_buf(),
        max_concurrent: 2,
        max_queued: 2,
        per_room_limit: 0,
        timeout_secs: 5,
        languages: languages(),
        ..ExecutionConfig::default()
    }
}

fn request(language: &str, source: &str) -> ExecutionRequest {
    ExecutionRequest {
        source_code: source.into(),
        language: language.into(),
        file_path: "main.sh".into(),
    }
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

/// Wait until `n` requests are running.
async fn wait_in_flight(exec: &ExecutionCoordinator, n: usize) {
    for _ in 0..200 {
        if exec.stats().in_flight == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached {n} in-flight executions");
}

/// Running and not a zombie.
#[cfg(target_os = "linux")]
fn alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat.rsplit_once(") ").is_some_and(|(_, rest)| rest.starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn wait_until_dead(pid: i32) -> bool {
    for _ in 0..100 {
        if !alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ─── Interpreted ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_interpreted_output_is_trimmed() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("sh", "echo hi\n")).await;
    assert_eq!(report.event, TerminalEvent::output("main.sh", "hi"));
    assert_eq!(
        report.phases,
        vec![ExecPhase::Received, ExecPhase::Evaluating, ExecPhase::Cleanup, ExecPhase::Terminal]
    );
    assert!(!report.work_dir.unwrap().exists());
    assert!(dir_is_empty(root.path()));
}

#[tokio::test]
async fn test_interpreted_empty_output_placeholder() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("shell", "true")).await;
    assert_eq!(report.event.kind, TerminalKind::Output);
    assert_eq!(report.event.content, EMPTY_OUTPUT);
}

#[tokio::test]
async fn test_interpreted_failure_reports_stderr() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("shell", "echo partial; echo boom >&2; exit 2")).await;
    assert_eq!(report.event, TerminalEvent::error("main.sh", "boom"));
    assert!(dir_is_empty(root.path()));
}

#[tokio::test]
async fn test_interpreted_failure_without_stderr_reports_status() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("shell", "exit 3")).await;
    assert_eq!(report.event, TerminalEvent::error("main.sh", "Process exited with status 3"));
}

#[tokio::test]
async fn test_output_is_capped() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&ExecutionConfig {
        max_output_bytes: 32,
        ..config(root.path())
    })
    .unwrap();

    let source = "i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done";
    let report = exec.run("room", request("shell", source)).await;
    assert_eq!(report.event.kind, TerminalKind::Output);
    assert!(report.event.content.ends_with(TRUNCATED_MARKER));
    assert!(report.event.content.len() <= 32 + 1 + TRUNCATED_MARKER.len());
}

// ─── Toolchain ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_toolchain_compiles_and_runs() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let source = "# public class Hello\necho hello\n";
    let report = exec.run("room", request("shellc", source)).await;
    assert_eq!(report.event, TerminalEvent::output("main.sh", "hello\n"));
    assert_eq!(
        report.phases,
        vec![
            ExecPhase::Received,
            ExecPhase::Staging,
            ExecPhase::Compiling,
            ExecPhase::Running,
            ExecPhase::Cleanup,
            ExecPhase::Terminal,
        ]
    );
    assert_eq!(exec.stats().processes_spawned, 2);
    assert!(dir_is_empty(root.path()));
}

#[tokio::test]
async fn test_toolchain_missing_entry_spawns_nothing() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("shellc", "echo no class here")).await;
    assert_eq!(report.event, TerminalEvent::error("main.sh", "Error: No public class found."));
    assert!(report.work_dir.is_none());
    assert_eq!(exec.stats().processes_spawned, 0);
}

#[tokio::test]
async fn test_compile_failure_skips_run_and_cleans_up() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("broken", "# public class Main")).await;
    assert_eq!(report.event.kind, TerminalKind::Error);
    assert_eq!(report.event.content, "syntax error on line 1\n");
    assert!(!report.phases.contains(&ExecPhase::Running));
    assert_eq!(exec.stats().processes_spawned, 1);
    assert!(dir_is_empty(root.path()));
}

#[tokio::test]
async fn test_compiler_stderr_counts_as_failure() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("noisy", "# public class Main")).await;
    assert_eq!(report.event, TerminalEvent::error("main.sh", "warning: deprecated\n"));
}

#[tokio::test]
async fn test_runtime_failure_cleans_up() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();

    let report = exec.run("room", request("shellc", "# public class Boom\nexit 4\n")).await;
    assert_eq!(report.event, TerminalEvent::error("main.sh", "Process exited with status 4"));
    assert!(report.phases.contains(&ExecPhase::Running));
    assert!(dir_is_empty(root.path()));
}

// ─── Bounds ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_kills_and_cleans_up() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&ExecutionConfig {
        timeout_secs: 1,
        ..config(root.path())
    })
    .unwrap();

    let started = std::time::Instant::now();
    let report = exec.run("room", request("shell", "sleep 5")).await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(report.event, TerminalEvent::error("main.sh", "Execution timed out after 1s."));
    assert!(dir_is_empty(root.path()));
    assert_eq!(exec.stats().timed_out, 1);
    assert_eq!(exec.stats().in_flight, 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_background_process_does_not_outlive_request() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&ExecutionConfig {
        timeout_secs: 2,
        ..config(root.path())
    })
    .unwrap();

    let started = std::time::Instant::now();
    let report = exec.run("room", request("shell", "sleep 37 &\necho $!\n")).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.event.kind, TerminalKind::Output, "{}", report.event.content);

    let pid: i32 = report.event.content.parse().unwrap();
    assert!(wait_until_dead(pid).await, "background pid {pid} survived the request");
    assert!(dir_is_empty(root.path()));
}

#[tokio::test]
async fn test_program_cannot_write_outside_its_dir() {
    let root = tempdir().unwrap();
    let exec = ExecutionCoordinator::new(&config(root.path())).unwrap();
    if !exec.sandbox().filesystem_isolated() && exec.sandbox().run_as().is_none() {
        // Neither Landlock nor a user switch is available here
        return;
    }

    let outside = tempdir().unwrap();
    let target = outside.path().join("store-file");
    std::fs::write(&target, "original").unwrap();

    let source = format!("echo clobbered > {}", target.display());
    let report = exec.run("room", request("shell", &source)).await;
    assert_eq!(report.event.kind, TerminalKind::Error);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "original");
}

#[tokio::test]
async fn test_busy_pool_rejects() {
    let root = tempdir().unwrap();
    let exec = Arc::new(
        ExecutionCoordinator::new(&ExecutionConfig {
            max_concurrent: 1,
            max_queued: 0,
            ..config(root.path())
        })
        .unwrap(),
    );

    let slow = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.run("a", request("shell", "sleep 1; echo done")).await })
    };
    wait_in_flight(&exec, 1).await;

    let report = exec.run("b", request("shell", "echo hi")).await;
    assert_eq!(report.event, TerminalEvent::error("main.sh", "Execution rejected: server is busy."));
    assert_eq!(report.phases, vec![ExecPhase::Received, ExecPhase::Terminal]);

    assert_eq!(slow.await.unwrap().event.content, "done");
    let stats = exec.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_per_room_limit() {
    let root = tempdir().unwrap();
    let exec = Arc::new(
        ExecutionCoordinator::new(&ExecutionConfig {
            per_room_limit: 1,
            ..config(root.path())
        })
        .unwrap(),
    );

    let slow = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.run("a", request("shell", "sleep 1")).await })
    };
    wait_in_flight(&exec, 1).await;

    let same_room = exec.run("a", request("shell", "echo hi")).await;
    assert_eq!(
        same_room.event.content,
        "Execution rejected: too many executions in this room."
    );
    let other_room = exec.run("b", request("shell", "echo hi")).await;
    assert_eq!(other_room.event, TerminalEvent::output("main.sh", "hi"));

    slow.await.unwrap();
}

#[tokio::test]
async fn test_queued_request_waits_for_slot() {
    let root = tempdir().unwrap();
    let exec = Arc::new(
        ExecutionCoordinator::new(&ExecutionConfig {
            max_concurrent: 1,
            max_queued: 1,
            ..config(root.path())
        })
        .unwrap(),
    );

    let first = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.run("a", request("shell", "sleep 1; echo first")).await })
    };
    wait_in_flight(&exec, 1).await;

    let second = exec.run("b", request("shell", "echo second")).await;
    assert_eq!(second.event.content, "second");
    assert_eq!(first.await.unwrap().event.content, "first");
    assert_eq!(exec.stats().rejected, 0);
}

// ─── Room broadcast ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_submit_broadcasts_to_whole_room() {
    let root = tempdir().unwrap();
    let exec = Arc::new(ExecutionCoordinator::new(&config(root.path())).unwrap());
    let group = Arc::new(BroadcastGroup::new("room", 16, Vec::new()));
    let requester = Uuid::new_v4();
    let mut requester_sub = group.subscribe(requester);
    let mut other_sub = group.subscribe(Uuid::new_v4());

    exec.submit(group.clone(), request("shell", "echo shared"))
        .await
        .unwrap();

    for sub in [&mut requester_sub, &mut other_sub] {
        let frame = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let event = ServerEvent::decode(&frame).unwrap();
        assert_eq!(event, ServerEvent::TerminalUpdate(TerminalEvent::output("main.sh", "shared")));
    }
}
