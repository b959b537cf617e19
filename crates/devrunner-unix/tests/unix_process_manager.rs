#![cfg(unix)]

use devrunner_core::{
    LaunchMode, LaunchSpec, PortBinding, ProcessError, ProcessId, ProcessLauncher,
    ProcessManager, ProcessTermination, TerminationResult,
};
use devrunner_unix::UnixProcessManager;
use std::collections::HashMap;
use std::time::Duration;

fn shell(script: &str, mode: LaunchMode) -> LaunchSpec {
    LaunchSpec {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        working_directory: None,
        env: HashMap::new(),
        mode,
    }
}

async fn wait_for_exit(manager: &UnixProcessManager, pid: ProcessId, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !manager.is_alive(pid).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !manager.is_alive(pid).await
}

#[tokio::test]
async fn test_launch_and_terminate_gracefully() {
    let manager = UnixProcessManager::new();
    let pid = manager
        .launch(&shell("sleep 30", LaunchMode::Attached), None)
        .await
        .unwrap();
    assert!(manager.is_alive(pid).await);

    assert_eq!(manager.terminate_gracefully(pid).await, TerminationResult::Success);
    assert!(wait_for_exit(&manager, pid, Duration::from_secs(5)).await);
    assert_eq!(
        manager.terminate_gracefully(pid).await,
        TerminationResult::ProcessNotFound
    );
}

#[tokio::test]
async fn test_force_kill_stops_process_ignoring_sigterm() {
    let manager = UnixProcessManager::new();
    let pid = manager
        .launch(
            &shell(
                "trap '' TERM; while true; do sleep 0.1; done",
                LaunchMode::Attached,
            ),
            None,
        )
        .await
        .unwrap();
    // Let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.terminate_gracefully(pid).await, TerminationResult::Success);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.is_alive(pid).await);

    assert!(manager.force_kill(pid).await.is_delivered());
    assert!(wait_for_exit(&manager, pid, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_output_lands_in_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.log");
    let file = std::fs::File::create(&path).unwrap();

    let manager = UnixProcessManager::new();
    let pid = manager
        .launch(
            &shell("echo listening; echo boom >&2", LaunchMode::Attached),
            Some(file),
        )
        .await
        .unwrap();
    assert!(wait_for_exit(&manager, pid, Duration::from_secs(5)).await);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("listening"));
    assert!(contents.contains("boom"));
}

#[tokio::test]
async fn test_env_and_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("env.log");
    let mut spec = shell("echo \"$GREETING\"; pwd", LaunchMode::Attached);
    spec.env.insert("GREETING".to_string(), "hello".to_string());
    spec.working_directory = Some(dir.path().to_path_buf());

    let manager = UnixProcessManager::new();
    let pid = manager
        .launch(&spec, Some(std::fs::File::create(&log).unwrap()))
        .await
        .unwrap();
    assert!(wait_for_exit(&manager, pid, Duration::from_secs(5)).await);

    let contents = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines[0], "hello");
    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(std::path::Path::new(lines[1]).canonicalize().unwrap(), expected);
}

#[tokio::test]
async fn test_detached_launch_gets_own_session() {
    let manager = UnixProcessManager::new();
    let pid = manager
        .launch(&shell("sleep 30", LaunchMode::Detached), None)
        .await
        .unwrap();

    let raw = nix::unistd::Pid::from_raw(pid.0 as i32);
    assert_eq!(nix::unistd::getsid(Some(raw)).unwrap(), raw);
    assert_ne!(
        nix::unistd::getsid(None).unwrap(),
        raw,
        "child must not share our session"
    );

    manager.force_kill(pid).await;
    assert!(wait_for_exit(&manager, pid, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_spawn_failure() {
    let manager = UnixProcessManager::new();
    let spec = LaunchSpec {
        command: "devrunner-definitely-missing-binary".to_string(),
        args: vec![],
        working_directory: None,
        env: HashMap::new(),
        mode: LaunchMode::Attached,
    };
    let err = manager.launch(&spec, None).await.unwrap_err();
    assert!(matches!(err, ProcessError::SpawnFailed(_)));
}

#[tokio::test]
async fn test_pids_on_port_and_describe() {
    let manager = UnixProcessManager::new();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let binding = PortBinding::new("127.0.0.1", listener.local_addr().unwrap().port());

    let own = ProcessId(std::process::id());
    let pids = manager.pids_on_port(&binding).await.unwrap();
    assert!(pids.contains(&own), "expected {own} in {pids:?}");

    let info = manager.describe(own).await.unwrap();
    assert_eq!(info.pid, own);
    assert!(!info.name.is_empty());
    assert!(!info.command.is_empty(), "no command line for {info}");
    assert!(!info.command_line().is_empty());

    drop(listener);
    let pids = manager.pids_on_port(&binding).await.unwrap();
    assert!(!pids.contains(&own));
}

#[tokio::test]
async fn test_unknown_pid_is_not_alive() {
    let manager = UnixProcessManager::new();
    let pid = manager
        .launch(&shell("exit 0", LaunchMode::Attached), None)
        .await
        .unwrap();
    assert!(wait_for_exit(&manager, pid, Duration::from_secs(5)).await);
    manager.release(pid);
    assert!(!manager.is_alive(pid).await);
}
