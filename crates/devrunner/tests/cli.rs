use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

fn dev_runner(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dev-runner"))
        .args(args)
        .current_dir(cwd)
        .env_remove("DEV_RUNNER_PORT")
        .env_remove("DEV_RUNNER_GRACE_PERIOD")
        .env_remove("DEV_RUNNER_LOG_DIR")
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run dev-runner")
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_lists_examples() {
    let dir = tempfile::tempdir().unwrap();
    let output = dev_runner(dir.path(), &["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("EXAMPLES"));
}

#[test]
fn test_unknown_command_exits_with_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = dev_runner(dir.path(), &["deploy"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_status_on_free_port() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().to_string();
    let output = dev_runner(dir.path(), &["status", "--host", "127.0.0.1", "--port", &port]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Not running"));
}

#[test]
fn test_status_reports_open_port() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let output = dev_runner(dir.path(), &["status", "--host", "127.0.0.1", "--port", &port]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Running"));
}

#[test]
fn test_logs_without_sessions_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let output = dev_runner(dir.path(), &["logs"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("No log files found"));
}

#[test]
fn test_logs_prints_tail_of_latest_session() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    std::fs::write(logs.join("dev-runner-20260101-120000.log"), "a\nb\nc\n").unwrap();

    let output = dev_runner(dir.path(), &["logs", "2", "--log-dir", "logs"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let lines: Vec<String> = stdout(&output).lines().map(String::from).collect();
    assert_eq!(lines, vec!["b", "c"]);
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = dev_runner(dir.path(), &["--config", "missing.json", "status"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("missing.json"));
}

#[test]
fn test_start_refuses_occupied_port() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let output = dev_runner(
        dir.path(),
        &["start", "--no-browser", "--host", "127.0.0.1", "--port", &port],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("already in use"));
    // No session was opened
    assert!(!std::fs::read_dir(dir.path())
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().starts_with("dev-runner-")));
}

#[test]
fn test_fatal_error_prints_latest_session_tail() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    std::fs::write(
        logs.join("dev-runner-20260101-120000.log"),
        "booting\nlistening on 5000\n",
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let output = dev_runner(
        dir.path(),
        &[
            "start",
            "--no-browser",
            "--host",
            "127.0.0.1",
            "--port",
            &port,
            "--log-dir",
            "logs",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("already in use"), "{err}");
    assert!(err.contains("Last log lines:"), "{err}");
    assert!(err.contains("listening on 5000"), "{err}");
}

#[test]
fn test_clean_removes_configured_paths() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dist/nested")).unwrap();
    std::fs::write(
        dir.path().join("dev-runner.json"),
        r#"{ "cleanPaths": ["dist", "not-there"] }"#,
    )
    .unwrap();

    let output = dev_runner(dir.path(), &["clean"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(!dir.path().join("dist").exists());
    assert!(stdout(&output).contains("Removed"));
}

#[test]
fn test_build_reports_timing() {
    let dir = tempfile::tempdir().unwrap();
    let exe = env!("CARGO_BIN_EXE_dev-runner").replace('\\', "\\\\");
    std::fs::write(
        dir.path().join("dev-runner.json"),
        format!(r#"{{ "buildCommand": ["{exe}", "--version"] }}"#),
    )
    .unwrap();

    let output = dev_runner(dir.path(), &["build", "--time"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Build completed in"));
}

#[cfg(unix)]
#[test]
fn test_readiness_timeout_is_reported_with_hint() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    std::fs::write(
        dir.path().join("dev-runner.json"),
        format!(
            r#"{{
                "command": "sleep",
                "args": ["3"],
                "host": "127.0.0.1",
                "port": {port},
                "readiness": {{ "maxAttempts": 2, "intervalMs": 50 }}
            }}"#
        ),
    )
    .unwrap();

    let output = dev_runner(dir.path(), &["start", "--no-browser"]);
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("did not open"), "{err}");
    assert!(err.contains("may still come up"), "{err}");
}

#[cfg(unix)]
#[test]
fn test_start_status_stop_real_server() {
    if Command::new("python3").arg("--version").output().is_err() {
        eprintln!("python3 not available, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    std::fs::write(
        dir.path().join("dev-runner.json"),
        format!(
            r#"{{
                "command": "python3",
                "args": ["-m", "http.server", "{port}", "--bind", "127.0.0.1"],
                "host": "127.0.0.1",
                "port": {port},
                "urlScheme": "http",
                "readiness": {{ "maxAttempts": 100, "intervalMs": 100 }}
            }}"#
        ),
    )
    .unwrap();

    let output = dev_runner(dir.path(), &["start", "--no-browser"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains(&format!("http://127.0.0.1:{port}")));

    // Detached: still serving after the CLI exited
    assert!(TcpStream::connect(("127.0.0.1", port)).is_ok());

    let output = dev_runner(dir.path(), &["status"]);
    assert!(stdout(&output).contains("Running"));

    let output = dev_runner(dir.path(), &["stop"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Stopped"));

    std::thread::sleep(Duration::from_millis(100));
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}
