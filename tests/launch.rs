//! Launch protocol integration tests.
//!
//! These run the real fork/clone/exec sequence without namespace flags,
//! so they work unprivileged: the task is a plain process and both pid
//! stages carry its host pid.

use portod::error::ErrorKind;
use portod::launcher::start_task;
use portod::task::TaskEnv;

fn base_env(command: &str) -> TaskEnv {
    TaskEnv {
        container: "test".to_string(),
        command: command.to_string(),
        env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
        start_timeout_ms: 30_000,
        ..Default::default()
    }
}

#[test]
fn test_launch_reports_pids_and_success() {
    let pids = start_task(&base_env("/bin/true")).expect("launch should succeed");

    // Without a pid namespace both stages name the same process.
    assert_eq!(pids.wait_pid, pids.task_pid);
    assert_eq!(pids.task_pid, pids.task_vpid);
    assert!(pids.wait_pid.as_raw() > 0);
    assert_ne!(pids.wait_pid.as_raw(), std::process::id() as i32);
}

#[test]
fn test_launch_exec_failure_reaches_supervisor() {
    let err = start_task(&base_env("/does/not/exist-please")).expect_err("exec must fail");
    assert_eq!(err.errno, libc::ENOENT);
    assert!(!err.msg.is_empty());
}

#[test]
fn test_launch_child_setup_failure_reaches_supervisor() {
    let mut env = base_env("/bin/true");
    env.cwd = Some("/definitely/missing/cwd".into());
    let err = start_task(&env).expect_err("chdir must fail");
    assert_eq!(err.errno, libc::ENOENT);
    assert!(err.msg.contains("chdir"));
}

#[test]
fn test_launch_rejects_empty_command() {
    let err = start_task(&base_env("")).expect_err("empty command");
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_launch_expands_environment() {
    let mut env = base_env("$TRUTH");
    env.env
        .push(("TRUTH".to_string(), "/bin/true".to_string()));
    start_task(&env).expect("expanded command should launch");

    let err = start_task(&base_env("$MISSING_BIN")).expect_err("undefined variable");
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}
