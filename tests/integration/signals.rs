#[path = "common/mod.rs"]
mod common;

use std::{
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{Child, Command, Stdio},
    time::Duration,
};

use bootshim::constants::EXIT_SIGNALED;
use common::{
    bootshim_bin, is_process_alive, read_pid, wait_for_file_value, wait_for_process_exit,
    wait_with_timeout, write_file,
};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tempfile::tempdir;

/// Starts `bootshim run` with `script` as the daemon and waits until it
/// has written its PID to `dir/daemon.pid`. Scripts that start workers write
/// their PIDs next to it.
fn start_daemon(dir: &Path, extra: &[&str], script: &str) -> (Child, i32) {
    let template = write_file(dir, "app.tpl", "listen ${PORT:-80};");
    let pid_path = dir.join("daemon.pid");

    let mut cmd = Command::new(bootshim_bin());
    cmd.arg("run")
        .arg("-t")
        .arg(format!("{}:{}", template.display(), dir.join("app.conf").display()))
        .args(extra)
        .arg("--")
        .arg("sh")
        .arg("-c")
        .arg(format!("echo $$ > {}; {script}", pid_path.display()))
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let child = cmd.spawn().expect("failed to start bootshim");
    (child, read_pid(&pid_path))
}

#[test]
fn forwards_sigterm_and_propagates_exit_status() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let got = dir.join("got");

    let (mut bootshim, daemon_pid) = start_daemon(
        dir,
        &[],
        &format!(
            "trap 'echo TERM > {}; exit 42' TERM; while :; do sleep 0.1; done",
            got.display()
        ),
    );

    signal::kill(Pid::from_raw(bootshim.id() as i32), Signal::SIGTERM).unwrap();

    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.code(), Some(42));
    wait_for_file_value(&got, "TERM");
    assert!(!is_process_alive(daemon_pid));
}

#[test]
fn forwards_sigint_while_running() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let got = dir.join("got");

    let (mut bootshim, _) = start_daemon(
        dir,
        &[],
        &format!(
            "trap 'echo INT > {}; exit 0' INT; while :; do sleep 0.1; done",
            got.display()
        ),
    );

    signal::kill(Pid::from_raw(bootshim.id() as i32), Signal::SIGINT).unwrap();

    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
    wait_for_file_value(&got, "INT");
}

#[test]
fn non_termination_signals_do_not_stop_supervision() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let got = dir.join("got");

    let (mut bootshim, _) = start_daemon(
        dir,
        &[],
        &format!(
            "trap 'echo HUP > {}' HUP; trap 'exit 3' TERM; while :; do sleep 0.1; done",
            got.display()
        ),
    );

    let supervisor = Pid::from_raw(bootshim.id() as i32);
    signal::kill(supervisor, Signal::SIGHUP).unwrap();
    wait_for_file_value(&got, "HUP");
    assert!(bootshim.try_wait().unwrap().is_none());

    signal::kill(supervisor, Signal::SIGTERM).unwrap();
    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.code(), Some(3));
}

#[test]
fn kill_after_escalates_to_sigkill() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    let (mut bootshim, daemon_pid) = start_daemon(
        dir,
        &["--kill-after", "1s"],
        "trap '' TERM; while :; do sleep 0.1; done",
    );

    signal::kill(Pid::from_raw(bootshim.id() as i32), Signal::SIGTERM).unwrap();

    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.code(), Some(EXIT_SIGNALED));
    assert!(!is_process_alive(daemon_pid));
}

#[test]
fn forwarded_signal_reaches_daemon_workers() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let worker_got = dir.join("worker.got");
    let worker_pid_path = dir.join("worker.pid");

    let (mut bootshim, _) = start_daemon(
        dir,
        &[],
        &format!(
            "trap 'exit 0' TERM; \
             sh -c \"trap 'echo TERM > {}; exit 0' TERM; echo \\$\\$ > {}; \
             while :; do sleep 0.1; done\" & wait",
            worker_got.display(),
            worker_pid_path.display()
        ),
    );
    let worker = read_pid(&worker_pid_path);
    assert!(is_process_alive(worker));

    signal::kill(Pid::from_raw(bootshim.id() as i32), Signal::SIGTERM).unwrap();

    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
    wait_for_file_value(&worker_got, "TERM");
    wait_for_process_exit(worker);
}

#[test]
fn kill_after_takes_down_daemon_workers() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let worker_pid_path = dir.join("worker.pid");

    let (mut bootshim, daemon_pid) = start_daemon(
        dir,
        &["--kill-after", "1s"],
        &format!(
            "trap '' TERM; sh -c \"trap '' TERM; while :; do sleep 0.1; done\" & \
             echo $! > {}; while :; do sleep 0.1; done",
            worker_pid_path.display()
        ),
    );
    let worker = read_pid(&worker_pid_path);

    signal::kill(Pid::from_raw(bootshim.id() as i32), Signal::SIGTERM).unwrap();

    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.code(), Some(EXIT_SIGNALED));
    assert!(!is_process_alive(daemon_pid));
    wait_for_process_exit(worker);
}

#[test]
fn propagate_signal_reraises_daemon_signal() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    let (mut bootshim, _) = start_daemon(
        dir,
        &["--propagate-signal"],
        "while :; do sleep 0.1; done",
    );

    // sh has no TERM trap here, so the forwarded signal kills it.
    signal::kill(Pid::from_raw(bootshim.id() as i32), Signal::SIGTERM).unwrap();

    let status = wait_with_timeout(&mut bootshim, Duration::from_secs(10));
    assert_eq!(status.signal(), Some(libc::SIGTERM));
}
