#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, ExitStatus},
    thread,
    time::{Duration, Instant},
};

/// Path to the compiled `bootshim` binary.
pub fn bootshim_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("bootshim").to_path_buf()
}

/// Writes `contents` to `dir/name` and returns the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("failed to write file");
    path
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_file_value(path: &Path, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.trim() == expected
        {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for value '{}' in {:?}", expected, path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits for `child` to exit, killing it and panicking after `timeout`.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("failed to poll child") {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("Timed out waiting for bootshim (PID {}) to exit", child.id());
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn is_process_alive(pid: i32) -> bool {
    use nix::{errno::Errno, sys::signal, unistd::Pid};
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Reads a PID written by a test script, waiting for the write to land.
pub fn read_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(raw) = fs::read_to_string(path)
            && let Ok(pid) = raw.trim().parse::<i32>()
        {
            return pid;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for a PID in {:?}", path);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits until `pid` is gone or a zombie. Orphans are reaped by init, so a
/// zombie counts as exited.
#[cfg(target_os = "linux")]
pub fn wait_for_process_exit(pid: i32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let stat_path = PathBuf::from(format!("/proc/{pid}/stat"));

    while Instant::now() < deadline {
        let Ok(stat) = fs::read_to_string(&stat_path) else {
            return;
        };

        // The state is the first field after the parenthesized command name.
        if let Some(end) = stat.rfind(')')
            && let Some(state) = stat[end + 1..].trim().chars().next()
            && (state == 'Z' || state == 'X')
        {
            return;
        }

        thread::sleep(Duration::from_millis(100));
    }

    panic!("Timed out waiting for PID {pid} to exit");
}
