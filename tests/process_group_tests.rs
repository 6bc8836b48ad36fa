//! Integration tests for subprocess isolation
//!
//! These tests verify that:
//! 1. Tools run through SystemRunner get their own process group
//! 2. A group signal takes down a command spawned with in_new_process_group()
//! 3. Detached daemons are started as group leaders

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use mimo_update::exec::{CommandProcessGroup, CommandRunner, SystemRunner};

/// Helper: (pid, pgrp) from a /proc/<pid>/stat line
fn pid_and_group(stat: &str) -> (i32, i32) {
    // The command name is parenthesised and may contain spaces
    let after_comm = &stat[stat.rfind(')').unwrap() + 2..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let pid = stat.split_whitespace().next().unwrap().parse().unwrap();
    // fields: state ppid pgrp ...
    (pid, fields[2].parse().unwrap())
}

/// Helper: Check if a process is alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            let state = stat[stat.rfind(')').unwrap() + 2..].chars().next();
            !matches!(state, Some('Z') | Some('X'))
        }
        Err(_) => false,
    }
}

fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_system_runner_isolates_process_group() {
    let out = SystemRunner
        .run("sh", &["-c", "cat /proc/$$/stat"])
        .unwrap();
    assert!(out.success, "stderr: {}", out.stderr);

    let (pid, pgrp) = pid_and_group(out.stdout.trim());
    assert_eq!(pid, pgrp, "child should lead its own process group");
    assert_ne!(pgrp, nix::unistd::getpgrp().as_raw());
}

#[test]
fn test_group_signal_kills_command() {
    let mut child = Command::new("sleep")
        .arg("1000")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .in_new_process_group()
        .spawn()
        .unwrap();
    let pid = child.id();

    kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL).unwrap();
    let _ = child.wait();

    assert!(wait_for_process_death(pid, Duration::from_secs(5)));
}

#[test]
fn test_spawn_detached_starts_group_leader() {
    let pid = SystemRunner.spawn_detached("sleep", &["1000"]).unwrap();

    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
    let (_, pgrp) = pid_and_group(&stat);
    assert_eq!(pgrp, pid as i32);

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    assert!(wait_for_process_death(pid, Duration::from_secs(5)));
}
