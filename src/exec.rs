//! External command execution
//!
//! Every OS tool the updater touches (`systemctl`, `update-grub`,
//! `update-initramfs`, `apt`, `tar`, `lsof`, ...) goes through the
//! `CommandRunner` trait so registrars stay testable and `--dry-run` can
//! swap in a runner that only records.
//!
//! # Process Groups
//!
//! Blocking tool invocations run in their own process group with a parent
//! death signal, so an interrupted update does not leave `update-initramfs`
//! or `apt` running on its own. Long-lived daemons started through
//! `spawn_detached` are deliberately *not* tied to our lifetime.

use anyhow::{Context, Result};
use nix::libc;
use nix::unistd::Pid;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    /// Whether the command exited with status 0
    pub success: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output with exit code 1 and the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(1),
            success: false,
        }
    }

    /// Return an error carrying the exit code and stderr if the command failed
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            let detail = if self.stderr.trim().is_empty() {
                self.stdout.trim()
            } else {
                self.stderr.trim()
            };
            anyhow::bail!("{} failed (exit code {}): {}", context, code, detail)
        }
    }
}

/// Capability to run external programs.
pub trait CommandRunner {
    /// Run `program` with `args` to completion, capturing stdout and stderr.
    ///
    /// A non-zero exit status is reported through `CommandOutput::success`,
    /// not as an `Err`. `Err` means the program could not be run at all.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Start `program` in the background and return its PID.
    fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<u32>;

    /// Run a command and fail unless it exits successfully.
    fn check(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(program, args)?;
        output.ensure_success(&command_line(program, args))?;
        Ok(output)
    }
}

/// Runner handle shared between the registrars and the actions they build
pub type SharedRunner = Arc<dyn CommandRunner + Send + Sync>;

/// Render a command line for logs and error messages
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("exec: {}", command_line(program, args));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .output()
            .with_context(|| format!("Failed to execute {}", program))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        })
    }

    fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<u32> {
        use std::os::unix::process::CommandExt;

        info!("spawn: {}", command_line(program, args));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        Ok(child.id())
    }
}

/// Records commands instead of running them.
///
/// Backs `--dry-run`, and lets tests script the output of specific
/// commands. Unscripted commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    /// Create a runner with no scripted responses
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command line starting with `prefix` with `output`.
    ///
    /// Later scripts take precedence over earlier ones.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.to_string(), output));
    }

    /// Make every command line starting with `prefix` fail with `stderr`
    pub fn fail_on(&self, prefix: &str, stderr: &str) {
        self.respond(prefix, CommandOutput::failed(stderr));
    }

    /// Command lines seen so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, line: String) -> CommandOutput {
        let output = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok(""));

        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
        output
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        info!("[dry-run] {}", line);
        Ok(self.record(line))
    }

    fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<u32> {
        let line = command_line(program, args);
        info!("[dry-run] spawn {}", line);
        self.record(line).ensure_success("spawn")?;
        Ok(0)
    }
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group and to receive
    /// SIGTERM if the updater dies
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the hook only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
