//! Running SPDK target control for target updates
//!
//! Before the target's binaries are replaced, its live configuration is saved
//! through `rpc.py save_config` and the process is killed. After the copy
//! (or its rollback) the target is relaunched from the installed tree with the
//! saved configuration and the rest of its original arguments.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::exec::CommandRunner;
use crate::paths::SystemPaths;

/// A target that was stopped and how it was launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedTarget {
    pub pid: u32,
    /// Full original command line as reported by `ps`
    pub command: String,
}

/// Stops and restarts the SPDK target
pub struct SpdkControl<'a> {
    runner: &'a dyn CommandRunner,
    mimo_root: &'a Path,
    paths: &'a SystemPaths,
}

impl<'a> SpdkControl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, mimo_root: &'a Path, paths: &'a SystemPaths) -> Self {
        Self {
            runner,
            mimo_root,
            paths,
        }
    }

    /// Whether the target's RPC socket exists
    pub fn socket_present(&self) -> bool {
        self.paths.spdk_socket.exists()
    }

    fn rpc_script(&self) -> PathBuf {
        self.mimo_root.join("scripts").join("rpc.py")
    }

    fn target_binary(&self) -> PathBuf {
        self.mimo_root.join("build").join("bin").join("spdk_tgt")
    }

    /// PID of the process holding the RPC socket
    pub fn find_pid(&self) -> Result<u32> {
        let socket = self.paths.spdk_socket.to_string_lossy();
        let output = self
            .runner
            .check("lsof", &["-t", &socket])
            .context("Failed to check MIMO socket")?;
        parse_pid(&output.stdout)
    }

    /// Save the running configuration, then kill the target
    pub fn stop_saving_config(&self) -> Result<StoppedTarget> {
        let pid = self.find_pid()?;
        info!("MIMO process detected (pid={})", pid);

        let pid_arg = pid.to_string();
        let command = self
            .runner
            .check("ps", &["-p", &pid_arg, "-o", "args="])
            .context("Failed to obtain MIMO process info")?
            .stdout
            .trim()
            .to_string();

        let rpc = self.rpc_script();
        if !rpc.is_file() {
            anyhow::bail!("required helper {} not found", rpc.display());
        }

        let saved = self
            .runner
            .check(&rpc.to_string_lossy(), &["save_config", "-i", "2"])
            .context("Failed to save MIMO configuration")?;
        let config_path = &self.paths.spdk_saved_config;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(config_path, saved.stdout)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        info!("Configuration saved to {}", config_path.display());

        self.runner
            .check("kill", &["-9", &pid_arg])
            .context("Failed to stop MIMO process")?;
        info!("MIMO process stopped");

        Ok(StoppedTarget { pid, command })
    }

    /// Relaunch the target detached; returns the new PID
    pub fn restart(&self, target: &StoppedTarget) -> Result<u32> {
        let args = restart_args(&target.command, &self.paths.spdk_saved_config);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        info!("Restarting MIMO service...");
        let pid = self
            .runner
            .spawn_detached(&self.target_binary().to_string_lossy(), &arg_refs)
            .context("Failed to restart MIMO")?;
        info!("MIMO restart initiated (pid={})", pid);
        Ok(pid)
    }
}

/// First PID in `lsof -t` output
pub fn parse_pid(lsof_output: &str) -> Result<u32> {
    let first = lsof_output
        .split_whitespace()
        .next()
        .context("no MIMO process found on socket")?;
    first
        .parse()
        .with_context(|| format!("Failed to parse MIMO pid {:?}", first))
}

/// Arguments for the relaunch: `-c <config>` followed by the original
/// arguments minus the program name and any earlier `-c <file>` pair.
pub fn restart_args(original: &str, config: &Path) -> Vec<String> {
    let mut args = vec!["-c".to_string(), config.to_string_lossy().into_owned()];

    let mut parts = original.split_whitespace().skip(1);
    while let Some(part) = parts.next() {
        if part == "-c" {
            if parts.next().is_some() {
                continue;
            }
            // A trailing "-c" without a value is kept verbatim
        }
        args.push(part.to_string());
    }
    args
}
