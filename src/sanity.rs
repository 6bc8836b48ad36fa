//! Pre-flight sanity checks for the runtime environment
//!
//! Before a bundle is touched the updater verifies:
//! - The OS tools the chosen update mode calls are present
//! - It runs with root privileges (EUID 0)
//!
//! A failed check is a precondition error: nothing has been changed yet.

use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, UpdaterError};
use crate::exec::CommandProcessGroup;

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Describe every failed check in one message
    pub fn describe(&self) -> String {
        let mut problems = Vec::new();
        if !self.is_root {
            problems.push("must run as root".to_string());
        }
        if !self.missing_binaries.is_empty() {
            let packages: Vec<String> = self
                .missing_binaries
                .iter()
                .map(|b| format!("{} (apt install {})", b, package_for_binary(b)))
                .collect();
            problems.push(format!("missing required binaries: {}", packages.join(", ")));
        }
        problems.join("; ")
    }
}

/// Binaries a system update calls
pub const SYSTEM_BINARIES: &[&str] = &["tar", "update-grub", "update-initramfs", "systemctl"];

/// Binaries a target update calls
pub const TARGET_BINARIES: &[&str] = &["tar", "lsof", "ps", "kill"];

/// Optional binaries (warn if missing but don't fail)
const OPTIONAL_BINARIES: &[&str] = &[
    "apt",  // Package dependency refresh
    "bash", // pkgdep.sh
];

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Check if running as root (EUID 0)
fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Perform all sanity checks for the given required binaries
pub fn verify_environment(required: &[&str]) -> SanityCheckResult {
    let missing = required
        .iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| (*binary).to_string())
        .collect();

    for binary in OPTIONAL_BINARIES {
        if !binary_exists(binary) {
            warn!("Optional binary not found: {}", binary);
        }
    }

    SanityCheckResult {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to their Debian package names
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "tar" => "tar",
        "update-grub" => "grub2-common",
        "update-initramfs" => "initramfs-tools",
        "systemctl" => "systemd",
        "lsof" => "lsof",
        "ps" | "kill" => "procps",
        _ => "unknown",
    }
}

/// Skip the root check (for staging runs against a scratch root).
/// Set MIMO_SKIP_ROOT_CHECK=1 to skip.
pub fn should_skip_root_check() -> bool {
    std::env::var("MIMO_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run pre-flight checks, failing with a precondition error
pub fn run_preflight_checks(required: &[&str]) -> Result<()> {
    debug!("Running pre-flight sanity checks...");

    let mut result = verify_environment(required);

    if should_skip_root_check() {
        warn!("Root check skipped (MIMO_SKIP_ROOT_CHECK=1)");
        result.is_root = true;
    }

    if !result.is_ok() {
        return Err(UpdaterError::precondition(result.describe()));
    }

    info!("Pre-flight checks passed");
    Ok(())
}
