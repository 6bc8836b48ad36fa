//! Bootloader registrar
//!
//! Quiets the kernel command line in `/etc/default/grub` and installs an
//! initramfs `init-top` hook that prints the MIMO boot banner. Both actions
//! regenerate their boot artefacts (`update-grub`, `update-initramfs -u`) on
//! the way forward and, best-effort, on the way back.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::engine::{Action, Reversible, Transaction};
use crate::exec::SharedRunner;
use crate::paths::SystemPaths;

const CMDLINE_KEY: &str = "GRUB_CMDLINE_LINUX_DEFAULT=";

/// The command line written into `/etc/default/grub`
pub const QUIET_CMDLINE: &str =
    r#"GRUB_CMDLINE_LINUX_DEFAULT="quiet loglevel=0 systemd.show_status=0""#;

/// Content of the initramfs banner hook
pub const INITRAMFS_HOOK: &str =
    "#!/bin/sh\necho \">>> Initializing MIMO Live Server (initramfs) <<<\" > /dev/console\n";

/// Replace every `GRUB_CMDLINE_LINUX_DEFAULT=` line with [`QUIET_CMDLINE`],
/// or append it when there is none.
pub fn set_quiet_cmdline(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + QUIET_CMDLINE.len() + 1);
    let mut found = false;

    for line in text.split_inclusive('\n') {
        if line.starts_with(CMDLINE_KEY) {
            out.push_str(QUIET_CMDLINE);
            if line.ends_with('\n') {
                out.push('\n');
            }
            found = true;
        } else {
            out.push_str(line);
        }
    }

    if !found {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(QUIET_CMDLINE);
        out.push('\n');
    }
    out
}

/// Bytes and permission bits of a file before we touched it
type PriorFile = Option<(Vec<u8>, u32)>;

fn read_prior(path: &Path) -> Result<PriorFile> {
    let mode = match fs::metadata(path) {
        Ok(meta) => meta.permissions().mode() & 0o7777,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", path.display())),
    };
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some((bytes, mode)))
}

fn restore_prior(path: &Path, prior: &PriorFile) -> Result<()> {
    match prior {
        Some((bytes, mode)) => {
            fs::write(path, bytes)
                .with_context(|| format!("Failed to restore {}", path.display()))?;
            fs::set_permissions(path, fs::Permissions::from_mode(*mode))
                .with_context(|| format!("Failed to chmod {}", path.display()))
        }
        None => super::fileops::remove_path(path),
    }
}

/// Rewrites the default kernel command line
pub struct GrubCmdline {
    path: PathBuf,
    original: PriorFile,
    runner: SharedRunner,
}

impl GrubCmdline {
    pub fn capture(path: impl Into<PathBuf>, runner: SharedRunner) -> Result<Self> {
        let path = path.into();
        let original = read_prior(&path)?;
        Ok(Self {
            path,
            original,
            runner,
        })
    }
}

impl Reversible for GrubCmdline {
    fn apply(&self) -> Result<()> {
        let text = self
            .original
            .as_ref()
            .map(|(bytes, _)| String::from_utf8_lossy(bytes))
            .unwrap_or_default();
        let updated = set_quiet_cmdline(&text);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, updated)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        if let Err(e) = self.runner.check("update-grub", &[]) {
            if let Err(restore_err) = restore_prior(&self.path, &self.original) {
                warn!("Failed to restore {}: {:#}", self.path.display(), restore_err);
            }
            return Err(e);
        }
        info!("GRUB command line updated");
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        restore_prior(&self.path, &self.original)?;
        if let Err(e) = self.runner.check("update-grub", &[]) {
            warn!("update-grub after restore failed: {:#}", e);
        }
        Ok(())
    }
}

/// Installs the initramfs banner hook
pub struct InitramfsHook {
    path: PathBuf,
    original: PriorFile,
    runner: SharedRunner,
}

impl InitramfsHook {
    pub fn capture(path: impl Into<PathBuf>, runner: SharedRunner) -> Result<Self> {
        let path = path.into();
        let original = read_prior(&path)?;
        Ok(Self {
            path,
            original,
            runner,
        })
    }
}

impl Reversible for InitramfsHook {
    fn apply(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, INITRAMFS_HOOK)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o755))?;

        if let Err(e) = self.runner.check("update-initramfs", &["-u"]) {
            if let Err(restore_err) = restore_prior(&self.path, &self.original) {
                warn!("Failed to restore {}: {:#}", self.path.display(), restore_err);
            }
            return Err(e);
        }
        info!("initramfs hook installed at {}", self.path.display());
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        restore_prior(&self.path, &self.original)?;
        if let Err(e) = self.runner.check("update-initramfs", &["-u"]) {
            warn!("update-initramfs after restore failed: {:#}", e);
        }
        Ok(())
    }
}

/// Register the GRUB command line edit followed by the initramfs hook
pub fn register_boot_actions(
    txn: &mut Transaction,
    paths: &SystemPaths,
    runner: &SharedRunner,
) -> Result<()> {
    let grub = GrubCmdline::capture(&paths.grub_default, runner.clone())?;
    txn.add(Action::new("modify grub cmdline", grub))?;

    let hook = InitramfsHook::capture(&paths.initramfs_hook, runner.clone())?;
    txn.add(Action::new("add initramfs mimo-msg", hook))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SAMPLE: &str = "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"splash\"\nGRUB_CMDLINE_LINUX=\"\"\n";

    fn setup() -> (TempDir, SystemPaths, Arc<RecordingRunner>) {
        let tmp = TempDir::new().unwrap();
        let paths = SystemPaths::under(tmp.path());
        (tmp, paths, Arc::new(RecordingRunner::new()))
    }

    #[test]
    fn test_set_quiet_cmdline_replaces_existing_line() {
        let out = set_quiet_cmdline(SAMPLE);
        assert_eq!(
            out,
            format!("GRUB_DEFAULT=0\n{}\nGRUB_CMDLINE_LINUX=\"\"\n", QUIET_CMDLINE)
        );
    }

    #[test]
    fn test_set_quiet_cmdline_appends_when_missing() {
        assert_eq!(
            set_quiet_cmdline("GRUB_DEFAULT=0"),
            format!("GRUB_DEFAULT=0\n{}\n", QUIET_CMDLINE)
        );
        assert_eq!(set_quiet_cmdline(""), format!("{}\n", QUIET_CMDLINE));
    }

    #[test]
    fn test_set_quiet_cmdline_leaves_similar_keys_alone() {
        let text = "GRUB_CMDLINE_LINUX=\"a\"\n";
        assert!(set_quiet_cmdline(text).starts_with(text));
    }

    #[test]
    fn test_grub_apply_and_undo() {
        let (_tmp, paths, runner) = setup();
        fs::create_dir_all(paths.grub_default.parent().unwrap()).unwrap();
        fs::write(&paths.grub_default, SAMPLE).unwrap();

        let grub = GrubCmdline::capture(&paths.grub_default, runner.clone()).unwrap();
        grub.apply().unwrap();
        assert!(fs::read_to_string(&paths.grub_default)
            .unwrap()
            .contains("loglevel=0"));

        grub.undo().unwrap();
        assert_eq!(fs::read_to_string(&paths.grub_default).unwrap(), SAMPLE);
        assert_eq!(runner.calls(), vec!["update-grub", "update-grub"]);
    }

    #[test]
    fn test_update_grub_failure_fails_apply() {
        let (_tmp, paths, runner) = setup();
        runner.fail_on("update-grub", "grub-probe: error");

        let grub = GrubCmdline::capture(&paths.grub_default, runner.clone()).unwrap();
        let err = grub.apply().unwrap_err();
        assert!(format!("{:#}", err).contains("grub-probe"));

        // The failed apply put the absent file back itself
        assert!(!paths.grub_default.exists());

        // Regeneration failure on the way back is only a warning
        assert!(grub.undo().is_ok());
    }

    #[test]
    fn test_initramfs_hook_restores_prior_content() {
        let (_tmp, paths, runner) = setup();
        fs::create_dir_all(paths.initramfs_hook.parent().unwrap()).unwrap();
        fs::write(&paths.initramfs_hook, "#!/bin/sh\n# vendor\n").unwrap();

        let hook = InitramfsHook::capture(&paths.initramfs_hook, runner.clone()).unwrap();
        hook.apply().unwrap();
        assert_eq!(fs::read_to_string(&paths.initramfs_hook).unwrap(), INITRAMFS_HOOK);
        let mode = fs::metadata(&paths.initramfs_hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        hook.undo().unwrap();
        assert_eq!(
            fs::read_to_string(&paths.initramfs_hook).unwrap(),
            "#!/bin/sh\n# vendor\n"
        );
        assert_eq!(
            runner.calls(),
            vec!["update-initramfs -u", "update-initramfs -u"]
        );
    }

    #[test]
    fn test_grub_undo_restores_exact_bytes_and_mode() {
        let (_tmp, paths, runner) = setup();
        fs::create_dir_all(paths.grub_default.parent().unwrap()).unwrap();
        let original = b"# caf\xe9\nGRUB_CMDLINE_LINUX_DEFAULT=\"splash\"\n".to_vec();
        fs::write(&paths.grub_default, &original).unwrap();
        fs::set_permissions(&paths.grub_default, fs::Permissions::from_mode(0o600)).unwrap();

        let grub = GrubCmdline::capture(&paths.grub_default, runner).unwrap();
        grub.apply().unwrap();
        assert!(fs::read_to_string(&paths.grub_default)
            .unwrap()
            .contains("loglevel=0"));

        grub.undo().unwrap();
        assert_eq!(fs::read(&paths.grub_default).unwrap(), original);
        let mode = fs::metadata(&paths.grub_default).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_initramfs_hook_restores_prior_mode() {
        let (_tmp, paths, runner) = setup();
        fs::create_dir_all(paths.initramfs_hook.parent().unwrap()).unwrap();
        fs::write(&paths.initramfs_hook, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&paths.initramfs_hook, fs::Permissions::from_mode(0o700)).unwrap();

        let hook = InitramfsHook::capture(&paths.initramfs_hook, runner).unwrap();
        hook.apply().unwrap();
        hook.undo().unwrap();

        let mode = fs::metadata(&paths.initramfs_hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_initramfs_hook_removed_when_new() {
        let (_tmp, paths, runner) = setup();
        let hook = InitramfsHook::capture(&paths.initramfs_hook, runner).unwrap();
        hook.apply().unwrap();
        hook.undo().unwrap();
        assert!(!paths.initramfs_hook.exists());
    }

    #[test]
    fn test_register_boot_actions_order() {
        let (_tmp, paths, runner) = setup();
        let shared: SharedRunner = runner;
        let mut txn = Transaction::new();
        register_boot_actions(&mut txn, &paths, &shared).unwrap();
        assert_eq!(
            txn.pending_names(),
            vec!["modify grub cmdline", "add initramfs mimo-msg"]
        );
    }
}
