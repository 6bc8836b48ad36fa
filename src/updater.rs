//! Update orchestration
//!
//! Ties the bundle, the registrars and the transaction engine together for
//! the two update modes:
//!
//! - **System update** (`--sys`): verify and extract the bundle, refresh
//!   package dependencies, then run one transaction built in fixed order:
//!   MOTD, file copies, GRUB + initramfs, init files, services, cloud-init.
//! - **Target update** (`--target`): compare versions, confirm, stop the
//!   running SPDK target after saving its configuration, copy the bundle's
//!   files transactionally and relaunch the target, even after a rollback.
//!
//! Everything a run needs is carried in an [`UpdateContext`]; nothing here
//! reads or mutates process-wide state.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::bundle::{Bundle, CONFIG_FILE};
use crate::config::{read_mimo_version, BundleConfig};
use crate::engine::Transaction;
use crate::error::{Result, UpdaterError};
use crate::exec::SharedRunner;
use crate::paths::{SystemPaths, DEFAULT_MIMO_ROOT};
use crate::registrars::fileops::remove_path;
use crate::registrars::{
    register_boot_actions, register_cloud_init_actions, register_copy_actions,
    register_init_actions, register_motd_actions, register_service_actions,
};
use crate::spdk::SpdkControl;
use crate::version::version_less;

/// Default extraction directory
pub const DEFAULT_WORK_DIR: &str = "/tmp/mimo-output";

/// Everything one update run needs, resolved once up front
pub struct UpdateContext {
    /// Resource archive
    pub bundle: PathBuf,
    /// Extraction directory, removed when the run ends
    pub work_dir: PathBuf,
    /// MIMO installation root
    pub mimo_root: PathBuf,
    pub paths: SystemPaths,
    pub runner: SharedRunner,
    /// Register and report the actions without running them
    pub dry_run: bool,
    /// Answer yes to every confirmation prompt
    pub assume_yes: bool,
}

impl UpdateContext {
    pub fn new(bundle: impl Into<PathBuf>, runner: SharedRunner) -> Self {
        Self {
            bundle: bundle.into(),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            mimo_root: PathBuf::from(DEFAULT_MIMO_ROOT),
            paths: SystemPaths::default(),
            runner,
            dry_run: false,
            assume_yes: false,
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_mimo_root(mut self, mimo_root: impl Into<PathBuf>) -> Self {
        self.mimo_root = mimo_root.into();
        self
    }

    pub fn with_paths(mut self, paths: SystemPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn assume_yes(mut self, assume_yes: bool) -> Self {
        self.assume_yes = assume_yes;
        self
    }
}

/// How a run ended, when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Every action was applied
    Committed { actions: usize },
    /// Dry run: the actions that would have run, in order
    Planned { actions: Vec<String> },
    /// The operator declined a confirmation prompt
    Cancelled,
}

/// Resolve the MIMO installation root.
///
/// A non-empty `MIMO_ROOT` wins. Otherwise the default is used and, when
/// `persist` is set, exported from a profile snippet for later logins.
pub fn resolve_mimo_root(env_value: Option<String>, profile_script: &Path, persist: bool) -> PathBuf {
    if let Some(root) = env_value.filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(root);
    }

    info!("MIMO_ROOT set to {}", DEFAULT_MIMO_ROOT);
    if persist {
        let content = format!("export MIMO_ROOT={}\n", DEFAULT_MIMO_ROOT);
        match fs::write(profile_script, content) {
            Ok(()) => info!("MIMO_ROOT persisted to {}", profile_script.display()),
            Err(e) => warn!("Failed to persist MIMO_ROOT (will continue): {}", e),
        }
    }
    PathBuf::from(DEFAULT_MIMO_ROOT)
}

/// Exclusive single-run lock, released on drop.
///
/// The lock file holds the owner's PID. A lock whose owner is gone (crash,
/// `kill -9`, power loss) is taken over.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match Self::create(path) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match fs::read_to_string(path).ok().and_then(|s| s.trim().parse::<i32>().ok()) {
                    Some(pid) if process_alive(pid) => {
                        return Err(UpdaterError::precondition(format!(
                            "another update is running (pid {}, lock file {})",
                            pid,
                            path.display()
                        )));
                    }
                    holder => {
                        warn!(
                            "Taking over stale lock {} (holder {:?} is gone)",
                            path.display(),
                            holder
                        );
                        fs::remove_file(path)?;
                        Self::create(path).map_err(|e| match e.kind() {
                            ErrorKind::AlreadyExists => UpdaterError::precondition(format!(
                                "another update is running (lock file {} exists)",
                                path.display()
                            )),
                            _ => e.into(),
                        })?
                    }
                }
            }
            other => other?,
        };
        writeln!(file, "{}", std::process::id())?;

        debug!("Acquired lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn create(path: &Path) -> std::io::Result<fs::File> {
        fs::OpenOptions::new().write(true).create_new(true).open(path)
    }
}

/// Signal 0 probes for existence; EPERM still means the process is there
fn process_alive(pid: i32) -> bool {
    pid > 0 && matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Extraction directory for one run.
///
/// A directory this run creates is removed entirely when the run ends. In a
/// directory that already existed only the top-level entries added during the
/// run are removed.
struct WorkDir {
    path: PathBuf,
    created: bool,
    existing: HashSet<OsString>,
}

impl WorkDir {
    fn prepare(path: &Path) -> Result<Self> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => {
                let existing = fs::read_dir(path)?
                    .map(|e| e.map(|e| e.file_name()))
                    .collect::<std::io::Result<_>>()?;
                Ok(Self {
                    path: path.to_path_buf(),
                    created: false,
                    existing,
                })
            }
            Ok(_) => Err(UpdaterError::precondition(format!(
                "work directory {} is not a directory",
                path.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(path)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    created: true,
                    existing: HashSet::new(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup(&self) -> anyhow::Result<()> {
        if self.created {
            return remove_path(&self.path);
        }
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !self.existing.contains(&entry.file_name()) {
                remove_path(&entry.path())?;
            }
        }
        Ok(())
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        match self.cleanup() {
            Ok(()) => debug!("Cleaned work directory {}", self.path.display()),
            Err(e) => warn!("Failed to clean work directory {}: {:#}", self.path.display(), e),
        }
    }
}

/// Ask a yes/no question; anything but "y" (or a read error) is no
pub fn confirm(prompt: &str, input: &mut dyn BufRead, assume_yes: bool) -> bool {
    if assume_yes {
        info!("{}y (--yes)", prompt);
        return true;
    }

    print!("{}", prompt);
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => line.trim().eq_ignore_ascii_case("y"),
    }
}

/// Load, resolve and validate the extracted bundle's configuration
pub fn load_config(path: &Path, base: &Path) -> Result<BundleConfig> {
    let mut config =
        BundleConfig::load_from_file(path).map_err(|e| UpdaterError::config(format!("{:#}", e)))?;
    config.resolve_sources(base);
    config
        .validate()
        .map_err(|e| UpdaterError::config(format!("{:#}", e)))?;
    Ok(config)
}

/// Verify and extract the bundle, then load its configuration
pub fn prepare_bundle(ctx: &UpdateContext) -> Result<BundleConfig> {
    let bundle = Bundle::open(&ctx.bundle)?;
    bundle.verify()?;
    bundle.extract(&ctx.work_dir, ctx.runner.as_ref())?;
    load_config(&ctx.work_dir.join(CONFIG_FILE), &ctx.work_dir)
}

/// `pkgdep.sh` locations, bundle first
pub fn pkgdep_candidates(ctx: &UpdateContext) -> [PathBuf; 2] {
    [
        ctx.work_dir
            .join("file")
            .join("SPDK_for_MIMO")
            .join("scripts")
            .join("pkgdep.sh"),
        ctx.mimo_root.join("scripts").join("pkgdep.sh"),
    ]
}

/// Refresh apt and install package dependencies. Failures are warnings.
pub fn run_pkgdep(ctx: &UpdateContext) {
    let Some(script) = pkgdep_candidates(ctx).into_iter().find(|p| p.is_file()) else {
        warn!("Dependency script not found, skipping");
        return;
    };

    info!("Running 'apt update'...");
    match ctx.runner.check("apt", &["update"]) {
        Ok(_) => info!("'apt update' completed"),
        Err(e) => warn!("'apt update' failed: {:#}", e),
    }

    info!("Installing package dependencies; this may take some time...");
    match ctx.runner.check("bash", &[&script.to_string_lossy()]) {
        Ok(_) => info!("Dependencies installed"),
        Err(e) => warn!("Dependency installation failed: {:#}", e),
    }
}

/// Build the system update transaction. Nothing is applied yet.
pub fn build_system_transaction(ctx: &UpdateContext, config: &BundleConfig) -> Result<Transaction> {
    let mut txn = Transaction::new();

    register_motd_actions(&mut txn, &ctx.paths)
        .map_err(|e| UpdaterError::register("MOTD", e))?;
    register_copy_actions(&mut txn, &config.file_mappings)
        .map_err(|e| UpdaterError::register("file copy", e))?;
    register_boot_actions(&mut txn, &ctx.paths, &ctx.runner)
        .map_err(|e| UpdaterError::register("GRUB", e))?;
    if let Some(init) = &config.init {
        register_init_actions(&mut txn, init)
            .map_err(|e| UpdaterError::register("init file", e))?;
    }
    register_service_actions(&mut txn, config, &ctx.runner)
        .map_err(|e| UpdaterError::register("service", e))?;
    register_cloud_init_actions(&mut txn, &ctx.paths, &ctx.runner)
        .map_err(|e| UpdaterError::register("cloud-init", e))?;

    debug!("Registered {} actions", txn.len());
    Ok(txn)
}

/// Run a transaction, report the outcome and release its actions
pub fn run_transaction(txn: &mut Transaction) -> Result<usize> {
    let count = txn.len();
    info!("Executing {} update actions", count);

    let result = txn.run();
    match &result {
        Ok(()) => info!("All {} actions completed", count),
        Err(e) => {
            error!("Update failed: {}", e);
            match e.rollback_failures() {
                Some(rollback) => error!(
                    "Rollback left {} action(s) unrestored: {}",
                    rollback.failures.len(),
                    rollback.failed_actions().join(", ")
                ),
                None => info!("All applied actions were rolled back"),
            }
        }
    }

    txn.cleanup();
    result.map(|()| count).map_err(UpdaterError::from)
}

fn planned(txn: &Transaction) -> UpdateOutcome {
    UpdateOutcome::Planned {
        actions: txn.pending_names().into_iter().map(String::from).collect(),
    }
}

/// System update (`update --sys`)
pub fn run_system_update(ctx: &UpdateContext) -> Result<UpdateOutcome> {
    let _lock = LockFile::acquire(&ctx.paths.lock_file)?;
    let _work = WorkDir::prepare(&ctx.work_dir)?;

    let config = prepare_bundle(ctx)?;

    if ctx.dry_run {
        return Ok(planned(&build_system_transaction(ctx, &config)?));
    }

    run_pkgdep(ctx);

    let mut txn = build_system_transaction(ctx, &config)?;
    let actions = run_transaction(&mut txn)?;
    Ok(UpdateOutcome::Committed { actions })
}

/// Target update (`update --target`)
pub fn run_target_update(ctx: &UpdateContext, input: &mut dyn BufRead) -> Result<UpdateOutcome> {
    let _lock = LockFile::acquire(&ctx.paths.lock_file)?;
    let _work = WorkDir::prepare(&ctx.work_dir)?;

    let config = prepare_bundle(ctx)?;
    let (bundled_file, installed_file) = config
        .version_files()
        .map_err(|e| UpdaterError::config(e.to_string()))?;
    let installed = read_mimo_version(&installed_file);
    let bundled = read_mimo_version(&bundled_file);

    info!("Installed version: {}", installed);
    info!("New version      : {}", bundled);
    if !version_less(&installed, &bundled) {
        warn!("Bundle version {} is not newer than installed {}", bundled, installed);
    }

    let mut txn = Transaction::new();
    register_copy_actions(&mut txn, &config.file_mappings)
        .map_err(|e| UpdaterError::register("file copy", e))?;

    if ctx.dry_run {
        return Ok(planned(&txn));
    }

    if !confirm("Proceed with update? [y/N]: ", input, ctx.assume_yes) {
        info!("Update cancelled");
        return Ok(UpdateOutcome::Cancelled);
    }

    let spdk = SpdkControl::new(ctx.runner.as_ref(), &ctx.mimo_root, &ctx.paths);
    let stopped = if spdk.socket_present() {
        info!("Detected running MIMO instance");
        if !confirm("Stop MIMO now? [y/N]: ", input, ctx.assume_yes) {
            info!("Please stop I/O before updating");
            return Ok(UpdateOutcome::Cancelled);
        }
        let target = spdk
            .stop_saving_config()
            .map_err(|e| UpdaterError::precondition(format!("{:#}", e)))?;
        Some(target)
    } else {
        None
    };

    info!("Applying file mappings...");
    let result = run_transaction(&mut txn);

    // The target comes back whether the copy committed or rolled back
    if let Some(target) = &stopped {
        if let Err(e) = spdk.restart(target) {
            let restart = UpdaterError::Restart(format!("{:#}", e));
            if result.is_ok() {
                return Err(restart);
            }
            error!("{}", restart);
        }
    } else {
        info!("No running MIMO instance was stopped; restart skipped");
    }

    result.map(|actions| UpdateOutcome::Committed { actions })
}

/// Verify and extract a bundle and check its configuration (`verify`)
pub fn verify_bundle(ctx: &UpdateContext) -> Result<BundleConfig> {
    let _work = WorkDir::prepare(&ctx.work_dir)?;
    prepare_bundle(ctx)
}
