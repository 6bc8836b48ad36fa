//! File copy registrar
//!
//! Registers one action per `(src, dst)` mapping. Whatever currently lives at
//! `dst` is captured when the action is built:
//!
//! | Prior state at `dst`     | Captured                         | Undo                         |
//! |--------------------------|----------------------------------|------------------------------|
//! | nothing                  | nothing                          | remove what was copied       |
//! | regular file             | bytes + permission bits          | rewrite bytes, restore mode  |
//! | directory / symlink      | unique sibling backup path       | rename the backup back       |
//!
//! The forward operation refuses to touch `dst` when `src` is missing.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::FileMapping;
use crate::engine::{Action, Reversible, Transaction};

/// Destination state captured at registration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
    /// Nothing existed at the destination
    Absent,
    /// A regular file; its content and permission bits
    File { contents: Vec<u8>, mode: u32 },
    /// A directory or symlink, moved aside to `backup` by the forward op
    MovedAside { backup: PathBuf },
}

/// Copy of a file or directory tree over a destination, with restore.
#[derive(Debug)]
pub struct FileCopy {
    src: PathBuf,
    dst: PathBuf,
    prior: PriorState,
}

impl FileCopy {
    /// Inspect `dst` and capture what is needed to restore it.
    pub fn capture(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Result<Self> {
        let (src, dst) = (src.into(), dst.into());

        let prior = match fs::symlink_metadata(&dst) {
            Err(e) if e.kind() == ErrorKind::NotFound => PriorState::Absent,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect {}", dst.display()));
            }
            Ok(meta) if meta.is_file() => PriorState::File {
                contents: fs::read(&dst)
                    .with_context(|| format!("Failed to back up {}", dst.display()))?,
                mode: meta.permissions().mode() & 0o7777,
            },
            Ok(_) => PriorState::MovedAside {
                backup: backup_path(&dst)?,
            },
        };

        debug!("Captured prior state of {}: {}", dst.display(), prior.describe());
        Ok(Self { src, dst, prior })
    }

    /// The captured prior state
    pub fn prior(&self) -> &PriorState {
        &self.prior
    }

    fn replace_destination(&self, src_is_dir: bool) -> Result<()> {
        if let PriorState::MovedAside { backup } = &self.prior {
            if exists(&self.dst)? {
                fs::rename(&self.dst, backup).with_context(|| {
                    format!("Failed to move {} aside to {}", self.dst.display(), backup.display())
                })?;
            }
        } else {
            remove_path(&self.dst)?;
        }

        if src_is_dir {
            copy_dir(&self.src, &self.dst)
        } else {
            copy_file(&self.src, &self.dst)?;
            grant_exec_if_needed(&self.dst)
        }
    }

    fn restore(&self) -> Result<()> {
        match &self.prior {
            PriorState::Absent => remove_path(&self.dst),
            PriorState::File { contents, mode } => {
                if fs::symlink_metadata(&self.dst).is_ok_and(|m| !m.is_file()) {
                    remove_path(&self.dst)?;
                }
                if let Some(parent) = self.dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.dst, contents)
                    .with_context(|| format!("Failed to restore {}", self.dst.display()))?;
                fs::set_permissions(&self.dst, fs::Permissions::from_mode(*mode))
                    .with_context(|| format!("Failed to restore mode of {}", self.dst.display()))
            }
            PriorState::MovedAside { backup } => {
                if exists(backup)? {
                    remove_path(&self.dst)?;
                    fs::rename(backup, &self.dst).with_context(|| {
                        format!("Failed to move {} back to {}", backup.display(), self.dst.display())
                    })
                } else if exists(&self.dst)? {
                    // The original was never moved aside
                    Ok(())
                } else {
                    anyhow::bail!(
                        "backup {} is missing and {} is gone",
                        backup.display(),
                        self.dst.display()
                    )
                }
            }
        }
    }
}

impl Reversible for FileCopy {
    fn apply(&self) -> Result<()> {
        let src_meta = match fs::metadata(&self.src) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                anyhow::bail!("source not found: {}", self.src.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", self.src.display()));
            }
        };

        if let Err(e) = self.replace_destination(src_meta.is_dir()) {
            // Leave nothing half-copied behind
            if let Err(restore_err) = self.restore() {
                warn!(
                    "Failed to restore {} after partial copy: {:#}",
                    self.dst.display(),
                    restore_err
                );
            }
            return Err(e);
        }

        info!("Copied {} -> {}", self.src.display(), self.dst.display());
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        self.restore()?;
        info!("Restored {} ({})", self.dst.display(), self.prior.describe());
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        if let PriorState::MovedAside { backup } = &self.prior {
            remove_path(backup)?;
        }
        Ok(())
    }
}

impl PriorState {
    fn describe(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::File { .. } => "file",
            Self::MovedAside { .. } => "moved aside",
        }
    }
}

/// Register one copy action per mapping, in mapping order.
pub fn register_copy_actions(txn: &mut Transaction, mappings: &[FileMapping]) -> Result<()> {
    for mapping in mappings {
        let copy = FileCopy::capture(&mapping.src, &mapping.dst)?;
        let name = format!("copy {} -> {}", mapping.src.display(), mapping.dst.display());
        txn.add(Action::new(name, copy))?;
    }
    Ok(())
}

/// Copy a single file, creating parent directories and preserving its mode
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

/// Recursively copy a directory tree; symlinks are recreated, not followed
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            let mode = entry.metadata()?.permissions().mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            remove_path(&target)?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to link {}", target.display()))?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove a file, symlink or directory tree; a missing path is not an error
pub fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    };
    result.with_context(|| format!("Failed to remove {}", path.display()))
}

/// Move a file or tree, falling back to copy + remove across filesystems
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to inspect {}", src.display()))?;
    if meta.is_dir() {
        copy_dir(src, dst)?;
    } else if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)
            .with_context(|| format!("Failed to link {}", dst.display()))?;
    } else {
        copy_file(src, dst)?;
    }
    remove_path(src)
}

pub(crate) fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to inspect {}", path.display())),
    }
}

/// Shell scripts and unit files dropped into place get execute permission
fn grant_exec_if_needed(path: &Path) -> Result<()> {
    let needs_exec = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("sh") | Some("service")
    );
    if needs_exec {
        let mode = fs::metadata(path)?.permissions().mode();
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o111))
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    Ok(())
}

/// Unique sibling path: `<name>.mimo-bak.<pid>.<nanos>`
pub(crate) fn backup_path(dst: &Path) -> Result<PathBuf> {
    let name = dst
        .file_name()
        .with_context(|| format!("{} has no file name", dst.display()))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut backup = name.to_os_string();
    backup.push(format!(".mimo-bak.{}.{}", std::process::id(), nanos));
    Ok(dst.with_file_name(backup))
}
