//! MOTD registrar
//!
//! The appliance replaces the distribution's dynamic login banner. Scripts in
//! `/etc/update-motd.d` are parked in a backup directory rather than deleted,
//! and the backup is kept after a successful run as a record of what was
//! disabled.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::fileops::{exists, move_path, remove_path};
use crate::engine::{Action, Reversible, Transaction};
use crate::paths::SystemPaths;

/// Moves the MOTD scripts present at registration into a backup directory
#[derive(Debug)]
pub struct MotdBackup {
    motd_dir: PathBuf,
    backup_dir: PathBuf,
    entries: Vec<OsString>,
}

impl MotdBackup {
    pub fn capture(motd_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Result<Self> {
        let motd_dir = motd_dir.into();
        let mut entries = match fs::read_dir(&motd_dir) {
            Ok(iter) => iter
                .map(|e| e.map(|e| e.file_name()))
                .collect::<std::io::Result<Vec<_>>>()
                .with_context(|| format!("Failed to list {}", motd_dir.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", motd_dir.display()));
            }
        };
        entries.sort();

        debug!("{} MOTD entries to park", entries.len());
        Ok(Self {
            motd_dir,
            backup_dir: backup_dir.into(),
            entries,
        })
    }

    /// Names of the scripts that will be parked
    pub fn entries(&self) -> &[OsString] {
        &self.entries
    }
}

impl MotdBackup {
    fn park(&self, moved: &mut usize) -> Result<()> {
        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Failed to create {}", self.backup_dir.display()))?;

        for name in &self.entries {
            let src = self.motd_dir.join(name);
            if exists(&src)? {
                let dst = self.backup_dir.join(name);
                // A stale copy from an earlier run is superseded
                remove_path(&dst)?;
                move_path(&src, &dst)?;
            }
            *moved += 1;
        }
        Ok(())
    }

    /// Move the named entries back from the backup directory
    fn restore(&self, names: &[OsString]) -> Result<()> {
        for name in names {
            let parked = self.backup_dir.join(name);
            let original = self.motd_dir.join(name);

            if exists(&parked)? {
                remove_path(&original)?;
                move_path(&parked, &original)?;
            } else if !exists(&original)? {
                anyhow::bail!(
                    "MOTD script {} is missing from both {} and {}",
                    name.to_string_lossy(),
                    self.motd_dir.display(),
                    self.backup_dir.display()
                );
            }
        }
        Ok(())
    }
}

impl Reversible for MotdBackup {
    fn apply(&self) -> Result<()> {
        let mut moved = 0;
        if let Err(e) = self.park(&mut moved) {
            if let Err(restore_err) = self.restore(&self.entries[..moved]) {
                warn!("Failed to restore parked MOTD scripts: {:#}", restore_err);
            }
            return Err(e);
        }

        info!(
            "Disabled {} MOTD scripts (backup in {})",
            self.entries.len(),
            self.backup_dir.display()
        );
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        self.restore(&self.entries)
    }
}

/// Register the MOTD backup action
pub fn register_motd_actions(txn: &mut Transaction, paths: &SystemPaths) -> Result<()> {
    let backup = MotdBackup::capture(&paths.motd_dir, &paths.motd_backup)?;
    txn.add(Action::new("motd backup and disable", backup))?;
    Ok(())
}
