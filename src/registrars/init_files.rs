//! Inline init file registrar
//!
//! Writes files whose content is embedded in the bundle configuration. Entries
//! flagged `is_dir` are skipped; their directories appear when the files
//! inside them are written.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::info;

use super::fileops::remove_path;
use crate::config::{InitConfig, InitFile};
use crate::engine::{Action, Reversible, Transaction};

/// Writes one inline init file
#[derive(Debug)]
pub struct InitFileWrite {
    path: PathBuf,
    content: String,
    mode: u32,
    prior: Option<(Vec<u8>, u32)>,
}

impl InitFileWrite {
    pub fn capture(file: &InitFile) -> Result<Self> {
        let path = file.path.clone();
        let prior = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => {
                let bytes =
                    fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
                Some((bytes, meta.permissions().mode() & 0o7777))
            }
            Ok(_) => anyhow::bail!("{} exists and is not a regular file", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect {}", path.display()));
            }
        };

        Ok(Self {
            path,
            content: file.content.clone(),
            mode: file.mode_bits(),
            prior,
        })
    }

    fn write(&self, bytes: &[u8], mode: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, bytes)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to chmod {}", self.path.display()))
    }
}

impl Reversible for InitFileWrite {
    fn apply(&self) -> Result<()> {
        self.write(self.content.as_bytes(), self.mode)?;
        info!("Created init file {} ({:o})", self.path.display(), self.mode);
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        match &self.prior {
            Some((bytes, mode)) => self.write(bytes, *mode),
            None => remove_path(&self.path),
        }
    }
}

/// Register one action per init file, in configuration order
pub fn register_init_actions(txn: &mut Transaction, init: &InitConfig) -> Result<()> {
    for file in init.files.iter().filter(|f| !f.is_dir) {
        let write = InitFileWrite::capture(file)?;
        txn.add(Action::new(
            format!("create init file {}", file.path.display()),
            write,
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_file(path: PathBuf, content: &str, mode: &str) -> InitFile {
        InitFile {
            path,
            content: content.to_string(),
            mode: Some(mode.to_string()),
            kind: None,
            is_dir: false,
        }
    }

    #[test]
    fn test_apply_writes_content_and_mode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("etc/mimo/start.sh");
        let write = InitFileWrite::capture(&init_file(path.clone(), "#!/bin/sh\n", "0750")).unwrap();

        write.apply().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o750);

        write.undo().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_undo_restores_prior_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("env");
        fs::write(&path, "A=0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        let write = InitFileWrite::capture(&init_file(path.clone(), "A=1\n", "0644")).unwrap();
        write.apply().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=1\n");

        write.undo().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=0\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_directory_in_the_way_fails_capture() {
        let tmp = TempDir::new().unwrap();
        let err = InitFileWrite::capture(&init_file(tmp.path().to_path_buf(), "", "0644"))
            .unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn test_register_skips_directories() {
        let tmp = TempDir::new().unwrap();
        let mut dir_entry = init_file(tmp.path().join("etc/mimo"), "", "0755");
        dir_entry.is_dir = true;

        let init = InitConfig {
            files: vec![dir_entry, init_file(tmp.path().join("etc/mimo/env"), "A=1\n", "0644")],
            ..Default::default()
        };

        let mut txn = Transaction::new();
        register_init_actions(&mut txn, &init).unwrap();
        assert_eq!(txn.len(), 1);
        assert!(txn.pending_names()[0].ends_with("etc/mimo/env"));
    }
}
