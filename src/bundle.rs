//! Resource bundle verification and extraction
//!
//! A bundle is a gzip'd tarball plus a SHA-256 sidecar. The sidecar holds the
//! hex digest, optionally followed by a file name in `sha256sum` format.
//! Verification runs before anything is extracted.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::UpdaterError;
use crate::exec::CommandRunner;

/// Default bundle location when `--bundle` is not given
pub const DEFAULT_BUNDLE: &str = "resources.tar.gz";

/// Name of the configuration file inside the extracted bundle
pub const CONFIG_FILE: &str = "config.json";

/// A resource archive and its checksum sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    archive: PathBuf,
    checksum: PathBuf,
}

impl Bundle {
    /// Locate the sidecar for `archive`: `<archive>.sha256`, or the archive
    /// name with its `.tar.gz`/`.tgz` suffix replaced by `.sha256`.
    pub fn open(archive: impl Into<PathBuf>) -> Result<Self, UpdaterError> {
        let archive = archive.into();
        if !archive.is_file() {
            return Err(UpdaterError::bundle(format!(
                "bundle {} not found",
                archive.display()
            )));
        }

        let checksum = sidecar_candidates(&archive)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| {
                UpdaterError::bundle(format!("no checksum file found for {}", archive.display()))
            })?;

        Ok(Self { archive, checksum })
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Compare the archive digest with the sidecar
    pub fn verify(&self) -> Result<(), UpdaterError> {
        let expected = fs::read_to_string(&self.checksum)?;
        let expected = expected.split_whitespace().next().unwrap_or_default();

        let actual = sha256_file(&self.archive).map_err(|e| UpdaterError::bundle(format!("{:#}", e)))?;

        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdaterError::bundle(format!(
                "checksum mismatch for {}: expected {}, got {}",
                self.archive.display(),
                expected,
                actual
            )));
        }

        info!("Resources verified ({})", actual);
        Ok(())
    }

    /// Extract into `dest`, creating it if needed
    pub fn extract(&self, dest: &Path, runner: &dyn CommandRunner) -> Result<(), UpdaterError> {
        fs::create_dir_all(dest)?;
        info!("Extracting resources into {}; this may take some time...", dest.display());

        let archive = self.archive.to_string_lossy();
        let dest_str = dest.to_string_lossy();
        runner
            .check("tar", &["-xzf", &archive, "-C", &dest_str])
            .map_err(|e| UpdaterError::bundle(format!("extraction failed: {:#}", e)))?;

        info!("Extraction completed");
        Ok(())
    }
}

fn sidecar_candidates(archive: &Path) -> Vec<PathBuf> {
    let mut with_suffix = archive.as_os_str().to_os_string();
    with_suffix.push(".sha256");

    let mut candidates = vec![PathBuf::from(with_suffix)];

    if let Some(name) = archive.file_name().and_then(|n| n.to_str()) {
        let stem = name
            .strip_suffix(".tar.gz")
            .or_else(|| name.strip_suffix(".tgz"));
        if let Some(stem) = stem {
            candidates.push(archive.with_file_name(format!("{}.sha256", stem)));
        }
    }
    candidates
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use tempfile::TempDir;

    // sha256("hello\n")
    const HELLO_SHA: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn bundle_dir(sidecar: &str, content: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("resources.tar.gz");
        fs::write(&archive, "hello\n").unwrap();
        fs::write(tmp.path().join(sidecar), content).unwrap();
        (tmp, archive)
    }

    #[test]
    fn test_sha256_file() {
        let (_tmp, archive) = bundle_dir("resources.sha256", "");
        assert_eq!(sha256_file(&archive).unwrap(), HELLO_SHA);
    }

    #[test]
    fn test_verify_accepts_sha256sum_format() {
        let (_tmp, archive) = bundle_dir(
            "resources.tar.gz.sha256",
            &format!("{}  resources.tar.gz\n", HELLO_SHA.to_uppercase()),
        );
        let bundle = Bundle::open(&archive).unwrap();
        bundle.verify().unwrap();
    }

    #[test]
    fn test_verify_finds_short_sidecar() {
        let (_tmp, archive) = bundle_dir("resources.sha256", HELLO_SHA);
        assert!(Bundle::open(&archive).unwrap().verify().is_ok());
    }

    #[test]
    fn test_verify_rejects_mismatch() {
        let (_tmp, archive) = bundle_dir("resources.sha256", "deadbeef");
        let err = Bundle::open(&archive).unwrap().verify().unwrap_err();
        assert!(matches!(err, UpdaterError::Bundle(_)));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_open_requires_sidecar() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("resources.tar.gz");
        fs::write(&archive, "x").unwrap();
        assert!(Bundle::open(&archive).is_err());
        assert!(Bundle::open(tmp.path().join("missing.tar.gz")).is_err());
    }

    #[test]
    fn test_extract_invokes_tar() {
        let (tmp, archive) = bundle_dir("resources.sha256", HELLO_SHA);
        let dest = tmp.path().join("out");
        let runner = RecordingRunner::new();

        Bundle::open(&archive).unwrap().extract(&dest, &runner).unwrap();

        assert!(dest.is_dir());
        assert_eq!(
            runner.calls(),
            vec![format!("tar -xzf {} -C {}", archive.display(), dest.display())]
        );
    }

    #[test]
    fn test_extract_failure_is_bundle_error() {
        let (tmp, archive) = bundle_dir("resources.sha256", HELLO_SHA);
        let runner = RecordingRunner::new();
        runner.fail_on("tar", "gzip: stdin: not in gzip format");

        let err = Bundle::open(&archive)
            .unwrap()
            .extract(&tmp.path().join("out"), &runner)
            .unwrap_err();
        assert!(err.to_string().contains("not in gzip format"));
    }
}
