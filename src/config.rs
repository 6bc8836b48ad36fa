//! Bundle configuration (`config.json`)
//!
//! The resource bundle ships a `config.json` describing what to copy where,
//! which version files to compare, and optional inline init files:
//!
//! ```json
//! {
//!   "file_mappings": [{ "src": "file/mimo.service", "dst": "/etc/systemd/system/mimo.service" }],
//!   "version": [{ "src": "file/version.json", "dst": "" }, { "src": "", "dst": "/usr/local/mimo/version.json" }],
//!   "init": { "files": [{ "path": "/etc/mimo/env", "content": "A=1\n", "mode": "0644" }], "services": [] }
//! }
//! ```
//!
//! Relative `src` paths are resolved against the extraction directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

/// Version reported when an installed version file is missing or unreadable
pub const DEFAULT_VERSION: &str = "v0.0.0";

/// A single source → destination copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    pub src: PathBuf,
    pub dst: PathBuf,
}

impl FileMapping {
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

/// Kind of an inline init file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InitFileKind {
    Script,
    Service,
    Config,
    Text,
}

/// An init file whose content is embedded in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFile {
    /// Final location on the system
    pub path: PathBuf,
    /// File content
    #[serde(default)]
    pub content: String,
    /// Octal permission string such as "0755"
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<InitFileKind>,
    /// Directories are created implicitly by their files and skipped
    #[serde(default)]
    pub is_dir: bool,
}

impl InitFile {
    /// Permission bits, defaulting to 0644 when absent or unparsable
    pub fn mode_bits(&self) -> u32 {
        self.mode
            .as_deref()
            .and_then(|m| u32::from_str_radix(m.trim(), 8).ok())
            .unwrap_or(0o644)
    }
}

/// Inline init files plus services to enable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default)]
    pub files: Vec<InitFile>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Contents of the bundle's `config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default)]
    pub file_mappings: Vec<FileMapping>,
    #[serde(default)]
    pub version: Vec<FileMapping>,
    #[serde(default)]
    pub init: Option<InitConfig>,
}

impl BundleConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Make relative mapping sources absolute under `base`
    pub fn resolve_sources(&mut self, base: &Path) {
        for mapping in self.file_mappings.iter_mut().chain(self.version.iter_mut()) {
            if !mapping.src.as_os_str().is_empty() && mapping.src.is_relative() {
                mapping.src = base.join(&mapping.src);
            }
        }
    }

    /// Validate the file mappings
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for mapping in &self.file_mappings {
            if mapping.src.as_os_str().is_empty() {
                anyhow::bail!("File mapping to {:?} has an empty source", mapping.dst);
            }
            if !mapping.dst.is_absolute() {
                anyhow::bail!("File mapping destination {:?} must be absolute", mapping.dst);
            }
            // Two actions restoring the same path would clobber each other's backups
            if !seen.insert(mapping.dst.clone()) {
                anyhow::bail!("Destination {:?} is mapped more than once", mapping.dst);
            }
        }

        if let Some(init) = &self.init {
            for file in init.files.iter().filter(|f| !f.is_dir) {
                if !file.path.is_absolute() {
                    anyhow::bail!("Init file path {:?} must be absolute", file.path);
                }
                if !seen.insert(file.path.clone()) {
                    anyhow::bail!("Init file {:?} collides with another destination", file.path);
                }
            }
        }

        Ok(())
    }

    /// The (bundled, installed) version file pair.
    ///
    /// The first entry's `src` is the version file shipped in the bundle, the
    /// second entry's `dst` is the installed one.
    pub fn version_files(&self) -> Result<(PathBuf, PathBuf)> {
        match self.version.as_slice() {
            [bundled, installed, ..] => Ok((bundled.src.clone(), installed.dst.clone())),
            _ => anyhow::bail!("Version config malformed: need src and dst entries"),
        }
    }

    /// Services declared by the init section
    pub fn init_services(&self) -> &[String] {
        self.init.as_ref().map(|i| i.services.as_slice()).unwrap_or(&[])
    }
}

#[derive(Deserialize)]
struct VersionFile {
    #[serde(rename = "MIMO", default)]
    mimo: String,
}

/// Read the `MIMO` field of a version file, or `DEFAULT_VERSION`
pub fn read_mimo_version(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<VersionFile>(&content).ok())
        .map(|v| v.mimo)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_VERSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "file_mappings": [
            { "src": "file/mimo.service", "dst": "/etc/systemd/system/mimo.service" },
            { "src": "/abs/run.sh", "dst": "/usr/local/bin/run.sh" }
        ],
        "version": [
            { "src": "file/version.json", "dst": "" },
            { "src": "", "dst": "/usr/local/mimo/version.json" }
        ],
        "init": {
            "files": [
                { "path": "/etc/mimo/env", "content": "A=1\n", "mode": "0600", "type": "config" },
                { "path": "/etc/mimo", "is_dir": true }
            ],
            "services": ["mimo-init.service"]
        }
    }"#;

    fn load_sample() -> BundleConfig {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(SAMPLE.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        BundleConfig::load_from_file(temp_file.path()).unwrap()
    }

    #[test]
    fn test_load_sample_config() {
        let config = load_sample();
        assert_eq!(config.file_mappings.len(), 2);
        assert_eq!(config.init_services(), ["mimo-init.service"]);

        let init = config.init.as_ref().unwrap();
        assert_eq!(init.files[0].kind, Some(InitFileKind::Config));
        assert_eq!(init.files[0].mode_bits(), 0o600);
        assert!(init.files[1].is_dir);
    }

    #[test]
    fn test_missing_sections_default_to_empty() {
        let config: BundleConfig = serde_json::from_str("{}").unwrap();
        assert!(config.file_mappings.is_empty());
        assert!(config.init_services().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = BundleConfig::load_from_file("/nonexistent/config.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration"));
    }

    #[test]
    fn test_resolve_sources_only_touches_relative_paths() {
        let mut config = load_sample();
        config.resolve_sources(Path::new("/tmp/mimo-output"));

        assert_eq!(
            config.file_mappings[0].src,
            PathBuf::from("/tmp/mimo-output/file/mimo.service")
        );
        assert_eq!(config.file_mappings[1].src, PathBuf::from("/abs/run.sh"));
        assert_eq!(config.version[1].src, PathBuf::new(), "empty src stays empty");
    }

    #[test]
    fn test_validate_rejects_duplicate_destinations() {
        let config = BundleConfig {
            file_mappings: vec![
                FileMapping::new("a", "/etc/x.conf"),
                FileMapping::new("b", "/etc/x.conf"),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_rejects_relative_destination() {
        let config = BundleConfig {
            file_mappings: vec![FileMapping::new("a", "etc/x.conf")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_version_files_requires_two_entries() {
        let config = load_sample();
        let (bundled, installed) = config.version_files().unwrap();
        assert_eq!(bundled, PathBuf::from("file/version.json"));
        assert_eq!(installed, PathBuf::from("/usr/local/mimo/version.json"));

        let short = BundleConfig {
            version: vec![FileMapping::new("v.json", "")],
            ..Default::default()
        };
        assert!(short.version_files().is_err());
    }

    #[test]
    fn test_mode_bits_fallback() {
        let file = InitFile {
            path: PathBuf::from("/etc/a"),
            content: String::new(),
            mode: Some("rwx".to_string()),
            kind: None,
            is_dir: false,
        };
        assert_eq!(file.mode_bits(), 0o644);
    }

    #[test]
    fn test_read_mimo_version() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{"MIMO": "V2.3"}"#).unwrap();
        temp_file.flush().unwrap();
        assert_eq!(read_mimo_version(temp_file.path()), "V2.3");

        assert_eq!(read_mimo_version(Path::new("/nonexistent")), DEFAULT_VERSION);

        let mut empty = NamedTempFile::new().unwrap();
        empty.write_all(br#"{"MIMO": ""}"#).unwrap();
        empty.flush().unwrap();
        assert_eq!(read_mimo_version(empty.path()), DEFAULT_VERSION);
    }
}
