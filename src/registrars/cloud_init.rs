//! cloud-init registrar
//!
//! The appliance is provisioned by this updater, so cloud-init is stopped,
//! disabled and fenced off with its `cloud-init.disabled` marker.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::fileops::remove_path;
use super::services::UnitState;
use crate::engine::{Action, Reversible, Transaction};
use crate::exec::SharedRunner;
use crate::paths::SystemPaths;

/// Units stopped and disabled, in order
pub const CLOUD_INIT_UNITS: &[&str] =
    &["cloud-init", "cloud-final", "cloud-config", "cloud-init-local"];

/// Stops cloud-init and writes its disable marker
pub struct CloudInitDisable {
    marker: PathBuf,
    prior_marker: Option<Vec<u8>>,
    units: Vec<UnitState>,
    runner: SharedRunner,
}

impl CloudInitDisable {
    pub fn capture(marker: impl Into<PathBuf>, runner: SharedRunner) -> Result<Self> {
        let marker = marker.into();
        let prior_marker = match fs::read(&marker) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", marker.display()));
            }
        };

        let mut units = Vec::with_capacity(CLOUD_INIT_UNITS.len());
        for &unit in CLOUD_INIT_UNITS {
            let output = runner.run("systemctl", &["is-enabled", unit])?;
            units.push(UnitState {
                name: unit.to_string(),
                was_enabled: output.success && output.stdout.trim() == "enabled",
            });
        }

        Ok(Self {
            marker,
            prior_marker,
            units,
            runner,
        })
    }

    pub fn units(&self) -> &[UnitState] {
        &self.units
    }
}

impl Reversible for CloudInitDisable {
    fn apply(&self) -> Result<()> {
        for unit in &self.units {
            for verb in ["stop", "disable"] {
                if let Err(e) = self.runner.check("systemctl", &[verb, &unit.name]) {
                    debug!("{} {} ignored: {:#}", verb, unit.name, e);
                }
            }
        }

        if let Some(dir) = self.marker.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        fs::write(&self.marker, "disabled\n")
            .with_context(|| format!("Failed to create marker {}", self.marker.display()))?;

        info!("cloud-init disabled");
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        match &self.prior_marker {
            Some(bytes) => fs::write(&self.marker, bytes)
                .with_context(|| format!("Failed to restore {}", self.marker.display()))?,
            None => remove_path(&self.marker)?,
        }

        // Units are re-enabled for the next boot, not started
        for unit in self.units.iter().filter(|u| u.was_enabled) {
            if let Err(e) = self.runner.check("systemctl", &["enable", &unit.name]) {
                warn!("re-enable {} failed: {:#}", unit.name, e);
            }
        }
        Ok(())
    }
}

/// Register the cloud-init disable action
pub fn register_cloud_init_actions(
    txn: &mut Transaction,
    paths: &SystemPaths,
    runner: &SharedRunner,
) -> Result<()> {
    let disable = CloudInitDisable::capture(paths.cloud_init_marker(), runner.clone())?;
    txn.add(Action::new("disable cloud-init", disable))?;
    Ok(())
}
