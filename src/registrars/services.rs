//! Service enablement registrar
//!
//! Unit files copied by the bundle's mappings and services named in the init
//! section are enabled and started once everything else is in place. Per-unit
//! `enable`/`start` failures are warnings; a failing `daemon-reload` aborts.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::config::BundleConfig;
use crate::engine::{Action, Reversible, Transaction};
use crate::exec::SharedRunner;

/// A unit and whether it was enabled before the update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitState {
    pub name: String,
    pub was_enabled: bool,
}

/// Enables and starts a set of systemd units
pub struct ServiceEnable {
    units: Vec<UnitState>,
    runner: SharedRunner,
}

impl ServiceEnable {
    /// Query `systemctl is-enabled` for each unit
    pub fn capture(names: Vec<String>, runner: SharedRunner) -> Result<Self> {
        let mut units = Vec::with_capacity(names.len());
        for name in names {
            let output = runner.run("systemctl", &["is-enabled", &name])?;
            let was_enabled = output.success && output.stdout.trim() == "enabled";
            units.push(UnitState { name, was_enabled });
        }
        Ok(Self { units, runner })
    }

    pub fn units(&self) -> &[UnitState] {
        &self.units
    }
}

impl Reversible for ServiceEnable {
    fn apply(&self) -> Result<()> {
        self.runner.check("systemctl", &["daemon-reload"])?;

        for unit in &self.units {
            if let Err(e) = self.runner.check("systemctl", &["enable", &unit.name]) {
                warn!("enable {} failed: {:#}", unit.name, e);
            }
            if let Err(e) = self
                .runner
                .check("systemctl", &["start", "--no-block", &unit.name])
            {
                warn!("start (non-blocking) {} failed: {:#}", unit.name, e);
                continue;
            }
            info!("Service {} enabled", unit.name);
        }
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        for unit in self.units.iter().filter(|u| !u.was_enabled) {
            if let Err(e) = self.runner.check("systemctl", &["disable", "--now", &unit.name]) {
                warn!("disable {} failed: {:#}", unit.name, e);
            }
        }
        if let Err(e) = self.runner.check("systemctl", &["daemon-reload"]) {
            warn!("daemon-reload after disabling services failed: {:#}", e);
        }
        Ok(())
    }
}

/// Units to enable: `.service` destinations first, then init services,
/// without duplicates.
pub fn collect_units(config: &BundleConfig) -> Vec<String> {
    let from_mappings = config
        .file_mappings
        .iter()
        .map(|m| m.dst.as_path())
        .filter(|dst| is_unit_file(dst))
        .filter_map(|dst| dst.file_name())
        .map(|name| name.to_string_lossy().into_owned());

    let mut units: Vec<String> = Vec::new();
    for unit in from_mappings.chain(config.init_services().iter().cloned()) {
        if !units.contains(&unit) {
            units.push(unit);
        }
    }
    units
}

fn is_unit_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("service"))
}

/// Register the service enablement action, if there is anything to enable
pub fn register_service_actions(
    txn: &mut Transaction,
    config: &BundleConfig,
    runner: &SharedRunner,
) -> Result<()> {
    let units = collect_units(config);
    let action = if units.is_empty() {
        None
    } else {
        let enable = ServiceEnable::capture(units, runner.clone())?;
        Some(Action::new("enable services", enable))
    };
    txn.add(action)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileMapping, InitConfig};
    use crate::exec::{CommandOutput, RecordingRunner};
    use std::sync::Arc;

    fn sample_config() -> BundleConfig {
        BundleConfig {
            file_mappings: vec![
                FileMapping::new("file/mimo.service", "/etc/systemd/system/mimo.service"),
                FileMapping::new("file/run.sh", "/usr/local/bin/run.sh"),
                FileMapping::new("file/Agent.SERVICE", "/etc/systemd/system/Agent.SERVICE"),
            ],
            init: Some(InitConfig {
                services: vec!["mimo.service".to_string(), "mimo-init.service".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_collect_units_dedups_in_order() {
        assert_eq!(
            collect_units(&sample_config()),
            vec!["mimo.service", "Agent.SERVICE", "mimo-init.service"]
        );
    }

    #[test]
    fn test_nothing_to_enable_registers_nothing() {
        let runner: SharedRunner = Arc::new(RecordingRunner::new());
        let mut txn = Transaction::new();
        register_service_actions(&mut txn, &BundleConfig::default(), &runner).unwrap();
        assert!(txn.is_empty());
    }

    #[test]
    fn test_apply_reloads_enables_and_starts() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("systemctl enable b.service", "masked");

        let enable = ServiceEnable::capture(
            vec!["a.service".to_string(), "b.service".to_string()],
            runner.clone(),
        )
        .unwrap();
        enable.apply().unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "systemctl is-enabled a.service",
                "systemctl is-enabled b.service",
                "systemctl daemon-reload",
                "systemctl enable a.service",
                "systemctl start --no-block a.service",
                "systemctl enable b.service",
                "systemctl start --no-block b.service",
            ]
        );
    }

    #[test]
    fn test_daemon_reload_failure_fails_apply() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("systemctl daemon-reload", "bus error");

        let enable = ServiceEnable::capture(vec!["a.service".to_string()], runner.clone()).unwrap();
        assert!(enable.apply().is_err());
    }

    #[test]
    fn test_undo_only_disables_newly_enabled_units() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("systemctl is-enabled", "disabled");
        runner.respond("systemctl is-enabled old.service", CommandOutput::ok("enabled\n"));

        let enable = ServiceEnable::capture(
            vec!["old.service".to_string(), "new.service".to_string()],
            runner.clone(),
        )
        .unwrap();
        assert!(enable.units()[0].was_enabled);
        assert!(!enable.units()[1].was_enabled);

        enable.undo().unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"systemctl disable --now new.service".to_string()));
        assert!(!calls.contains(&"systemctl disable --now old.service".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("systemctl daemon-reload"));
    }
}
