//! Well-known host paths the updater reads and writes
//!
//! Everything the registrars touch outside the bundle's own file mappings is
//! resolved here, so tests and staging runs can point the whole updater at a
//! scratch root with [`SystemPaths::under`].

use std::path::{Path, PathBuf};

/// Default MIMO installation root
pub const DEFAULT_MIMO_ROOT: &str = "/usr/local/mimo";

/// Resolved host paths for one update run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    /// `/etc/default/grub`
    pub grub_default: PathBuf,
    /// initramfs `init-top` hook printing the boot banner
    pub initramfs_hook: PathBuf,
    /// Dynamic MOTD script directory
    pub motd_dir: PathBuf,
    /// Where MOTD scripts are parked while disabled
    pub motd_backup: PathBuf,
    /// cloud-init configuration directory holding the disable marker
    pub cloud_dir: PathBuf,
    /// Profile snippet exporting `MIMO_ROOT`
    pub profile_script: PathBuf,
    /// Single-run lock file
    pub lock_file: PathBuf,
    /// RPC socket of the running SPDK target
    pub spdk_socket: PathBuf,
    /// Where the running target's configuration is saved before a restart
    pub spdk_saved_config: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self::under(Path::new("/"))
    }
}

impl SystemPaths {
    /// Resolve every path below `root` instead of `/`
    pub fn under(root: &Path) -> Self {
        let at = |p: &str| root.join(p);
        Self {
            grub_default: at("etc/default/grub"),
            initramfs_hook: at("etc/initramfs-tools/scripts/init-top/mimo-msg"),
            motd_dir: at("etc/update-motd.d"),
            motd_backup: at("var/lib/mimo/motd-backup"),
            cloud_dir: at("etc/cloud"),
            profile_script: at("etc/profile.d/mimo_root.sh"),
            lock_file: at("run/mimo-update.lock"),
            spdk_socket: at("var/tmp/spdk.sock"),
            spdk_saved_config: at("tmp/spdk_full_config.json"),
        }
    }

    /// The cloud-init disable marker
    pub fn cloud_init_marker(&self) -> PathBuf {
        self.cloud_dir.join("cloud-init.disabled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_are_host_paths() {
        let paths = SystemPaths::default();
        assert_eq!(paths.grub_default, PathBuf::from("/etc/default/grub"));
        assert_eq!(paths.lock_file, PathBuf::from("/run/mimo-update.lock"));
        assert_eq!(
            paths.cloud_init_marker(),
            PathBuf::from("/etc/cloud/cloud-init.disabled")
        );
    }

    #[test]
    fn test_under_rebases_every_path() {
        let paths = SystemPaths::under(Path::new("/srv/stage"));
        assert_eq!(paths.motd_dir, PathBuf::from("/srv/stage/etc/update-motd.d"));
        assert_eq!(
            paths.spdk_saved_config,
            PathBuf::from("/srv/stage/tmp/spdk_full_config.json")
        );
    }
}
