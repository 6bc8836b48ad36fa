use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::bundle::DEFAULT_BUNDLE;
use crate::updater::DEFAULT_WORK_DIR;

/// mimo-update - Transactional updater for MIMO storage appliances
#[derive(Parser, Debug)]
#[command(name = "mimo-update")]
#[command(about = "Install MIMO resource bundles with rollback on failure")]
#[command(version)]
pub struct Cli {
    /// Resource bundle (gzip'd tarball with a .sha256 sidecar)
    #[arg(long, global = true, default_value = DEFAULT_BUNDLE)]
    pub bundle: PathBuf,

    /// Directory the bundle is extracted into; removed afterwards
    #[arg(long, global = true, default_value = DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,

    /// Dry-run mode: verify and extract the bundle, then list the actions
    /// that would run without changing the system.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a resource bundle
    Update {
        #[command(flatten)]
        mode: UpdateMode,
    },
    /// Verify a bundle's checksum and configuration without installing it
    Verify,
}

/// Exactly one of `--sys` / `--target`
#[derive(Args, Debug, Clone, Copy)]
#[group(required = true, multiple = false)]
pub struct UpdateMode {
    /// System update: files, bootloader, MOTD, services, cloud-init
    #[arg(long)]
    pub sys: bool,

    /// Target update: replace the storage target and restart it
    #[arg(long)]
    pub target: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
