//! Registrars: collaborators that inspect the host, capture undo state and
//! contribute actions to a [`Transaction`](crate::engine::Transaction).
//!
//! Each registrar captures everything its compensating operation needs at
//! registration time, before any action runs.

pub mod cloud_init;
pub mod fileops;
pub mod grub;
pub mod init_files;
pub mod motd;
pub mod services;

pub use cloud_init::{register_cloud_init_actions, CloudInitDisable};
pub use fileops::{register_copy_actions, FileCopy, PriorState};
pub use grub::{register_boot_actions, GrubCmdline, InitramfsHook};
pub use init_files::{register_init_actions, InitFileWrite};
pub use motd::{register_motd_actions, MotdBackup};
pub use services::{register_service_actions, ServiceEnable};
