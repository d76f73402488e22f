//! Daemon configuration and bootstrap.

mod bootstrap;
mod config;

pub use bootstrap::{bootstrap, initial_pod_manifest, Daemon};
pub use config::{DaemonConfig, InitialPod};
