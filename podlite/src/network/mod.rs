//! Pod networking through driver pods.
//!
//! Each configured driver runs as an app of the `podlite-networking` pod.
//! Provisioning a pod creates a network namespace for it and calls every
//! selected driver's `add` command inside the driver pod with
//! `[netns path, pod uuid, interface name]` as arguments and the driver's
//! configuration on stdin. Deprovisioning calls `del` the same way.

mod call;
mod iface;
mod manager;
mod netns;

use std::path::PathBuf;

use async_trait::async_trait;
use podlite_shared::schema::{IpResult, NetConf, RuntimeImage};
use podlite_shared::PodliteResult;

use crate::pod::Pod;

pub use iface::interface_name;
pub use manager::{DriverManager, NetworkOptions};
pub use netns::{BindMountNamespaces, NamespaceCreator};

/// A driver to launch in the networking pod.
#[derive(Debug, Clone)]
pub struct NetworkDriver {
    pub image: RuntimeImage,
    pub config: NetConf,
}

/// Outcome of [`NetworkManager::provision`].
#[derive(Debug, Clone, Default)]
pub struct Provisioned {
    /// Host path of the pod's network namespace.
    pub netns_path: PathBuf,
    /// One entry per driver that attached an interface.
    pub results: Vec<IpResult>,
}

#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Launches the networking pod with one app per driver.
    async fn setup(&self, drivers: Vec<NetworkDriver>) -> PodliteResult<()>;

    /// Creates the pod's network namespace and attaches `networks`, or the
    /// default drivers when empty. Driver failures are logged and skipped.
    async fn provision(&self, pod: &Pod, networks: &[String]) -> PodliteResult<Provisioned>;

    /// Detaches every driver that provisioned the pod and removes its
    /// network namespace.
    async fn deprovision(&self, pod: &Pod) -> PodliteResult<()>;
}
