//! Registry of live pods and the entry point for creating them.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use podlite_shared::constants::network::NETWORK_POD_NAME;
use podlite_shared::constants::isolators;
use podlite_shared::constants::pod::{ENTER_ACK_TIMEOUT, STAGER_STOP_TIMEOUT};
use podlite_shared::container::ContainerFactory;
use podlite_shared::schema::{namespaces, validate_ac_name, Namespace, PodManifest};
use podlite_shared::{PodliteError, PodliteResult};

use super::pod::{Pod, PodOptions};
use crate::images::ImageManager;
use crate::network::NetworkManager;

/// Settings shared by the manager and its pods.
#[derive(Debug, Clone)]
pub struct Options {
    /// Parent of every pod directory.
    pub pod_directory: PathBuf,
    /// Backing directories of non-host volumes.
    pub volume_directory: PathBuf,
    /// Pods get cgroups at `/<parent_cgroup_name>/<short id>`.
    pub parent_cgroup_name: String,
    /// Stager image used when a create call names none.
    pub default_stager_hash: String,
    /// Daemon API socket exposed by the `host/api-access` isolator.
    pub host_socket_file: PathBuf,
    /// Namespaces a pod's namespace isolator may not set to `host`.
    pub required_namespaces: Vec<Namespace>,
    /// Fallback DNS configuration when no driver reports one.
    pub host_resolv_conf: PathBuf,
    pub stager_stop_timeout: Duration,
    pub enter_ack_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pod_directory: PathBuf::from("/var/lib/podlite/pods"),
            volume_directory: PathBuf::from("/var/lib/podlite/volumes"),
            parent_cgroup_name: "podlite".to_string(),
            default_stager_hash: String::new(),
            host_socket_file: PathBuf::from("/var/lib/podlite.sock"),
            required_namespaces: Vec::new(),
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
            stager_stop_timeout: STAGER_STOP_TIMEOUT,
            enter_ack_timeout: ENTER_ACK_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Registry {
    pods: HashMap<String, Arc<Pod>>,
    /// Pod name to uuid.
    names: HashMap<String, String>,
}

/// Creates pods and tracks the ones that are live.
///
/// The registry lock is only held for short register and unregister
/// operations; when both are needed it is taken before a pod's own lock.
pub struct Manager {
    opts: Options,
    image_manager: Arc<dyn ImageManager>,
    network_manager: OnceLock<Arc<dyn NetworkManager>>,
    factory: Arc<dyn ContainerFactory>,
    registry: RwLock<Registry>,
    volume_lock: Mutex<()>,
}

impl Manager {
    pub fn new(
        opts: Options,
        image_manager: Arc<dyn ImageManager>,
        network_manager: Option<Arc<dyn NetworkManager>>,
        factory: Arc<dyn ContainerFactory>,
    ) -> PodliteResult<Arc<Self>> {
        for dir in [&opts.pod_directory, &opts.volume_directory] {
            fs::create_dir_all(dir).map_err(|e| {
                PodliteError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let network = OnceLock::new();
        if let Some(nm) = network_manager {
            let _ = network.set(nm);
        }

        Ok(Arc::new(Self {
            opts,
            image_manager,
            network_manager: network,
            factory,
            registry: RwLock::new(Registry::default()),
            volume_lock: Mutex::new(()),
        }))
    }

    /// Sets the network manager when it could not be passed to [`Manager::new`]
    /// because it needs the manager itself. Only the first call has an effect.
    pub fn set_network_manager(&self, network_manager: Arc<dyn NetworkManager>) {
        if self.network_manager.set(network_manager).is_err() {
            tracing::warn!("Network manager already set, ignoring");
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub(super) fn image_manager(&self) -> &dyn ImageManager {
        self.image_manager.as_ref()
    }

    pub(super) fn network_manager(&self) -> Option<&Arc<dyn NetworkManager>> {
        self.network_manager.get()
    }

    pub(super) fn factory(&self) -> &dyn ContainerFactory {
        self.factory.as_ref()
    }

    /// Checks that a manifest can run on this host.
    fn validate(&self, manifest: &PodManifest) -> PodliteResult<()> {
        if manifest.apps.is_empty() {
            return Err(PodliteError::Validation(
                "the manifest must specify an App".into(),
            ));
        }

        for app in &manifest.apps {
            let image = self.image_manager.get_image(&app.image.id).ok_or_else(|| {
                PodliteError::Validation(format!(
                    "unable to load the ImageManifest for app {:?}",
                    app.name
                ))
            })?;
            if app.app.is_none() && image.app.is_none() {
                return Err(PodliteError::Validation(format!(
                    "no App sets in the pod or image manifest for app {:?}",
                    app.name
                )));
            }
        }

        if let Some(ns) = namespaces(&manifest.isolators)? {
            for required in &self.opts.required_namespaces {
                if ns.is_host(*required) {
                    return Err(PodliteError::Validation(format!(
                        "the manifest {} isolator must require the {} namespace",
                        isolators::LINUX_NAMESPACES,
                        required
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validates and registers a pod, then starts it in the background.
    ///
    /// Returns as soon as the pod is registered; it will be `STARTING` or
    /// later. Must be called within a Tokio runtime.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        manifest: PodManifest,
        options: PodOptions,
    ) -> PodliteResult<Arc<Pod>> {
        self.validate(&manifest)?;

        let mut options = options;
        if options.stager_hash.is_empty() {
            options.stager_hash = self.opts.default_stager_hash.clone();
        }

        let pod = Pod::new(Arc::clone(self), name, manifest);

        {
            let mut registry = self.registry.write();
            // Checked under the same lock as the insert.
            if registry.names.contains_key(name) {
                return Err(PodliteError::AlreadyExists(format!(
                    "a pod with the name {:?} already exists",
                    name
                )));
            }
            registry.pods.insert(pod.uuid().to_string(), Arc::clone(&pod));
            registry
                .names
                .insert(name.to_string(), pod.uuid().to_string());
        }

        tracing::debug!(pod_id = %pod.uuid(), name, "Launching pod");
        Pod::start(Arc::clone(&pod), options);
        Ok(pod)
    }

    pub fn pods(&self) -> Vec<Arc<Pod>> {
        self.registry.read().pods.values().cloned().collect()
    }

    pub fn pod(&self, uuid: &str) -> Option<Arc<Pod>> {
        self.registry.read().pods.get(uuid).cloned()
    }

    pub fn pod_by_name(&self, name: &str) -> Option<Arc<Pod>> {
        let registry = self.registry.read();
        registry
            .names
            .get(name)
            .and_then(|uuid| registry.pods.get(uuid))
            .cloned()
    }

    /// Stops every pod, leaving the networking pod for last so drivers can
    /// still deprovision the others.
    pub async fn shutdown(&self) {
        let (network_pod, others): (Vec<_>, Vec<_>) = self
            .pods()
            .into_iter()
            .partition(|pod| pod.name() == NETWORK_POD_NAME);

        tracing::info!(count = others.len(), "Stopping pods");
        join_all(others.iter().map(|pod| pod.stop())).await;

        for pod in network_pod {
            pod.stop().await;
        }
    }

    pub(super) fn remove(&self, pod: &Pod) {
        let mut registry = self.registry.write();
        let _inner = pod.lock_inner();
        registry.pods.remove(pod.uuid());
        registry.names.remove(pod.name());
    }

    /// Host directory backing the named volume, created on first use.
    pub(super) fn get_volume_path(&self, name: &str) -> PodliteResult<PathBuf> {
        validate_ac_name(name).map_err(|_| {
            PodliteError::Validation("invalid characters present in volume name".into())
        })?;

        let path = self.opts.volume_directory.join(name);

        let _guard = self.volume_lock.lock();
        match fs::DirBuilder::new().mode(0o755).create(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(path)
    }
}
