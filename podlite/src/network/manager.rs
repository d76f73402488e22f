//! Driver-pod backed [`NetworkManager`].

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use podlite_shared::constants::network::{
    ADD_CMD, CALL_TIMEOUT, DEL_CMD, NETNS_MOUNT_PATH, NETNS_VOLUME, NETWORK_POD_NAME,
    POD_START_TIMEOUT,
};
use podlite_shared::constants::stager::VOLUMES_DIR;
use podlite_shared::container::MountConfig;
use podlite_shared::schema::{
    IpResult, LinuxNamespaces, Mount, Namespace, NamespaceMode, NetConf, PodManifest, RuntimeApp,
    Volume,
};
use podlite_shared::{PodliteError, PodliteResult};
use tempfile::TempDir;

use super::call::call;
use super::iface::interface_name;
use super::netns::NamespaceCreator;
use super::{NetworkDriver, NetworkManager, Provisioned};
use crate::pod::{ContainerIo, Manager, Pod, PodOptions, PodState};

#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Where per-pod namespaces are pinned; a fresh directory under the
    /// system temp dir when unset.
    pub netns_directory: Option<PathBuf>,
    /// Deadline for one driver call.
    pub call_timeout: Duration,
    /// How long `setup` waits for the networking pod.
    pub pod_start_timeout: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            netns_directory: None,
            call_timeout: CALL_TIMEOUT,
            pod_start_timeout: POD_START_TIMEOUT,
        }
    }
}

struct Driver {
    config: NetConf,
    /// Pod uuid to the interface this driver attached to it.
    pod_interfaces: Mutex<HashMap<String, String>>,
}

#[derive(Default)]
struct DriverSet {
    /// In setup order; provisioning walks them sequentially.
    drivers: Vec<Arc<Driver>>,
    defaults: Vec<String>,
}

impl DriverSet {
    fn get(&self, name: &str) -> Option<Arc<Driver>> {
        self.drivers.iter().find(|d| d.config.name == name).cloned()
    }
}

/// Runs network drivers as apps of the `podlite-networking` pod.
pub struct DriverManager {
    pods: Weak<Manager>,
    namespaces: Arc<dyn NamespaceCreator>,
    netns_dir: PathBuf,
    /// Holds the driver configurations handed to the driver apps on stdin.
    config_dir: TempDir,
    opts: NetworkOptions,
    drivers: RwLock<DriverSet>,
    /// Weak so the pod manager and this manager do not keep each other alive
    /// through it; a stopped networking pod leaves the registry.
    network_pod: Mutex<Option<Weak<Pod>>>,
}

impl DriverManager {
    /// Creates the manager and its namespace directory. The pod manager is
    /// held weakly since pods hold the pod manager and it holds this.
    pub fn new(
        pods: &Arc<Manager>,
        namespaces: Arc<dyn NamespaceCreator>,
        opts: NetworkOptions,
    ) -> PodliteResult<Arc<Self>> {
        let netns_dir = match &opts.netns_directory {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!(
                "podlite-netns-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            )),
        };
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o770)
            .create(&netns_dir)
            .map_err(|e| {
                PodliteError::Network(format!(
                    "failed to generate network namespace temp path: {}",
                    e
                ))
            })?;
        namespaces.prepare_dir(&netns_dir)?;

        let config_dir = tempfile::Builder::new()
            .prefix("podlite-netconf")
            .tempdir()
            .map_err(|e| {
                PodliteError::Network(format!("failed to create driver config directory: {}", e))
            })?;

        Ok(Arc::new(Self {
            pods: Arc::downgrade(pods),
            namespaces,
            netns_dir,
            config_dir,
            opts,
            drivers: RwLock::new(DriverSet::default()),
            network_pod: Mutex::new(None),
        }))
    }

    pub fn netns_dir(&self) -> &Path {
        &self.netns_dir
    }

    /// The networking pod, once setup has brought it up.
    pub fn network_pod(&self) -> Option<Arc<Pod>> {
        self.network_pod.lock().as_ref().and_then(Weak::upgrade)
    }

    fn netns_path(&self, pod: &Pod) -> PathBuf {
        self.netns_dir.join(pod.uuid())
    }

    /// Manifest and options of the networking pod, which shares every host
    /// namespace and sees the namespace directory as a volume.
    fn network_pod_spec(&self) -> (PodManifest, PodOptions) {
        let mut manifest = PodManifest::blank();
        let namespaces = [
            Namespace::Ipc,
            Namespace::Net,
            Namespace::User,
            Namespace::Uts,
            Namespace::Pid,
        ]
        .into_iter()
        .fold(LinuxNamespaces::default(), |ns, kind| {
            ns.with(kind, NamespaceMode::Host)
        });
        manifest.isolators.push(namespaces.to_isolator());

        let source = self.netns_dir.display().to_string();
        let options = PodOptions {
            raw_volumes: vec![Volume::host(NETNS_VOLUME, source.clone(), false)],
            stager_mounts: vec![MountConfig::bind(
                source,
                format!("{}/{}", VOLUMES_DIR, NETNS_VOLUME),
            )],
            ..Default::default()
        };
        (manifest, options)
    }

    fn write_driver_config(&self, config: &NetConf) -> PodliteResult<PathBuf> {
        let path = self.config_dir.path().join(format!("{}.json", config.name));
        fs::write(&path, config.raw_bytes()).map_err(|e| {
            PodliteError::Network(format!("failed to write configuration for {:?}: {}", config.name, e))
        })?;
        Ok(path)
    }

    /// Arguments every driver command receives.
    fn driver_args(driver: &Driver, pod: &Pod) -> Vec<String> {
        let iface = driver
            .pod_interfaces
            .lock()
            .get(pod.uuid())
            .cloned()
            .unwrap_or_default();
        vec![
            format!("{}/{}", NETNS_MOUNT_PATH, pod.uuid()),
            pod.uuid().to_string(),
            iface,
        ]
    }

    async fn call_driver(
        &self,
        network_pod: &Pod,
        driver: &Driver,
        pod: &Pod,
        exec: &str,
    ) -> PodliteResult<Vec<u8>> {
        let args = Self::driver_args(driver, pod);
        call(
            network_pod,
            &driver.config.name,
            exec,
            &args,
            &driver.config.raw_bytes(),
            self.opts.call_timeout,
        )
        .await
        .map_err(|e| match e {
            PodliteError::CallTimeout => e,
            e => PodliteError::Network(format!(
                "Failed to provision network with {:?}: {}",
                driver.config.name, e
            )),
        })
    }
}

#[async_trait]
impl NetworkManager for DriverManager {
    async fn setup(&self, drivers: Vec<NetworkDriver>) -> PodliteResult<()> {
        if drivers.is_empty() {
            return Ok(());
        }
        let pods = self
            .pods
            .upgrade()
            .ok_or_else(|| PodliteError::InvalidState("pod manager is gone".into()))?;

        let (mut manifest, mut options) = self.network_pod_spec();
        let mut set = DriverSet::default();
        for driver in drivers {
            let name = driver.config.name.clone();
            manifest.apps.push(RuntimeApp {
                name: name.clone(),
                image: driver.image,
                app: None,
                mounts: vec![Mount {
                    volume: NETNS_VOLUME.to_string(),
                    path: NETNS_MOUNT_PATH.to_string(),
                }],
            });

            let config_path = self.write_driver_config(&driver.config)?;
            options
                .container_io
                .insert(name.clone(), ContainerIo::stdin(config_path));

            if driver.config.default {
                set.defaults.push(name);
            }
            set.drivers.push(Arc::new(Driver {
                config: driver.config,
                pod_interfaces: Mutex::new(HashMap::new()),
            }));
        }
        *self.drivers.write() = set;

        let pod = pods
            .create(NETWORK_POD_NAME, manifest, options)
            .map_err(|e| PodliteError::Network(format!("failed to launch network pod: {}", e)))?;
        pod.wait_for_state(
            self.opts.pod_start_timeout,
            &[PodState::Running, PodState::Stopped, PodState::Errored],
        )
        .await
        .map_err(|e| {
            PodliteError::Network(format!("failed to wait for network pod to start: {}", e))
        })?;

        let state = pod.state();
        if state != PodState::Running {
            return Err(PodliteError::Network(format!(
                "network pod failed to be running, is in the {} state",
                state
            )));
        }
        tracing::debug!(pod_id = %pod.uuid(), "Network pod provisioned and running");
        *self.network_pod.lock() = Some(Arc::downgrade(&pod));
        Ok(())
    }

    async fn provision(&self, pod: &Pod, networks: &[String]) -> PodliteResult<Provisioned> {
        let selected = {
            let set = self.drivers.read();
            let names = if networks.is_empty() {
                set.defaults.as_slice()
            } else {
                networks
            };
            names
                .iter()
                .map(|name| {
                    set.get(name).ok_or_else(|| {
                        PodliteError::Network(format!("network {:?} does not exist", name))
                    })
                })
                .collect::<PodliteResult<Vec<_>>>()?
        };

        let netns_path = self.netns_path(pod);
        self.namespaces.create(&netns_path).map_err(|e| {
            PodliteError::Network(format!("failed to create network namespace: {}", e))
        })?;

        let Some(network_pod) = self.network_pod() else {
            tracing::trace!(pod_id = %pod.uuid(), "Network provisioning skipped, no network pod");
            return Ok(Provisioned {
                netns_path,
                results: Vec::new(),
            });
        };

        let mut results: Vec<IpResult> = Vec::new();
        for driver in selected {
            let name = &driver.config.name;
            let iface = match interface_name(&driver.config.container_interface, pod.uuid(), &results) {
                Ok(iface) => iface,
                Err(e) => {
                    tracing::warn!(driver = %name, error = %e, "Failed to generate interface name");
                    continue;
                }
            };
            driver
                .pod_interfaces
                .lock()
                .insert(pod.uuid().to_string(), iface.clone());

            let output = match self.call_driver(&network_pod, &driver, pod, ADD_CMD).await {
                Ok(output) => output,
                Err(e) if e.is_timeout() => {
                    tracing::warn!(driver = %name, pod_id = %pod.uuid(), "Provision call timed out");
                    continue;
                }
                Err(e) => {
                    tracing::error!(driver = %name, pod_id = %pod.uuid(), error = %e, "Provision call failed");
                    continue;
                }
            };

            let mut result: IpResult = match serde_json::from_slice(&output) {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(driver = %name, error = %e, "Driver returned an invalid result");
                    continue;
                }
            };
            result.name = name.clone();
            result.container_interface = iface;
            tracing::trace!(driver = %result.name, iface = %result.container_interface, "Provisioned networking");
            results.push(result);
        }

        Ok(Provisioned {
            netns_path,
            results,
        })
    }

    async fn deprovision(&self, pod: &Pod) -> PodliteResult<()> {
        if let Some(network_pod) = self.network_pod() {
            let drivers = self.drivers.read().drivers.clone();
            for driver in drivers {
                let attached = driver.pod_interfaces.lock().contains_key(pod.uuid());
                if !attached {
                    continue;
                }

                match self.call_driver(&network_pod, &driver, pod, DEL_CMD).await {
                    Ok(_) => {}
                    Err(e) if e.is_timeout() => {
                        tracing::warn!(driver = %driver.config.name, pod_id = %pod.uuid(), "Teardown call timed out");
                    }
                    Err(e) => {
                        tracing::error!(driver = %driver.config.name, pod_id = %pod.uuid(), error = %e, "Teardown call failed");
                    }
                }
                driver.pod_interfaces.lock().remove(pod.uuid());
            }
        }

        self.namespaces.delete(&self.netns_path(pod)).map_err(|e| {
            PodliteError::Network(format!("failed to cleanup network namespace: {}", e))
        })
    }
}
