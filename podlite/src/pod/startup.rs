//! Pod startup pipeline.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use podlite_shared::constants::isolators::{HOST_API_ACCESS, HOST_PRIVILEGED};
use podlite_shared::constants::pod::STAGER_LOG;
use podlite_shared::constants::stager::{MANIFEST_PATH, READY_SOCKET, VOLUMES_DIR};
use podlite_shared::container::{
    Capabilities, ContainerConfig, MountConfig, NamespaceConfig, ProcessSpec,
};
use podlite_shared::pipeline::Pipeline;
use podlite_shared::schema::{
    flag_enabled, namespaces, App, IpResult, Namespace, RuntimeApp, StagerManifest, VolumeKind,
};
use podlite_shared::{PodliteError, PodliteResult, VERSION};
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;

use super::config;
use super::dns;
use super::fsutil::{copy_tree, mkdirs};
use super::isolators::{self, Grants};
use super::pod::{Pod, PodOptions};

/// Working state of one startup run, owned by the startup task.
pub(super) struct StartupCtx {
    pod: Arc<Pod>,
    options: PodOptions,
    manifest: StagerManifest,
    stager_app: Option<App>,
    stager_path: PathBuf,
    layer_paths: BTreeMap<String, PathBuf>,
    skip_networking: bool,
    netns_path: Option<PathBuf>,
    network_results: Vec<IpResult>,
}

/// Declares a startup step that refuses to run once the pod is stopping.
macro_rules! startup_task {
    ($ty:ident, $name:literal, $method:ident) => {
        struct $ty;

        #[async_trait::async_trait]
        impl podlite_shared::pipeline::PipelineTask<StartupCtx> for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            async fn run(&self, ctx: &mut StartupCtx) -> PodliteResult<()> {
                ctx.ensure_live()?;
                ctx.$method().await
            }
        }
    };
}

startup_task!(GetStager, "get_stager", get_stager);
startup_task!(DependencySet, "dependency_set", dependency_set);
startup_task!(BaseDirectories, "base_directories", base_directories);
startup_task!(ApplyIsolators, "apply_isolators", apply_isolators);
startup_task!(Network, "network", network);
startup_task!(ResolvConf, "resolv_conf", resolv_conf);
startup_task!(InitializeContainer, "initialize_container", initialize_container);
startup_task!(WriteManifest, "write_manifest", write_manifest);
startup_task!(LaunchStager, "launch_stager", launch_stager);
startup_task!(WaitForReady, "wait_for_ready", wait_for_ready);

pub(super) fn pipeline() -> Pipeline<StartupCtx> {
    Pipeline::new("pod startup")
        .task(GetStager)
        .task(DependencySet)
        .task(BaseDirectories)
        .task(ApplyIsolators)
        .task(Network)
        .task(ResolvConf)
        .task(InitializeContainer)
        .task(WriteManifest)
        .task(LaunchStager)
        .task(WaitForReady)
}

impl StartupCtx {
    pub(super) fn new(pod: Arc<Pod>, options: PodOptions) -> Self {
        let manifest = StagerManifest::new(VERSION, pod.name(), pod.manifest());
        Self {
            pod,
            options,
            manifest,
            stager_app: None,
            stager_path: PathBuf::new(),
            layer_paths: BTreeMap::new(),
            skip_networking: false,
            netns_path: None,
            network_results: Vec::new(),
        }
    }

    fn ensure_live(&self) -> PodliteResult<()> {
        if self.pod.is_shutting_down() {
            return Err(PodliteError::InvalidState("pod is shutting down".into()));
        }
        Ok(())
    }

    fn root(&self) -> PathBuf {
        self.pod.stager_root()
    }

    /// Makes the current pod manifest visible through [`Pod::manifest`].
    fn publish_manifest(&self) {
        self.pod.lock_inner().manifest = self.manifest.pod.clone();
    }

    /// Locates the stager image; it must define an app and have no
    /// dependencies.
    async fn get_stager(&mut self) -> PodliteResult<()> {
        let images = self.pod.manager().image_manager();
        let hash = self.options.stager_hash.clone();

        let image = images.get_image(&hash).ok_or_else(|| {
            PodliteError::NotFound("failed to locate specified stager image".into())
        })?;
        let app = image.app.ok_or_else(|| {
            PodliteError::Validation("the specified stager does not define an \"app\"".into())
        })?;

        let tree = images.resolve_tree(&hash).map_err(|e| {
            PodliteError::Resolution(format!("failed to resolve stager tree: {}", e))
        })?;
        if tree.paths.len() != 1 {
            return Err(PodliteError::Validation(
                "stager image must have no dependencies".into(),
            ));
        }

        self.stager_path = tree.paths.get(&hash).cloned().unwrap_or_default();
        self.stager_app = Some(app);
        Ok(())
    }

    /// Resolves every app's image tree into the stager manifest.
    async fn dependency_set(&mut self) -> PodliteResult<()> {
        let images = self.pod.manager().image_manager();
        let apps = self.manifest.pod.apps.clone();
        for app in &apps {
            let tree = images.resolve_tree(&app.image.id).map_err(|e| {
                PodliteError::Resolution(format!(
                    "failed to resolve dependencies for app {:?}: {}",
                    app.name, e
                ))
            })?;

            self.manifest
                .app_image_order
                .insert(app.name.clone(), tree.order);
            self.manifest.images.extend(tree.manifests);
            self.layer_paths.extend(tree.paths);
        }
        Ok(())
    }

    async fn base_directories(&mut self) -> PodliteResult<()> {
        let root = self.root();
        let directory = root
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| PodliteError::Internal("stager root has no parent".into()))?;

        // Recorded first so teardown removes a partially created tree.
        self.pod.lock_inner().directory = Some(directory.clone());

        mkdirs(&[directory, root.clone(), root.join("tmp")], 0o755, false).map_err(|e| {
            PodliteError::Storage(format!("failed to create base directories: {}", e))
        })?;
        tracing::debug!(pod_id = %self.pod.uuid(), root = %root.display(), "Created pod directories");
        Ok(())
    }

    /// Applies the isolators that need the host's cooperation.
    async fn apply_isolators(&mut self) -> PodliteResult<()> {
        let opts = self.pod.manager().options().clone();
        let mut apps = std::mem::take(&mut self.manifest.pod.apps);

        for app in &mut apps {
            let Some(spec) = self.app_spec(app) else {
                continue;
            };
            let mut grants = Grants::default();

            if flag_enabled(&spec.isolators, HOST_PRIVILEGED) {
                let volumes_dir = Some(opts.volume_directory.as_path())
                    .filter(|p| !p.as_os_str().is_empty());
                grants.extend(isolators::host_privilege(
                    &app.name,
                    &opts.pod_directory,
                    volumes_dir,
                ));
            }

            if flag_enabled(&spec.isolators, HOST_API_ACCESS) {
                let volumes = self.root().join(VOLUMES_DIR.trim_start_matches('/'));
                let dest = volumes.join(isolators::api_socket_volume(&app.name));
                mkdirs(&[volumes], 0o755, true)
                    .and_then(|_| mkdirs(&[dest], 0o755, false))
                    .map_err(|e| {
                        PodliteError::Storage(format!(
                            "failed to create podlite-socket volume: {}",
                            e
                        ))
                    })?;
                grants.extend(isolators::host_api_access(&app.name, &opts.host_socket_file));
            }

            app.mounts.extend(grants.app_mounts);
            self.options.raw_volumes.extend(grants.volumes);
            self.options.stager_mounts.extend(grants.stager_mounts);
        }
        self.manifest.pod.apps = apps;

        if let Some(ns) = namespaces(&self.manifest.pod.isolators)?
            && ns.is_host(Namespace::Net)
        {
            tracing::debug!(pod_id = %self.pod.uuid(), "Pod shares the host network namespace");
            self.skip_networking = true;
            self.pod.lock_inner().skip_networking = true;
        }

        self.publish_manifest();
        Ok(())
    }

    /// The app definition in effect: the pod's override or the image's.
    fn app_spec(&self, app: &RuntimeApp) -> Option<App> {
        app.app.clone().or_else(|| {
            self.manifest
                .images
                .get(&app.image.id)
                .and_then(|image| image.app.clone())
        })
    }

    async fn network(&mut self) -> PodliteResult<()> {
        if self.skip_networking {
            tracing::debug!(pod_id = %self.pod.uuid(), "Skipping stager network configuration");
            return Ok(());
        }
        let Some(network) = self.pod.manager().network_manager().cloned() else {
            tracing::debug!(pod_id = %self.pod.uuid(), "Skipping network provisioning, no network manager");
            return Ok(());
        };

        let provisioned = network
            .provision(&self.pod, &self.options.networks)
            .await
            .map_err(|e| PodliteError::Network(format!("failed to provision networking: {}", e)))?;

        self.netns_path = Some(provisioned.netns_path.clone());
        self.network_results = provisioned.results.clone();
        {
            let mut inner = self.pod.lock_inner();
            inner.netns_path = Some(provisioned.netns_path);
            inner.network_results = provisioned.results;
        }
        tracing::debug!(pod_id = %self.pod.uuid(), "Finished configuring networking");
        Ok(())
    }

    /// Writes the stager's resolv.conf from the network results, falling
    /// back to the host's.
    async fn resolv_conf(&mut self) -> PodliteResult<()> {
        let dns = match dns::from_results(&self.network_results) {
            Some(dns) => dns,
            None => {
                let path = &self.pod.manager().options().host_resolv_conf;
                let content = fs::read_to_string(path).map_err(|e| {
                    PodliteError::Config(format!("failed to parse system resolv.conf: {}", e))
                })?;
                dns::parse_resolv_conf(&content)
            }
        };

        let etc = self.root().join("etc");
        mkdirs(&[&etc], 0o755, true).map_err(|e| {
            PodliteError::Storage(format!("failed to create /etc in stager: {}", e))
        })?;
        fs::write(etc.join("resolv.conf"), dns::render_resolv_conf(&dns)).map_err(|e| {
            PodliteError::Storage(format!("failed to create /etc/resolv.conf for stager: {}", e))
        })?;
        Ok(())
    }

    /// Builds the stager's container configuration and creates the
    /// container. Nothing runs in it yet.
    async fn initialize_container(&mut self) -> PodliteResult<()> {
        let config = self.container_config().map_err(|e| {
            PodliteError::Container(format!("failed to generate stager configuration: {}", e))
        })?;

        let container = self
            .pod
            .manager()
            .factory()
            .create(self.pod.short_name(), config)
            .map_err(|e| {
                PodliteError::Container(format!("failed to initialize the container: {}", e))
            })?;
        self.pod.lock_inner().stager_container = Some(container);
        Ok(())
    }

    fn container_config(&mut self) -> PodliteResult<ContainerConfig> {
        let manager = self.pod.manager();
        let opts = manager.options();

        let mut mounts = config::base_mounts();
        mounts.extend(config::layer_mounts(&self.layer_paths));

        for volume in &self.manifest.pod.volumes {
            let source = match (&volume.kind, &volume.source) {
                (VolumeKind::Host, Some(source)) => PathBuf::from(source),
                _ => manager.get_volume_path(&volume.name).map_err(|e| {
                    PodliteError::Storage(format!(
                        "failed to retrieve volume for {:?}: {}",
                        volume.name, e
                    ))
                })?,
            };
            let mut mount = MountConfig::bind(
                source.display().to_string(),
                isolators::stager_volume_path(&volume.name),
            );
            mount.set_read_only(volume.is_read_only());
            mounts.push(mount);
        }

        mounts.extend(self.options.stager_mounts.iter().cloned());
        let (io_mounts, _) = config::io_mounts(&self.options.container_io);
        mounts.extend(io_mounts);

        // Raw volumes are already bound through stager mounts.
        self.manifest
            .pod
            .volumes
            .extend(self.options.raw_volumes.iter().cloned());
        self.publish_manifest();

        let mut namespaces = vec![NamespaceConfig::new(Namespace::Mount)];
        if !self.skip_networking {
            namespaces.push(match &self.netns_path {
                Some(path) => NamespaceConfig::join(Namespace::Net, path),
                None => NamespaceConfig::new(Namespace::Net),
            });
        }

        Ok(ContainerConfig {
            rootfs: self.root(),
            hostname: None,
            cgroup_path: Some(format!(
                "/{}/{}",
                opts.parent_cgroup_name.trim_matches('/'),
                self.pod.short_name()
            )),
            capabilities: Capabilities::All,
            namespaces,
            mounts,
            masked_paths: Vec::new(),
            readonly_paths: Vec::new(),
            readonly_rootfs: false,
        })
    }

    /// Copies the stager image into the stager root and writes the manifest.
    async fn write_manifest(&mut self) -> PodliteResult<()> {
        let root = self.root();
        let src = self.stager_path.clone();
        let dst = root.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?
            .map_err(|e| {
                PodliteError::Storage(format!(
                    "failed to prepare stager manifest: {:?} {}",
                    self.stager_path, e
                ))
            })?;

        let data = serde_json::to_vec(&self.manifest).map_err(|e| {
            PodliteError::Internal(format!("failed to marshal stager manifest: {}", e))
        })?;
        fs::write(root.join(MANIFEST_PATH.trim_start_matches('/')), data).map_err(|e| {
            PodliteError::Storage(format!("failed to create stager manifest: {}", e))
        })?;
        tracing::debug!(pod_id = %self.pod.uuid(), "Wrote stager manifest");
        Ok(())
    }

    /// Starts the stager process. Its output goes to `stager.log` in the pod
    /// directory.
    async fn launch_stager(&mut self) -> PodliteResult<()> {
        let root = self.root();
        let app = self
            .stager_app
            .clone()
            .ok_or_else(|| PodliteError::Internal("stager image was not loaded".into()))?;
        let container = self
            .pod
            .lock_inner()
            .stager_container
            .clone()
            .ok_or_else(|| PodliteError::InvalidState("stager container was not created".into()))?;

        let log_path = root
            .parent()
            .map(|dir| dir.join(STAGER_LOG))
            .ok_or_else(|| PodliteError::Internal("stager root has no parent".into()))?;
        let log = OpenOptions::new()
            .append(true)
            .create_new(true)
            .mode(0o666)
            .open(&log_path)
            .map_err(|e| {
                PodliteError::Storage(format!("failed to open stager log path: {}", e))
            })?;
        let stderr = log.try_clone()?;

        let listener = UnixListener::bind(root.join(READY_SOCKET.trim_start_matches('/')))
            .map_err(|e| PodliteError::Internal(format!("failed to allocate ready socket: {}", e)))?;
        self.pod.lock_inner().ready = Some(listener);

        let (_, io_env) = config::io_mounts(&self.options.container_io);
        let mut process = ProcessSpec::new(app.exec.clone());
        process.cwd = app.cwd().to_string();
        process.env = app.env_pairs();
        process.env.extend(io_env);
        process.stdout = Some(OwnedFd::from(log));
        process.stderr = Some(OwnedFd::from(stderr));

        let handle = container.start(process).map_err(|e| {
            PodliteError::Container(format!("failed to launch stager process: {}", e))
        })?;
        tracing::debug!(pod_id = %self.pod.uuid(), pid = handle.pid(), "Launched stager process");

        self.pod.lock_inner().stager_process = Some(Arc::clone(&handle));
        self.pod.spawn_stager_waiter(handle);
        Ok(())
    }

    /// Waits for the stager to connect to the ready socket and hang up, or
    /// for the pod to start shutting down.
    async fn wait_for_ready(&mut self) -> PodliteResult<()> {
        let listener = self
            .pod
            .lock_inner()
            .ready
            .take()
            .ok_or_else(|| PodliteError::InvalidState("no ready socket was found".into()))?;
        let mut shutdown = self.pod.shutdown_signal();

        tokio::select! {
            result = accept_hangup(listener) => {
                result.map_err(|e| PodliteError::Internal(format!("failed waiting for stager readiness: {}", e)))?;
                tracing::debug!(pod_id = %self.pod.uuid(), "Stager signaled pod is running");
            }
            _ = shutdown.wait_for(|stopping| *stopping) => {
                tracing::debug!(pod_id = %self.pod.uuid(), "Pod is shutting down, not ready");
            }
        }
        Ok(())
    }
}

/// Accepts one connection and reads it to end-of-stream; any bytes sent are
/// ignored.
async fn accept_hangup(listener: UnixListener) -> std::io::Result<()> {
    let (mut stream, _) = listener.accept().await?;
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_order() {
        assert_eq!(
            pipeline().steps(),
            vec![
                "get_stager",
                "dependency_set",
                "base_directories",
                "apply_isolators",
                "network",
                "resolv_conf",
                "initialize_container",
                "write_manifest",
                "launch_stager",
                "wait_for_ready"
            ]
        );
    }

    #[tokio::test]
    async fn ready_hangup_ignores_payload() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let waiter = tokio::spawn(accept_hangup(listener));
        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        client.write_all(b"ignored").await.unwrap();
        drop(client);

        waiter.await.unwrap().unwrap();
    }
}
