//! Stager startup pipeline.

use std::fs::{self, File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use podlite_shared::constants::stager::{CONTAINER_IO_ENV_PREFIX, INIT_CONTAINER};
use podlite_shared::container::{parse_id, ProcessSpec};
use podlite_shared::pipeline::Pipeline;
use podlite_shared::pipeline_task;
use podlite_shared::schema::{namespaces, App, Namespace, RuntimeApp, StagerConfig, StagerManifest, StagerPhase};
use podlite_shared::{PodliteError, PodliteResult};
use tokio::signal::unix::{signal, SignalKind};

use super::{Supervisor, TeardownReason};
use crate::config::{app_config, init_config, pod_namespaces};
use crate::graph::{provisioner, StorageProvisioner};

/// Executable inside the init root, run as the init container's process.
const INIT_BINARY: &str = "init";

pub(super) struct StartupCtx {
    sup: Arc<Supervisor>,
    manifest: Option<StagerManifest>,
    config: StagerConfig,
    namespaces: Vec<Namespace>,
}

impl StartupCtx {
    pub(super) fn new(sup: Arc<Supervisor>) -> Self {
        Self {
            sup,
            manifest: None,
            config: StagerConfig::default(),
            namespaces: Vec::new(),
        }
    }

    fn manifest(&self) -> PodliteResult<&StagerManifest> {
        self.manifest
            .as_ref()
            .ok_or_else(|| PodliteError::InvalidState("stager manifest has not been read".into()))
    }
}

pipeline_task!(Signals, "signals", StartupCtx, install_signal_handlers);
pipeline_task!(ReadManifest, "read_manifest", StartupCtx, read_manifest);
pipeline_task!(PopulateState, "populate_state", StartupCtx, populate_state);
pipeline_task!(Filesystem, "container_filesystem", StartupCtx, container_filesystem);
pipeline_task!(LaunchInit, "launch_init", StartupCtx, launch_init);
pipeline_task!(CreateContainers, "create_containers", StartupCtx, create_containers);
pipeline_task!(MarkRunning, "mark_running", StartupCtx, mark_running);
pipeline_task!(NotifyReady, "notify_ready", StartupCtx, notify_ready);

pub(super) fn pipeline() -> Pipeline<StartupCtx> {
    Pipeline::new("stager startup")
        .task(Signals)
        .task(ReadManifest)
        .task(PopulateState)
        .task(Filesystem)
        .task(LaunchInit)
        .task(CreateContainers)
        .task(MarkRunning)
        .task(NotifyReady)
}

impl StartupCtx {
    async fn install_signal_handlers(&mut self) -> PodliteResult<()> {
        if !self.sup.opts.handle_signals {
            return Ok(());
        }
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let sup = Arc::downgrade(&self.sup);
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => tracing::info!("Received SIGTERM"),
                _ = int.recv() => tracing::info!("Received SIGINT"),
            }
            if let Some(sup) = sup.upgrade() {
                sup.request_teardown(TeardownReason::Signal);
            }
        });
        Ok(())
    }

    async fn read_manifest(&mut self) -> PodliteResult<()> {
        tracing::debug!("Reading stager manifest");
        let path = self.sup.layout.manifest();
        let data = fs::read(&path).map_err(|e| {
            PodliteError::Config(format!("failed to open stager manifest: {}", e))
        })?;
        let manifest: StagerManifest = serde_json::from_slice(&data).map_err(|e| {
            PodliteError::Config(format!("failed to parse stager manifest: {}", e))
        })?;

        self.config = StagerConfig::from_value(&manifest.stager_config).map_err(|e| {
            PodliteError::Config(format!("failed to parse stager configuration: {}", e))
        })?;
        let isolator = namespaces(&manifest.pod.isolators)?;
        self.namespaces = pod_namespaces(&self.config, isolator.as_ref())?;

        tracing::info!(pod = %manifest.name, version = %manifest.version, apps = manifest.pod.apps.len(), "Loaded stager manifest");
        self.manifest = Some(manifest);
        Ok(())
    }

    async fn populate_state(&mut self) -> PodliteResult<()> {
        let manifest = self.manifest()?;
        self.sup
            .state
            .populate(manifest.pod.apps.iter().map(|a| a.name.as_str()));
        self.sup.state.persist()
    }

    async fn container_filesystem(&mut self) -> PodliteResult<()> {
        tracing::debug!("Setting up container filesystem");
        let layout = &self.sup.layout;
        for dir in [layout.apps(), layout.init_root(), layout.logs(), layout.containers()] {
            fs::create_dir_all(&dir).map_err(|e| {
                PodliteError::Storage(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        install_init_binary(&layout.init_root().join(INIT_BINARY))?;

        let storage: Arc<dyn StorageProvisioner> = match &self.sup.opts.storage {
            Some(storage) => Arc::clone(storage),
            None => Arc::from(provisioner(&self.config.graph_storage)?),
        };

        let manifest = self.manifest()?;
        for app in &manifest.pod.apps {
            let root = layout.app_root(&app.name);
            fs::create_dir(&root).map_err(|e| {
                PodliteError::Storage(format!(
                    "failed to create app directory for {:?}: {}",
                    app.name, e
                ))
            })?;

            let layers: Vec<_> = manifest
                .app_image_order
                .get(&app.name)
                .map(|order| order.iter().map(|hash| layout.layer(hash)).collect())
                .unwrap_or_default();
            storage.create(&root, &layers).map_err(|e| {
                PodliteError::Storage(format!(
                    "failed to configure app {:?} filesystem: {}",
                    app.name, e
                ))
            })?;
        }

        tracing::debug!("Done setting up filesystem");
        Ok(())
    }

    async fn launch_init(&mut self) -> PodliteResult<()> {
        tracing::debug!("Launching the init process");
        let manifest = self.manifest()?;
        let config = init_config(
            &self.sup.layout,
            &manifest.name,
            &self.namespaces,
            self.sup.opts.cgroup_parent.as_deref(),
        );
        let container = self.sup.factory.create(INIT_CONTAINER, config).map_err(|e| {
            PodliteError::Container(format!("failed to create init container: {}", e))
        })?;

        let log = open_log(&self.sup.layout.logs().join(format!("{}.log", INIT_CONTAINER)))
            .map_err(|e| {
                PodliteError::Container(format!("failed to open init process log: {}", e))
            })?;
        let mut process = ProcessSpec::new(vec![format!("/{}", INIT_BINARY)]);
        process.stdin = Some(dev_null()?);
        process.stderr = Some(log.try_clone()?.into());
        process.stdout = Some(log.into());

        let handle = container.start(process).map_err(|e| {
            PodliteError::Container(format!("failed to launch init process: {}", e))
        })?;
        tracing::debug!(pid = handle.pid(), "Launched init process");

        self.sup.set_init(container, Arc::clone(&handle));
        self.sup.spawn_init_waiter(handle);
        Ok(())
    }

    async fn create_containers(&mut self) -> PodliteResult<()> {
        tracing::debug!("Creating application containers");
        let init_pid = self.sup.init_pid().ok_or_else(|| {
            PodliteError::InvalidState("failed to get init container's pid".into())
        })?;
        let manifest = self.manifest()?;

        for runtime_app in &manifest.pod.apps {
            let name = runtime_app.name.as_str();
            let app = pod_app(manifest, runtime_app)?;

            let config = app_config(
                &self.sup.layout,
                runtime_app,
                app,
                &manifest.pod.volumes,
                init_pid,
                &self.namespaces,
                self.sup.opts.cgroup_parent.as_deref(),
            )
            .map_err(|e| {
                PodliteError::Container(format!("failed to generate config for app {:?}: {}", name, e))
            })?;
            let container = self.sup.factory.create(name, config).map_err(|e| {
                PodliteError::Container(format!(
                    "failed to initialize the container for {:?}: {}",
                    name, e
                ))
            })?;

            let process = self.app_process(name, app)?;
            tracing::debug!(app = name, user = %app.user, group = %app.group, exec = ?app.exec, "Launching application");
            let handle = container.start(process).map_err(|e| {
                PodliteError::Container(format!("failed to launch app {:?}: {}", name, e))
            })?;
            tracing::info!(app = name, pid = handle.pid(), "Launched app");

            self.sup.state.set_pid(name, handle.pid());
            self.sup.add_app(name, container, Arc::clone(&handle));
            self.sup.spawn_app_waiter(name.to_string(), handle);
        }
        Ok(())
    }

    fn app_process(&self, name: &str, app: &App) -> PodliteResult<ProcessSpec> {
        if app.exec.is_empty() {
            return Err(PodliteError::Validation(format!(
                "app {:?} does not specify an exec command",
                name
            )));
        }

        let mut process = ProcessSpec::new(app.exec.clone());
        process.cwd = app.cwd().to_string();
        process.env = app.env_pairs();
        process.uid = parse_id(&app.user)?;
        process.gid = parse_id(&app.group)?;
        process.additional_gids = app.supplementary_gids.clone();

        let stream_path = |stream: &str| {
            let var = format!("{}{}_{}", CONTAINER_IO_ENV_PREFIX, name, stream);
            self.sup.opts.env.get(&var).map(|p| self.sup.layout.resolve(p))
        };
        process.stdin = Some(match stream_path("STDIN") {
            Some(path) => File::open(&path)?.into(),
            None => dev_null()?,
        });

        let log_path = self.sup.layout.logs().join(name);
        let stdout = match stream_path("STDOUT") {
            Some(path) => open_stream(&path)?,
            None => open_log(&log_path)?,
        };
        let stderr = match stream_path("STDERR") {
            Some(path) => open_stream(&path)?,
            None => stdout.try_clone()?,
        };
        process.stdout = Some(stdout.into());
        process.stderr = Some(stderr.into());
        Ok(process)
    }

    async fn mark_running(&mut self) -> PodliteResult<()> {
        self.sup.state.set_phase(StagerPhase::Running);
        self.sup.state.persist()
    }

    /// Connecting and closing the ready socket tells the manager the pod runs.
    async fn notify_ready(&mut self) -> PodliteResult<()> {
        let path = self.sup.layout.ready_socket();
        match tokio::net::UnixStream::connect(&path).await {
            Ok(stream) => {
                drop(stream);
                tracing::info!("Manager notified");
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to notify manager"),
        }
        Ok(())
    }
}

/// The app definition: the pod's override, else the image's own.
fn pod_app<'a>(manifest: &'a StagerManifest, runtime_app: &'a RuntimeApp) -> PodliteResult<&'a App> {
    if let Some(app) = &runtime_app.app {
        return Ok(app);
    }
    manifest
        .images
        .get(&runtime_app.image.id)
        .and_then(|image| image.app.as_ref())
        .ok_or_else(|| {
            PodliteError::Validation(format!(
                "app {:?} has no definition in the pod or its image",
                runtime_app.name
            ))
        })
}

/// Puts the stager's own executable in the init root unless the stager image
/// already ships one.
fn install_init_binary(target: &Path) -> PodliteResult<()> {
    if target.exists() {
        return Ok(());
    }
    let exe = std::env::current_exe()?;
    fs::copy(&exe, target).map_err(|e| {
        PodliteError::Storage(format!(
            "failed to install init binary at {}: {}",
            target.display(),
            e
        ))
    })?;
    Ok(())
}

/// A fresh log file; an existing one means a previous run left state behind.
fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create_new(true)
        .mode(0o666)
        .open(path)
}

fn open_stream(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().append(true).open(path)
}

fn dev_null() -> PodliteResult<OwnedFd> {
    Ok(File::open("/dev/null")?.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_order() {
        assert_eq!(
            pipeline().steps(),
            vec![
                "signals",
                "read_manifest",
                "populate_state",
                "container_filesystem",
                "launch_init",
                "create_containers",
                "mark_running",
                "notify_ready",
            ]
        );
    }

    #[test]
    fn log_files_are_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web");
        open_log(&path).unwrap();
        assert!(open_log(&path).is_err());
    }

    #[test]
    fn existing_init_binary_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("init");
        fs::write(&target, "shipped").unwrap();
        install_init_binary(&target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "shipped");
    }
}
