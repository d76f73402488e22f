//! libcontainer-backed container runtime
//!
//! The first process started in a container becomes its init and is launched
//! from an OCI bundle written next to the state root. Later processes join the
//! running container as tenants.

mod capabilities;
mod spec;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libcontainer::container::builder::ContainerBuilder;
use libcontainer::container::Container as LibContainer;
use libcontainer::syscall::syscall::SyscallType;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::container::{Container, ContainerConfig, ContainerFactory, ContainerProcess, ExitStatus, ProcessSpec};
use crate::errors::{PodliteError, PodliteResult};

const BUNDLES_DIR: &str = ".bundles";

/// Marks the calling process as a child subreaper so detached container
/// processes are reparented to it and can be waited on.
pub fn set_child_subreaper() -> PodliteResult<()> {
    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| PodliteError::Container(format!("Failed to become child subreaper: {}", e)))
}

/// Factory storing container state under `state_root`.
#[derive(Debug, Clone)]
pub struct LibcontainerFactory {
    state_root: PathBuf,
}

impl LibcontainerFactory {
    pub fn new(state_root: impl Into<PathBuf>) -> PodliteResult<Self> {
        let state_root = state_root.into();
        std::fs::create_dir_all(state_root.join(BUNDLES_DIR)).map_err(|e| {
            PodliteError::Container(format!(
                "Failed to create container state root {}: {}",
                state_root.display(),
                e
            ))
        })?;
        Ok(Self { state_root })
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }
}

impl ContainerFactory for LibcontainerFactory {
    fn create(&self, id: &str, config: ContainerConfig) -> PodliteResult<Arc<dyn Container>> {
        if self.state_root.join(id).exists() {
            return Err(PodliteError::AlreadyExists(format!(
                "container {:?} already exists",
                id
            )));
        }
        tracing::debug!(container_id = %id, rootfs = %config.rootfs.display(), "Creating container");
        Ok(Arc::new(LibcontainerContainer {
            id: id.to_string(),
            state_root: self.state_root.clone(),
            bundle: self.state_root.join(BUNDLES_DIR).join(id),
            pending: Mutex::new(Some(config)),
        }))
    }

    fn load(&self, id: &str) -> PodliteResult<Arc<dyn Container>> {
        LibContainer::load(self.state_root.join(id)).map_err(|e| {
            PodliteError::NotFound(format!("failed to load container {:?}: {}", id, e))
        })?;
        Ok(Arc::new(LibcontainerContainer {
            id: id.to_string(),
            state_root: self.state_root.clone(),
            bundle: self.state_root.join(BUNDLES_DIR).join(id),
            pending: Mutex::new(None),
        }))
    }
}

struct LibcontainerContainer {
    id: String,
    state_root: PathBuf,
    bundle: PathBuf,
    /// Configuration of a container whose init has not been started yet.
    pending: Mutex<Option<ContainerConfig>>,
}

impl LibcontainerContainer {
    fn builder(&self, process: &mut ProcessSpec) -> PodliteResult<ContainerBuilder> {
        let mut builder = ContainerBuilder::new(self.id.clone(), SyscallType::default())
            .with_root_path(self.state_root.clone())
            .map_err(|e| {
                PodliteError::Container(format!("Failed to set container root path: {}", e))
            })?
            .validate_id()
            .map_err(|e| PodliteError::Container(format!("Invalid container ID: {}", e)))?;

        if let Some(fd) = process.stdin.take() {
            builder = builder.with_stdin(fd);
        }
        if let Some(fd) = process.stdout.take() {
            builder = builder.with_stdout(fd);
        }
        if let Some(fd) = process.stderr.take() {
            builder = builder.with_stderr(fd);
        }
        Ok(builder)
    }

    fn start_init(&self, config: &ContainerConfig, mut process: ProcessSpec) -> PodliteResult<Pid> {
        let spec = spec::create_oci_spec(config, &process)?;
        std::fs::create_dir_all(&self.bundle).map_err(|e| {
            PodliteError::Container(format!(
                "Failed to create bundle directory {}: {}",
                self.bundle.display(),
                e
            ))
        })?;
        spec.save(self.bundle.join("config.json"))
            .map_err(|e| PodliteError::Container(format!("Failed to write OCI spec: {}", e)))?;

        let mut container = self
            .builder(&mut process)?
            .as_init(self.bundle.clone())
            .with_systemd(false)
            .with_detach(true)
            .build()
            .map_err(|e| {
                PodliteError::Container(format!("Failed to create container {}: {}", self.id, e))
            })?;
        container.start().map_err(|e| {
            PodliteError::Container(format!("Failed to start container {}: {}", self.id, e))
        })?;

        container.pid().ok_or_else(|| {
            PodliteError::Container(format!("container {} started without an init pid", self.id))
        })
    }

    /// Joins the running container. The tenant keeps the container's own
    /// capability set and runs as the process's user.
    fn start_tenant(&self, mut process: ProcessSpec) -> PodliteResult<Pid> {
        let tenant = Tenant::from_process(&process);

        self.builder(&mut process)?
            .as_tenant()
            .with_detach(false)
            .with_user(Some(tenant.uid))
            .with_group(Some(tenant.gid))
            .with_additional_gids(tenant.additional_gids)
            .with_cwd(Some(tenant.cwd))
            .with_env(tenant.env)
            .with_container_args(tenant.args.clone())
            .build()
            .map_err(|e| {
                PodliteError::Container(format!(
                    "Failed to spawn {:?} in container {}: {}",
                    tenant.args, self.id, e
                ))
            })
    }
}

/// What a tenant process takes from its [`ProcessSpec`].
#[derive(Debug, PartialEq, Eq)]
struct Tenant {
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: PathBuf,
    uid: u32,
    gid: u32,
    additional_gids: Vec<u32>,
}

impl Tenant {
    fn from_process(process: &ProcessSpec) -> Self {
        Self {
            args: process.args.clone(),
            env: process.env.iter().cloned().collect(),
            cwd: PathBuf::from(&process.cwd),
            uid: process.uid,
            gid: process.gid,
            additional_gids: process.additional_gids.clone(),
        }
    }
}

impl Container for LibcontainerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self, process: ProcessSpec) -> PodliteResult<Arc<dyn ContainerProcess>> {
        let pending = self.pending.lock().take();
        let pid = match pending {
            Some(config) => self.start_init(&config, process)?,
            None => self.start_tenant(process)?,
        };
        tracing::debug!(container_id = %self.id, pid = pid.as_raw(), "Started container process");
        Ok(Arc::new(LinuxProcess::new(pid)))
    }

    fn destroy(&self) -> PodliteResult<()> {
        let state_path = self.state_root.join(&self.id);
        if state_path.exists() {
            let mut container = LibContainer::load(state_path).map_err(|e| {
                PodliteError::Container(format!("Failed to load container {}: {}", self.id, e))
            })?;
            kill_container(&mut container);
            let force = !container.can_delete();
            container.delete(force).map_err(|e| {
                PodliteError::Container(format!("Failed to delete container {}: {}", self.id, e))
            })?;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.bundle) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(container_id = %self.id, error = %e, "Failed to remove bundle");
            }
        }
        Ok(())
    }
}

fn kill_container(container: &mut LibContainer) {
    if !container.can_kill() {
        return;
    }
    if let Ok(sigkill) = libcontainer::signal::Signal::try_from(9) {
        let _ = container.kill(sigkill, true);
    }
}

/// A container process waited on from a blocking thread.
pub struct LinuxProcess {
    pid: Pid,
    status: OnceCell<ExitStatus>,
}

impl LinuxProcess {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            status: OnceCell::new(),
        }
    }
}

#[async_trait]
impl ContainerProcess for LinuxProcess {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn signal(&self, signal: Signal) -> PodliteResult<()> {
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PodliteError::Container(format!(
                "Failed to send {} to {}: {}",
                signal, self.pid, e
            ))),
        }
    }

    async fn wait(&self) -> PodliteResult<ExitStatus> {
        let pid = self.pid;
        self.status
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || wait_blocking(pid))
                    .await
                    .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?
            })
            .await
            .copied()
    }
}

fn wait_blocking(pid: Pid) -> PodliteResult<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitStatus::signaled(sig as i32)),
            Ok(_) | Err(Errno::EINTR) => continue,
            // Not our child, e.g. a tenant started by another process.
            Err(Errno::ECHILD) => return Ok(poll_until_gone(pid)),
            Err(e) => {
                return Err(PodliteError::Container(format!(
                    "waitpid {} failed: {}",
                    pid, e
                )))
            }
        }
    }
}

fn poll_until_gone(pid: Pid) -> ExitStatus {
    loop {
        let alive = procfs::process::Process::new(pid.as_raw())
            .and_then(|p| p.stat())
            .map(|stat| stat.state != 'Z')
            .unwrap_or(false);
        if !alive {
            return ExitStatus::default();
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
