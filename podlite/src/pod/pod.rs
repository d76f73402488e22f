//! A single pod and its lifecycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use podlite_shared::constants::pod::{STAGER_DIR, STATE_POLL_INTERVAL};
use podlite_shared::container::{Container, ContainerProcess, ExitStatus, MountConfig};
use podlite_shared::schema::{IpResult, PodManifest, Volume};
use podlite_shared::{PodliteError, PodliteResult};
use tokio::net::UnixListener;
use tokio::sync::watch;
use uuid::Uuid;

use super::config::ContainerIo;
use super::manager::Manager;
use super::startup::{self, StartupCtx};
use super::state::PodState;
use super::teardown;

/// Per-create settings.
#[derive(Debug, Clone, Default)]
pub struct PodOptions {
    /// Stager image; the manager's default when empty.
    pub stager_hash: String,
    /// Networks to attach; the default drivers when empty.
    pub networks: Vec<String>,
    /// App name to the host files used as that app's streams.
    pub container_io: HashMap<String, ContainerIo>,
    /// Volumes appended to the pod manifest without a backing directory.
    pub raw_volumes: Vec<Volume>,
    /// Extra binds into the stager's root.
    pub stager_mounts: Vec<MountConfig>,
}

/// Mutable pod fields, guarded by the pod's mutex.
///
/// Never held across an await.
pub(super) struct PodInner {
    pub state: PodState,
    pub shutting_down: bool,
    pub manifest: PodManifest,
    pub directory: Option<PathBuf>,
    pub skip_networking: bool,
    pub netns_path: Option<PathBuf>,
    pub network_results: Vec<IpResult>,
    pub stager_container: Option<Arc<dyn Container>>,
    pub stager_process: Option<Arc<dyn ContainerProcess>>,
    pub ready: Option<UnixListener>,
}

pub struct Pod {
    manager: Arc<Manager>,
    uuid: String,
    name: String,
    created_at: DateTime<Utc>,
    inner: Mutex<PodInner>,
    state_tx: watch::Sender<PodState>,
    shutdown_tx: watch::Sender<bool>,
    stager_exit_tx: watch::Sender<Option<ExitStatus>>,
}

impl std::fmt::Debug for Pod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pod")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Pod {
    pub(super) fn new(manager: Arc<Manager>, name: &str, manifest: PodManifest) -> Arc<Self> {
        Arc::new(Self {
            manager,
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            inner: Mutex::new(PodInner {
                state: PodState::New,
                shutting_down: false,
                manifest,
                directory: None,
                skip_networking: false,
                netns_path: None,
                network_results: Vec::new(),
                stager_container: None,
                stager_process: None,
                ready: None,
            }),
            state_tx: watch::Sender::new(PodState::New),
            shutdown_tx: watch::Sender::new(false),
            stager_exit_tx: watch::Sender::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First 8 characters of the uuid; names the pod directory and container.
    pub fn short_name(&self) -> &str {
        self.uuid.get(..8).unwrap_or(&self.uuid)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> PodState {
        self.inner.lock().state
    }

    /// The pod manifest, including volumes and mounts added by isolators.
    pub fn manifest(&self) -> PodManifest {
        self.inner.lock().manifest.clone()
    }

    pub fn netns_path(&self) -> Option<PathBuf> {
        self.inner.lock().netns_path.clone()
    }

    pub fn network_results(&self) -> Vec<IpResult> {
        self.inner.lock().network_results.clone()
    }

    /// Pod directory, once startup has created it.
    pub fn directory(&self) -> Option<PathBuf> {
        self.inner.lock().directory.clone()
    }

    pub(super) fn stager_root(&self) -> PathBuf {
        self.manager
            .options()
            .pod_directory
            .join(self.short_name())
            .join(STAGER_DIR)
    }

    pub(super) fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub(super) fn lock_inner(&self) -> MutexGuard<'_, PodInner> {
        self.inner.lock()
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(super) fn stager_exit_signal(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.stager_exit_tx.subscribe()
    }

    /// Moves to `target` if the state machine allows it.
    ///
    /// A startup that finishes after a stop began must not move the pod back
    /// to RUNNING, so refused transitions are dropped rather than reported.
    fn set_state(&self, target: PodState) -> bool {
        let mut inner = self.inner.lock();
        self.set_state_locked(&mut inner, target)
    }

    fn set_state_locked(&self, inner: &mut PodInner, target: PodState) -> bool {
        if !inner.state.can_transition_to(target) {
            tracing::debug!(
                pod_id = %self.uuid,
                from = %inner.state,
                to = %target,
                "Ignoring state transition"
            );
            return false;
        }
        tracing::debug!(pod_id = %self.uuid, from = %inner.state, to = %target, "Pod state change");
        inner.state = target;
        self.state_tx.send_replace(target);
        true
    }

    /// Runs the startup pipeline on its own task.
    pub(super) fn start(pod: Arc<Self>, options: PodOptions) {
        pod.set_state(PodState::Starting);

        tokio::spawn(async move {
            let mut ctx = StartupCtx::new(Arc::clone(&pod), options);
            match startup::pipeline().run(&mut ctx).await {
                Ok(()) => {
                    if pod.set_state(PodState::Running) {
                        tracing::info!(pod_id = %pod.uuid, name = %pod.name, "Pod is running");
                    }
                }
                Err(failure) => {
                    tracing::error!(
                        pod_id = %pod.uuid,
                        step = failure.step,
                        error = %failure.error,
                        "Pod startup failed"
                    );
                    pod.set_state(PodState::Errored);
                }
            }
        });
    }

    /// Watches the stager and stops the pod if it exits on its own.
    pub(super) fn spawn_stager_waiter(self: &Arc<Self>, process: Arc<dyn ContainerProcess>) {
        let pod = Arc::clone(self);
        tokio::spawn(async move {
            let status = match process.wait().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(pod_id = %pod.uuid, error = %e, "Failed to wait on stager");
                    ExitStatus::default()
                }
            };
            tracing::warn!(pod_id = %pod.uuid, %status, "Stager process has exited");
            pod.stager_exit_tx.send_replace(Some(status));

            if pod.is_shutting_down() {
                return;
            }
            tracing::error!(pod_id = %pod.uuid, "Stager exited unexpectedly, stopping pod");
            pod.stop().await;
        });
    }

    /// Tears the pod down. Only the first call runs the teardown; later and
    /// concurrent calls return immediately.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            self.set_state_locked(&mut inner, PodState::Stopping);
        }
        self.shutdown_tx.send_replace(true);

        tracing::info!(pod_id = %self.uuid, name = %self.name, "Stopping pod");
        let mut pod = Arc::clone(self);
        for failure in teardown::pipeline().run_all(&mut pod).await {
            tracing::error!(
                pod_id = %self.uuid,
                step = failure.step,
                error = %failure.error,
                "Pod stopping error"
            );
        }

        self.set_state(PodState::Stopped);
        tracing::info!(pod_id = %self.uuid, name = %self.name, "Pod stopped");
    }

    /// Resolves once the pod is STOPPED.
    pub async fn wait(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == PodState::Stopped).await;
    }

    /// Polls until the pod is in one of `states`.
    pub async fn wait_for_state(&self, timeout: Duration, states: &[PodState]) -> PodliteResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if states.contains(&self.state()) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PodliteError::InvalidState(
                    "timeout exceeded waiting for state change".into(),
                ));
            }
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
    }
}
