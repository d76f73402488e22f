//! Pod supervisor.
//!
//! The supervisor is the pod's top-level process. Startup builds every app's
//! root filesystem, launches the init container that holds the shared
//! namespaces, then one container per app joined to them. Once running it
//! only watches: app exits are recorded, while an init exit or a termination
//! signal tears the whole pod down.

mod startup;
mod teardown;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use podlite_shared::constants::supervisor::STOP_GRACE;
use podlite_shared::container::{Container, ContainerFactory, ContainerProcess};
use podlite_shared::schema::{StagerPhase, StagerState};
use podlite_shared::PodliteResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::graph::StorageProvisioner;
use crate::layout::Layout;
use crate::state::StateTracker;

/// Why the supervisor is tearing the pod down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// SIGTERM or SIGINT from the pod manager.
    Signal,
    /// The init process died, taking the shared namespaces with it.
    InitExited,
}

pub struct SupervisorOptions {
    /// Grace period between SIGTERM and SIGKILL for each process.
    pub stop_grace: Duration,
    /// Cgroup the init and app cgroups are nested under.
    pub cgroup_parent: Option<String>,
    /// Environment of the stager, for the per-app stdio paths.
    pub env: HashMap<String, String>,
    /// Overrides the provisioner named by the stager configuration.
    pub storage: Option<Arc<dyn StorageProvisioner>>,
    /// Installs the SIGTERM and SIGINT handlers during startup.
    pub handle_signals: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_grace: STOP_GRACE,
            cgroup_parent: None,
            env: HashMap::new(),
            storage: None,
            handle_signals: true,
        }
    }
}

#[derive(Clone)]
struct Launched {
    container: Arc<dyn Container>,
    process: Arc<dyn ContainerProcess>,
}

#[derive(Default)]
struct Inner {
    init: Option<Launched>,
    /// In launch order.
    apps: Vec<(String, Launched)>,
    /// Exit recorders of the apps, joined during teardown.
    waiters: Vec<JoinHandle<()>>,
}

pub struct Supervisor {
    layout: Layout,
    factory: Arc<dyn ContainerFactory>,
    opts: SupervisorOptions,
    state: StateTracker,
    inner: Mutex<Inner>,
    teardown_tx: watch::Sender<Option<TeardownReason>>,
}

impl Supervisor {
    pub fn new(
        layout: Layout,
        factory: Arc<dyn ContainerFactory>,
        opts: SupervisorOptions,
    ) -> Arc<Self> {
        let (teardown_tx, _) = watch::channel(None);
        Arc::new(Self {
            state: StateTracker::new(layout.state_file()),
            layout,
            factory,
            opts,
            inner: Mutex::new(Inner::default()),
            teardown_tx,
        })
    }

    /// Starts the pod, supervises it until it must come down, then tears it
    /// down. A startup failure tears down whatever was started and is
    /// returned as the error.
    pub async fn run(self: &Arc<Self>) -> PodliteResult<TeardownReason> {
        let mut ctx = startup::StartupCtx::new(Arc::clone(self));
        if let Err(failure) = startup::pipeline().run(&mut ctx).await {
            tracing::error!(step = failure.step, error = %failure.error, "Stager startup failed");
            self.teardown().await;
            return Err(failure.error);
        }
        tracing::info!("Pod is running");

        let reason = self.wait_for_teardown().await;
        tracing::info!(?reason, "Tearing down pod");
        self.teardown().await;
        Ok(reason)
    }

    pub fn state(&self) -> StagerState {
        self.state.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.phase() == StagerPhase::Teardown
    }

    /// Asks `run` to tear the pod down; the first reason wins.
    pub fn request_teardown(&self, reason: TeardownReason) {
        self.teardown_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    async fn wait_for_teardown(&self) -> TeardownReason {
        let mut rx = self.teardown_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(TeardownReason::Signal),
            // The sender lives in self, so this cannot close while we wait.
            Err(_) => TeardownReason::Signal,
        };
        reason
    }

    fn spawn_init_waiter(self: &Arc<Self>, process: Arc<dyn ContainerProcess>) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            match process.wait().await {
                Ok(status) => tracing::info!(%status, "Init process exited"),
                Err(e) => tracing::error!(error = %e, "Failed to wait on the init process"),
            }
            if sup.is_shutting_down() {
                return;
            }
            tracing::error!(
                "The init process has exited, but the pod is not tearing down. Stager exiting."
            );
            sup.request_teardown(TeardownReason::InitExited);
        });
    }

    /// Records the app's exit in the state file. App exits never stop the pod.
    fn spawn_app_waiter(self: &Arc<Self>, app: String, process: Arc<dyn ContainerProcess>) {
        let sup = Arc::clone(self);
        let waiter = tokio::spawn(async move {
            let result = process.wait().await;
            match &result {
                Ok(status) => tracing::info!(app = %app, %status, "App exited"),
                Err(e) => tracing::error!(app = %app, error = %e, "Failed to wait on app"),
            }
            sup.state.record_exit(&app, &result);
            if let Err(e) = sup.state.persist() {
                tracing::error!(error = %e, "Failed to write state file");
            }
        });
        self.inner.lock().waiters.push(waiter);
    }

    fn set_init(&self, container: Arc<dyn Container>, process: Arc<dyn ContainerProcess>) {
        self.inner.lock().init = Some(Launched { container, process });
    }

    fn add_app(&self, name: &str, container: Arc<dyn Container>, process: Arc<dyn ContainerProcess>) {
        self.inner
            .lock()
            .apps
            .push((name.to_string(), Launched { container, process }));
    }

    fn init_pid(&self) -> Option<i32> {
        self.inner.lock().init.as_ref().map(|l| l.process.pid())
    }
}
