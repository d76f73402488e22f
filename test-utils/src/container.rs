//! In-memory [`ContainerFactory`] that records what it is asked to do.
//!
//! Processes never run. Each start goes through an optional [`StartHook`]
//! that decides how the process reacts to SIGTERM and may act on its
//! behalf from a background thread, for example connecting to a ready
//! socket or reading an Enter FIFO.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::{Mutex, RwLock};
use podlite_shared::container::{
    Container, ContainerConfig, ContainerFactory, ContainerProcess, ExitStatus, ProcessSpec,
};
use podlite_shared::{PodliteError, PodliteResult};
use tokio::sync::watch;

/// How a mock process reacts to signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Behavior {
    /// Status to exit with on SIGTERM; `None` ignores it.
    pub on_term: Option<ExitStatus>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            on_term: Some(ExitStatus::signaled(Signal::SIGTERM as i32)),
        }
    }
}

impl Behavior {
    pub fn exit_on_term(code: i32) -> Self {
        Self {
            on_term: Some(ExitStatus::exited(code)),
        }
    }

    pub fn ignore_term() -> Self {
        Self { on_term: None }
    }
}

pub struct MockProcess {
    pid: i32,
    behavior: Mutex<Behavior>,
    signals: Mutex<Vec<Signal>>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

impl MockProcess {
    fn new(pid: i32) -> Self {
        Self {
            pid,
            behavior: Mutex::new(Behavior::default()),
            signals: Mutex::new(Vec::new()),
            exit_tx: watch::Sender::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Exits the process; only the first call has an effect.
    pub fn exit(&self, status: ExitStatus) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
    }

    pub fn exited(&self) -> Option<ExitStatus> {
        *self.exit_tx.borrow()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn received(&self, signal: Signal) -> bool {
        self.signals.lock().contains(&signal)
    }

    /// Blocks the calling thread until the process exits.
    pub fn wait_blocking(&self) -> ExitStatus {
        loop {
            if let Some(status) = self.exited() {
                return status;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[async_trait]
impl ContainerProcess for MockProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> PodliteResult<()> {
        self.signals.lock().push(signal);
        if self.exited().is_some() {
            return Ok(());
        }
        match signal {
            Signal::SIGKILL => self.exit(ExitStatus::signaled(Signal::SIGKILL as i32)),
            Signal::SIGTERM => {
                let on_term = self.behavior.lock().on_term;
                if let Some(status) = on_term {
                    self.exit(status);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn wait(&self) -> PodliteResult<ExitStatus> {
        let mut rx = self.exit_tx.subscribe();
        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| PodliteError::Internal(format!("exit channel closed: {}", e)))?;
        Ok((*status).unwrap_or_default())
    }
}

/// What a [`StartHook`] gets to see about a start.
#[derive(Clone)]
pub struct StartContext {
    pub container_id: String,
    pub rootfs: PathBuf,
    /// True for the container's first process.
    pub first: bool,
    pub process: Arc<MockProcess>,
}

pub type StartHook = Arc<dyn Fn(StartContext, ProcessSpec) -> Behavior + Send + Sync>;

/// Arguments and environment of a started process; its file descriptors
/// go to the hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSpec {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub has_stdin: bool,
    pub has_stdout: bool,
    pub has_stderr: bool,
}

impl StartedSpec {
    fn of(spec: &ProcessSpec) -> Self {
        Self {
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            uid: spec.uid,
            gid: spec.gid,
            has_stdin: spec.stdin.is_some(),
            has_stdout: spec.stdout.is_some(),
            has_stderr: spec.stderr.is_some(),
        }
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct FactoryState {
    live: Mutex<HashMap<String, Arc<MockContainer>>>,
    created: Mutex<Vec<(String, ContainerConfig)>>,
    destroyed: Mutex<Vec<String>>,
    started: Mutex<HashMap<String, Vec<(StartedSpec, Arc<MockProcess>)>>>,
    next_pid: AtomicI32,
    hook: RwLock<Option<StartHook>>,
}

/// Cloning shares the recorded state.
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<FactoryState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hook(&self, hook: StartHook) {
        *self.state.hook.write() = Some(hook);
    }

    /// Container ids in creation order.
    pub fn created(&self) -> Vec<String> {
        self.state.created.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn config(&self, id: &str) -> Option<ContainerConfig> {
        self.state
            .created
            .lock()
            .iter()
            .rev()
            .find(|(created, _)| created == id)
            .map(|(_, config)| config.clone())
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.destroyed.lock().clone()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.state.live.lock().contains_key(id)
    }

    pub fn started(&self, id: &str) -> Vec<StartedSpec> {
        self.state
            .started
            .lock()
            .get(id)
            .map(|list| list.iter().map(|(spec, _)| spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn processes(&self, id: &str) -> Vec<Arc<MockProcess>> {
        self.state
            .started
            .lock()
            .get(id)
            .map(|list| list.iter().map(|(_, p)| Arc::clone(p)).collect())
            .unwrap_or_default()
    }

    /// The first process started in `id`.
    pub fn process(&self, id: &str) -> Option<Arc<MockProcess>> {
        self.processes(id).into_iter().next()
    }
}

impl ContainerFactory for MockFactory {
    fn create(&self, id: &str, config: ContainerConfig) -> PodliteResult<Arc<dyn Container>> {
        let mut live = self.state.live.lock();
        if live.contains_key(id) {
            return Err(PodliteError::AlreadyExists(format!(
                "container {:?} already exists",
                id
            )));
        }
        let container = Arc::new(MockContainer {
            id: id.to_string(),
            rootfs: config.rootfs.clone(),
            state: Arc::clone(&self.state),
        });
        live.insert(id.to_string(), Arc::clone(&container));
        self.state.created.lock().push((id.to_string(), config));
        Ok(container)
    }

    fn load(&self, id: &str) -> PodliteResult<Arc<dyn Container>> {
        self.state
            .live
            .lock()
            .get(id)
            .cloned()
            .map(|c| c as Arc<dyn Container>)
            .ok_or_else(|| PodliteError::NotFound(format!("container {:?} does not exist", id)))
    }
}

pub struct MockContainer {
    id: String,
    rootfs: PathBuf,
    state: Arc<FactoryState>,
}

impl Container for MockContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self, process: ProcessSpec) -> PodliteResult<Arc<dyn ContainerProcess>> {
        if !self.state.live.lock().contains_key(&self.id) {
            return Err(PodliteError::Container(format!(
                "container {:?} was destroyed",
                self.id
            )));
        }
        let pid = self.state.next_pid.fetch_add(1, Ordering::SeqCst) + 100;
        let handle = Arc::new(MockProcess::new(pid));
        let first = {
            let mut started = self.state.started.lock();
            let list = started.entry(self.id.clone()).or_default();
            list.push((StartedSpec::of(&process), Arc::clone(&handle)));
            list.len() == 1
        };

        let hook = self.state.hook.read().clone();
        if let Some(hook) = hook {
            let ctx = StartContext {
                container_id: self.id.clone(),
                rootfs: self.rootfs.clone(),
                first,
                process: Arc::clone(&handle),
            };
            handle.set_behavior(hook(ctx, process));
        }
        Ok(handle)
    }

    fn destroy(&self) -> PodliteResult<()> {
        self.state.live.lock().remove(&self.id);
        for process in self
            .state
            .started
            .lock()
            .get(&self.id)
            .into_iter()
            .flatten()
            .map(|(_, p)| p)
        {
            process.exit(ExitStatus::signaled(Signal::SIGKILL as i32));
        }
        self.state.destroyed.lock().push(self.id.clone());
        Ok(())
    }
}
