//! Running extra processes inside a live pod.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use podlite_shared::constants::stager::{RUN_BINARY, RUN_CONFIG_ENV};
use podlite_shared::container::{ContainerProcess, ProcessSpec};
use podlite_shared::schema::RunApp;
use podlite_shared::{PodliteError, PodliteResult};
use uuid::Uuid;

use super::pod::Pod;
use super::state::PodState;

/// Standard streams for an entered process; `None` leaves the stream closed.
#[derive(Debug, Default)]
pub struct EnterIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Callback invoked once the process has started, before its configuration
/// is acknowledged.
pub type PostStart = Box<dyn FnOnce() + Send>;

impl Pod {
    /// Starts `app` inside the container of the pod app `app_name`.
    ///
    /// The stager's run helper is launched as a tenant of the stager container
    /// and reads the JSON encoded `app` from a FIFO. If it has not read the
    /// configuration within the enter timeout, the helper is killed and
    /// [`PodliteError::EnterTimeout`] is returned.
    pub async fn enter(
        &self,
        app_name: &str,
        app: &RunApp,
        io: EnterIo,
        post_start: Option<PostStart>,
    ) -> PodliteResult<Arc<dyn ContainerProcess>> {
        let container = {
            let inner = self.lock_inner();
            if inner.shutting_down {
                return Err(PodliteError::InvalidState("pod is shutting down".into()));
            }
            if inner.state != PodState::Running {
                return Err(PodliteError::InvalidState(
                    "pod must be in the running state to enter it".into(),
                ));
            }
            if inner.manifest.app(app_name).is_none() {
                return Err(PodliteError::NotFound(format!(
                    "app {:?} does not exist in the pod",
                    app_name
                )));
            }
            inner.stager_container.clone().ok_or_else(|| {
                PodliteError::InvalidState("pod does not have a running stager".into())
            })?
        };

        let config = serde_json::to_vec(app)?;
        let fifo_name = format!("enter-{}", Uuid::new_v4());
        let fifo = self.stager_root().join("tmp").join(&fifo_name);
        mkfifo(&fifo, Mode::from_bits_truncate(0o600)).map_err(|e| {
            PodliteError::Internal(format!("failed to create run config pipe: {}", e))
        })?;

        let mut process = ProcessSpec::new(vec![RUN_BINARY.to_string(), app_name.to_string()]);
        process.env.push((RUN_CONFIG_ENV.to_string(), format!("/tmp/{}", fifo_name)));
        process.stdin = io.stdin;
        process.stdout = io.stdout;
        process.stderr = io.stderr;

        let handle = match container.start(process) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = fs::remove_file(&fifo);
                return Err(PodliteError::Container(format!(
                    "failed to start run process: {}",
                    e
                )));
            }
        };
        tracing::debug!(pod_id = %self.uuid(), app = app_name, pid = handle.pid(), "Entered pod");

        // Opening the write end blocks until the helper opens the read end.
        let writer_path = fifo.clone();
        let mut writer = tokio::task::spawn_blocking(move || {
            let mut pipe = OpenOptions::new().write(true).open(&writer_path)?;
            pipe.write_all(&config)
        });

        if let Some(callback) = post_start {
            callback();
        }

        let timeout = self.manager().options().enter_ack_timeout;
        let written = match tokio::time::timeout(timeout, &mut writer).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(pod_id = %self.uuid(), app = app_name, "Run process did not read its configuration");
                if let Err(e) = handle.signal(Signal::SIGKILL) {
                    tracing::warn!(pod_id = %self.uuid(), error = %e, "Failed to kill run process");
                }
                // Opening the read end releases a writer still blocked in open.
                let release = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&fifo);
                let _ = writer.await;
                drop(release);
                let _ = fs::remove_file(&fifo);
                return Err(PodliteError::EnterTimeout);
            }
        };

        let _ = fs::remove_file(&fifo);
        written
            .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?
            .map_err(|e| PodliteError::Internal(format!("failed to write run config: {}", e)))?;
        Ok(handle)
    }
}
