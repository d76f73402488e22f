//! Stager teardown: apps first, then init, then the containers.

use std::sync::Arc;

use futures::future::join_all;
use nix::sys::signal::Signal;
use podlite_shared::constants::stager::INIT_CONTAINER;
use podlite_shared::container::{Container, ContainerProcess};
use podlite_shared::pipeline::Pipeline;
use podlite_shared::pipeline_task;
use podlite_shared::schema::StagerPhase;
use podlite_shared::{PodliteError, PodliteResult};

use super::Supervisor;

pipeline_task!(StopApps, "stop_apps", Arc<Supervisor>, stop_apps);
pipeline_task!(RecordExits, "record_exits", Arc<Supervisor>, record_exits);
pipeline_task!(StopInit, "stop_init", Arc<Supervisor>, stop_init);
pipeline_task!(DestroyApps, "destroy_apps", Arc<Supervisor>, destroy_apps);
pipeline_task!(DestroyInit, "destroy_init", Arc<Supervisor>, destroy_init);

fn pipeline() -> Pipeline<Arc<Supervisor>> {
    Pipeline::new("stager teardown")
        .task(StopApps)
        .task(RecordExits)
        .task(StopInit)
        .task(DestroyApps)
        .task(DestroyInit)
}

impl Supervisor {
    /// Runs once; later calls return immediately. Every step runs even when
    /// an earlier one failed.
    pub(super) async fn teardown(self: &Arc<Self>) {
        if !self.state.set_phase(StagerPhase::Teardown) {
            return;
        }
        if let Err(e) = self.state.persist() {
            tracing::error!(error = %e, "Failed to write state file");
        }

        let mut sup = Arc::clone(self);
        for failure in pipeline().run_all(&mut sup).await {
            tracing::error!(step = failure.step, error = %failure.error, "Teardown step failed");
        }
        tracing::info!("Teardown complete");
    }

    /// Every app gets its own grace period, concurrently.
    async fn stop_apps(&self) -> PodliteResult<()> {
        let apps = self.inner.lock().apps.clone();
        let state = self.state.snapshot();
        let running = apps
            .iter()
            .filter(|(name, _)| !state.apps.get(name).is_some_and(|a| a.exited));
        join_all(running.map(|(name, launched)| self.stop_process(name, &launched.process))).await;
        Ok(())
    }

    /// Waits for every app's exit to reach the state file.
    async fn record_exits(&self) -> PodliteResult<()> {
        let waiters = std::mem::take(&mut self.inner.lock().waiters);
        let failed = join_all(waiters)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();
        if failed == 0 {
            Ok(())
        } else {
            Err(PodliteError::Internal(format!(
                "{} app exit waiters did not finish",
                failed
            )))
        }
    }

    async fn stop_init(&self) -> PodliteResult<()> {
        let init = self.inner.lock().init.clone();
        if let Some(init) = init {
            self.stop_process(INIT_CONTAINER, &init.process).await;
        }
        Ok(())
    }

    /// SIGTERM, then SIGKILL once the grace period passes.
    async fn stop_process(&self, name: &str, process: &Arc<dyn ContainerProcess>) {
        if let Err(e) = process.signal(Signal::SIGTERM) {
            tracing::warn!(process = name, error = %e, "Failed to send SIGTERM");
        }
        let grace = self.opts.stop_grace;
        if tokio::time::timeout(grace, process.wait()).await.is_ok() {
            return;
        }

        tracing::warn!(process = name, ?grace, "Process did not exit in time, killing it");
        if let Err(e) = process.signal(Signal::SIGKILL) {
            tracing::warn!(process = name, error = %e, "Failed to send SIGKILL");
        }
        let _ = process.wait().await;
    }

    async fn destroy_apps(&self) -> PodliteResult<()> {
        let apps = std::mem::take(&mut self.inner.lock().apps);
        let mut errors = Vec::new();
        for (name, launched) in apps {
            if let Err(e) = destroy(launched.container).await {
                errors.push(format!("{}: {}", name, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PodliteError::Container(format!(
                "failed to destroy app containers: {}",
                errors.join("; ")
            )))
        }
    }

    async fn destroy_init(&self) -> PodliteResult<()> {
        let init = self.inner.lock().init.take();
        match init {
            Some(init) => destroy(init.container).await,
            None => Ok(()),
        }
    }
}

async fn destroy(container: Arc<dyn Container>) -> PodliteResult<()> {
    tokio::task::spawn_blocking(move || container.destroy())
        .await
        .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_order() {
        assert_eq!(
            pipeline().steps(),
            vec![
                "stop_apps",
                "record_exits",
                "stop_init",
                "destroy_apps",
                "destroy_init"
            ]
        );
    }
}
