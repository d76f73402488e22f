//! Pod teardown pipeline.
//!
//! Every step checks what startup got around to creating, so the same
//! pipeline cleans up a running pod and one whose startup failed halfway.

use std::fs;
use std::sync::Arc;

use nix::sys::signal::Signal;
use podlite_shared::pipeline::Pipeline;
use podlite_shared::pipeline_task;
use podlite_shared::{PodliteError, PodliteResult};

use super::fsutil::unmount_tree;
use super::pod::Pod;

pipeline_task!(ReadySocket, "ready_socket", Arc<Pod>, release_ready_socket);
pipeline_task!(SignalStager, "signal", Arc<Pod>, signal_stager);
pipeline_task!(Network, "network", Arc<Pod>, deprovision_network);
pipeline_task!(Stager, "stager", Arc<Pod>, destroy_stager);
pipeline_task!(Directories, "directories", Arc<Pod>, remove_directories);
pipeline_task!(RemoveFromParent, "remove_from_parent", Arc<Pod>, remove_from_parent);

pub(super) fn pipeline() -> Pipeline<Arc<Pod>> {
    Pipeline::new("pod teardown")
        .task(ReadySocket)
        .task(SignalStager)
        .task(Network)
        .task(Stager)
        .task(Directories)
        .task(RemoveFromParent)
}

impl Pod {
    async fn release_ready_socket(&self) -> PodliteResult<()> {
        drop(self.lock_inner().ready.take());
        Ok(())
    }

    /// SIGTERM, then SIGKILL once the stop timeout passes.
    async fn signal_stager(&self) -> PodliteResult<()> {
        let Some(process) = self.lock_inner().stager_process.clone() else {
            return Ok(());
        };
        let mut exited = self.stager_exit_signal();
        let already_exited = exited.borrow().is_some();
        if already_exited {
            return Ok(());
        }

        if let Err(e) = process.signal(Signal::SIGTERM) {
            tracing::warn!(pod_id = %self.uuid(), error = %e, "Failed to send SIGTERM to stager");
        }

        let timeout = self.manager().options().stager_stop_timeout;
        let stopped = tokio::time::timeout(timeout, exited.wait_for(Option::is_some))
            .await
            .is_ok();
        if stopped {
            return Ok(());
        }

        tracing::warn!(pod_id = %self.uuid(), ?timeout, "Stager did not exit in time, killing it");
        process.signal(Signal::SIGKILL)?;
        let _ = exited.wait_for(Option::is_some).await;
        Ok(())
    }

    async fn deprovision_network(&self) -> PodliteResult<()> {
        let provisioned = {
            let inner = self.lock_inner();
            !inner.skip_networking && inner.netns_path.is_some()
        };
        if !provisioned {
            return Ok(());
        }
        let Some(network) = self.manager().network_manager().cloned() else {
            return Ok(());
        };
        network.deprovision(self).await
    }

    async fn destroy_stager(&self) -> PodliteResult<()> {
        let Some(container) = self.lock_inner().stager_container.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || container.destroy())
            .await
            .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?
    }

    /// Unmounts anything still mounted under the pod directory, then
    /// removes it.
    async fn remove_directories(&self) -> PodliteResult<()> {
        let Some(directory) = self.lock_inner().directory.take() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || {
            unmount_tree(&directory)?;
            match fs::remove_dir_all(&directory) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(PodliteError::Storage(format!(
                    "failed to remove pod directory {}: {}",
                    directory.display(),
                    e
                ))),
            }
        })
        .await
        .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?
    }

    async fn remove_from_parent(&self) -> PodliteResult<()> {
        self.manager().remove(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_order() {
        assert_eq!(
            pipeline().steps(),
            vec![
                "ready_socket",
                "signal",
                "network",
                "stager",
                "directories",
                "remove_from_parent"
            ]
        );
    }
}
