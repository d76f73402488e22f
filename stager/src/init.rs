//! The init container's process: PID 1 of the pod.
//!
//! It holds the pod's namespaces open, reaps orphans reparented to it, and
//! exits on SIGTERM or SIGINT.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use podlite_shared::PodliteResult;
use tokio::signal::unix::{signal, SignalKind};

pub async fn pause() -> PodliteResult<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut child = signal(SignalKind::child())?;

    loop {
        tokio::select! {
            _ = term.recv() => break,
            _ = int.recv() => break,
            _ = child.recv() => {
                let reaped = reap();
                tracing::debug!(reaped, "Reaped children");
            }
        }
    }
    Ok(())
}

/// Collects every exited child without blocking.
fn reap() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return reaped,
            Ok(_) => reaped += 1,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                return reaped;
            }
        }
    }
}

