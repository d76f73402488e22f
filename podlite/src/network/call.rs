//! A single driver invocation through Enter.

use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::pipe2;
use podlite_shared::schema::RunApp;
use podlite_shared::{PodliteError, PodliteResult};

use crate::pod::{EnterIo, Pod};

/// Runs `exec args..` as root in the `driver` app of `network_pod`, feeding
/// `config` on stdin.
///
/// Returns the combined stdout and stderr on a zero exit. A non-zero exit is
/// an error carrying that output; running past `timeout` kills the process
/// and returns [`PodliteError::CallTimeout`].
pub(super) async fn call(
    network_pod: &Pod,
    driver: &str,
    exec: &str,
    args: &[String],
    config: &[u8],
    timeout: Duration,
) -> PodliteResult<Vec<u8>> {
    let (stdin_r, stdin_w) = pipe2(OFlag::O_CLOEXEC)?;
    let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC)?;
    let stderr_w = stdout_w.try_clone()?;

    let mut command = vec![exec.to_string()];
    command.extend(args.iter().cloned());
    let app = RunApp::root(command);

    let io = EnterIo {
        stdin: Some(stdin_r),
        stdout: Some(stdout_w),
        stderr: Some(stderr_w),
    };
    let process = network_pod.enter(driver, &app, io, None).await?;

    // Our copies of the child's pipe ends went away with the process spec.
    let config = config.to_vec();
    let writer = tokio::task::spawn_blocking(move || {
        let mut stdin = File::from(stdin_w);
        let _ = stdin.write_all(&config);
    });
    let reader = tokio::task::spawn_blocking(move || {
        let mut output = Vec::new();
        let _ = File::from(stdout_r).read_to_end(&mut output);
        output
    });

    let status = match tokio::time::timeout(timeout, process.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            if let Err(e) = process.signal(Signal::SIGKILL) {
                tracing::warn!(driver, error = %e, "Failed to kill timed out driver call");
            }
            return Err(PodliteError::CallTimeout);
        }
    };

    let _ = writer.await;
    let output = reader
        .await
        .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))?;

    if status.exit_code() != 0 {
        return Err(PodliteError::Network(format!(
            "exited {}: {}",
            status.exit_code(),
            String::from_utf8_lossy(&output)
        )));
    }
    Ok(output)
}
