//! `run` helper: starts one process in a running app container.
//!
//! Enter launches this inside the stager's container. The process
//! definition arrives on the FIFO named by `STAGER_RUN_CONFIG`; finishing
//! the read is what tells the manager the helper started.

use std::fs::File;
use std::path::Path;

use podlite_shared::constants::stager::RUN_CONFIG_ENV;
use podlite_shared::container::{parse_id, ContainerFactory, ProcessSpec};
use podlite_shared::schema::RunApp;
use podlite_shared::{PodliteError, PodliteResult};

use crate::layout::Layout;

/// Runs the configured process in `app`'s container and returns its shell
/// style exit code.
pub async fn run(
    app: &str,
    config_path: Option<&str>,
    layout: &Layout,
    factory: &dyn ContainerFactory,
) -> PodliteResult<i32> {
    let config_path = config_path.ok_or_else(|| {
        PodliteError::Config(format!("{} is not set", RUN_CONFIG_ENV))
    })?;
    let path = layout.resolve(config_path);
    let run_app = tokio::task::spawn_blocking(move || read_run_config(&path))
        .await
        .map_err(|e| PodliteError::Internal(format!("spawn_blocking failed: {}", e)))??;

    let spec = process_spec(&run_app)?;
    let container = factory.load(app)?;
    let process = container.start(spec)?;
    let status = process.wait().await?;
    tracing::debug!(app, %status, "Process exited");
    Ok(status.exit_code())
}

/// Opening the FIFO blocks until the manager opens its end.
fn read_run_config(path: &Path) -> PodliteResult<RunApp> {
    let file = File::open(path).map_err(|e| {
        PodliteError::Config(format!("failed to open run configuration {}: {}", path.display(), e))
    })?;
    serde_json::from_reader(file).map_err(|e| {
        PodliteError::Config(format!("failed to parse run configuration: {}", e))
    })
}

/// Stdio is left unset so the process inherits the helper's.
fn process_spec(app: &RunApp) -> PodliteResult<ProcessSpec> {
    if app.exec.is_empty() {
        return Err(PodliteError::Validation("no command to run was given".into()));
    }
    if app.tty {
        return Err(PodliteError::Validation(
            "allocating a terminal for an entered process is not supported".into(),
        ));
    }
    let mut process = ProcessSpec::new(app.exec.clone());
    if !app.working_directory.is_empty() {
        process.cwd = app.working_directory.clone();
    }
    process.env = app
        .environment
        .iter()
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect();
    process.uid = parse_id(&app.user)?;
    process.gid = parse_id(&app.group)?;
    process.additional_gids = app.supplementary_gids.clone();
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlite_shared::schema::NameValue;

    #[test]
    fn spec_from_run_app() {
        let app = RunApp {
            exec: vec!["/bin/sh".into(), "-c".into(), "id".into()],
            user: "1000".into(),
            group: "100".into(),
            supplementary_gids: vec![27],
            working_directory: "/srv".into(),
            environment: vec![NameValue::new("TERM", "dumb")],
            tty: false,
        };
        let spec = process_spec(&app).unwrap();
        assert_eq!(spec.uid, 1000);
        assert_eq!(spec.gid, 100);
        assert_eq!(spec.additional_gids, vec![27]);
        assert_eq!(spec.cwd, "/srv");
        assert_eq!(spec.env_strings(), vec!["TERM=dumb"]);
        assert!(spec.stdin.is_none());

        assert_eq!(process_spec(&RunApp::root(vec!["ls".into()])).unwrap().cwd, "/");
        assert!(process_spec(&RunApp::default()).is_err());
    }

    #[test]
    fn terminal_requests_are_refused() {
        let mut app = RunApp::root(vec!["/bin/sh".into()]);
        app.tty = true;
        let err = process_spec(&app).unwrap_err();
        assert!(matches!(err, PodliteError::Validation(_)));
        assert!(err.to_string().contains("terminal"));
    }

    #[test]
    fn reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enter-1");
        std::fs::write(&path, r#"{"exec": ["/bin/true"], "user": "0", "group": "0"}"#).unwrap();
        let app = read_run_config(&path).unwrap();
        assert_eq!(app.exec, vec!["/bin/true"]);

        std::fs::write(&path, "not json").unwrap();
        let err = read_run_config(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse run configuration"));
    }
}
