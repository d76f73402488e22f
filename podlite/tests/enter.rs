//! Integration tests for running processes inside a live pod.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::pipe;
use podlite::pod::{EnterIo, PodOptions, PodState};
use podlite::PodliteError;
use podlite_shared::constants::stager::{RUN_BINARY, RUN_CONFIG_ENV};
use podlite_shared::schema::{NameValue, RunApp};
use podlite_test_utils::{CommandScript, EnterMode, Harness};

fn tmp_entries(root: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(root.join("tmp"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn enter_hands_the_process_to_the_run_helper() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web", "db"]).await.unwrap();

    let mut app = RunApp::root(vec!["/bin/sh".into(), "-c".into(), "env".into()]);
    app.environment.push(NameValue::new("TERM", "dumb"));
    app.working_directory = "/srv".into();

    let process = pod.enter("db", &app, EnterIo::default(), None).await.unwrap();
    assert!(process.wait().await.unwrap().success());

    let started = h.factory.started(pod.short_name());
    assert_eq!(started.len(), 2);
    let helper = &started[1];
    assert_eq!(helper.args, vec![RUN_BINARY.to_string(), "db".to_string()]);
    let config = helper.env_value(RUN_CONFIG_ENV).unwrap();
    assert!(config.starts_with("/tmp/enter-"), "{}", config);

    let entered = h.stager.entered();
    assert_eq!(entered.len(), 1);
    assert_eq!(entered[0].app, "db");
    assert_eq!(entered[0].container_id, pod.short_name());
    assert_eq!(entered[0].run_app, app);

    // The FIFO is gone once the configuration was read.
    let root = pod.directory().unwrap().join("stager");
    assert!(tmp_entries(&root).is_empty());

    pod.stop().await;
}

#[tokio::test]
async fn entered_process_streams_are_passed_through() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();
    h.stager.on_command(
        "/bin/hostname",
        CommandScript::Output {
            stdout: b"web-pod\n".to_vec(),
            code: 0,
        },
    );

    let (read_end, write_end) = pipe().unwrap();
    let io = EnterIo {
        stdout: Some(write_end),
        ..Default::default()
    };
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let process = pod
        .enter(
            "web",
            &RunApp::root(vec!["/bin/hostname".into()]),
            io,
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        )
        .await
        .unwrap();
    assert!(started.load(Ordering::SeqCst));
    assert_eq!(process.wait().await.unwrap().exit_code(), 0);

    let mut output = String::new();
    File::from(read_end).read_to_string(&mut output).unwrap();
    assert_eq!(output, "web-pod\n");

    pod.stop().await;
}

#[tokio::test]
async fn enter_rejects_unknown_apps() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();

    let err = pod
        .enter("cache", &RunApp::root(vec!["/bin/true".into()]), EnterIo::default(), None)
        .await
        .err()
        .expect("expected enter to fail");
    assert!(matches!(err, PodliteError::NotFound(_)));
    assert_eq!(h.factory.started(pod.short_name()).len(), 1);

    pod.stop().await;
}

#[tokio::test]
async fn enter_times_out_when_the_helper_never_reads() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();
    h.stager.set_enter_mode(EnterMode::NeverRead);

    let err = pod
        .enter("web", &RunApp::root(vec!["/bin/true".into()]), EnterIo::default(), None)
        .await
        .err()
        .expect("expected enter to fail");
    assert!(matches!(err, PodliteError::EnterTimeout));
    assert!(err.is_timeout());

    let helper = h.factory.processes(pod.short_name()).pop().unwrap();
    assert!(helper.received(Signal::SIGKILL));
    let root = pod.directory().unwrap().join("stager");
    assert!(tmp_entries(&root).is_empty());
    assert!(h.stager.entered().is_empty());

    pod.stop().await;
}

#[tokio::test]
async fn stopped_pods_cannot_be_entered() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();
    pod.stop().await;

    let err = pod
        .enter("web", &RunApp::root(vec!["/bin/true".into()]), EnterIo::default(), None)
        .await
        .err()
        .expect("expected enter to fail");
    assert!(matches!(err, PodliteError::InvalidState(_)));
}

#[tokio::test]
async fn starting_pods_cannot_be_entered() {
    let h = Harness::new().unwrap();
    h.stager.set_ready(false);
    let pod = h
        .manager
        .create("web", h.manifest(&["web"]).unwrap(), PodOptions::default())
        .unwrap();
    for _ in 0..100 {
        if h.factory.process(pod.short_name()).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pod.state(), PodState::Starting);

    let err = pod
        .enter("web", &RunApp::root(vec!["/bin/true".into()]), EnterIo::default(), None)
        .await
        .err()
        .expect("expected enter to fail");
    assert!(matches!(err, PodliteError::InvalidState(_)));
    assert!(err.to_string().contains("running state"));
    assert_eq!(h.factory.started(pod.short_name()).len(), 1);
    assert!(h.stager.entered().is_empty());

    pod.stop().await;
}
