//! Integration tests for the pod lifecycle (create, run, stop, cleanup).

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use podlite::pod::{Options, PodOptions, PodState};
use podlite::PodliteError;
use podlite_shared::container::ExitStatus;
use podlite_shared::schema::{LinuxNamespaces, Namespace, NamespaceMode, PodManifest};
use podlite_test_utils::{Harness, MockNetworkManager, NetworkEvent};

const SETTLE: Duration = Duration::from_secs(5);

fn running_states() -> [PodState; 3] {
    [PodState::Running, PodState::Errored, PodState::Stopped]
}

// ============================================================================
// CREATE
// ============================================================================

#[tokio::test]
async fn create_runs_the_stager_in_the_pod_directory() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web", "db"]).await.unwrap();
    assert_eq!(pod.state(), PodState::Running);

    let dir = pod.directory().unwrap();
    assert_eq!(dir, h.dir.path().join("pods").join(pod.short_name()));
    let root = dir.join("stager");
    assert!(root.join("manifest").exists());
    assert!(dir.join("stager.log").exists());
    let resolv = std::fs::read_to_string(root.join("etc/resolv.conf")).unwrap();
    assert!(resolv.contains("nameserver 192.0.2.53"));

    let config = h.factory.config(pod.short_name()).unwrap();
    assert_eq!(config.rootfs, root);
    assert_eq!(
        config.cgroup_path.as_deref(),
        Some(format!("/podlite/{}", pod.short_name()).as_str())
    );
    assert!(config.has_namespace(Namespace::Mount));
    let started = h.factory.started(pod.short_name());
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].args, vec!["/stager"]);

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("manifest")).unwrap()).unwrap();
    assert_eq!(manifest["name"], "web");
    assert_eq!(manifest["pod"]["apps"].as_array().unwrap().len(), 2);

    pod.stop().await;
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let h = Harness::new().unwrap();
    let first = h.app_pod("web", &["web"]).await.unwrap();

    let err = h
        .manager
        .create("web", h.manifest(&["web"]).unwrap(), PodOptions::default())
        .unwrap_err();
    assert!(matches!(err, PodliteError::AlreadyExists(_)));
    assert!(err.to_string().contains("a pod with the name \"web\" already exists"));
    assert_eq!(h.manager.pods().len(), 1);

    // The name is free again once the pod is gone.
    first.stop().await;
    let second = h.app_pod("web", &["web"]).await.unwrap();
    assert_ne!(first.uuid(), second.uuid());
    second.stop().await;
}

#[tokio::test]
async fn invalid_manifests_are_rejected_before_registration() {
    let h = Harness::new().unwrap();

    let err = h
        .manager
        .create("empty", PodManifest::blank(), PodOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("must specify an App"));

    let mut manifest = h.manifest(&["web"]).unwrap();
    manifest.apps[0].image.id = "sha512-ffff".into();
    let err = h
        .manager
        .create("missing", manifest, PodOptions::default())
        .unwrap_err();
    assert!(matches!(err, PodliteError::Validation(_)));
    assert!(h.manager.pods().is_empty());
}

#[tokio::test]
async fn required_namespaces_cannot_be_shared_with_the_host() {
    let h = Harness::build(None, |opts: &mut Options| {
        opts.required_namespaces = vec![Namespace::Pid];
    })
    .unwrap();

    let mut manifest = h.manifest(&["web"]).unwrap();
    manifest.isolators.push(
        LinuxNamespaces::default()
            .with(Namespace::Pid, NamespaceMode::Host)
            .to_isolator(),
    );
    let err = h
        .manager
        .create("web", manifest, PodOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("must require the pid namespace"));
}

// ============================================================================
// STARTUP FAILURES
// ============================================================================

#[tokio::test]
async fn unknown_stager_image_errors_the_pod() {
    let h = Harness::new().unwrap();
    let options = PodOptions {
        stager_hash: "sha512-0bad".into(),
        ..Default::default()
    };
    let pod = h
        .manager
        .create("web", h.manifest(&["web"]).unwrap(), options)
        .unwrap();
    pod.wait_for_state(SETTLE, &running_states()).await.unwrap();

    assert_eq!(pod.state(), PodState::Errored);
    assert!(pod.directory().is_none());
    assert!(h.factory.created().is_empty());

    pod.stop().await;
    assert_eq!(pod.state(), PodState::Stopped);
    assert!(h.manager.pod(pod.uuid()).is_none());
}

#[tokio::test]
async fn errored_pods_keep_their_state_until_stopped() {
    let network = Arc::new(MockNetworkManager::new("/run/netns"));
    network.fail_provision(true);
    let h = Harness::with_network(network.clone()).unwrap();

    let pod = h.app_pod("web", &["web"]).await.unwrap();
    assert_eq!(pod.state(), PodState::Errored);

    // Startup does not roll back: the directory stays for inspection.
    let dir = pod.directory().unwrap();
    assert!(dir.join("stager").exists());
    assert!(h.manager.pod_by_name("web").is_some());

    pod.stop().await;
    assert_eq!(pod.state(), PodState::Stopped);
    assert!(!dir.exists());
    assert!(h.manager.pod_by_name("web").is_none());
    // Nothing was provisioned, so nothing is deprovisioned.
    assert_eq!(
        network.events(),
        vec![NetworkEvent::Provision {
            pod: pod.uuid().to_string(),
            networks: Vec::new(),
        }]
    );
}

// ============================================================================
// STOP
// ============================================================================

#[tokio::test]
async fn stop_tears_down_everything() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();
    let dir = pod.directory().unwrap();
    let stager = h.factory.process(pod.short_name()).unwrap();

    pod.stop().await;

    assert_eq!(pod.state(), PodState::Stopped);
    assert_eq!(stager.signals(), vec![Signal::SIGTERM]);
    assert_eq!(stager.exited(), Some(ExitStatus::exited(0)));
    assert_eq!(h.factory.destroyed(), vec![pod.short_name().to_string()]);
    assert!(!dir.exists());
    assert!(h.manager.pods().is_empty());
}

#[tokio::test]
async fn concurrent_stops_tear_down_once() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();

    tokio::join!(pod.stop(), pod.stop(), pod.stop());
    pod.wait().await;

    let stager = h.factory.process(pod.short_name()).unwrap();
    assert_eq!(stager.signals(), vec![Signal::SIGTERM]);
    assert_eq!(h.factory.destroyed().len(), 1);
    assert_eq!(pod.state(), PodState::Stopped);
}

#[tokio::test]
async fn stubborn_stagers_are_killed() {
    let h = Harness::build(None, |opts: &mut Options| {
        opts.stager_stop_timeout = Duration::from_millis(100);
    })
    .unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();
    let stager = h.factory.process(pod.short_name()).unwrap();
    stager.set_behavior(podlite_test_utils::Behavior::ignore_term());

    pod.stop().await;
    assert_eq!(stager.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    assert_eq!(stager.exited().unwrap().exit_code(), 137);
}

#[tokio::test]
async fn stager_exit_stops_the_pod() {
    let h = Harness::new().unwrap();
    let pod = h.app_pod("web", &["web"]).await.unwrap();
    let stager = h.factory.process(pod.short_name()).unwrap();

    stager.exit(ExitStatus::exited(1));
    tokio::time::timeout(SETTLE, pod.wait()).await.unwrap();

    assert_eq!(pod.state(), PodState::Stopped);
    assert!(stager.signals().is_empty());
    assert!(h.manager.pods().is_empty());
}

#[tokio::test]
async fn stop_during_startup_wins() {
    let h = Harness::new().unwrap();
    h.stager.set_ready(false);
    let pod = h
        .manager
        .create("web", h.manifest(&["web"]).unwrap(), PodOptions::default())
        .unwrap();

    // Wait until the stager runs but has not reported ready.
    for _ in 0..100 {
        if h.factory.process(pod.short_name()).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pod.state(), PodState::Starting);

    pod.stop().await;
    assert_eq!(pod.state(), PodState::Stopped);

    // A late startup never moves the pod back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pod.state(), PodState::Stopped);
}

// ============================================================================
// MANAGER
// ============================================================================

#[tokio::test]
async fn lookups_by_uuid_and_name() {
    let h = Harness::new().unwrap();
    let web = h.app_pod("web", &["web"]).await.unwrap();
    let db = h.app_pod("db", &["db"]).await.unwrap();

    assert_eq!(h.manager.pods().len(), 2);
    assert_eq!(h.manager.pod(web.uuid()).unwrap().name(), "web");
    assert_eq!(h.manager.pod_by_name("db").unwrap().uuid(), db.uuid());
    assert!(h.manager.pod_by_name("cache").is_none());
    assert_eq!(web.short_name().len(), 8);

    h.manager.shutdown().await;
    assert!(h.manager.pods().is_empty());
    assert_eq!(web.state(), PodState::Stopped);
    assert_eq!(db.state(), PodState::Stopped);
}
