//! Integration tests for pod networking: driver pods, provisioning and the
//! shutdown order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use podlite::network::{DriverManager, NetworkDriver, NetworkManager, NetworkOptions};
use podlite::pod::{PodOptions, PodState};
use podlite_shared::constants::network::{ADD_CMD, DEL_CMD, NETNS_MOUNT_PATH, NETWORK_POD_NAME};
use podlite_shared::container::NamespaceConfig;
use podlite_shared::schema::{
    LinuxNamespaces, Namespace, NamespaceMode, NetConf, RuntimeImage,
};
use podlite_test_utils::images::app_manifest;
use podlite_test_utils::{CommandScript, FileNamespaces, Harness, MockNetworkManager, NetworkEvent};
use serde_json::json;

const BRIDGE_RESULT: &[u8] =
    br#"{"ip4":{"ip":"10.1.0.2/24","gateway":"10.1.0.1"},"dns":{"nameservers":["10.1.0.1"]}}"#;

struct DriverContext {
    h: Harness,
    drivers: Arc<DriverManager>,
    netns_dir: PathBuf,
}

impl DriverContext {
    async fn new(call_timeout: Duration) -> Self {
        let h = Harness::new().unwrap();
        let netns_dir = h.dir.path().join("netns");
        let opts = NetworkOptions {
            netns_directory: Some(netns_dir.clone()),
            call_timeout,
            pod_start_timeout: Duration::from_secs(5),
        };
        let drivers = DriverManager::new(&h.manager, Arc::new(FileNamespaces), opts).unwrap();
        h.manager.set_network_manager(drivers.clone());

        let image = h
            .images
            .add(app_manifest("podlite/bridge", &["/opt/network/setup"]))
            .unwrap();
        let config = NetConf::from_json(json!({
            "name": "bridge",
            "default": true,
            "containerInterface": "eth{{num}}",
            "bridge": "br0"
        }))
        .unwrap();
        drivers
            .setup(vec![NetworkDriver {
                image: RuntimeImage {
                    id: image,
                    ..Default::default()
                },
                config,
            }])
            .await
            .unwrap();

        Self {
            h,
            drivers,
            netns_dir,
        }
    }
}

// ============================================================================
// DRIVER PODS
// ============================================================================

#[tokio::test]
async fn setup_launches_the_networking_pod() {
    let ctx = DriverContext::new(Duration::from_secs(5)).await;
    let pod = ctx.drivers.network_pod().unwrap();
    assert_eq!(pod.name(), NETWORK_POD_NAME);
    assert_eq!(pod.state(), PodState::Running);

    // It shares the host network, so it was never provisioned itself.
    assert!(pod.netns_path().is_none());
    let config = ctx.h.factory.config(pod.short_name()).unwrap();
    assert!(!config.has_namespace(Namespace::Net));
    let netns = ctx.netns_dir.display().to_string();
    assert!(config.mounts.iter().any(|m| m.source == netns));
    assert!(pod.manifest().app("bridge").is_some());

    ctx.h.manager.shutdown().await;
}

#[tokio::test]
async fn provision_runs_the_driver_and_records_its_result() {
    let ctx = DriverContext::new(Duration::from_secs(5)).await;
    ctx.h.stager.on_command(
        ADD_CMD,
        CommandScript::Output {
            stdout: BRIDGE_RESULT.to_vec(),
            code: 0,
        },
    );

    let pod = ctx.h.app_pod("web", &["web"]).await.unwrap();
    assert_eq!(pod.state(), PodState::Running);

    let results = pod.network_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "bridge");
    assert_eq!(results[0].container_interface, "eth0");
    assert_eq!(results[0].ip4.as_ref().unwrap().ip, "10.1.0.2/24");

    let netns = ctx.netns_dir.join(pod.uuid());
    assert_eq!(pod.netns_path(), Some(netns.clone()));
    assert!(netns.exists());
    let config = ctx.h.factory.config(pod.short_name()).unwrap();
    assert!(config
        .namespaces
        .contains(&NamespaceConfig::join(Namespace::Net, &netns)));

    // Driver DNS wins over the host's resolv.conf.
    let resolv =
        std::fs::read_to_string(pod.directory().unwrap().join("stager/etc/resolv.conf")).unwrap();
    assert!(resolv.contains("nameserver 10.1.0.1"));
    assert!(!resolv.contains("192.0.2.53"));

    let network_pod = ctx.drivers.network_pod().unwrap();
    let entered = ctx.h.stager.entered();
    assert_eq!(entered.len(), 1);
    assert_eq!(entered[0].container_id, network_pod.short_name());
    assert_eq!(entered[0].app, "bridge");
    assert_eq!(
        entered[0].run_app.exec,
        vec![
            ADD_CMD.to_string(),
            format!("{}/{}", NETNS_MOUNT_PATH, pod.uuid()),
            pod.uuid().to_string(),
            "eth0".to_string(),
        ]
    );
    let stdin: serde_json::Value = serde_json::from_slice(&entered[0].stdin).unwrap();
    assert_eq!(stdin["bridge"], "br0");

    pod.stop().await;
    let entered = ctx.h.stager.entered();
    assert_eq!(entered.len(), 2);
    assert_eq!(entered[1].run_app.exec[0], DEL_CMD);
    assert_eq!(entered[1].run_app.exec[3], "eth0");
    assert!(!netns.exists());

    ctx.h.manager.shutdown().await;
}

#[tokio::test]
async fn timed_out_drivers_are_skipped() {
    let ctx = DriverContext::new(Duration::from_millis(200)).await;
    ctx.h.stager.on_command(ADD_CMD, CommandScript::Hang);

    let pod = ctx.h.app_pod("web", &["web"]).await.unwrap();
    assert_eq!(pod.state(), PodState::Running);
    assert!(pod.network_results().is_empty());
    assert!(pod.netns_path().is_some());

    let network_pod = ctx.drivers.network_pod().unwrap();
    let helper = ctx.h.factory.processes(network_pod.short_name()).pop().unwrap();
    assert_eq!(helper.exited().unwrap().exit_code(), 137);

    ctx.h.manager.shutdown().await;
}

#[tokio::test]
async fn failing_drivers_are_skipped() {
    let ctx = DriverContext::new(Duration::from_secs(5)).await;
    ctx.h.stager.on_command(
        ADD_CMD,
        CommandScript::Output {
            stdout: b"no bridge".to_vec(),
            code: 1,
        },
    );

    let pod = ctx.h.app_pod("web", &["web"]).await.unwrap();
    assert_eq!(pod.state(), PodState::Running);
    assert!(pod.network_results().is_empty());

    ctx.h.manager.shutdown().await;
}

#[tokio::test]
async fn unknown_networks_fail_startup() {
    let ctx = DriverContext::new(Duration::from_secs(5)).await;
    let options = PodOptions {
        networks: vec!["overlay".into()],
        ..Default::default()
    };
    let pod = ctx
        .h
        .manager
        .create("web", ctx.h.manifest(&["web"]).unwrap(), options)
        .unwrap();
    pod.wait_for_state(
        Duration::from_secs(5),
        &[PodState::Running, PodState::Errored],
    )
    .await
    .unwrap();
    assert_eq!(pod.state(), PodState::Errored);
    assert!(ctx.h.stager.entered().is_empty());

    ctx.h.manager.shutdown().await;
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test]
async fn shutdown_stops_the_networking_pod_last() {
    let network = Arc::new(MockNetworkManager::new("/run/podlite/netns"));
    let h = Harness::with_network(network.clone()).unwrap();

    let mut manifest = h.manifest(&["bridge"]).unwrap();
    manifest.isolators.push(
        LinuxNamespaces::default()
            .with(Namespace::Net, NamespaceMode::Host)
            .to_isolator(),
    );
    let network_pod = h
        .manager
        .create(NETWORK_POD_NAME, manifest, PodOptions::default())
        .unwrap();
    network_pod
        .wait_for_state(Duration::from_secs(5), &[PodState::Running])
        .await
        .unwrap();
    let web = h.app_pod("web", &["web"]).await.unwrap();
    let db = h.app_pod("db", &["db"]).await.unwrap();

    h.manager.shutdown().await;

    let destroyed = h.factory.destroyed();
    assert_eq!(destroyed.len(), 3);
    assert_eq!(destroyed[2], network_pod.short_name());
    assert!(h.manager.pods().is_empty());

    let deprovisioned: Vec<_> = network
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NetworkEvent::Deprovision { pod } => Some(pod),
            _ => None,
        })
        .collect();
    assert_eq!(deprovisioned.len(), 2);
    assert!(deprovisioned.contains(&web.uuid().to_string()));
    assert!(deprovisioned.contains(&db.uuid().to_string()));
}

#[tokio::test]
async fn host_network_pods_skip_provisioning() {
    let network = Arc::new(MockNetworkManager::new("/run/podlite/netns"));
    let h = Harness::with_network(network.clone()).unwrap();

    let mut manifest = h.manifest(&["web"]).unwrap();
    manifest.isolators.push(
        LinuxNamespaces::default()
            .with(Namespace::Net, NamespaceMode::Host)
            .to_isolator(),
    );
    let pod = h
        .manager
        .create("web", manifest, PodOptions::default())
        .unwrap();
    pod.wait_for_state(Duration::from_secs(5), &[PodState::Running])
        .await
        .unwrap();

    assert!(network.events().is_empty());
    let config = h.factory.config(pod.short_name()).unwrap();
    assert!(!config.has_namespace(Namespace::Net));
    pod.stop().await;
    assert!(network.events().is_empty());
}
