//! A pod manager wired to the mocks, rooted in a temp directory.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use podlite::network::NetworkManager;
use podlite::pod::{Manager, Options, Pod, PodOptions, PodState};
use podlite_shared::schema::{PodManifest, RuntimeApp, RuntimeImage};
use podlite_shared::PodliteResult;
use tempfile::TempDir;

use crate::container::MockFactory;
use crate::images::{app_manifest, stager_manifest, MockImageManager};
use crate::stager::ScriptedStager;

pub const HOST_RESOLV_CONF: &str = "nameserver 192.0.2.53\nsearch example.test\n";

pub struct Harness {
    pub dir: TempDir,
    pub images: Arc<MockImageManager>,
    pub factory: MockFactory,
    pub stager: ScriptedStager,
    pub stager_hash: String,
    pub manager: Arc<Manager>,
}

impl Harness {
    pub fn new() -> PodliteResult<Self> {
        Self::build(None, |_| {})
    }

    pub fn with_network(network: Arc<dyn NetworkManager>) -> PodliteResult<Self> {
        Self::build(Some(network), |_| {})
    }

    /// Lets the caller adjust the manager options before it is created.
    pub fn build(
        network: Option<Arc<dyn NetworkManager>>,
        configure: impl FnOnce(&mut Options),
    ) -> PodliteResult<Self> {
        let dir = TempDir::new()?;
        let images = Arc::new(MockImageManager::new()?);
        let stager_hash = images.add(stager_manifest())?;

        let factory = MockFactory::new();
        let stager = ScriptedStager::new();
        factory.set_hook(stager.hook());

        let resolv_conf = dir.path().join("resolv.conf");
        fs::write(&resolv_conf, HOST_RESOLV_CONF)?;

        let mut opts = Options {
            pod_directory: dir.path().join("pods"),
            volume_directory: dir.path().join("volumes"),
            default_stager_hash: stager_hash.clone(),
            host_socket_file: dir.path().join("podlite.sock"),
            host_resolv_conf: resolv_conf,
            stager_stop_timeout: Duration::from_secs(2),
            enter_ack_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        configure(&mut opts);

        let manager = Manager::new(opts, images.clone(), network, Arc::new(factory.clone()))?;
        Ok(Self {
            dir,
            images,
            factory,
            stager,
            stager_hash,
            manager,
        })
    }

    /// A manifest with one app per name, each with its own image.
    pub fn manifest(&self, apps: &[&str]) -> PodliteResult<PodManifest> {
        let mut manifest = PodManifest::blank();
        for name in apps {
            let hash = self
                .images
                .add(app_manifest(&format!("example/{}", name), &["/bin/app"]))?;
            manifest.apps.push(RuntimeApp {
                name: name.to_string(),
                image: RuntimeImage {
                    id: hash,
                    ..Default::default()
                },
                app: None,
                mounts: Vec::new(),
            });
        }
        Ok(manifest)
    }

    /// Creates a pod of `apps` and waits for it to leave STARTING.
    pub async fn app_pod(&self, name: &str, apps: &[&str]) -> PodliteResult<Arc<Pod>> {
        let pod = self
            .manager
            .create(name, self.manifest(apps)?, PodOptions::default())?;
        pod.wait_for_state(
            Duration::from_secs(5),
            &[PodState::Running, PodState::Errored, PodState::Stopped],
        )
        .await?;
        Ok(pod)
    }
}
