//! Network fakes: a recording [`NetworkManager`] and file-backed namespaces.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use podlite::network::{NamespaceCreator, NetworkDriver, NetworkManager, Provisioned};
use podlite::pod::Pod;
use podlite_shared::schema::IpResult;
use podlite_shared::{PodliteError, PodliteResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Setup(Vec<String>),
    Provision { pod: String, networks: Vec<String> },
    Deprovision { pod: String },
}

/// Hands out `<netns_dir>/<pod uuid>` without creating anything.
pub struct MockNetworkManager {
    netns_dir: PathBuf,
    events: Mutex<Vec<NetworkEvent>>,
    results: Mutex<Vec<IpResult>>,
    fail_provision: AtomicBool,
}

impl MockNetworkManager {
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            netns_dir: netns_dir.into(),
            events: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            fail_provision: AtomicBool::new(false),
        }
    }

    pub fn set_results(&self, results: Vec<IpResult>) {
        *self.results.lock() = results;
    }

    pub fn fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().clone()
    }

    pub fn netns_path(&self, uuid: &str) -> PathBuf {
        self.netns_dir.join(uuid)
    }
}

#[async_trait]
impl NetworkManager for MockNetworkManager {
    async fn setup(&self, drivers: Vec<NetworkDriver>) -> PodliteResult<()> {
        let names = drivers.into_iter().map(|d| d.config.name).collect();
        self.events.lock().push(NetworkEvent::Setup(names));
        Ok(())
    }

    async fn provision(&self, pod: &Pod, networks: &[String]) -> PodliteResult<Provisioned> {
        self.events.lock().push(NetworkEvent::Provision {
            pod: pod.uuid().to_string(),
            networks: networks.to_vec(),
        });
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(PodliteError::Network("no driver could be reached".into()));
        }
        Ok(Provisioned {
            netns_path: self.netns_path(pod.uuid()),
            results: self.results.lock().clone(),
        })
    }

    async fn deprovision(&self, pod: &Pod) -> PodliteResult<()> {
        self.events.lock().push(NetworkEvent::Deprovision {
            pod: pod.uuid().to_string(),
        });
        Ok(())
    }
}

/// Plain files standing in for pinned namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileNamespaces;

impl NamespaceCreator for FileNamespaces {
    fn prepare_dir(&self, _dir: &Path) -> PodliteResult<()> {
        Ok(())
    }

    fn create(&self, path: &Path) -> PodliteResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| PodliteError::Network(format!("failed to create {}: {}", path.display(), e)))
    }

    fn delete(&self, path: &Path) -> PodliteResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
