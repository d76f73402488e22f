//! Manifest schema shared by the manager, the stager and the drivers.
//!
//! Field names follow the appc JSON encoding so existing manifests load
//! unchanged.

mod image;
mod isolator;
mod network;
mod pod;
mod run_app;
mod stager;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{PodliteError, PodliteResult};

pub use image::{App, Dependency, ImageManifest, MountPoint};
pub use isolator::{
    flag_enabled, namespaces, Isolator, LinuxNamespaces, Namespace, NamespaceMode,
};
pub use network::{Dns, IpConfig, IpResult, NetConf, Route};
pub use pod::{Mount, PodManifest, RuntimeApp, RuntimeImage, Volume, VolumeKind};
pub use run_app::RunApp;
pub use stager::{AppState, StagerConfig, StagerManifest, StagerPhase, StagerState};

/// A `{name, value}` pair, used for labels, annotations and environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub type Label = NameValue;
pub type Annotation = NameValue;

pub(crate) fn label_value<'a>(labels: &'a [Label], name: &str) -> Option<&'a str> {
    labels
        .iter()
        .find(|l| l.name == name)
        .map(|l| l.value.as_str())
}

static AC_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+([-][a-z0-9]+)*$").expect("AC name pattern is valid")
});

static IMAGE_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha512-[0-9a-f]{1,128}$").expect("hash pattern is valid"));

/// Validates an app, volume or pod name.
pub fn validate_ac_name(name: &str) -> PodliteResult<()> {
    if AC_NAME.is_match(name) {
        Ok(())
    } else {
        Err(PodliteError::Validation(format!(
            "{:?} is not a valid name: must be lowercase alphanumerics separated by dashes",
            name
        )))
    }
}

/// True for `sha512-<hex>` identifiers.
pub fn is_image_hash(s: &str) -> bool {
    IMAGE_HASH.is_match(s)
}
