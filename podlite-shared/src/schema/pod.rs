use serde::{Deserialize, Serialize};

use super::image::App;
use super::isolator::Isolator;
use super::{Annotation, Label};

/// Declarative description of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    #[serde(default = "pod_kind")]
    pub ac_kind: String,
    #[serde(default)]
    pub ac_version: String,
    #[serde(default)]
    pub apps: Vec<RuntimeApp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub isolators: Vec<Isolator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

fn pod_kind() -> String {
    "PodManifest".to_string()
}

impl PodManifest {
    pub fn blank() -> Self {
        Self {
            ac_kind: pod_kind(),
            ..Default::default()
        }
    }

    pub fn isolator(&self, name: &str) -> Option<&Isolator> {
        self.isolators.iter().find(|i| i.name == name)
    }

    pub fn app(&self, name: &str) -> Option<&RuntimeApp> {
        self.apps.iter().find(|a| a.name == name)
    }
}

/// An application entry of a pod, bound to an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeApp {
    pub name: String,
    pub image: RuntimeImage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeImage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl RuntimeImage {
    pub fn version(&self) -> &str {
        super::label_value(&self.labels, "version").unwrap_or("")
    }
}

/// Binds a pod volume into an app at `path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub volume: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// Bind-mounted from `source` on the host.
    Host,
    /// Allocated by the runtime under its volume directory.
    #[default]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub kind: VolumeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

impl Volume {
    pub fn host(name: impl Into<String>, source: impl Into<String>, read_only: bool) -> Self {
        Self {
            name: name.into(),
            kind: VolumeKind::Host,
            source: Some(source.into()),
            read_only: Some(read_only),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }
}
