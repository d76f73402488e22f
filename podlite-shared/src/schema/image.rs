use serde::{Deserialize, Serialize};

use super::isolator::Isolator;
use super::{Annotation, Label, NameValue};

/// Manifest of a content-addressed filesystem image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default = "image_kind")]
    pub ac_kind: String,
    #[serde(default)]
    pub ac_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

fn image_kind() -> String {
    "ImageManifest".to_string()
}

impl ImageManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            ac_kind: image_kind(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Value of the label `name`, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        super::label_value(&self.labels, name)
    }
}

/// A declared dependency, located either by exact hash or by name and labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub image_name: String,
    #[serde(rename = "imageID", default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl Dependency {
    pub fn version(&self) -> &str {
        super::label_value(&self.labels, "version").unwrap_or("")
    }
}

/// Execution parameters of an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    #[serde(default)]
    pub exec: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
    #[serde(rename = "supplementaryGIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub supplementary_gids: Vec<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<NameValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub isolators: Vec<Isolator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<MountPoint>,
}

impl App {
    pub fn isolator(&self, name: &str) -> Option<&Isolator> {
        self.isolators.iter().find(|i| i.name == name)
    }

    /// Environment as `KEY=VALUE` pairs, preserving declaration order.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.environment
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    /// Working directory, defaulting to the root.
    pub fn cwd(&self) -> &str {
        if self.working_directory.is_empty() {
            "/"
        } else {
            &self.working_directory
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}
