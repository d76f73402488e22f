//! Image dependency resolution.
//!
//! The walk is a depth-first preorder where the first visit of a hash wins:
//! each dependency is appended when first seen and its own dependencies are
//! walked before the next sibling. The resulting order is the overlay layer
//! order (topmost first), so it must not be replaced by a depth-sorted
//! topological order.

use std::collections::HashSet;
use std::path::PathBuf;

use podlite_shared::schema::ImageManifest;
use podlite_shared::{PodliteError, PodliteResult};

use super::ResolutionTree;

/// Read access to an image catalogue, as needed by [`resolve_tree`].
pub trait ImageLookup {
    fn manifest(&self, hash: &str) -> Option<ImageManifest>;

    /// Hash of the image named `name`; an empty `version` matches any.
    fn find(&self, name: &str, version: &str) -> Option<String>;

    fn rootfs_path(&self, hash: &str) -> PathBuf;
}

struct Walk<'a, L: ImageLookup + ?Sized> {
    lookup: &'a L,
    tree: ResolutionTree,
    seen: HashSet<String>,
}

pub fn resolve_tree<L: ImageLookup + ?Sized>(lookup: &L, hash: &str) -> PodliteResult<ResolutionTree> {
    let manifest = lookup
        .manifest(hash)
        .ok_or_else(|| PodliteError::Resolution(format!("unable to locate hash {:?}", hash)))?;

    let mut walk = Walk {
        lookup,
        tree: ResolutionTree::default(),
        seen: HashSet::new(),
    };
    walk.visit(hash, manifest.clone());
    walk.dependencies(&manifest)?;
    Ok(walk.tree)
}

impl<L: ImageLookup + ?Sized> Walk<'_, L> {
    fn visit(&mut self, hash: &str, manifest: ImageManifest) {
        self.seen.insert(hash.to_string());
        self.tree.order.push(hash.to_string());
        self.tree
            .paths
            .insert(hash.to_string(), self.lookup.rootfs_path(hash));
        self.tree.manifests.insert(hash.to_string(), manifest);
    }

    fn dependencies(&mut self, manifest: &ImageManifest) -> PodliteResult<()> {
        for dep in &manifest.dependencies {
            let missing = || {
                PodliteError::Resolution(format!(
                    "failed to locate dependent image {}:{}",
                    dep.image_name,
                    dep.version()
                ))
            };

            let hash = match dep.image_id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => id.to_string(),
                None => self
                    .lookup
                    .find(&dep.image_name, dep.version())
                    .ok_or_else(missing)?,
            };
            if self.seen.contains(&hash) {
                continue;
            }

            let dep_manifest = self.lookup.manifest(&hash).ok_or_else(missing)?;
            self.visit(&hash, dep_manifest.clone());
            self.dependencies(&dep_manifest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlite_shared::schema::{Dependency, Label};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Catalogue(HashMap<String, ImageManifest>);

    impl Catalogue {
        fn add(&mut self, hash: &str, name: &str, version: &str, deps: &[&str]) {
            let mut m = ImageManifest::new(name);
            if !version.is_empty() {
                m.labels.push(Label::new("version", version));
            }
            m.dependencies = deps
                .iter()
                .map(|d| Dependency {
                    image_name: format!("img/{}", d),
                    image_id: Some(d.to_string()),
                    labels: vec![],
                })
                .collect();
            self.0.insert(hash.to_string(), m);
        }
    }

    impl ImageLookup for Catalogue {
        fn manifest(&self, hash: &str) -> Option<ImageManifest> {
            self.0.get(hash).cloned()
        }

        fn find(&self, name: &str, version: &str) -> Option<String> {
            self.0
                .iter()
                .find(|(_, m)| m.name == name && (version.is_empty() || m.label("version") == Some(version)))
                .map(|(h, _)| h.clone())
        }

        fn rootfs_path(&self, hash: &str) -> PathBuf {
            PathBuf::from("/images").join(hash).join("rootfs")
        }
    }

    #[test]
    fn diamond_is_first_visited_preorder() {
        let mut c = Catalogue::default();
        c.add("a", "img/a", "", &["b", "c"]);
        c.add("b", "img/b", "", &["d"]);
        c.add("c", "img/c", "", &["d"]);
        c.add("d", "img/d", "", &[]);

        let tree = resolve_tree(&c, "a").unwrap();
        assert_eq!(tree.order, vec!["a", "b", "d", "c"]);
        assert_eq!(tree.manifests.len(), 4);
    }

    #[test]
    fn single_image_without_dependencies() {
        let mut c = Catalogue::default();
        c.add("sha512-app", "img/app", "", &[]);

        let tree = resolve_tree(&c, "sha512-app").unwrap();
        assert_eq!(tree.order, vec!["sha512-app"]);
        assert_eq!(
            tree.paths["sha512-app"],
            PathBuf::from("/images/sha512-app/rootfs")
        );
    }

    #[test]
    fn cycles_are_tolerated() {
        let mut c = Catalogue::default();
        c.add("a", "img/a", "", &["b"]);
        c.add("b", "img/b", "", &["a"]);

        let tree = resolve_tree(&c, "a").unwrap();
        assert_eq!(tree.order, vec!["a", "b"]);
    }

    #[test]
    fn missing_root_hash() {
        let c = Catalogue::default();
        let err = resolve_tree(&c, "sha512-nope").unwrap_err();
        assert_eq!(err.to_string(), r#"unable to locate hash "sha512-nope""#);
    }

    #[test]
    fn missing_dependency_names_image_and_version() {
        let mut c = Catalogue::default();
        let mut m = ImageManifest::new("img/a");
        m.dependencies.push(Dependency {
            image_name: "img/base".into(),
            image_id: None,
            labels: vec![Label::new("version", "2.1")],
        });
        c.0.insert("a".into(), m);

        let err = resolve_tree(&c, "a").unwrap_err();
        assert_eq!(err.to_string(), "failed to locate dependent image img/base:2.1");
    }

    #[test]
    fn dependency_by_name_and_version() {
        let mut c = Catalogue::default();
        c.add("base1", "img/base", "1.0", &[]);
        c.add("base2", "img/base", "2.0", &[]);
        let mut m = ImageManifest::new("img/a");
        m.dependencies.push(Dependency {
            image_name: "img/base".into(),
            image_id: None,
            labels: vec![Label::new("version", "2.0")],
        });
        c.0.insert("a".into(), m);

        let tree = resolve_tree(&c, "a").unwrap();
        assert_eq!(tree.order, vec!["a", "base2"]);
    }
}
