//! OCI runtime specification builder
//!
//! Translates a [`ContainerConfig`] and the container's first process into an
//! OCI runtime spec for libcontainer.

use oci_spec::runtime::{
    LinuxBuilder, LinuxCapabilitiesBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, Mount, MountBuilder, Process, ProcessBuilder, RootBuilder, Spec,
    SpecBuilder, UserBuilder,
};

use super::capabilities;
use crate::container::{ContainerConfig, MountConfig, NamespaceConfig, ProcessSpec};
use crate::errors::{PodliteError, PodliteResult};
use crate::schema::Namespace;

pub fn create_oci_spec(config: &ContainerConfig, process: &ProcessSpec) -> PodliteResult<Spec> {
    let mounts = config
        .mounts
        .iter()
        .map(build_mount)
        .collect::<PodliteResult<Vec<_>>>()?;
    let namespaces = config
        .namespaces
        .iter()
        .map(build_namespace)
        .collect::<PodliteResult<Vec<_>>>()?;

    let root = RootBuilder::default()
        .path(&config.rootfs)
        .readonly(config.readonly_rootfs)
        .build()
        .map_err(|e| PodliteError::Container(format!("Failed to build root spec: {}", e)))?;

    let mut linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .masked_paths(config.masked_paths.clone())
        .readonly_paths(config.readonly_paths.clone());
    if let Some(cgroup) = &config.cgroup_path {
        linux = linux.cgroups_path(cgroup);
    }
    let linux = linux
        .build()
        .map_err(|e| PodliteError::Container(format!("Failed to build linux spec: {}", e)))?;

    let mut spec = SpecBuilder::default()
        .version("1.0.2")
        .root(root)
        .mounts(mounts)
        .process(build_process(config, process)?)
        .linux(linux);
    if let Some(hostname) = &config.hostname {
        spec = spec.hostname(hostname);
    }
    spec.build()
        .map_err(|e| PodliteError::Container(format!("Failed to build OCI spec: {}", e)))
}

fn build_process(config: &ContainerConfig, process: &ProcessSpec) -> PodliteResult<Process> {
    let caps = capabilities::resolve(&config.capabilities)?;
    let caps = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .inheritable(caps.clone())
        .permitted(caps.clone())
        .ambient(caps)
        .build()
        .map_err(|e| PodliteError::Container(format!("Failed to build capabilities: {}", e)))?;

    let user = UserBuilder::default()
        .uid(process.uid)
        .gid(process.gid)
        .additional_gids(process.additional_gids.clone())
        .build()
        .map_err(|e| PodliteError::Container(format!("Failed to build user spec: {}", e)))?;

    ProcessBuilder::default()
        .terminal(false)
        .user(user)
        .args(process.args.clone())
        .env(process.env_strings())
        .cwd(&process.cwd)
        .capabilities(caps)
        .no_new_privileges(false)
        .build()
        .map_err(|e| PodliteError::Container(format!("Failed to build process spec: {}", e)))
}

fn build_mount(mount: &MountConfig) -> PodliteResult<Mount> {
    MountBuilder::default()
        .destination(&mount.destination)
        .typ(&mount.fstype)
        .source(&mount.source)
        .options(mount.options.clone())
        .build()
        .map_err(|e| {
            PodliteError::Container(format!(
                "Failed to build mount {} → {}: {}",
                mount.source, mount.destination, e
            ))
        })
}

fn build_namespace(ns: &NamespaceConfig) -> PodliteResult<LinuxNamespace> {
    let typ = namespace_type(ns.kind);
    let mut builder = LinuxNamespaceBuilder::default().typ(typ);
    if let Some(path) = &ns.path {
        builder = builder.path(path);
    }
    builder
        .build()
        .map_err(|e| PodliteError::Container(format!("Failed to build {:?} namespace: {}", typ, e)))
}

fn namespace_type(kind: Namespace) -> LinuxNamespaceType {
    match kind {
        Namespace::Ipc => LinuxNamespaceType::Ipc,
        Namespace::Mount => LinuxNamespaceType::Mount,
        Namespace::Net => LinuxNamespaceType::Network,
        Namespace::Pid => LinuxNamespaceType::Pid,
        Namespace::User => LinuxNamespaceType::User,
        Namespace::Uts => LinuxNamespaceType::Uts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Capabilities;

    #[test]
    fn joined_namespaces_carry_paths() {
        let config = ContainerConfig {
            rootfs: "/apps/web".into(),
            hostname: Some("web".into()),
            capabilities: Capabilities::Only(vec!["CAP_KILL".into()]),
            namespaces: vec![
                NamespaceConfig::new(Namespace::Mount),
                NamespaceConfig::join(Namespace::Net, "/proc/10/ns/net"),
            ],
            mounts: vec![MountConfig::bind("/volumes/data", "/data").read_only()],
            masked_paths: vec!["/proc/kcore".into()],
            ..Default::default()
        };
        let spec = create_oci_spec(&config, &ProcessSpec::new(vec!["/bin/web".into()])).unwrap();

        let linux = spec.linux().as_ref().unwrap();
        let namespaces = linux.namespaces().as_ref().unwrap();
        assert_eq!(namespaces.len(), 2);
        assert_eq!(namespaces[1].typ(), LinuxNamespaceType::Network);
        assert_eq!(
            namespaces[1].path().as_ref().unwrap().to_str(),
            Some("/proc/10/ns/net")
        );
        assert_eq!(spec.hostname().as_deref(), Some("web"));
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let config = ContainerConfig {
            capabilities: Capabilities::Only(vec!["CAP_NOT_REAL".into()]),
            ..Default::default()
        };
        assert!(create_oci_spec(&config, &ProcessSpec::new(vec!["/bin/true".into()])).is_err());
    }
}
