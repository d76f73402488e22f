//! Linux capability sets.

use std::collections::HashSet;

use oci_spec::runtime::Capability;

use crate::container::Capabilities;
use crate::errors::{PodliteError, PodliteResult};

/// Every capability the runtime knows how to grant.
pub fn all_capabilities() -> HashSet<Capability> {
    [
        Capability::Chown,
        Capability::DacOverride,
        Capability::DacReadSearch,
        Capability::Fowner,
        Capability::Fsetid,
        Capability::Kill,
        Capability::Setgid,
        Capability::Setuid,
        Capability::Setpcap,
        Capability::LinuxImmutable,
        Capability::NetBindService,
        Capability::NetBroadcast,
        Capability::NetAdmin,
        Capability::NetRaw,
        Capability::IpcLock,
        Capability::IpcOwner,
        Capability::SysModule,
        Capability::SysRawio,
        Capability::SysChroot,
        Capability::SysPtrace,
        Capability::SysPacct,
        Capability::SysAdmin,
        Capability::SysBoot,
        Capability::SysNice,
        Capability::SysResource,
        Capability::SysTime,
        Capability::SysTtyConfig,
        Capability::Mknod,
        Capability::Lease,
        Capability::AuditWrite,
        Capability::AuditControl,
        Capability::Setfcap,
        Capability::MacOverride,
        Capability::MacAdmin,
        Capability::Syslog,
        Capability::WakeAlarm,
        Capability::BlockSuspend,
        Capability::AuditRead,
        Capability::Perfmon,
        Capability::Bpf,
        Capability::CheckpointRestore,
    ]
    .into_iter()
    .collect()
}

/// Resolves a [`Capabilities`] selection to the OCI capability set.
pub fn resolve(caps: &Capabilities) -> PodliteResult<HashSet<Capability>> {
    match caps {
        Capabilities::All => Ok(all_capabilities()),
        Capabilities::Only(names) => names
            .iter()
            .map(|name| {
                name.parse::<Capability>().map_err(|e| {
                    PodliteError::Container(format!("unknown capability {:?}: {}", name, e))
                })
            })
            .collect(),
    }
}
