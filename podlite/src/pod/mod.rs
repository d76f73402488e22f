//! Pod lifecycle management.
//!
//! A [`Manager`] owns the registry of live pods. Each [`Pod`] is brought up by
//! an ordered startup pipeline and taken down by an ordered teardown pipeline:
//!
//! ```text
//! startup:  get_stager → dependency_set → base_directories → apply_isolators
//!           → network → resolv_conf → initialize_container → write_manifest
//!           → launch_stager → wait_for_ready
//! teardown: ready_socket → signal → network → stager → directories
//!           → remove_from_parent
//! ```
//!
//! A failed startup leaves the pod `ERRORED` with whatever it had created so
//! far; calling [`Pod::stop`] runs the teardown pipeline, which tolerates
//! every partial state.

mod config;
mod dns;
mod enter;
mod fsutil;
mod isolators;
mod manager;
#[allow(clippy::module_inception)]
mod pod;
mod startup;
mod state;
mod teardown;

pub use config::ContainerIo;
pub use dns::{parse_resolv_conf, render_resolv_conf};
pub use enter::{EnterIo, PostStart};
pub use manager::{Manager, Options};
pub use pod::{Pod, PodOptions};
pub use state::PodState;
