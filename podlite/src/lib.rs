//! podlite: a single-host pod runtime.
//!
//! - [`images`]: content-addressed image store and dependency resolution
//! - [`pod`]: pod lifecycle, from manifest to a running stager and back
//! - [`network`]: pod networking through driver pods
//! - [`daemon`]: configuration and bootstrap of `podlited`

pub mod daemon;
pub mod images;
pub mod network;
pub mod pod;
pub mod util;

pub use podlite_shared::{PodliteError, PodliteResult};
