//! podlite shared code
//!
//! Types and runtime plumbing used by both the host-side pod manager
//! (`podlite`) and the in-pod supervisor (`podlite-stager`).

pub mod constants;
pub mod container;
pub mod errors;
pub mod pipeline;
pub mod schema;

pub use errors::{PodliteError, PodliteResult};

/// Runtime version recorded in every stager manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
