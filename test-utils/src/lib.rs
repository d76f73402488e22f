//! Test doubles for podlite: containers that never run, an image store fed
//! from manifests, network fakes and a scripted stager.

pub mod container;
pub mod harness;
pub mod images;
pub mod network;
pub mod stager;

pub use container::{Behavior, MockFactory, MockProcess, StartContext, StartHook};
pub use harness::Harness;
pub use images::MockImageManager;
pub use network::{FileNamespaces, MockNetworkManager, NetworkEvent};
pub use stager::{CommandScript, EnterMode, ScriptedStager};
