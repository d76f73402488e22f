//! Pod lifecycle states.
//!
//! ```text
//! New → Starting → Running → Stopping → Stopped
//!          │                    ▲
//!          └──→ Errored ────────┘
//! ```
//!
//! `Starting → Stopping` covers a stop requested while the startup pipeline
//! is still running; `Errored → Stopping` is the operator cleaning up a pod
//! whose startup failed.

use std::fmt;
use std::str::FromStr;

use podlite_shared::PodliteError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PodState {
    #[default]
    New,
    Starting,
    Running,
    Errored,
    Stopping,
    Stopped,
}

impl PodState {
    pub fn can_transition_to(&self, target: PodState) -> bool {
        use PodState::*;
        matches!(
            (self, target),
            (New, Starting)
                | (Starting, Running)
                | (Starting, Errored)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Errored, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Stopped is the only state a pod never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodState::New => "NEW",
            PodState::Starting => "STARTING",
            PodState::Running => "RUNNING",
            PodState::Errored => "ERRORED",
            PodState::Stopping => "STOPPING",
            PodState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PodState {
    type Err = PodliteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(PodState::New),
            "STARTING" => Ok(PodState::Starting),
            "RUNNING" => Ok(PodState::Running),
            "ERRORED" => Ok(PodState::Errored),
            "STOPPING" => Ok(PodState::Stopping),
            "STOPPED" => Ok(PodState::Stopped),
            other => Err(PodliteError::Validation(format!("unknown pod state {:?}", other))),
        }
    }
}
