//! Error types shared by the pod manager, the stager and the network drivers.

use thiserror::Error;

/// Result alias used throughout podlite.
pub type PodliteResult<T> = Result<T, PodliteError>;

#[derive(Debug, Error)]
pub enum PodliteError {
    /// A request was rejected before any resources were allocated.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// An image could not be imported, loaded or removed.
    #[error("image error: {0}")]
    Image(String),

    /// A dependency walk could not locate one of the images it requires.
    #[error("{0}")]
    Resolution(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Network(String),

    /// The OS-level container runtime failed.
    #[error("container error: {0}")]
    Container(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A network driver invocation exceeded its deadline and was killed.
    #[error("call to driver timed out")]
    CallTimeout,

    /// The in-pod run helper never acknowledged its configuration.
    #[error("stager run process timed out reading configuration")]
    EnterTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PodliteError {
    /// True for the distinguished timeout sentinels, letting callers
    /// warn-and-continue instead of failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PodliteError::CallTimeout | PodliteError::EnterTimeout)
    }
}

impl From<String> for PodliteError {
    fn from(msg: String) -> Self {
        PodliteError::Internal(msg)
    }
}

impl From<&str> for PodliteError {
    fn from(msg: &str) -> Self {
        PodliteError::Internal(msg.to_string())
    }
}

impl From<nix::Error> for PodliteError {
    fn from(err: nix::Error) -> Self {
        PodliteError::Io(std::io::Error::from(err))
    }
}
