use thiserror::Error;

use crate::types::ClientId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("client {0} is already running")]
    AlreadyRunning(ClientId),

    #[error("no actions available")]
    NoActionsAvailable,

    #[error("telemetry unavailable, check the stats server")]
    MissingTelemetry,

    #[error("vision service: {0}")]
    Vision(String),

    #[error("window switch failed: expected {expected}, foreground is {actual}")]
    WindowSwitchFailed { expected: ClientId, actual: ClientId },

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error("input device: {0}")]
    Device(String),

    #[error("http: {0}")]
    Http(String),

    #[error("profile {name}: {reason}")]
    Profile { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        Error::Http(e.to_string())
    }
}
