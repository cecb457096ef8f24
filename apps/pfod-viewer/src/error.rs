use pfod_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failure to write a response into a workspace.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FoldError {
    #[error("drawing {0:?} is not part of the workspace")]
    UnknownDrawing(String),
    #[error("cannot decode items for {name:?}: {reason}")]
    Decode { name: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("unknown request type {0:?}")]
    UnknownRequestKind(String),
    #[error("request {0} is not in flight")]
    NotInFlight(u64),
    #[error("engine has shut down")]
    EngineClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    NavigateBack,
    Dismiss,
}

/// Errors surfaced to the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ViewerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    MalformedResponse(#[from] CodecError),
    #[error("no connection: failed to load {0:?}")]
    ConnectionLost(String),
    #[error("drawing error {code}: {message}")]
    Drawing { code: String, message: String },
}

impl ViewerError {
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        match self {
            ViewerError::Transport(_) | ViewerError::MalformedResponse(_) => {
                vec![RecoveryAction::Retry, RecoveryAction::NavigateBack]
            }
            ViewerError::ConnectionLost(_) => vec![RecoveryAction::Retry],
            ViewerError::Drawing { .. } => {
                vec![RecoveryAction::NavigateBack, RecoveryAction::Dismiss]
            }
        }
    }
}

impl From<FoldError> for ViewerError {
    fn from(err: FoldError) -> Self {
        match err {
            FoldError::UnknownDrawing(name) | FoldError::Decode { name, .. } => {
                ViewerError::ConnectionLost(name)
            }
        }
    }
}
