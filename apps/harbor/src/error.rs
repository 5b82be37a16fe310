use harbor_proto::{ErrorCode, ServerMessage};
use thiserror::Error;

/// Recoverable signaling failures. Each one is reported to the originating
/// connection as an `error` message and never tears down the coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("boat {0} is not registered")]
    UnknownBoat(String),
    #[error("boat {0} not found")]
    BoatNotFound(String),
    #[error("boat {0} has no offer yet; retry shortly")]
    OfferNotReady(String),
    #[error("offer version {submitted} for boat {boat_id} is stale (current {current})")]
    StaleOffer {
        boat_id: String,
        submitted: u64,
        current: u64,
    },
    #[error("{0}")]
    DuplicateRejected(String),
    #[error("{0}")]
    UnexpectedMessage(String),
    #[error("boat {0} disconnected")]
    BoatDisconnected(String),
}

impl SignalError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalError::UnknownBoat(_) => ErrorCode::UnknownBoat,
            SignalError::BoatNotFound(_) => ErrorCode::BoatNotFound,
            SignalError::OfferNotReady(_) => ErrorCode::OfferNotReady,
            SignalError::StaleOffer { .. } => ErrorCode::StaleOffer,
            SignalError::DuplicateRejected(_) => ErrorCode::DuplicateRejected,
            SignalError::UnexpectedMessage(_) => ErrorCode::UnexpectedMessage,
            SignalError::BoatDisconnected(_) => ErrorCode::BoatDisconnected,
        }
    }

    fn boat_id(&self) -> Option<&str> {
        match self {
            SignalError::UnknownBoat(id)
            | SignalError::BoatNotFound(id)
            | SignalError::OfferNotReady(id)
            | SignalError::BoatDisconnected(id) => Some(id),
            SignalError::StaleOffer { boat_id, .. } => Some(boat_id),
            SignalError::DuplicateRejected(_) | SignalError::UnexpectedMessage(_) => None,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
            correlation_id: None,
            boat_id: self.boat_id().map(str::to_string),
        }
    }
}

/// Failures reported by a device backend. These surface as a failed
/// `command_result`, never as a signaling error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device backend unavailable")]
    Unavailable,
    #[error("unknown motor {0}")]
    UnknownMotor(String),
    #[error("device error: {0}")]
    Io(String),
    #[error("command has no target boat; request an offer first")]
    NoTargetBoat,
    #[error("boat {0} disconnected before answering")]
    BoatDisconnected(String),
    #[error("boat {0} did not answer in time")]
    Timeout(String),
    #[error("command {0} is already in flight")]
    DuplicateCorrelation(String),
    /// Failure reported by the boat itself
    #[error("{0}")]
    Remote(String),
}
