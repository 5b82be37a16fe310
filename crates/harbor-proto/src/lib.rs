//! Shared protocol definitions for boat ↔ harbor ↔ viewer signaling.
//! Keeping this in a dedicated crate lets boat-side tooling speak the
//! protocol without pulling in the coordinator's runtime stack.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Video capabilities a boat advertises at registration. Descriptive only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Capabilities {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoatState {
    Registered,
    OfferPending,
    OfferReady,
    Closed,
}

/// One row of the boat selection list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoatSummary {
    pub boat_id: String,
    pub capabilities: Capabilities,
    pub state: BoatState,
}

/// Messages sent from a boat or viewer to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Classifies the connection as a boat
    BoatRegister {
        boat_id: String,
        #[serde(default)]
        capabilities: Capabilities,
    },
    /// Classifies the connection as a viewer
    ViewerConnect {
        #[serde(default)]
        label: Option<String>,
    },
    /// Boat publishes (or replaces) its session offer
    Offer { sdp: String },
    /// Boat withdraws its current offer while it prepares a new one
    Renegotiate,
    /// Boat leaves the selection list without closing the socket
    Unregister,
    ListBoats,
    RequestOffer { boat_id: String },
    Answer {
        boat_id: String,
        sdp: String,
        offer_version: u64,
    },
    /// Control channel request, valid on either role
    Command {
        correlation_id: String,
        command: ControlCommand,
    },
    /// Boat's reply to a relayed [`ServerMessage::ControlRequest`]
    CommandResult {
        viewer_id: String,
        correlation_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        telemetry: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::BoatRegister { .. } => "boat_register",
            ClientMessage::ViewerConnect { .. } => "viewer_connect",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Renegotiate => "renegotiate",
            ClientMessage::Unregister => "unregister",
            ClientMessage::ListBoats => "list_boats",
            ClientMessage::RequestOffer { .. } => "request_offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Command { .. } => "command",
            ClientMessage::CommandResult { .. } => "command_result",
        }
    }
}

/// Messages sent from the coordinator to a boat or viewer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        boat_id: String,
        /// A previous registration under the same id was evicted
        replaced: bool,
    },
    ViewerConnected {
        viewer_id: String,
        boats: Vec<BoatSummary>,
    },
    OfferAccepted {
        boat_id: String,
        offer_version: u64,
    },
    Boats {
        boats: Vec<BoatSummary>,
    },
    Offer {
        boat_id: String,
        sdp: String,
        offer_version: u64,
    },
    AnswerAccepted {
        boat_id: String,
        offer_version: u64,
    },
    /// A viewer's answer, delivered to the boat that made the offer
    Answer {
        viewer_id: String,
        sdp: String,
        offer_version: u64,
    },
    BoatDisconnected {
        boat_id: String,
    },
    /// A viewer's command relayed to its boat; answered with
    /// [`ClientMessage::CommandResult`] carrying the same ids
    ControlRequest {
        viewer_id: String,
        correlation_id: String,
        command: ControlCommand,
    },
    CommandResult {
        correlation_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        telemetry: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Pong {
        correlation_id: String,
        timestamp_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boat_id: Option<String>,
    },
    /// Last message before the coordinator closes the socket
    Closing {
        reason: CloseReason,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            correlation_id: None,
            boat_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownBoat,
    BoatNotFound,
    OfferNotReady,
    StaleOffer,
    DuplicateRejected,
    MalformedCommand,
    UnexpectedMessage,
    BoatDisconnected,
    MalformedMessage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownBoat => "unknown_boat",
            ErrorCode::BoatNotFound => "boat_not_found",
            ErrorCode::OfferNotReady => "offer_not_ready",
            ErrorCode::StaleOffer => "stale_offer",
            ErrorCode::DuplicateRejected => "duplicate_rejected",
            ErrorCode::MalformedCommand => "malformed_command",
            ErrorCode::UnexpectedMessage => "unexpected_message",
            ErrorCode::BoatDisconnected => "boat_disconnected",
            ErrorCode::MalformedMessage => "malformed_message",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Replaced,
    IdleTimeout,
    HandshakeTimeout,
    UnexpectedMessage,
    MalformedCommand,
    TooManyMalformed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::UnexpectedMessage => "unexpected_message",
            CloseReason::MalformedCommand => "malformed_command",
            CloseReason::TooManyMalformed => "too_many_malformed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device and latency commands carried on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlCommand {
    SetPin {
        pin: u8,
        state: bool,
    },
    SetMotor {
        motor_id: String,
        direction: MotorDirection,
        speed: u8,
    },
    Move {
        movement: Movement,
        #[serde(default = "default_speed")]
        speed: u8,
    },
    StopMotors,
    Status,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

pub const MAX_SPEED: u8 = 100;

fn default_speed() -> u8 {
    70
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::SetPin { .. } => "set_pin",
            ControlCommand::SetMotor { .. } => "set_motor",
            ControlCommand::Move { .. } => "move",
            ControlCommand::StopMotors => "stop_motors",
            ControlCommand::Status => "status",
            ControlCommand::Ping { .. } => "ping",
        }
    }

    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ControlCommand::SetMotor { speed, .. } | ControlCommand::Move { speed, .. }
                if *speed > MAX_SPEED =>
            {
                Err(format!("speed {speed} out of range 0-{MAX_SPEED}"))
            }
            ControlCommand::SetMotor { motor_id, .. } if motor_id.trim().is_empty() => {
                Err("motor_id must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MotorDirection {
    Forward,
    Backward,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Forward,
    Backward,
    Left,
    Right,
    SpinLeft,
    SpinRight,
    Stop,
}
