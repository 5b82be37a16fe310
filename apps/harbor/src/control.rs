use std::sync::Arc;

use harbor_proto::{ClientMessage, ControlCommand, ErrorCode, ServerMessage};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::device::{CommandOrigin, DeviceBackend};

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid message format: {0}")]
    InvalidJson(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} message: {detail}")]
    InvalidFields { kind: String, detail: String },
    #[error("malformed command {correlation_id}: {detail}")]
    MalformedCommand {
        correlation_id: String,
        detail: String,
    },
    /// The command is too broken to echo a correlation id back.
    #[error("command without a usable correlation_id: {0}")]
    Unrecoverable(String),
}

impl FrameError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Unrecoverable(_))
    }

    pub fn to_message(&self) -> ServerMessage {
        let (code, correlation_id) = match self {
            FrameError::InvalidJson(_) | FrameError::InvalidFields { .. } => {
                (ErrorCode::MalformedMessage, None)
            }
            FrameError::UnknownType(_) => (ErrorCode::UnexpectedMessage, None),
            FrameError::MalformedCommand { correlation_id, .. } => {
                (ErrorCode::MalformedCommand, Some(correlation_id.clone()))
            }
            FrameError::Unrecoverable(_) => (ErrorCode::MalformedCommand, None),
        };
        ServerMessage::Error {
            code,
            message: self.to_string(),
            correlation_id,
            boat_id: None,
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "boat_register",
    "viewer_connect",
    "offer",
    "renegotiate",
    "unregister",
    "list_boats",
    "request_offer",
    "answer",
    "command_result",
];

/// Parse one text frame.
///
/// Commands get a second look when the strict parse fails so that a bad
/// command body can still be answered under its correlation id. A command
/// that parses but is out of range is rejected here too, so it counts
/// against the connection like any other malformed frame.
pub fn decode_frame(text: &str) -> Result<ClientMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::InvalidJson(err.to_string()))?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(FrameError::InvalidJson("\"type\" must be a string".into())),
        None => return Err(FrameError::InvalidJson("missing \"type\" field".into())),
    };

    if kind == "command" {
        return decode_command(value);
    }

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => Ok(message),
        Err(err) if KNOWN_TYPES.contains(&kind.as_str()) => Err(FrameError::InvalidFields {
            kind,
            detail: err.to_string(),
        }),
        Err(_) => Err(FrameError::UnknownType(kind)),
    }
}

fn decode_command(value: Value) -> Result<ClientMessage, FrameError> {
    let correlation_id = match value.get("correlation_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => {
            return Err(FrameError::Unrecoverable(
                "correlation_id missing or not a non-empty string".to_string(),
            ))
        }
    };

    let command = value
        .get("command")
        .cloned()
        .ok_or_else(|| FrameError::MalformedCommand {
            correlation_id: correlation_id.clone(),
            detail: "missing \"command\" object".to_string(),
        })?;
    let command: ControlCommand =
        serde_json::from_value(command).map_err(|err| FrameError::MalformedCommand {
            correlation_id: correlation_id.clone(),
            detail: err.to_string(),
        })?;
    if let Err(detail) = command.validate() {
        return Err(FrameError::MalformedCommand {
            correlation_id,
            detail,
        });
    }

    Ok(ClientMessage::Command {
        correlation_id,
        command,
    })
}

/// Per-connection control channel.
///
/// Each command is dispatched on its own task and answered under its
/// correlation id whenever it finishes, so a slow device call never holds up
/// the commands queued behind it. `ping` is answered inline.
pub struct ControlMultiplexer {
    backend: Arc<dyn DeviceBackend>,
    connection: ConnectionHandle,
    /// Set when the connection is a viewer
    viewer_id: Option<String>,
}

impl ControlMultiplexer {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        connection: ConnectionHandle,
        viewer_id: Option<String>,
    ) -> Self {
        Self {
            backend,
            connection,
            viewer_id,
        }
    }

    /// Run a command that already passed [`decode_frame`].
    pub fn dispatch(&self, correlation_id: String, command: ControlCommand) {
        counter!("harbor_commands_total", 1, "cmd" => command.name());

        if let ControlCommand::Ping { data } = command {
            self.connection.send(ServerMessage::Pong {
                correlation_id,
                timestamp_ms: now_millis(),
                data,
            });
            return;
        }

        let backend = Arc::clone(&self.backend);
        let connection = self.connection.clone();
        let origin = CommandOrigin {
            correlation_id: correlation_id.clone(),
            viewer_id: self.viewer_id.clone(),
        };
        tokio::spawn(async move {
            let message = match backend.execute(&origin, &command).await {
                Ok(telemetry) => ServerMessage::CommandResult {
                    correlation_id,
                    success: true,
                    telemetry: Some(telemetry).filter(|value| !value.is_null()),
                    error: None,
                },
                Err(err) => {
                    counter!("harbor_command_failures_total", 1, "cmd" => command.name());
                    warn!(correlation_id = %origin.correlation_id, backend = backend.name(), error = %err, "command failed");
                    ServerMessage::CommandResult {
                        correlation_id,
                        success: false,
                        telemetry: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            if !connection.send(message) {
                debug!(
                    cmd = command.name(),
                    backend = backend.name(),
                    "connection closed before command finished; result dropped"
                );
            }
        });
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
