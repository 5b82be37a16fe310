use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use harbor_proto::{ClientMessage, CloseReason, ServerMessage};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::broker::SignalingBroker;
use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, Outbound};
use crate::control::{decode_frame, ControlMultiplexer, FrameError};
use crate::device::{build_backend, DeviceBackend};
use crate::error::SignalError;
use crate::registry::SessionRegistry;
use crate::relay::CommandRelay;

/// How long a closing connection gets to flush its queued frames.
const CLOSE_FLUSH: Duration = Duration::from_millis(500);

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub broker: SignalingBroker,
    pub relay: CommandRelay,
    pub device: Arc<dyn DeviceBackend>,
    pub config: Arc<ServerConfig>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let broker = SignalingBroker::new(SessionRegistry::new());
        let relay = CommandRelay::new(broker.clone(), config.command_timeout);
        Self {
            device: build_backend(config.device, &relay),
            broker,
            relay,
            config: Arc::new(config),
            metrics,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("client closed socket before handshake")]
    SocketClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("first message must be boat_register or viewer_connect, got {0}")]
    UnexpectedFirst(&'static str),
    #[error("registration rejected: {0}")]
    Rejected(SignalError),
    #[error("too many malformed frames")]
    TooManyMalformed,
    #[error("{0}")]
    Unrecoverable(FrameError),
}

impl HandshakeError {
    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            HandshakeError::TimedOut => Some(CloseReason::HandshakeTimeout),
            HandshakeError::UnexpectedFirst(_) | HandshakeError::Rejected(_) => {
                Some(CloseReason::UnexpectedMessage)
            }
            HandshakeError::TooManyMalformed => Some(CloseReason::TooManyMalformed),
            HandshakeError::Unrecoverable(_) => Some(CloseReason::MalformedCommand),
            HandshakeError::SocketClosed | HandshakeError::Protocol(_) => None,
        }
    }
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

struct BoatRole {
    boat_id: String,
    /// False after `unregister`; the connection stays open but inert
    registered: bool,
}

enum Role {
    Boat(BoatRole),
    Viewer(String),
}

enum Flow {
    Continue,
    Close(CloseReason),
}

/// What a frame turned out to contain, once transport noise is stripped.
enum Inbound {
    Text(String),
    NotUtf8,
    Ignored,
    Closed,
}

fn classify(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Text(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Inbound::Text(text),
            Err(_) => Inbound::NotUtf8,
        },
        Message::Close(_) => Inbound::Closed,
        Message::Ping(_) | Message::Pong(_) => Inbound::Ignored,
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    counter!("harbor_connections_accepted_total", 1);
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = ConnectionHandle::new(tx);
    let mut writer = tokio::spawn(write_loop(sender, rx));
    state.broker.track(&connection);
    debug!(%remote_addr, connection_id = %connection.id(), "websocket connected");

    let mut strikes = 0;
    let role =
        match perform_handshake(&mut receiver, &state, &connection, &mut strikes).await {
            Ok(role) => role,
            Err(err) => {
                info!(%remote_addr, error = %err, "handshake failed");
                state.broker.untrack(connection.id());
                if let HandshakeError::Rejected(reason) = &err {
                    connection.send(reason.to_message());
                }
                match err.close_reason() {
                    Some(reason) => {
                        connection.close(reason);
                        drop(connection);
                        let _ = timeout(CLOSE_FLUSH, &mut writer).await;
                    }
                    None => drop(connection),
                }
                writer.abort();
                counter!("harbor_connections_closed_total", 1);
                return;
            }
        };

    let viewer_id = match &role {
        Role::Viewer(viewer_id) => Some(viewer_id.clone()),
        Role::Boat(_) => None,
    };
    let mut session = Session {
        control: ControlMultiplexer::new(Arc::clone(&state.device), connection.clone(), viewer_id),
        state,
        connection,
        role,
        strikes,
    };

    let idle = session.state.config.idle_timeout;
    let mut close_reason = None;
    let mut writer_done = false;
    loop {
        let next = tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            next = timeout(idle, receiver.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                counter!("harbor_idle_closes_total", 1);
                info!(%remote_addr, "closing idle connection");
                close_reason = Some(CloseReason::IdleTimeout);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(%remote_addr, error = %err, "websocket error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let flow = match classify(frame) {
            Inbound::Text(text) => session.handle_text(&text),
            Inbound::NotUtf8 => {
                session.reject(FrameError::InvalidJson("binary frame is not UTF-8".to_string()))
            }
            Inbound::Ignored => Flow::Continue,
            Inbound::Closed => break,
        };
        if let Flow::Close(reason) = flow {
            close_reason = Some(reason);
            break;
        }
    }

    session.teardown();
    let connection = session.connection.clone();
    let state = session.state.clone();
    drop(session);
    state.broker.untrack(connection.id());

    if !writer_done {
        if let Some(reason) = close_reason {
            connection.close(reason);
            let _ = timeout(CLOSE_FLUSH, &mut writer).await;
        }
        writer.abort();
    }
    counter!("harbor_connections_closed_total", 1);
    debug!(%remote_addr, connection_id = %connection.id(), ?close_reason, "websocket closed");
}

/// Read frames until the connection declares its role.
///
/// Malformed frames count as strikes but do not classify the connection; the
/// first frame that parses must be `boat_register` or `viewer_connect`.
async fn perform_handshake(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    connection: &ConnectionHandle,
    strikes: &mut u32,
) -> Result<Role, HandshakeError> {
    let deadline = Instant::now() + state.config.handshake_timeout;
    let max_malformed = state.config.max_malformed;

    loop {
        let frame = timeout_at(deadline, receiver.next())
            .await
            .map_err(|_| HandshakeError::TimedOut)?
            .ok_or(HandshakeError::SocketClosed)?
            .map_err(|err| HandshakeError::Protocol(err.to_string()))?;

        let text = match classify(frame) {
            Inbound::Text(text) => text,
            Inbound::NotUtf8 => {
                connection
                    .send(FrameError::InvalidJson("binary frame is not UTF-8".into()).to_message());
                *strikes += 1;
                if *strikes >= max_malformed {
                    return Err(HandshakeError::TooManyMalformed);
                }
                continue;
            }
            Inbound::Ignored => continue,
            Inbound::Closed => return Err(HandshakeError::SocketClosed),
        };

        let message = match decode_frame(&text) {
            Ok(message) => message,
            Err(err) if err.is_fatal() => return Err(HandshakeError::Unrecoverable(err)),
            Err(err) => {
                connection.send(err.to_message());
                *strikes += 1;
                if *strikes >= max_malformed {
                    return Err(HandshakeError::TooManyMalformed);
                }
                continue;
            }
        };

        return match message {
            ClientMessage::BoatRegister {
                boat_id,
                capabilities,
            } => {
                let registration = state
                    .broker
                    .register_boat(&boat_id, capabilities, connection.clone())
                    .map_err(HandshakeError::Rejected)?;
                connection.send(ServerMessage::Registered {
                    boat_id: boat_id.clone(),
                    replaced: registration.replaced,
                });
                Ok(Role::Boat(BoatRole {
                    boat_id,
                    registered: true,
                }))
            }
            ClientMessage::ViewerConnect { label } => {
                let viewer_id = state.broker.connect_viewer(connection.clone(), label);
                connection.send(ServerMessage::ViewerConnected {
                    viewer_id: viewer_id.clone(),
                    boats: state.broker.list_boats(),
                });
                Ok(Role::Viewer(viewer_id))
            }
            other => Err(HandshakeError::UnexpectedFirst(other.kind())),
        };
    }
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(message) => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode outbound message");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                if let Ok(text) = serde_json::to_string(&ServerMessage::Closing { reason }) {
                    let _ = sender.send(Message::Text(text)).await;
                }
                let frame = CloseFrame {
                    code: close_code_for(reason),
                    reason: Cow::Borrowed(reason.as_str()),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

fn close_code_for(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::Shutdown => close_code::AWAY,
        CloseReason::Replaced | CloseReason::IdleTimeout | CloseReason::HandshakeTimeout => {
            close_code::NORMAL
        }
        CloseReason::UnexpectedMessage
        | CloseReason::MalformedCommand
        | CloseReason::TooManyMalformed => close_code::POLICY,
    }
}

struct Session {
    state: AppState,
    connection: ConnectionHandle,
    control: ControlMultiplexer,
    role: Role,
    strikes: u32,
}

impl Session {
    fn handle_text(&mut self, text: &str) -> Flow {
        match decode_frame(text) {
            Ok(ClientMessage::Command {
                correlation_id,
                command,
            }) => {
                self.control.dispatch(correlation_id, command);
                Flow::Continue
            }
            Ok(message) => {
                let result = match &mut self.role {
                    Role::Boat(boat) => {
                        handle_boat_message(&self.state, &self.connection, boat, message)
                    }
                    Role::Viewer(viewer_id) => {
                        handle_viewer_message(&self.state.broker, &self.connection, viewer_id, message)
                    }
                };
                if let Err(err) = result {
                    debug!(code = %err.code(), error = %err, "signaling request failed");
                    self.connection.send(err.to_message());
                }
                Flow::Continue
            }
            Err(err) => self.reject(err),
        }
    }

    fn reject(&mut self, err: FrameError) -> Flow {
        counter!("harbor_malformed_frames_total", 1);
        warn!(error = %err, strikes = self.strikes + 1, "malformed frame");
        self.connection.send(err.to_message());
        if err.is_fatal() {
            return Flow::Close(CloseReason::MalformedCommand);
        }
        self.strikes += 1;
        if self.strikes >= self.state.config.max_malformed {
            Flow::Close(CloseReason::TooManyMalformed)
        } else {
            Flow::Continue
        }
    }

    /// Release whatever the connection owns in the registry or viewer table.
    fn teardown(&mut self) {
        match &mut self.role {
            Role::Boat(boat) if boat.registered => {
                boat.registered = false;
                let connection_id = self.connection.id();
                self.state.relay.abandon_connection(&boat.boat_id, connection_id);
                self.state.broker.disconnect_boat(&boat.boat_id, connection_id);
            }
            Role::Boat(_) => {}
            Role::Viewer(viewer_id) => {
                self.state.broker.disconnect_viewer(viewer_id);
            }
        }
    }
}

fn handle_boat_message(
    state: &AppState,
    connection: &ConnectionHandle,
    boat: &mut BoatRole,
    message: ClientMessage,
) -> Result<(), SignalError> {
    let broker = &state.broker;
    match message {
        ClientMessage::BoatRegister {
            boat_id,
            capabilities,
        } => {
            if boat.registered {
                return Err(SignalError::DuplicateRejected(format!(
                    "connection is already registered as boat {}",
                    boat.boat_id
                )));
            }
            let registration = broker.register_boat(&boat_id, capabilities, connection.clone())?;
            connection.send(ServerMessage::Registered {
                boat_id: boat_id.clone(),
                replaced: registration.replaced,
            });
            *boat = BoatRole {
                boat_id,
                registered: true,
            };
        }
        ClientMessage::Offer { sdp } => {
            ensure_registered(boat)?;
            let offer_version = broker.publish_offer(&boat.boat_id, connection.id(), sdp)?;
            connection.send(ServerMessage::OfferAccepted {
                boat_id: boat.boat_id.clone(),
                offer_version,
            });
        }
        ClientMessage::Renegotiate => {
            ensure_registered(boat)?;
            broker.withdraw_offer(&boat.boat_id, connection.id())?;
        }
        ClientMessage::Unregister => {
            ensure_registered(boat)?;
            boat.registered = false;
            state.relay.abandon_connection(&boat.boat_id, connection.id());
            broker.disconnect_boat(&boat.boat_id, connection.id());
        }
        ClientMessage::CommandResult {
            viewer_id,
            correlation_id,
            success,
            telemetry,
            error,
        } => {
            ensure_registered(boat)?;
            state.relay.complete(
                &boat.boat_id,
                connection.id(),
                viewer_id,
                correlation_id,
                success,
                telemetry,
                error,
            )?;
        }
        other => {
            return Err(SignalError::UnexpectedMessage(format!(
                "{} is not accepted from a boat",
                other.kind()
            )))
        }
    }
    Ok(())
}

fn ensure_registered(boat: &BoatRole) -> Result<(), SignalError> {
    if boat.registered {
        Ok(())
    } else {
        Err(SignalError::UnknownBoat(boat.boat_id.clone()))
    }
}

fn handle_viewer_message(
    broker: &SignalingBroker,
    connection: &ConnectionHandle,
    viewer_id: &str,
    message: ClientMessage,
) -> Result<(), SignalError> {
    match message {
        ClientMessage::ListBoats => {
            connection.send(ServerMessage::Boats {
                boats: broker.list_boats(),
            });
        }
        ClientMessage::RequestOffer { boat_id } => {
            let offer = broker.request_offer(viewer_id, &boat_id)?;
            connection.send(offer.to_message());
        }
        ClientMessage::Answer {
            boat_id,
            sdp,
            offer_version,
        } => {
            broker.submit_answer(viewer_id, &boat_id, sdp, offer_version)?;
            connection.send(ServerMessage::AnswerAccepted {
                boat_id,
                offer_version,
            });
        }
        ClientMessage::BoatRegister { .. } => {
            return Err(SignalError::DuplicateRejected(
                "connection is already classified as a viewer".to_string(),
            ))
        }
        other => {
            return Err(SignalError::UnexpectedMessage(format!(
                "{} is not accepted from a viewer",
                other.kind()
            )))
        }
    }
    Ok(())
}
