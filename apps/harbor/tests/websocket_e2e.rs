use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use harbor::config::ServerConfig;
use harbor::device::DeviceMode;
use harbor::server;
use harbor::websocket::AppState;
use harbor_proto::{BoatState, CloseReason, ControlCommand, ErrorCode, ServerMessage};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(config: ServerConfig) -> (SocketAddr, AppState) {
    start_until(config, std::future::pending::<()>()).await
}

async fn start_until<F>(config: ServerConfig, shutdown: F) -> (SocketAddr, AppState)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config, None);
    let served = state.clone();
    tokio::spawn(async move {
        server::serve(listener, served, shutdown).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/{path}")).await.unwrap();
    client
}

async fn send(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn send_raw(client: &mut Client, text: &str) {
    client.send(Message::Text(text.into())).await.unwrap();
}

/// Next coordinator message, or `None` once the server has closed.
async fn recv(client: &mut Client) -> Option<ServerMessage> {
    let read = async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap());
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    };
    timeout(Duration::from_secs(5), read)
        .await
        .expect("no message from coordinator")
}

async fn expect_closing(client: &mut Client, reason: CloseReason) {
    assert_eq!(recv(client).await, Some(ServerMessage::Closing { reason }));
    assert_eq!(recv(client).await, None);
}

async fn register_boat(addr: SocketAddr, boat_id: &str) -> Client {
    let mut boat = connect(addr, "boat").await;
    send(
        &mut boat,
        json!({
            "type": "boat_register",
            "boat_id": boat_id,
            "capabilities": { "width": 160, "height": 120, "fps": 30 }
        }),
    )
    .await;
    assert_eq!(
        recv(&mut boat).await,
        Some(ServerMessage::Registered {
            boat_id: boat_id.to_string(),
            replaced: false,
        })
    );
    boat
}

async fn connect_viewer(addr: SocketAddr) -> (Client, String) {
    let mut viewer = connect(addr, "browser").await;
    send(&mut viewer, json!({ "type": "viewer_connect", "label": "test" })).await;
    match recv(&mut viewer).await {
        Some(ServerMessage::ViewerConnected { viewer_id, .. }) => (viewer, viewer_id),
        other => panic!("unexpected handshake reply {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn boat_and_viewer_complete_a_session() {
    let (addr, _state) = start(ServerConfig::default()).await;
    let mut boat = register_boat(addr, "boat-1").await;

    send(&mut boat, json!({ "type": "offer", "sdp": "SDP-A" })).await;
    assert_eq!(
        recv(&mut boat).await,
        Some(ServerMessage::OfferAccepted {
            boat_id: "boat-1".into(),
            offer_version: 1,
        })
    );

    let mut viewer = connect(addr, "ws").await;
    send(&mut viewer, json!({ "type": "viewer_connect" })).await;
    let viewer_id = match recv(&mut viewer).await {
        Some(ServerMessage::ViewerConnected { viewer_id, boats }) => {
            assert_eq!(boats.len(), 1);
            assert_eq!(boats[0].boat_id, "boat-1");
            assert_eq!(boats[0].state, BoatState::OfferReady);
            viewer_id
        }
        other => panic!("unexpected handshake reply {other:?}"),
    };

    send(&mut viewer, json!({ "type": "request_offer", "boat_id": "boat-1" })).await;
    assert_eq!(
        recv(&mut viewer).await,
        Some(ServerMessage::Offer {
            boat_id: "boat-1".into(),
            sdp: "SDP-A".into(),
            offer_version: 1,
        })
    );

    send(
        &mut viewer,
        json!({ "type": "answer", "boat_id": "boat-1", "sdp": "ANS", "offer_version": 1 }),
    )
    .await;
    assert_eq!(
        recv(&mut viewer).await,
        Some(ServerMessage::AnswerAccepted {
            boat_id: "boat-1".into(),
            offer_version: 1,
        })
    );
    assert_eq!(
        recv(&mut boat).await,
        Some(ServerMessage::Answer {
            viewer_id,
            sdp: "ANS".into(),
            offer_version: 1,
        })
    );

    boat.close(None).await.unwrap();
    assert_eq!(
        recv(&mut viewer).await,
        Some(ServerMessage::BoatDisconnected {
            boat_id: "boat-1".into(),
        })
    );
}

#[test_timeout::tokio_timeout_test]
async fn stale_answer_is_rejected_over_the_wire() {
    let (addr, _state) = start(ServerConfig::default()).await;
    let mut boat = register_boat(addr, "boat-1").await;
    send(&mut boat, json!({ "type": "offer", "sdp": "SDP-A" })).await;
    recv(&mut boat).await;

    let (mut viewer, _) = connect_viewer(addr).await;
    send(&mut viewer, json!({ "type": "request_offer", "boat_id": "boat-1" })).await;
    recv(&mut viewer).await;

    send(&mut boat, json!({ "type": "offer", "sdp": "SDP-B" })).await;
    assert_eq!(
        recv(&mut boat).await,
        Some(ServerMessage::OfferAccepted {
            boat_id: "boat-1".into(),
            offer_version: 2,
        })
    );

    send(
        &mut viewer,
        json!({ "type": "answer", "boat_id": "boat-1", "sdp": "ANS", "offer_version": 1 }),
    )
    .await;
    match recv(&mut viewer).await {
        Some(ServerMessage::Error { code, boat_id, .. }) => {
            assert_eq!(code, ErrorCode::StaleOffer);
            assert_eq!(boat_id.as_deref(), Some("boat-1"));
        }
        other => panic!("expected stale_offer, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn first_message_must_classify_the_connection() {
    let (addr, state) = start(ServerConfig::default()).await;
    let mut client = connect(addr, "ws").await;
    send(&mut client, json!({ "type": "list_boats" })).await;
    expect_closing(&mut client, CloseReason::UnexpectedMessage).await;
    assert_eq!(state.broker.viewer_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn silent_connection_times_out_during_handshake() {
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let (addr, _state) = start(config).await;
    let mut client = connect(addr, "ws").await;
    expect_closing(&mut client, CloseReason::HandshakeTimeout).await;
}

#[test_timeout::tokio_timeout_test]
async fn idle_boat_is_closed_and_torn_down() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let (addr, state) = start(config).await;
    let mut boat = register_boat(addr, "sleepy").await;
    assert!(state.broker.registry().contains("sleepy"));

    expect_closing(&mut boat, CloseReason::IdleTimeout).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!state.broker.registry().contains("sleepy"));
}

#[test_timeout::tokio_timeout_test]
async fn repeated_malformed_frames_close_the_connection() {
    let config = ServerConfig {
        max_malformed: 2,
        ..ServerConfig::default()
    };
    let (addr, _state) = start(config).await;
    let (mut viewer, _) = connect_viewer(addr).await;

    send_raw(&mut viewer, "not json").await;
    match recv(&mut viewer).await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::MalformedMessage),
        other => panic!("expected malformed_message, got {other:?}"),
    }

    send(&mut viewer, json!({ "type": "teleport" })).await;
    match recv(&mut viewer).await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::UnexpectedMessage),
        other => panic!("expected unexpected_message, got {other:?}"),
    }
    expect_closing(&mut viewer, CloseReason::TooManyMalformed).await;
}

#[test_timeout::tokio_timeout_test]
async fn command_without_correlation_id_closes_the_connection() {
    let (addr, _state) = start(ServerConfig::default()).await;
    let (mut viewer, _) = connect_viewer(addr).await;
    send(&mut viewer, json!({ "type": "command", "command": { "cmd": "status" } })).await;
    match recv(&mut viewer).await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::MalformedCommand),
        other => panic!("expected malformed_command, got {other:?}"),
    }
    expect_closing(&mut viewer, CloseReason::MalformedCommand).await;
}

#[test_timeout::tokio_timeout_test]
async fn commands_and_pings_are_answered_by_correlation_id() {
    let (addr, _state) = start(ServerConfig::default()).await;
    let (mut viewer, _) = connect_viewer(addr).await;

    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": "c1",
                "command": { "cmd": "set_pin", "pin": 18, "state": true } }),
    )
    .await;
    for id in ["p1", "p2"] {
        send(
            &mut viewer,
            json!({ "type": "command", "correlation_id": id, "command": { "cmd": "ping" } }),
        )
        .await;
    }
    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": "c2",
                "command": { "cmd": "move", "movement": "forward", "speed": 101 } }),
    )
    .await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        match recv(&mut viewer).await {
            Some(ServerMessage::CommandResult {
                correlation_id,
                success,
                telemetry,
                ..
            }) => {
                assert_eq!(correlation_id, "c1");
                assert!(success);
                assert_eq!(telemetry, Some(json!({ "pin": 18, "state": true })));
                seen.push(correlation_id);
            }
            Some(ServerMessage::Pong { correlation_id, .. }) => seen.push(correlation_id),
            Some(ServerMessage::Error {
                code,
                correlation_id,
                ..
            }) => {
                assert_eq!(code, ErrorCode::MalformedCommand);
                seen.push(correlation_id.unwrap());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["c1", "c2", "p1", "p2"]);
}

#[test_timeout::tokio_timeout_test]
async fn unavailable_device_fails_commands_not_signaling() {
    let config = ServerConfig {
        device: DeviceMode::None,
        ..ServerConfig::default()
    };
    let (addr, _state) = start(config).await;
    let (mut viewer, _) = connect_viewer(addr).await;
    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": "c1", "command": { "cmd": "status" } }),
    )
    .await;
    match recv(&mut viewer).await {
        Some(ServerMessage::CommandResult { success, error, .. }) => {
            assert!(!success);
            assert_eq!(error.as_deref(), Some("device backend unavailable"));
        }
        other => panic!("unexpected message {other:?}"),
    }

    send(&mut viewer, json!({ "type": "list_boats" })).await;
    assert_eq!(
        recv(&mut viewer).await,
        Some(ServerMessage::Boats { boats: Vec::new() })
    );
}

#[test_timeout::tokio_timeout_test]
async fn second_boat_with_same_id_replaces_the_first() {
    let (addr, state) = start(ServerConfig::default()).await;
    let mut first = register_boat(addr, "boat-1").await;

    let mut second = connect(addr, "boat").await;
    send(&mut second, json!({ "type": "boat_register", "boat_id": "boat-1" })).await;
    assert_eq!(
        recv(&mut second).await,
        Some(ServerMessage::Registered {
            boat_id: "boat-1".into(),
            replaced: true,
        })
    );
    expect_closing(&mut first, CloseReason::Replaced).await;

    // The evicted socket's teardown must leave the new registration alone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.broker.registry().contains("boat-1"));

    send(&mut second, json!({ "type": "boat_register", "boat_id": "boat-1" })).await;
    match recv(&mut second).await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::DuplicateRejected),
        other => panic!("expected duplicate_rejected, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn boats_endpoint_lists_registered_boats() {
    let (addr, _state) = start(ServerConfig::default()).await;
    let _boat = register_boat(addr, "boat-7").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        b"GET /boats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let mut response = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response)
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"boat_id\":\"boat-7\""));
}

#[test_timeout::tokio_timeout_test]
async fn out_of_range_commands_count_as_malformed() {
    let config = ServerConfig {
        max_malformed: 2,
        ..ServerConfig::default()
    };
    let (addr, _state) = start(config).await;
    let (mut viewer, _) = connect_viewer(addr).await;

    for id in ["m1", "m2"] {
        send(
            &mut viewer,
            json!({ "type": "command", "correlation_id": id,
                    "command": { "cmd": "move", "movement": "forward", "speed": 250 } }),
        )
        .await;
        match recv(&mut viewer).await {
            Some(ServerMessage::Error {
                code,
                correlation_id,
                ..
            }) => {
                assert_eq!(code, ErrorCode::MalformedCommand);
                assert_eq!(correlation_id.as_deref(), Some(id));
            }
            other => panic!("expected malformed_command, got {other:?}"),
        }
    }
    expect_closing(&mut viewer, CloseReason::TooManyMalformed).await;
}

#[test_timeout::tokio_timeout_test]
async fn numeric_correlation_id_closes_the_connection() {
    let (addr, _state) = start(ServerConfig::default()).await;
    let (mut viewer, _) = connect_viewer(addr).await;
    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": 42, "command": { "cmd": "status" } }),
    )
    .await;
    match recv(&mut viewer).await {
        Some(ServerMessage::Error {
            code,
            correlation_id,
            ..
        }) => {
            assert_eq!(code, ErrorCode::MalformedCommand);
            assert_eq!(correlation_id, None);
        }
        other => panic!("expected malformed_command, got {other:?}"),
    }
    expect_closing(&mut viewer, CloseReason::MalformedCommand).await;
}

#[test_timeout::tokio_timeout_test]
async fn viewer_command_is_relayed_to_its_boat() {
    let config = ServerConfig {
        device: DeviceMode::Boat,
        ..ServerConfig::default()
    };
    let (addr, state) = start(config).await;
    let mut boat = register_boat(addr, "boat-1").await;
    send(&mut boat, json!({ "type": "offer", "sdp": "SDP-A" })).await;
    recv(&mut boat).await;

    let (mut viewer, viewer_id) = connect_viewer(addr).await;

    // No boat chosen yet, so there is nowhere to relay to.
    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": "c0", "command": { "cmd": "status" } }),
    )
    .await;
    match recv(&mut viewer).await {
        Some(ServerMessage::CommandResult {
            correlation_id,
            success,
            ..
        }) => {
            assert_eq!(correlation_id, "c0");
            assert!(!success);
        }
        other => panic!("unexpected message {other:?}"),
    }

    send(&mut viewer, json!({ "type": "request_offer", "boat_id": "boat-1" })).await;
    recv(&mut viewer).await;

    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": "c1",
                "command": { "cmd": "set_pin", "pin": 18, "state": true } }),
    )
    .await;
    match recv(&mut boat).await {
        Some(ServerMessage::ControlRequest {
            viewer_id: relayed_for,
            correlation_id,
            command,
        }) => {
            assert_eq!(relayed_for, viewer_id);
            assert_eq!(correlation_id, "c1");
            assert_eq!(command, ControlCommand::SetPin { pin: 18, state: true });
        }
        other => panic!("expected control_request, got {other:?}"),
    }

    send(
        &mut boat,
        json!({ "type": "command_result", "viewer_id": viewer_id, "correlation_id": "c1",
                "success": true, "telemetry": { "pin": 18, "state": true } }),
    )
    .await;
    assert_eq!(
        recv(&mut viewer).await,
        Some(ServerMessage::CommandResult {
            correlation_id: "c1".into(),
            success: true,
            telemetry: Some(json!({ "pin": 18, "state": true })),
            error: None,
        })
    );
    assert_eq!(state.relay.in_flight(), 0);

    // A result nobody is waiting for is reported back to the boat.
    send(
        &mut boat,
        json!({ "type": "command_result", "viewer_id": viewer_id, "correlation_id": "c1",
                "success": true }),
    )
    .await;
    match recv(&mut boat).await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::UnexpectedMessage),
        other => panic!("expected unexpected_message, got {other:?}"),
    }

    // A boat that leaves mid-command fails it instead of leaving it hanging.
    send(
        &mut viewer,
        json!({ "type": "command", "correlation_id": "c2", "command": { "cmd": "status" } }),
    )
    .await;
    assert!(matches!(
        recv(&mut boat).await,
        Some(ServerMessage::ControlRequest { .. })
    ));
    boat.close(None).await.unwrap();

    let mut failed = false;
    let mut disconnected = false;
    for _ in 0..2 {
        match recv(&mut viewer).await {
            Some(ServerMessage::CommandResult {
                correlation_id,
                success,
                ..
            }) => {
                assert_eq!(correlation_id, "c2");
                assert!(!success);
                failed = true;
            }
            Some(ServerMessage::BoatDisconnected { boat_id }) => {
                assert_eq!(boat_id, "boat-1");
                disconnected = true;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(failed && disconnected);
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_closes_connections_still_in_handshake() {
    let (trigger, fired) = oneshot::channel::<()>();
    let (addr, state) = start_until(ServerConfig::default(), async move {
        let _ = fired.await;
    })
    .await;

    let mut boat = register_boat(addr, "boat-1").await;
    let mut silent = connect(addr, "ws").await;
    while state.broker.connection_count() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    trigger.send(()).unwrap();
    expect_closing(&mut silent, CloseReason::Shutdown).await;
    expect_closing(&mut boat, CloseReason::Shutdown).await;
}
