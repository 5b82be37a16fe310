//! `harbor boat` and `harbor probe`: small clients for exercising a running
//! coordinator.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use harbor_proto::{Capabilities, ClientMessage, ControlCommand, ServerMessage};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::cli::{BoatArgs, ProbeArgs};
use crate::device::SimulatedDevice;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

async fn connect(url: &str) -> Result<WsStream> {
    let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| anyhow!("timed out connecting to {url}"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(stream)
}

/// Try each URL in order and keep the first that accepts.
async fn connect_first(urls: &[String]) -> Result<(WsStream, String)> {
    let mut last_error = None;
    for url in urls {
        match connect(url).await {
            Ok(stream) => return Ok((stream, url.clone())),
            Err(err) => {
                warn!(url = %url, error = %err, "connection attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("no coordinator URL configured")))
}

async fn send(ws: &mut WsStream, message: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    ws.send(Message::Text(text.into()))
        .await
        .context("failed to send frame")
}

/// Next coordinator message, skipping transport-level frames.
async fn recv(ws: &mut WsStream) -> Result<Option<ServerMessage>> {
    while let Some(frame) = ws.next().await {
        match frame.context("websocket error")? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .map(Some)
                    .with_context(|| format!("unexpected frame: {}", text.as_str()))
            }
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

async fn recv_timeout(ws: &mut WsStream) -> Result<ServerMessage> {
    timeout(REPLY_TIMEOUT, recv(ws))
        .await
        .map_err(|_| anyhow!("timed out waiting for the coordinator"))??
        .ok_or_else(|| anyhow!("coordinator closed the connection"))
}

async fn load_offer(args: &BoatArgs) -> Result<Option<String>> {
    if let Some(path) = &args.offer_file {
        let sdp = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read offer from {}", path.display()))?;
        return Ok(Some(sdp));
    }
    Ok(args.offer.clone())
}

/// Run a relayed command on the boat's own device and build the reply.
fn control_reply(
    device: &SimulatedDevice,
    viewer_id: String,
    correlation_id: String,
    command: &ControlCommand,
) -> ClientMessage {
    let (success, telemetry, error) = match device.apply(command) {
        Ok(telemetry) => (true, Some(telemetry), None),
        Err(err) => (false, None, Some(err.to_string())),
    };
    debug!(viewer_id = %viewer_id, correlation_id = %correlation_id, cmd = command.name(), success, "answered control request");
    ClientMessage::CommandResult {
        viewer_id,
        correlation_id,
        success,
        telemetry,
        error,
    }
}

pub async fn run_boat(args: BoatArgs) -> Result<()> {
    let offer = load_offer(&args).await?;

    let mut urls = vec![endpoint(&args.url, "boat")];
    if let Some(fallback) = &args.fallback_url {
        urls.push(endpoint(fallback, "boat"));
    }
    let (mut ws, url) = connect_first(&urls).await?;
    info!(url = %url, boat_id = %args.boat_id, "connected to coordinator");

    send(
        &mut ws,
        &ClientMessage::BoatRegister {
            boat_id: args.boat_id.clone(),
            capabilities: Capabilities {
                width: args.width,
                height: args.height,
                fps: args.fps,
            },
        },
    )
    .await?;
    match recv_timeout(&mut ws).await? {
        ServerMessage::Registered { replaced, .. } => {
            info!(boat_id = %args.boat_id, replaced, "registered")
        }
        ServerMessage::Error { code, message, .. } => bail!("registration failed ({code}): {message}"),
        other => bail!("unexpected reply to registration: {other:?}"),
    }

    match offer {
        Some(sdp) => send(&mut ws, &ClientMessage::Offer { sdp }).await?,
        None => warn!("no offer given; viewers will get offer_not_ready"),
    }

    let device = SimulatedDevice::new();
    let mut heartbeat = interval(Duration::from_secs(args.heartbeat_secs.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut beats: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; unregistering");
                send(&mut ws, &ClientMessage::Unregister).await?;
                let _ = ws.close(None).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                beats += 1;
                send(&mut ws, &ClientMessage::Command {
                    correlation_id: format!("hb-{beats}"),
                    command: ControlCommand::Ping { data: None },
                })
                .await?;
            }
            message = recv(&mut ws) => {
                match message? {
                    Some(ServerMessage::OfferAccepted { offer_version, .. }) => {
                        info!(offer_version, "offer published")
                    }
                    Some(ServerMessage::Answer { viewer_id, sdp, offer_version }) => {
                        info!(viewer_id = %viewer_id, offer_version, sdp_len = sdp.len(), "answer received");
                    }
                    Some(ServerMessage::ControlRequest { viewer_id, correlation_id, command }) => {
                        let reply = control_reply(&device, viewer_id, correlation_id, &command);
                        send(&mut ws, &reply).await?;
                    }
                    Some(ServerMessage::Pong { correlation_id, .. }) => {
                        debug!(correlation_id = %correlation_id, "heartbeat acknowledged")
                    }
                    Some(ServerMessage::Error { code, message, .. }) => {
                        warn!(code = %code, "coordinator error: {message}")
                    }
                    Some(ServerMessage::Closing { reason }) => {
                        info!(reason = %reason, "coordinator is closing the connection");
                    }
                    Some(other) => debug!(?other, "ignoring message"),
                    None => {
                        error!("coordinator closed the connection");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSummary {
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

impl RttSummary {
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = samples.iter().min().copied()?;
        let max = samples.iter().max().copied()?;
        let total: Duration = samples.iter().sum();
        Some(Self {
            min,
            avg: total / samples.len() as u32,
            max,
        })
    }
}

pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    let url = endpoint(&args.url, "ws");
    let mut ws = connect(&url).await?;
    send(
        &mut ws,
        &ClientMessage::ViewerConnect {
            label: Some(args.label.clone()),
        },
    )
    .await?;

    let boats = match recv_timeout(&mut ws).await? {
        ServerMessage::ViewerConnected { viewer_id, boats } => {
            info!(viewer_id = %viewer_id, "connected as viewer");
            boats
        }
        other => bail!("unexpected reply to viewer_connect: {other:?}"),
    };

    println!("{} boat(s) registered", boats.len());
    for boat in &boats {
        println!(
            "  {:<24} {:?}  {}x{}@{}",
            boat.boat_id,
            boat.state,
            boat.capabilities.width,
            boat.capabilities.height,
            boat.capabilities.fps
        );
    }

    let mut samples = Vec::with_capacity(args.count as usize);
    for seq in 0..args.count {
        let correlation_id = format!("probe-{seq}");
        let started = Instant::now();
        send(
            &mut ws,
            &ClientMessage::Command {
                correlation_id: correlation_id.clone(),
                command: ControlCommand::Ping { data: None },
            },
        )
        .await?;
        loop {
            match recv_timeout(&mut ws).await? {
                ServerMessage::Pong {
                    correlation_id: id, ..
                } if id == correlation_id => {
                    samples.push(started.elapsed());
                    break;
                }
                other => debug!(?other, "skipping message while waiting for pong"),
            }
        }
    }

    if let Some(rtt) = RttSummary::from_samples(&samples) {
        println!(
            "ping rtt over {} sample(s): min {:?} avg {:?} max {:?}",
            samples.len(),
            rtt.min,
            rtt.avg,
            rtt.max
        );
    }

    if let Some(boat_id) = args.boat_id {
        send(
            &mut ws,
            &ClientMessage::RequestOffer {
                boat_id: boat_id.clone(),
            },
        )
        .await?;
        match recv_timeout(&mut ws).await? {
            ServerMessage::Offer {
                offer_version, sdp, ..
            } => println!(
                "boat {boat_id} offer v{offer_version} ({} bytes of SDP)",
                sdp.len()
            ),
            ServerMessage::Error { code, message, .. } => {
                println!("boat {boat_id}: {code}: {message}")
            }
            other => bail!("unexpected reply to request_offer: {other:?}"),
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
