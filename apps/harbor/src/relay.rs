use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use harbor_proto::{ControlCommand, ServerMessage};
use metrics::counter;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::SignalingBroker;
use crate::device::{CommandOrigin, DeviceBackend};
use crate::error::{DeviceError, SignalError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    boat_id: String,
    viewer_id: String,
    correlation_id: String,
}

struct PendingCommand {
    /// Boat connection the request went to; only it may answer
    boat_connection: Uuid,
    reply: oneshot::Sender<Result<Value, DeviceError>>,
}

/// Device backend that forwards a viewer's command to the boat it watches
/// and waits for the boat's `command_result`.
///
/// Requests are keyed by boat, viewer and correlation id, so two viewers may
/// reuse the same correlation id without crossing replies.
#[derive(Clone)]
pub struct CommandRelay {
    broker: SignalingBroker,
    pending: Arc<DashMap<PendingKey, PendingCommand>>,
    reply_timeout: Duration,
}

impl CommandRelay {
    pub fn new(broker: SignalingBroker, reply_timeout: Duration) -> Self {
        Self {
            broker,
            pending: Arc::new(DashMap::new()),
            reply_timeout,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Hand a boat's `command_result` back to the waiting viewer command.
    #[allow(clippy::too_many_arguments)]
    pub fn complete(
        &self,
        boat_id: &str,
        connection_id: Uuid,
        viewer_id: String,
        correlation_id: String,
        success: bool,
        telemetry: Option<Value>,
        error: Option<String>,
    ) -> Result<(), SignalError> {
        let key = PendingKey {
            boat_id: boat_id.to_string(),
            viewer_id,
            correlation_id,
        };
        let Some((key, pending)) = self
            .pending
            .remove_if(&key, |_, pending| pending.boat_connection == connection_id)
        else {
            return Err(SignalError::UnexpectedMessage(format!(
                "no command {} for viewer {} is waiting on this boat",
                key.correlation_id, key.viewer_id
            )));
        };

        let result = if success {
            Ok(telemetry.unwrap_or(Value::Null))
        } else {
            Err(DeviceError::Remote(
                error.unwrap_or_else(|| "boat reported failure".to_string()),
            ))
        };
        if pending.reply.send(result).is_err() {
            debug!(
                boat_id = %key.boat_id,
                correlation_id = %key.correlation_id,
                "command result arrived after the viewer stopped waiting"
            );
        }
        Ok(())
    }

    /// Fail every command still waiting on `connection_id`. Returns how many.
    pub fn abandon_connection(&self, boat_id: &str, connection_id: Uuid) -> usize {
        let keys: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|entry| entry.key().boat_id == boat_id && entry.boat_connection == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut abandoned = 0;
        for key in keys {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&key, |_, pending| pending.boat_connection == connection_id)
            {
                let _ = pending
                    .reply
                    .send(Err(DeviceError::BoatDisconnected(boat_id.to_string())));
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            info!(boat_id = %boat_id, abandoned, "failed commands pending on departed boat");
        }
        abandoned
    }

    fn target_boat(&self, origin: &CommandOrigin) -> Result<(String, String), DeviceError> {
        let viewer_id = origin.viewer_id.clone().ok_or(DeviceError::NoTargetBoat)?;
        let boat_id = self
            .broker
            .viewer(&viewer_id)
            .and_then(|session| session.target_boat_id)
            .ok_or(DeviceError::NoTargetBoat)?;
        Ok((viewer_id, boat_id))
    }
}

#[async_trait]
impl DeviceBackend for CommandRelay {
    fn name(&self) -> &'static str {
        "boat"
    }

    async fn execute(
        &self,
        origin: &CommandOrigin,
        command: &ControlCommand,
    ) -> Result<Value, DeviceError> {
        let (viewer_id, boat_id) = self.target_boat(origin)?;
        let key = PendingKey {
            boat_id: boat_id.clone(),
            viewer_id: viewer_id.clone(),
            correlation_id: origin.correlation_id.clone(),
        };

        let boat_connection = self
            .broker
            .registry()
            .boat_connection(&boat_id)
            .ok_or_else(|| DeviceError::BoatDisconnected(boat_id.clone()))?;

        // Registered before the request goes out so a fast reply finds it.
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(DeviceError::DuplicateCorrelation(
                    origin.correlation_id.clone(),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCommand {
                    boat_connection,
                    reply: tx,
                });
            }
        }

        let request = ServerMessage::ControlRequest {
            viewer_id,
            correlation_id: origin.correlation_id.clone(),
            command: command.clone(),
        };
        match self.broker.registry().send_to_boat(&boat_id, request) {
            Ok(sent_to) if sent_to == boat_connection => {}
            Ok(sent_to) => {
                // The boat re-registered in between; its new connection answers.
                if let Some(mut pending) = self.pending.get_mut(&key) {
                    pending.boat_connection = sent_to;
                }
            }
            Err(err) => {
                self.pending.remove(&key);
                debug!(boat_id = %boat_id, error = %err, "could not relay command");
                return Err(DeviceError::BoatDisconnected(boat_id));
            }
        }
        counter!("harbor_commands_relayed_total", 1, "cmd" => command.name());

        let outcome = tokio::time::timeout(self.reply_timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::BoatDisconnected(boat_id)),
            Err(_) => {
                self.pending.remove(&key);
                warn!(
                    boat_id = %boat_id,
                    correlation_id = %origin.correlation_id,
                    "boat did not answer relayed command"
                );
                Err(DeviceError::Timeout(boat_id))
            }
        }
    }
}
