use std::sync::Arc;

use dashmap::DashMap;
use harbor_proto::{BoatSummary, Capabilities, CloseReason};
use metrics::gauge;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::SignalError;
use crate::registry::{OfferSnapshot, PairingState, Registration, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Connected,
    AwaitingOffer,
    AnswerSent,
    Closed,
}

impl ViewerState {
    /// Viewer state as implied by its pairing with the target boat.
    fn derive(target_boat_id: Option<&str>, pairing: Option<PairingState>) -> Self {
        match (target_boat_id, pairing) {
            (None, _) => ViewerState::Connected,
            (Some(_), Some(PairingState::Answered { .. })) => ViewerState::AnswerSent,
            (Some(_), _) => ViewerState::AwaitingOffer,
        }
    }
}

/// Point-in-time view of a viewer connection.
#[derive(Debug, Clone)]
pub struct ViewerSession {
    pub viewer_id: String,
    pub label: Option<String>,
    /// Fixed by the first offer request that reaches an existing boat
    pub target_boat_id: Option<String>,
    pub state: ViewerState,
}

struct ViewerEntry {
    label: Option<String>,
    target_boat_id: Option<String>,
    connection: ConnectionHandle,
}

/// Boat-offers / viewer-requests / viewer-answers protocol on top of the
/// [`SessionRegistry`].
///
/// Every operation is synchronous so the protocol can be exercised without a
/// network; delivery to other connections goes through their
/// [`ConnectionHandle`]s.
///
/// A viewer's state is not stored: it is read from the registry pairing, so a
/// renegotiation pushed by the boat is reflected without the broker hearing
/// about it.
#[derive(Clone)]
pub struct SignalingBroker {
    registry: SessionRegistry,
    viewers: Arc<DashMap<String, ViewerEntry>>,
    /// Every accepted socket, including ones still in handshake.
    connections: Arc<DashMap<Uuid, ConnectionHandle>>,
}

impl SignalingBroker {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            viewers: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Remember an accepted socket so shutdown can reach it whatever its role.
    pub fn track(&self, connection: &ConnectionHandle) {
        self.connections.insert(connection.id(), connection.clone());
    }

    pub fn untrack(&self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn register_boat(
        &self,
        boat_id: &str,
        capabilities: Capabilities,
        connection: ConnectionHandle,
    ) -> Result<Registration, SignalError> {
        if boat_id.trim().is_empty() {
            return Err(SignalError::UnexpectedMessage(
                "boat_id must not be empty".to_string(),
            ));
        }
        Ok(self.registry.register(boat_id, capabilities, connection))
    }

    pub fn publish_offer(
        &self,
        boat_id: &str,
        connection_id: Uuid,
        sdp: String,
    ) -> Result<u64, SignalError> {
        let stored = self.registry.set_offer_from(boat_id, connection_id, sdp)?;
        for viewer_id in &stored.renegotiated {
            debug!(viewer_id = %viewer_id, boat_id = %boat_id, "viewer renegotiating");
        }
        Ok(stored.offer_version)
    }

    pub fn withdraw_offer(&self, boat_id: &str, connection_id: Uuid) -> Result<(), SignalError> {
        self.registry.withdraw_offer(boat_id, connection_id)
    }

    /// Explicit unregister or connection close; only removes the entry the
    /// calling connection owns. Returns how many viewers were notified.
    pub fn disconnect_boat(&self, boat_id: &str, connection_id: Uuid) -> usize {
        self.registry
            .remove_owned(boat_id, connection_id)
            .map(|removal| removal.notified)
            .unwrap_or(0)
    }

    pub fn connect_viewer(&self, connection: ConnectionHandle, label: Option<String>) -> String {
        let viewer_id = Uuid::new_v4().to_string();
        self.viewers.insert(
            viewer_id.clone(),
            ViewerEntry {
                label,
                target_boat_id: None,
                connection,
            },
        );
        gauge!("harbor_viewers_connected", self.viewers.len() as f64);
        info!(viewer_id = %viewer_id, "viewer connected");
        viewer_id
    }

    /// Drop the viewer and abort its pairing. Returns its final, closed view.
    pub fn disconnect_viewer(&self, viewer_id: &str) -> Option<ViewerSession> {
        let (_, entry) = self.viewers.remove(viewer_id)?;
        if let Some(boat_id) = entry.target_boat_id.as_deref() {
            if self.registry.detach_viewer(boat_id, viewer_id) {
                debug!(viewer_id = %viewer_id, boat_id = %boat_id, "aborted pairing");
            }
        }
        gauge!("harbor_viewers_connected", self.viewers.len() as f64);
        info!(viewer_id = %viewer_id, "viewer disconnected");
        Some(ViewerSession {
            viewer_id: viewer_id.to_string(),
            label: entry.label,
            target_boat_id: entry.target_boat_id,
            state: ViewerState::Closed,
        })
    }

    /// Hand the boat's current offer to a viewer.
    ///
    /// `OfferNotReady` is not fatal: the viewer retries. The broker never
    /// waits for an offer to appear.
    pub fn request_offer(
        &self,
        viewer_id: &str,
        boat_id: &str,
    ) -> Result<OfferSnapshot, SignalError> {
        let connection = {
            let entry = self.viewers.get(viewer_id).ok_or_else(|| {
                SignalError::UnexpectedMessage(format!("unknown viewer {viewer_id}"))
            })?;
            if let Some(target) = entry.target_boat_id.as_deref() {
                if target != boat_id {
                    return Err(SignalError::UnexpectedMessage(format!(
                        "viewer is bound to boat {target}; reconnect to watch {boat_id}"
                    )));
                }
            }
            entry.connection.clone()
        };

        let result = self.registry.attach_viewer(boat_id, viewer_id, connection);

        if !matches!(result, Err(SignalError::BoatNotFound(_))) {
            if let Some(mut entry) = self.viewers.get_mut(viewer_id) {
                entry.target_boat_id = Some(boat_id.to_string());
            }
        }

        match &result {
            Ok(offer) => debug!(
                viewer_id = %viewer_id,
                boat_id = %boat_id,
                offer_version = offer.offer_version,
                "offer handed to viewer"
            ),
            Err(err) => debug!(viewer_id = %viewer_id, boat_id = %boat_id, error = %err, "offer request failed"),
        }
        result
    }

    /// Relay a viewer's answer to the boat, provided it answers the boat's
    /// current offer version.
    pub fn submit_answer(
        &self,
        viewer_id: &str,
        boat_id: &str,
        sdp: String,
        offer_version: u64,
    ) -> Result<(), SignalError> {
        let target = self
            .viewers
            .get(viewer_id)
            .ok_or_else(|| SignalError::UnexpectedMessage(format!("unknown viewer {viewer_id}")))?
            .target_boat_id
            .clone();
        if target.as_deref() != Some(boat_id) {
            return Err(SignalError::UnexpectedMessage(format!(
                "no offer from boat {boat_id} was requested by this viewer"
            )));
        }

        self.registry
            .forward_answer(boat_id, viewer_id, sdp, offer_version)?;

        info!(
            viewer_id = %viewer_id,
            boat_id = %boat_id,
            offer_version,
            "relayed answer to boat"
        );
        Ok(())
    }

    pub fn list_boats(&self) -> Vec<BoatSummary> {
        self.registry.list_boats()
    }

    pub fn viewer(&self, viewer_id: &str) -> Option<ViewerSession> {
        let (label, target_boat_id) = {
            let entry = self.viewers.get(viewer_id)?;
            (entry.label.clone(), entry.target_boat_id.clone())
        };
        // The viewers guard is released before the registry is consulted.
        let pairing = target_boat_id
            .as_deref()
            .and_then(|boat_id| self.registry.pairing_state(boat_id, viewer_id));
        Some(ViewerSession {
            viewer_id: viewer_id.to_string(),
            label,
            state: ViewerState::derive(target_boat_id.as_deref(), pairing),
            target_boat_id,
        })
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Ask every tracked connection to close; used on shutdown. Returns how
    /// many were asked.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for connection in self.connections.iter() {
            if connection.close(reason) {
                closed += 1;
            }
        }
        info!(closed, reason = %reason, "closing all connections");
        closed
    }
}
