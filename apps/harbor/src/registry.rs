use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use harbor_proto::{BoatState, BoatSummary, Capabilities, ServerMessage};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::SignalError;
use harbor_proto::CloseReason;

/// In-memory table of boats and their current offers.
///
/// Every mutation of a boat happens while holding that boat's map shard
/// lock, so readers observe either the whole entry or no entry at all.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    boats: DashMap<String, BoatEntry>,
    /// Shared by every boat, so a re-registered id never reuses a version.
    last_version: AtomicU64,
}

struct BoatEntry {
    boat_id: String,
    capabilities: Capabilities,
    state: BoatState,
    current_offer: Option<String>,
    offer_version: u64,
    connection: ConnectionHandle,
    pairings: HashMap<String, Pairing>,
}

impl BoatEntry {
    fn summary(&self) -> BoatSummary {
        BoatSummary {
            boat_id: self.boat_id.clone(),
            capabilities: self.capabilities,
            state: self.state,
        }
    }

    fn owned_by(&self, connection_id: Option<Uuid>) -> bool {
        connection_id.map_or(true, |id| self.connection.id() == id)
    }
}

/// A viewer that has been handed this boat's offer.
struct Pairing {
    viewer: ConnectionHandle,
    state: PairingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    OfferSent { version: u64 },
    Answered { version: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferSnapshot {
    pub boat_id: String,
    pub sdp: String,
    pub offer_version: u64,
}

impl OfferSnapshot {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Offer {
            boat_id: self.boat_id.clone(),
            sdp: self.sdp.clone(),
            offer_version: self.offer_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub summary: BoatSummary,
    /// A prior entry under the same id was evicted
    pub replaced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub summary: BoatSummary,
    /// Viewers that received `boat_disconnected`
    pub notified: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOffer {
    pub offer_version: u64,
    /// Viewers that had answered and were pushed the new offer
    pub renegotiated: Vec<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the entry for `boat_id`.
    ///
    /// A replaced entry belonging to another connection has that connection
    /// closed with `replaced` and its paired viewers told the boat is gone.
    pub fn register(
        &self,
        boat_id: &str,
        capabilities: Capabilities,
        connection: ConnectionHandle,
    ) -> Registration {
        let new_connection = connection.id();
        let entry = BoatEntry {
            boat_id: boat_id.to_string(),
            capabilities,
            state: BoatState::Registered,
            current_offer: None,
            offer_version: 0,
            connection,
            pairings: HashMap::new(),
        };
        let summary = entry.summary();
        let previous = self.inner.boats.insert(boat_id.to_string(), entry);

        let replaced = previous.is_some();
        if let Some(old) = previous {
            warn!(boat_id = %boat_id, "boat already registered, replacing");
            if old.connection.id() != new_connection && old.connection.is_open() {
                old.connection.close(CloseReason::Replaced);
            }
            notify_disconnected(old);
        } else {
            gauge!("harbor_boats_registered", self.len() as f64);
        }

        counter!("harbor_boat_registrations_total", 1);
        info!(
            boat_id = %boat_id,
            width = capabilities.width,
            height = capabilities.height,
            fps = capabilities.fps,
            replaced,
            "registered boat"
        );

        Registration { summary, replaced }
    }

    /// Store a new offer and return its version.
    pub fn set_offer(&self, boat_id: &str, offer: String) -> Result<u64, SignalError> {
        self.store_offer(boat_id, None, offer)
            .map(|stored| stored.offer_version)
    }

    /// Like [`set_offer`](Self::set_offer), but only if `connection_id`
    /// still owns the entry.
    pub fn set_offer_from(
        &self,
        boat_id: &str,
        connection_id: Uuid,
        offer: String,
    ) -> Result<StoredOffer, SignalError> {
        self.store_offer(boat_id, Some(connection_id), offer)
    }

    fn store_offer(
        &self,
        boat_id: &str,
        owner: Option<Uuid>,
        offer: String,
    ) -> Result<StoredOffer, SignalError> {
        let mut entry = self
            .inner
            .boats
            .get_mut(boat_id)
            .filter(|entry| entry.owned_by(owner))
            .ok_or_else(|| SignalError::UnknownBoat(boat_id.to_string()))?;

        // Taken under the shard lock, so versions for one boat are ordered.
        let version = self.inner.last_version.fetch_add(1, Ordering::Relaxed) + 1;
        entry.offer_version = version;
        entry.current_offer = Some(offer.clone());
        entry.state = BoatState::OfferReady;

        // Viewers that already answered renegotiate onto the new offer. Viewers
        // still holding an unanswered offer keep it and will be told it is stale.
        let mut renegotiated = Vec::new();
        for (viewer_id, pairing) in entry.pairings.iter_mut() {
            if let PairingState::Answered { .. } = pairing.state {
                let message = ServerMessage::Offer {
                    boat_id: boat_id.to_string(),
                    sdp: offer.clone(),
                    offer_version: version,
                };
                if pairing.viewer.send(message) {
                    pairing.state = PairingState::OfferSent { version };
                    renegotiated.push(viewer_id.clone());
                } else {
                    debug!(viewer_id = %viewer_id, "viewer gone before renegotiation push");
                }
            }
        }
        drop(entry);

        counter!("harbor_offers_stored_total", 1);
        info!(
            boat_id = %boat_id,
            offer_version = version,
            renegotiated = renegotiated.len(),
            "stored offer"
        );
        Ok(StoredOffer {
            offer_version: version,
            renegotiated,
        })
    }

    /// Withdraw the current offer while the boat prepares a new one.
    pub fn withdraw_offer(&self, boat_id: &str, connection_id: Uuid) -> Result<(), SignalError> {
        let mut entry = self
            .inner
            .boats
            .get_mut(boat_id)
            .filter(|entry| entry.owned_by(Some(connection_id)))
            .ok_or_else(|| SignalError::UnknownBoat(boat_id.to_string()))?;
        entry.current_offer = None;
        entry.state = BoatState::OfferPending;
        debug!(boat_id = %boat_id, "offer withdrawn for renegotiation");
        Ok(())
    }

    /// Latest offer for `boat_id`.
    pub fn get_offer(&self, boat_id: &str) -> Result<OfferSnapshot, SignalError> {
        let entry = self
            .inner
            .boats
            .get(boat_id)
            .ok_or_else(|| SignalError::BoatNotFound(boat_id.to_string()))?;
        snapshot_offer(&entry)
    }

    /// Read the current offer and record `viewer_id` as holding it, in one
    /// step, so a concurrent removal either sees the pairing or the viewer
    /// sees the boat absent.
    pub fn attach_viewer(
        &self,
        boat_id: &str,
        viewer_id: &str,
        viewer: ConnectionHandle,
    ) -> Result<OfferSnapshot, SignalError> {
        let mut entry = self
            .inner
            .boats
            .get_mut(boat_id)
            .ok_or_else(|| SignalError::BoatNotFound(boat_id.to_string()))?;
        let offer = snapshot_offer(&entry)?;
        entry.pairings.insert(
            viewer_id.to_string(),
            Pairing {
                viewer,
                state: PairingState::OfferSent {
                    version: offer.offer_version,
                },
            },
        );
        Ok(offer)
    }

    pub fn detach_viewer(&self, boat_id: &str, viewer_id: &str) -> bool {
        self.inner
            .boats
            .get_mut(boat_id)
            .and_then(|mut entry| entry.pairings.remove(viewer_id))
            .is_some()
    }

    /// Check `offer_version` against the boat's current offer and hand the
    /// answer to the boat's connection.
    pub fn forward_answer(
        &self,
        boat_id: &str,
        viewer_id: &str,
        sdp: String,
        offer_version: u64,
    ) -> Result<(), SignalError> {
        let mut entry = self
            .inner
            .boats
            .get_mut(boat_id)
            .ok_or_else(|| SignalError::BoatNotFound(boat_id.to_string()))?;

        if entry.current_offer.is_none() || entry.offer_version != offer_version {
            counter!("harbor_stale_answers_total", 1);
            return Err(SignalError::StaleOffer {
                boat_id: boat_id.to_string(),
                submitted: offer_version,
                current: entry.offer_version,
            });
        }

        let entry = &mut *entry;
        let Some(pairing) = entry.pairings.get_mut(viewer_id) else {
            return Err(SignalError::UnexpectedMessage(format!(
                "no offer from boat {boat_id} was requested by this viewer"
            )));
        };

        let delivered = entry.connection.send(ServerMessage::Answer {
            viewer_id: viewer_id.to_string(),
            sdp,
            offer_version,
        });
        if !delivered {
            return Err(SignalError::BoatDisconnected(boat_id.to_string()));
        }
        pairing.state = PairingState::Answered {
            version: offer_version,
        };
        counter!("harbor_answers_forwarded_total", 1);
        Ok(())
    }

    /// Deliver `message` to the boat's connection and return that
    /// connection's id.
    pub fn send_to_boat(&self, boat_id: &str, message: ServerMessage) -> Result<Uuid, SignalError> {
        let entry = self
            .inner
            .boats
            .get(boat_id)
            .ok_or_else(|| SignalError::BoatNotFound(boat_id.to_string()))?;
        if entry.connection.send(message) {
            Ok(entry.connection.id())
        } else {
            Err(SignalError::BoatDisconnected(boat_id.to_string()))
        }
    }

    /// Id of the connection that currently owns `boat_id`.
    pub fn boat_connection(&self, boat_id: &str) -> Option<Uuid> {
        self.inner.boats.get(boat_id).map(|entry| entry.connection.id())
    }

    /// Idempotent removal of `boat_id`, whichever connection owns it.
    pub fn remove(&self, boat_id: &str) -> Option<Removal> {
        self.remove_entry(boat_id, None)
    }

    /// Remove `boat_id` only if `connection_id` still owns it, so an evicted
    /// connection cannot tear down its replacement.
    pub fn remove_owned(&self, boat_id: &str, connection_id: Uuid) -> Option<Removal> {
        self.remove_entry(boat_id, Some(connection_id))
    }

    fn remove_entry(&self, boat_id: &str, owner: Option<Uuid>) -> Option<Removal> {
        let (_, removed) = self
            .inner
            .boats
            .remove_if(boat_id, |_, entry| entry.owned_by(owner))?;

        let mut summary = removed.summary();
        summary.state = BoatState::Closed;
        let notified = notify_disconnected(removed);

        gauge!("harbor_boats_registered", self.len() as f64);
        info!(boat_id = %boat_id, notified, "unregistered boat");
        Some(Removal { summary, notified })
    }

    /// Consistent snapshot of registered boats, sorted by id.
    pub fn list_boats(&self) -> Vec<BoatSummary> {
        let mut boats: Vec<BoatSummary> = self
            .inner
            .boats
            .iter()
            .map(|entry| entry.summary())
            .collect();
        boats.sort_by(|a, b| a.boat_id.cmp(&b.boat_id));
        boats
    }

    pub fn pairing_state(&self, boat_id: &str, viewer_id: &str) -> Option<PairingState> {
        let entry = self.inner.boats.get(boat_id)?;
        entry.pairings.get(viewer_id).map(|pairing| pairing.state)
    }

    pub fn boat_state(&self, boat_id: &str) -> Option<BoatState> {
        self.inner.boats.get(boat_id).map(|entry| entry.state)
    }

    pub fn contains(&self, boat_id: &str) -> bool {
        self.inner.boats.contains_key(boat_id)
    }

    pub fn len(&self) -> usize {
        self.inner.boats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.boats.is_empty()
    }
}

fn snapshot_offer(entry: &BoatEntry) -> Result<OfferSnapshot, SignalError> {
    match (&entry.state, &entry.current_offer) {
        (BoatState::OfferReady, Some(sdp)) => Ok(OfferSnapshot {
            boat_id: entry.boat_id.clone(),
            sdp: sdp.clone(),
            offer_version: entry.offer_version,
        }),
        _ => Err(SignalError::OfferNotReady(entry.boat_id.clone())),
    }
}

/// Tell every viewer paired with a departing entry, once each.
fn notify_disconnected(entry: BoatEntry) -> usize {
    let mut notified = 0usize;
    for (viewer_id, pairing) in entry.pairings {
        if pairing.viewer.send(ServerMessage::BoatDisconnected {
            boat_id: entry.boat_id.clone(),
        }) {
            notified += 1;
        } else {
            debug!(viewer_id = %viewer_id, "viewer already gone");
        }
    }
    if notified > 0 {
        counter!("harbor_boat_disconnected_notifications_total", notified as u64);
    }
    notified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn caps() -> Capabilities {
        Capabilities {
            width: 160,
            height: 120,
            fps: 30,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test_timeout::timeout]
    fn set_then_get_returns_same_blob_with_increasing_versions() {
        let registry = SessionRegistry::new();
        let (boat, _rx) = ConnectionHandle::channel();
        registry.register("boat-1", caps(), boat);

        assert_eq!(
            registry.get_offer("boat-1"),
            Err(SignalError::OfferNotReady("boat-1".into()))
        );

        let v1 = registry.set_offer("boat-1", "SDP-A".into()).unwrap();
        let offer = registry.get_offer("boat-1").unwrap();
        assert_eq!((offer.sdp.as_str(), offer.offer_version), ("SDP-A", 1));
        assert_eq!(v1, 1);

        let v2 = registry.set_offer("boat-1", "SDP-B".into()).unwrap();
        let offer = registry.get_offer("boat-1").unwrap();
        assert_eq!((offer.sdp.as_str(), offer.offer_version), ("SDP-B", 2));
        assert!(v2 > v1);
    }

    #[test_timeout::timeout]
    fn set_offer_on_unknown_boat_fails() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.set_offer("ghost", "SDP".into()),
            Err(SignalError::UnknownBoat("ghost".into()))
        );
        assert_eq!(
            registry.get_offer("ghost"),
            Err(SignalError::BoatNotFound("ghost".into()))
        );
    }

    #[test_timeout::timeout]
    fn versions_keep_increasing_across_reregistration() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = ConnectionHandle::channel();
        registry.register("boat-1", caps(), first);
        registry.set_offer("boat-1", "A".into()).unwrap();
        registry.set_offer("boat-1", "B".into()).unwrap();
        registry.remove("boat-1");

        let (second, _rx2) = ConnectionHandle::channel();
        registry.register("boat-1", caps(), second);
        assert_eq!(registry.set_offer("boat-1", "C".into()).unwrap(), 3);
    }

    #[test_timeout::timeout]
    fn removed_boats_leave_no_slots_behind() {
        let registry = SessionRegistry::new();
        let mut last_version = 0;
        for n in 0..1000 {
            let boat_id = format!("boat-{n}");
            let (conn, _rx) = ConnectionHandle::channel();
            registry.register(&boat_id, caps(), conn);
            let version = registry.set_offer(&boat_id, "SDP".into()).unwrap();
            assert!(version > last_version);
            last_version = version;
            assert!(registry.remove(&boat_id).is_some());
        }
        assert!(registry.is_empty());
        assert_eq!(registry.inner.boats.len(), 0);
    }

    #[test_timeout::timeout]
    fn duplicate_registration_evicts_old_connection() {
        let registry = SessionRegistry::new();
        let (old, mut old_rx) = ConnectionHandle::channel();
        let old_id = old.id();
        let (new, _new_rx) = ConnectionHandle::channel();

        assert!(!registry.register("boat-1", caps(), old).replaced);
        assert!(registry.register("boat-1", caps(), new).replaced);
        assert_eq!(registry.len(), 1);
        assert_eq!(drain(&mut old_rx), vec![Outbound::Close(CloseReason::Replaced)]);

        // The evicted connection's cleanup must not remove the replacement.
        assert!(registry.remove_owned("boat-1", old_id).is_none());
        assert!(registry.contains("boat-1"));
    }

    #[test_timeout::timeout]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (boat, _rx) = ConnectionHandle::channel();
        registry.register("boat-1", caps(), boat);

        let removal = registry.remove("boat-1").unwrap();
        assert_eq!(removal.summary.state, BoatState::Closed);
        assert!(registry.remove("boat-1").is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn removal_notifies_each_paired_viewer_once() {
        let registry = SessionRegistry::new();
        let (boat, _boat_rx) = ConnectionHandle::channel();
        registry.register("boat-1", caps(), boat);
        registry.set_offer("boat-1", "SDP".into()).unwrap();

        let mut receivers = Vec::new();
        for n in 0..4 {
            let (viewer, rx) = ConnectionHandle::channel();
            registry
                .attach_viewer("boat-1", &format!("viewer-{n}"), viewer)
                .unwrap();
            receivers.push(rx);
        }

        let removal = registry.remove("boat-1").unwrap();
        assert_eq!(removal.notified, 4);
        for mut rx in receivers {
            assert_eq!(
                drain(&mut rx),
                vec![Outbound::Message(ServerMessage::BoatDisconnected {
                    boat_id: "boat-1".into()
                })]
            );
        }
    }

    #[test_timeout::timeout]
    fn withdrawn_offer_is_not_ready_and_rejects_answers() {
        let registry = SessionRegistry::new();
        let (boat, _rx) = ConnectionHandle::channel();
        let boat_conn = boat.id();
        registry.register("boat-1", caps(), boat);
        registry.set_offer("boat-1", "SDP".into()).unwrap();
        let (viewer, _vrx) = ConnectionHandle::channel();
        registry.attach_viewer("boat-1", "v", viewer).unwrap();

        registry.withdraw_offer("boat-1", boat_conn).unwrap();
        assert_eq!(registry.boat_state("boat-1"), Some(BoatState::OfferPending));
        assert_eq!(
            registry.get_offer("boat-1"),
            Err(SignalError::OfferNotReady("boat-1".into()))
        );
        assert!(matches!(
            registry.forward_answer("boat-1", "v", "ANS".into(), 1),
            Err(SignalError::StaleOffer { .. })
        ));
    }

    #[test_timeout::timeout]
    fn renegotiation_reports_pushed_viewers() {
        let registry = SessionRegistry::new();
        let (boat, _rx) = ConnectionHandle::channel();
        let boat_conn = boat.id();
        registry.register("boat-1", caps(), boat);
        registry.set_offer("boat-1", "SDP-A".into()).unwrap();
        let (viewer, _vrx) = ConnectionHandle::channel();
        registry.attach_viewer("boat-1", "v", viewer).unwrap();
        registry
            .forward_answer("boat-1", "v", "ANS".into(), 1)
            .unwrap();

        let stored = registry
            .set_offer_from("boat-1", boat_conn, "SDP-B".into())
            .unwrap();
        assert_eq!(stored.offer_version, 2);
        assert_eq!(stored.renegotiated, vec!["v".to_string()]);
        assert_eq!(
            registry.pairing_state("boat-1", "v"),
            Some(PairingState::OfferSent { version: 2 })
        );
    }

    #[test_timeout::timeout]
    fn send_to_boat_reports_missing_and_closed_boats() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.send_to_boat("ghost", ServerMessage::Boats { boats: vec![] }),
            Err(SignalError::BoatNotFound("ghost".into()))
        );

        let (boat, rx) = ConnectionHandle::channel();
        let boat_conn = boat.id();
        registry.register("boat-1", caps(), boat);
        assert_eq!(
            registry.send_to_boat("boat-1", ServerMessage::Boats { boats: vec![] }),
            Ok(boat_conn)
        );
        drop(rx);
        assert_eq!(
            registry.send_to_boat("boat-1", ServerMessage::Boats { boats: vec![] }),
            Err(SignalError::BoatDisconnected("boat-1".into()))
        );
    }

    #[test_timeout::timeout]
    fn list_boats_is_sorted_and_excludes_removed() {
        let registry = SessionRegistry::new();
        for id in ["charlie", "alpha", "bravo"] {
            let (conn, _rx) = ConnectionHandle::channel();
            registry.register(id, caps(), conn);
        }
        registry.remove("bravo");
        let ids: Vec<String> = registry
            .list_boats()
            .into_iter()
            .map(|boat| boat.boat_id)
            .collect();
        assert_eq!(ids, vec!["alpha".to_string(), "charlie".to_string()]);
    }
}
