use harbor_proto::{CloseReason, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Work queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Send a `closing` notice and a close frame, then stop writing.
    Close(CloseReason),
}

/// The narrow "send to this connection" capability.
///
/// The socket itself stays with the task that accepted it; the registry and
/// broker only ever hold clones of this handle.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message. Returns false once the writer has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send(Outbound::Close(reason)).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
