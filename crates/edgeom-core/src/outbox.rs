// ── Upstream queues ──
//
// Components that report to the manager (alarms, events, routed replies)
// push envelopes here without knowing whether a session is up. The task
// group of the live attempt drains them; frames queued while disconnected
// wait for the next session, up to the queue bound.

use edgeom_api::Envelope;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

/// A bounded multi-producer queue with a single shared consumer slot.
#[derive(Debug)]
pub struct Outbox {
    name: &'static str,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

impl Outbox {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `envelope`; dropped with a warning when the queue is full.
    pub fn push(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(queue = self.name, resource = %dropped.route.resource, "outbox full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Next queued envelope. Only one drain runs at a time; a second
    /// caller waits for the first to release the slot.
    pub async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }

    /// Put back an envelope whose send failed, if there is room.
    pub fn requeue(&self, envelope: Envelope) {
        let _ = self.tx.try_send(envelope);
    }
}

/// The three upstream queues drained by every live connection.
#[derive(Debug)]
pub struct Outboxes {
    pub alarms: Outbox,
    pub events: Outbox,
    /// Messages other local components route to the manager.
    pub route: Outbox,
}

impl Outboxes {
    pub fn new(capacity: usize) -> Self {
        Self {
            alarms: Outbox::new("alarm", capacity),
            events: Outbox::new("event", capacity),
            route: Outbox::new("route", capacity),
        }
    }
}

impl Default for Outboxes {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
