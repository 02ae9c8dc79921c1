// §4.5 SubscriptionRegistry half of the facade: id allocation and the
// id -> sink table. Owned by a `StreamConnection`; ids are unique and never
// reused for the lifetime of one socket (spec §3 invariant).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// One decoded message routed to a subscription's sink, or a terminal
/// outcome.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Answer(serde_json::Value),
    Delta(serde_json::Value),
    /// The broker sent an `E` frame; carries the extracted error message.
    Error(String),
    /// The broker sent a `C` frame.
    Complete,
    /// The heartbeat supervisor declared the connection dead.
    ConnectionDead,
}

pub type SubscriptionSink = mpsc::UnboundedSender<SubscriptionEvent>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<u64, SubscriptionSink>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next id. Monotonically increasing, starting at 1.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, id: u64, sink: SubscriptionSink) {
        self.sinks.lock().expect("registry mutex poisoned").insert(id, sink);
    }

    /// Remove the sink for `id`. Safe on unknown ids (spec: `unsubscribe` is
    /// safe on unknown ids).
    pub fn deregister(&self, id: u64) -> Option<SubscriptionSink> {
        self.sinks.lock().expect("registry mutex poisoned").remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sinks.lock().expect("registry mutex poisoned").contains_key(&id)
    }

    /// Route a decoded event to `id`'s sink. Frames referencing unknown ids
    /// (teardown races) are dropped with a debug log, per §4.4.
    pub fn dispatch(&self, id: u64, event: SubscriptionEvent) {
        let sink = self.sinks.lock().expect("registry mutex poisoned").get(&id).cloned();
        match sink {
            Some(sink) => {
                // Receiver may have already dropped (caller tore down the
                // subscription but the registry entry hasn't been removed
                // yet); that's a normal race, not an error.
                let _ = sink.send(event);
            }
            None => {
                tracing::debug!(id, "dropping frame for unknown subscription id");
            }
        }
    }

    /// Fail every live subscription with [`SubscriptionEvent::ConnectionDead`]
    /// and clear the table. Called once by the heartbeat supervisor when it
    /// declares the connection dead.
    pub fn fail_all(&self) {
        let mut sinks = self.sinks.lock().expect("registry mutex poisoned");
        for (id, sink) in sinks.drain() {
            let _ = sink.send(SubscriptionEvent::ConnectionDead);
            tracing::debug!(id, "failed subscription: connection dead");
        }
    }

    pub fn active_count(&self) -> usize {
        self.sinks.lock().expect("registry mutex poisoned").len()
    }
}
