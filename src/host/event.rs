//! Event system - broadcaster/listener primitives.
//!
//! Mirrors the usual debugger event model: a process owns a broadcaster,
//! listeners attach to it and wait for events with a bounded timeout so
//! consumers stay cancellable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use super::types::ProcessState;

static NEXT_BROADCASTER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a broadcaster, used to test event provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BroadcasterId(u64);

/// Event payload delivered to listeners
#[derive(Debug, Clone)]
pub enum EventKind {
    /// The process transitioned to a new lifecycle state
    StateChanged(ProcessState),
    /// Process stdout/stderr data
    Output(String),
}

/// An event with its originating broadcaster
#[derive(Debug, Clone)]
pub struct Event {
    broadcaster: BroadcasterId,
    kind: EventKind,
}

impl Event {
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Test whether this event came from the given broadcaster
    pub fn broadcaster_matches(&self, broadcaster: &Broadcaster) -> bool {
        self.broadcaster == broadcaster.id()
    }

    /// Extract the new process state from a state-changed event
    pub fn state_from_event(&self) -> Option<ProcessState> {
        match self.kind {
            EventKind::StateChanged(state) => Some(state),
            _ => None,
        }
    }
}

/// Event source owned by a process. Fans events out to every attached
/// listener; delivery order per listener matches broadcast order.
pub struct Broadcaster {
    id: BroadcasterId,
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            id: BroadcasterId(NEXT_BROADCASTER_ID.fetch_add(1, Ordering::Relaxed)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> BroadcasterId {
        self.id
    }

    /// Attach a listener to this broadcaster
    pub fn add_listener(&self, handle: &ListenerHandle) {
        self.subscribers.lock().unwrap().push(handle.tx.clone());
    }

    /// Broadcast an event to all attached listeners, dropping the ones
    /// whose receiving end is gone.
    pub fn broadcast(&self, kind: EventKind) {
        let event = Event {
            broadcaster: self.id,
            kind,
        };
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending side of a listener, handed to broadcasters at attach time
#[derive(Clone)]
pub struct ListenerHandle {
    tx: Sender<Event>,
}

/// Event sink with bounded waits. Owned by a single consumer.
pub struct Listener {
    name: String,
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl Listener {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            name: name.to_string(),
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle used to attach this listener to a broadcaster
    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Wait up to `timeout` for the next event. Returns None on timeout.
    pub fn wait_for_event(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }
}
