//! Typed session event bus.
//!
//! Listeners are kept per [`EventKind`] in insertion order. Dispatch works on
//! a snapshot, so a listener may subscribe or unsubscribe (itself or others)
//! while an event is being delivered.

use crate::media::{LocalStream, RemoteTrack};
use crate::peer::types::{ChannelData, ConnectionState, DataSource, Description, IceCandidate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnected,
    Status,
    Signal,
    IceCandidates,
    StreamLocal,
    StreamRemote,
    ChannelOpen,
    ChannelClosed,
    ChannelError,
    ChannelData,
    Error,
}

/// A fault reported through the `error` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFault {
    pub operation: String,
    pub message: String,
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.operation, self.message)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connecting,
    Connected,
    Disconnected,
    Status(ConnectionState),
    /// Local description to relay to the remote side
    Signal(Description),
    /// Batch of local candidates to relay to the remote side
    IceCandidates(Vec<IceCandidate>),
    StreamLocal(LocalStream),
    StreamRemote(RemoteTrack),
    ChannelOpen {
        label: String,
    },
    ChannelClosed {
        label: String,
    },
    ChannelError {
        label: String,
        message: String,
    },
    ChannelData {
        label: String,
        data: ChannelData,
        source: DataSource,
    },
    Error(SessionFault),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Connecting => EventKind::Connecting,
            SessionEvent::Connected => EventKind::Connected,
            SessionEvent::Disconnected => EventKind::Disconnected,
            SessionEvent::Status(_) => EventKind::Status,
            SessionEvent::Signal(_) => EventKind::Signal,
            SessionEvent::IceCandidates(_) => EventKind::IceCandidates,
            SessionEvent::StreamLocal(_) => EventKind::StreamLocal,
            SessionEvent::StreamRemote(_) => EventKind::StreamRemote,
            SessionEvent::ChannelOpen { .. } => EventKind::ChannelOpen,
            SessionEvent::ChannelClosed { .. } => EventKind::ChannelClosed,
            SessionEvent::ChannelError { .. } => EventKind::ChannelError,
            SessionEvent::ChannelData { .. } => EventKind::ChannelData,
            SessionEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    any: Mutex<Vec<(ListenerId, Listener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to one kind of event
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.allocate();
        self.by_kind
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Subscribe to every event
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.allocate();
        self.any.lock().push((id, Arc::new(listener)));
        id
    }

    /// Forward every event into an unbounded channel
    pub fn listen(&self) -> (ListenerId, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on_any(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut by_kind = self.by_kind.lock();
        for listeners in by_kind.values_mut() {
            if let Some(pos) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(pos);
                return true;
            }
        }
        drop(by_kind);

        let mut any = self.any.lock();
        match any.iter().position(|(lid, _)| *lid == id) {
            Some(pos) => {
                any.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Deliver `event`; returns false when nobody listens
    pub fn emit(&self, event: SessionEvent) -> bool {
        let snapshot: Vec<Listener> = {
            let by_kind = self.by_kind.lock();
            let any = self.any.lock();
            by_kind
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(any.iter())
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };
        if snapshot.is_empty() {
            return false;
        }
        for listener in snapshot {
            listener(&event);
        }
        true
    }
}
