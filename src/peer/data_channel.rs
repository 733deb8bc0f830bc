//! Channel registry and channel event bridging

use crate::events::SessionEvent;
use crate::peer::state::SessionInner;
use crate::peer::types::{ChannelData, ChannelOptions, ChannelState, DataSource};
use crate::transport::{ChannelEvent, ChannelId, DataChannel, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ActiveChannel {
    handle: Arc<dyn DataChannel>,
    announced: bool,
}

/// Channels by label.
///
/// A label is in at most one of three places: pending (requested, not yet
/// created), creating (transport call in flight) or active.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, ActiveChannel>,
    pending: HashMap<String, ChannelOptions>,
    creating: HashSet<String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `label` for creation. Returns false if it already exists or is being created.
    pub fn request(&mut self, label: &str, options: ChannelOptions) -> bool {
        if self.channels.contains_key(label) || self.creating.contains(label) {
            return false;
        }
        self.pending.insert(label.to_owned(), options);
        true
    }

    /// Move every pending label to creating
    pub fn take_pending(&mut self) -> Vec<(String, ChannelOptions)> {
        let pending: Vec<_> = self.pending.drain().collect();
        self.creating
            .extend(pending.iter().map(|(label, _)| label.clone()));
        pending
    }

    pub fn activate(&mut self, label: &str, handle: Arc<dyn DataChannel>) {
        self.creating.remove(label);
        self.channels.insert(
            label.to_owned(),
            ActiveChannel {
                handle,
                announced: false,
            },
        );
    }

    /// Creation failed; forget the label
    pub fn abandon(&mut self, label: &str) {
        self.creating.remove(label);
    }

    /// Register a channel opened by the remote side.
    /// A pending request for the same label is satisfied by it.
    pub fn insert_inbound(&mut self, label: &str, handle: Arc<dyn DataChannel>) -> bool {
        if self.channels.contains_key(label) || self.creating.contains(label) {
            return false;
        }
        self.pending.remove(label);
        self.channels.insert(
            label.to_owned(),
            ActiveChannel {
                handle,
                announced: false,
            },
        );
        true
    }

    /// True the first time an open channel is reported
    pub fn mark_open(&mut self, label: &str) -> bool {
        match self.channels.get_mut(label) {
            Some(ch) if !ch.announced => {
                ch.announced = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels.get(label).map(|ch| Arc::clone(&ch.handle))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.channels.contains_key(label)
    }

    /// True if `label` is registered with exactly this handle
    pub fn owns(&self, label: &str, id: ChannelId) -> bool {
        self.channels
            .get(label)
            .is_some_and(|ch| ch.handle.id() == id)
    }

    pub fn is_pending(&self, label: &str) -> bool {
        self.pending.contains_key(label)
    }

    pub fn remove(&mut self, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels.remove(label).map(|ch| ch.handle)
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.channels.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.pending.clear();
        self.creating.clear();
    }
}

/// Request a channel; it is created right away when the session is active
pub(crate) async fn request_channel(
    inner: &Arc<SessionInner>,
    label: &str,
    options: ChannelOptions,
) -> bool {
    let (transport, generation, active) = {
        let mut st = inner.state.lock();
        let Some(transport) = st.transport.clone() else {
            drop(st);
            inner.usage_fault("add_channel", format!("session is closed, channel '{label}' not created"));
            return false;
        };
        if !st.registry.request(label, options) {
            debug!("Channel '{}' already exists", label);
            return false;
        }
        (transport, st.generation, st.active)
    };

    if active {
        materialize_pending(inner, &transport, generation).await;
    } else {
        debug!("Channel '{}' deferred until negotiation", label);
    }
    true
}

/// Create every pending channel on `transport`
pub(crate) async fn materialize_pending(
    inner: &Arc<SessionInner>,
    transport: &Arc<dyn Transport>,
    generation: u64,
) {
    let pending = {
        let mut st = inner.state.lock();
        if st.generation != generation {
            return;
        }
        st.registry.take_pending()
    };

    for (label, options) in pending {
        match transport.create_channel(&label, &options).await {
            Ok(handle) => {
                let announce = {
                    let mut st = inner.state.lock();
                    if st.generation != generation {
                        return;
                    }
                    let open = handle.ready_state() == ChannelState::Open;
                    st.registry.activate(&label, handle);
                    open && st.registry.mark_open(&label)
                };
                info!("Data channel '{}' created", label);
                if announce {
                    inner.emit(SessionEvent::ChannelOpen { label });
                }
            }
            Err(e) => {
                inner.state.lock().registry.abandon(&label);
                inner.fault("create_channel", e);
            }
        }
    }
}

pub(crate) fn on_inbound_channel(
    inner: &Arc<SessionInner>,
    generation: u64,
    handle: Arc<dyn DataChannel>,
) {
    let label = handle.label().to_owned();
    if !inner.config.enable_data_channels {
        debug!("Data channels disabled, ignoring remote channel '{}'", label);
        return;
    }

    let announce = {
        let mut st = inner.state.lock();
        if st.generation != generation {
            return;
        }
        let open = handle.ready_state() == ChannelState::Open;
        if !st.registry.insert_inbound(&label, handle) {
            debug!("Remote channel '{}' already registered", label);
            return;
        }
        open && st.registry.mark_open(&label)
    };
    info!("Remote data channel '{}' registered", label);
    if announce {
        inner.emit(SessionEvent::ChannelOpen { label });
    }
}

/// Surface a channel event. Events of handles that are not registered,
/// such as a remote channel shadowed by a local one, are dropped.
pub(crate) fn on_channel_event(
    inner: &Arc<SessionInner>,
    id: ChannelId,
    label: String,
    event: ChannelEvent,
) {
    let event = {
        let mut st = inner.state.lock();
        if !st.registry.owns(&label, id) {
            debug!(channel = id.0, "Event of unregistered channel '{}' dropped", label);
            return;
        }
        match event {
            ChannelEvent::Open => st
                .registry
                .mark_open(&label)
                .then(|| SessionEvent::ChannelOpen { label }),
            ChannelEvent::Close => st
                .registry
                .remove(&label)
                .map(|_| SessionEvent::ChannelClosed { label }),
            ChannelEvent::Error(message) => {
                warn!("Data channel '{}' error: {}", label, message);
                Some(SessionEvent::ChannelError { label, message })
            }
            ChannelEvent::Message(data) => Some(SessionEvent::ChannelData {
                label,
                data,
                source: DataSource::Incoming,
            }),
        }
    };
    if let Some(event) = event {
        inner.emit(event);
    }
}

/// Send on an open channel. Returns false without side effects otherwise.
pub(crate) async fn send_data(inner: &Arc<SessionInner>, label: &str, data: ChannelData) -> bool {
    if data.is_empty() {
        return false;
    }
    let Some(channel) = inner.state.lock().registry.get(label) else {
        debug!("No channel '{}' to send on", label);
        return false;
    };
    if channel.ready_state() != ChannelState::Open {
        debug!("Channel '{}' is not open", label);
        return false;
    }

    match channel.send(&data).await {
        Ok(()) => {
            inner.emit(SessionEvent::ChannelData {
                label: label.to_owned(),
                data,
                source: DataSource::Outgoing,
            });
            true
        }
        Err(e) => {
            inner.fault("send", e);
            false
        }
    }
}
