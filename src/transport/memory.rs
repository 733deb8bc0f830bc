//! In-process transport.
//!
//! Descriptions are plain text listing the channels (`a=x-channel:`) and
//! tracks (`a=x-track:`) a side carries. Once both descriptions are applied
//! and signaling is stable the transport "connects": local channels open,
//! remote channels and tracks surface as inbound. Gathering yields two host
//! candidates and an end-of-gathering marker shortly after the first local
//! description.

use super::{
    CandidatePairStats, ChannelEvent, ChannelId, DataChannel, SenderId, SenderInfo, Transport,
    TransportEvent, TransportEvents, TransportFactory, TransportStats,
};
use crate::config::SessionConfig;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::peer::types::{
    AnswerOptions, ChannelData, ChannelOptions, ChannelState, ConnectionState, Description,
    IceCandidate, OfferOptions, SdpType, SignalingState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const GATHER_DELAY: Duration = Duration::from_millis(10);
const CHANNEL_LINE: &str = "a=x-channel:";
const TRACK_LINE: &str = "a=x-track:";

/// Hands out [`MemoryTransport`]s and remembers every one it created
#[derive(Default)]
pub struct MemoryTransportFactory {
    created: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of transports created so far
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// The most recently created transport
    pub fn last(&self) -> Option<Arc<MemoryTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(
        &self,
        _config: &SessionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>> {
        let transport = Arc::new(MemoryTransport::new(events));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

struct MemorySender {
    track: LocalTrack,
    stream_id: String,
}

#[derive(Default)]
struct MemoryState {
    signaling: Option<SignalingState>,
    connection: Option<ConnectionState>,
    local: Option<Description>,
    remote: Option<Description>,
    stable_local: Option<Description>,
    stable_remote: Option<Description>,
    version: u64,
    negotiation_dirty: bool,
    gathered: bool,
    data_negotiated: bool,
    channels: Vec<Arc<MemoryChannel>>,
    created_labels: Vec<String>,
    senders: BTreeMap<SenderId, MemorySender>,
    next_sender: u64,
    enabled: HashMap<String, bool>,
    remote_candidates: Vec<IceCandidate>,
    surfaced_channels: HashSet<String>,
    surfaced_tracks: HashSet<String>,
    failures: HashSet<&'static str>,
    local_delay: Duration,
    remote_delay: Duration,
    closed: bool,
}

impl MemoryState {
    fn signaling(&self) -> SignalingState {
        self.signaling.unwrap_or(SignalingState::Stable)
    }

    fn connection(&self) -> ConnectionState {
        self.connection.unwrap_or(ConnectionState::New)
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(Error::transport(operation, "transport is closed"));
        }
        if self.failures.contains(operation) {
            return Err(Error::transport(operation, "injected failure"));
        }
        Ok(())
    }

    fn render(&mut self, kind: SdpType) -> Description {
        self.version += 1;
        let mut sdp = format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.version);
        for channel in &self.channels {
            sdp.push_str(&format!("{CHANNEL_LINE}{}\r\n", channel.label));
        }
        for sender in self.senders.values() {
            let kind = match sender.track.kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            sdp.push_str(&format!(
                "{TRACK_LINE}{kind}:{}:{}\r\n",
                sender.track.id, sender.stream_id
            ));
        }
        Description { kind, sdp }
    }

    /// Record a change the remote side has not seen yet
    fn mark_dirty(&mut self, out: &mut Vec<TransportEvent>) {
        self.negotiation_dirty = true;
        if self.signaling() == SignalingState::Stable {
            out.push(TransportEvent::NegotiationNeeded);
        }
    }

    fn set_signaling(&mut self, state: SignalingState, out: &mut Vec<TransportEvent>) {
        if self.signaling() != state {
            self.signaling = Some(state);
            out.push(TransportEvent::SignalingStateChanged(state));
        }
        if state == SignalingState::Stable {
            self.stable_local = self.local.clone();
            self.stable_remote = self.remote.clone();
        }
    }

    fn set_connection(&mut self, state: ConnectionState, out: &mut Vec<TransportEvent>) {
        if self.connection() != state {
            self.connection = Some(state);
            out.push(TransportEvent::ConnectionStateChanged(state));
        }
    }

    fn on_stable(&mut self, events: &TransportEvents, out: &mut Vec<TransportEvent>) {
        let (Some(local), Some(remote)) = (self.local.clone(), self.remote.clone()) else {
            return;
        };
        if self.connection() == ConnectionState::New {
            self.set_connection(ConnectionState::Checking, out);
            self.set_connection(ConnectionState::Connected, out);
        }
        if !matches!(
            self.connection(),
            ConnectionState::Connected | ConnectionState::Completed
        ) {
            return;
        }

        let remote_labels: Vec<String> = parse_channels(&remote.sdp);
        self.data_negotiated |= !remote_labels.is_empty() || !parse_channels(&local.sdp).is_empty();

        if self.data_negotiated {
            for channel in &self.channels {
                if channel.ready_state() == ChannelState::Connecting {
                    channel.set_state(ChannelState::Open);
                    out.push(TransportEvent::Channel {
                        id: channel.id,
                        label: channel.label.clone(),
                        event: ChannelEvent::Open,
                    });
                }
            }
        }

        for label in remote_labels {
            let known = self.channels.iter().any(|c| c.label == label);
            if known || !self.surfaced_channels.insert(label.clone()) {
                continue;
            }
            let channel = Arc::new(MemoryChannel::new(&label, events.clone()));
            channel.set_state(ChannelState::Open);
            self.channels.push(Arc::clone(&channel));
            let id = channel.id;
            out.push(TransportEvent::ChannelReceived(channel));
            out.push(TransportEvent::Channel {
                id,
                label,
                event: ChannelEvent::Open,
            });
        }

        for track in parse_tracks(&remote.sdp) {
            if self.surfaced_tracks.insert(track.id.clone()) {
                out.push(TransportEvent::TrackReceived(track));
            }
        }

        if self.negotiation_dirty {
            out.push(TransportEvent::NegotiationNeeded);
        }
    }
}

/// Transport double that negotiates with another instance through real
/// session signaling, without any network
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    events: TransportEvents,
}

impl MemoryTransport {
    pub fn new(events: TransportEvents) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_sender: 1,
                ..Default::default()
            })),
            events,
        }
    }

    fn dispatch(&self, out: Vec<TransportEvent>) {
        for event in out {
            self.events.emit(event);
        }
    }

    fn start_gathering(&self) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GATHER_DELAY).await;
            for port in [50000u16, 50001] {
                if state.lock().closed {
                    return;
                }
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{port} 1 udp 2122260223 127.0.0.1 {port} typ host"
                ));
                candidate.username_fragment = Some("mem".into());
                events.emit(TransportEvent::CandidateDiscovered(Some(candidate)));
            }
            if !state.lock().closed {
                events.emit(TransportEvent::CandidateDiscovered(None));
            }
        });
    }

    /// Make `operation` fail until the transport is dropped
    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().failures.insert(operation);
    }

    /// Force an ICE connection state, as if reported by the network
    pub fn set_connection_state(&self, state: ConnectionState) {
        let mut out = Vec::new();
        self.state.lock().set_connection(state, &mut out);
        self.dispatch(out);
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    /// Labels of every locally created channel, duplicates included
    pub fn created_channels(&self) -> Vec<String> {
        self.state.lock().created_labels.clone()
    }

    /// Simulate a message from the remote side on `label`
    pub fn deliver_message(&self, label: &str, data: ChannelData) {
        if let Some(channel) = self.channel(label) {
            channel.raise(ChannelEvent::Message(data));
        }
    }

    /// Simulate the remote side closing `label`
    pub fn close_channel(&self, label: &str) {
        if let Some(channel) = self.channel(label) {
            channel.set_state(ChannelState::Closed);
            channel.raise(ChannelEvent::Close);
        }
    }

    /// Simulate an SCTP error on `label`
    pub fn channel_error(&self, label: &str, message: &str) {
        if let Some(channel) = self.channel(label) {
            channel.raise(ChannelEvent::Error(message.to_owned()));
        }
    }

    /// Surface an open inbound channel named `label`, even if a local
    /// channel already uses that label
    pub fn open_remote_channel(&self, label: &str) -> Arc<MemoryChannel> {
        let channel = Arc::new(MemoryChannel::new(label, self.events.clone()));
        channel.set_state(ChannelState::Open);
        self.state.lock().channels.push(Arc::clone(&channel));
        self.events.emit(TransportEvent::ChannelReceived(
            Arc::clone(&channel) as Arc<dyn DataChannel>
        ));
        channel.raise(ChannelEvent::Open);
        channel
    }

    /// Report a local candidate as if gathering had found it
    pub fn discover_candidate(&self, candidate: IceCandidate) {
        self.events
            .emit(TransportEvent::CandidateDiscovered(Some(candidate)));
    }

    /// Undo [`fail_on`](Self::fail_on)
    pub fn recover(&self, operation: &'static str) {
        self.state.lock().failures.remove(operation);
    }

    /// Make applying descriptions take time, like a real peer connection
    pub fn delay_descriptions(&self, local: Duration, remote: Duration) {
        let mut state = self.state.lock();
        state.local_delay = local;
        state.remote_delay = remote;
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn track_enabled(&self, track_id: &str) -> Option<bool> {
        self.state.lock().enabled.get(track_id).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryTransport")
            .field("signaling", &state.signaling())
            .field("connection", &state.connection())
            .field("closed", &state.closed)
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling()
        }
    }

    fn connection_state(&self) -> ConnectionState {
        let state = self.state.lock();
        if state.closed {
            ConnectionState::Closed
        } else {
            state.connection()
        }
    }

    async fn create_offer(&self, _options: &OfferOptions) -> Result<Description> {
        let mut state = self.state.lock();
        state.check("create_offer")?;
        Ok(state.render(SdpType::Offer))
    }

    async fn create_answer(&self, _options: &AnswerOptions) -> Result<Description> {
        let mut state = self.state.lock();
        state.check("create_answer")?;
        if state.signaling() != SignalingState::HaveRemoteOffer {
            return Err(Error::InvalidState {
                operation: "create_answer",
                state: state.signaling(),
            });
        }
        Ok(state.render(SdpType::Answer))
    }

    async fn set_local_description(&self, description: Description) -> Result<()> {
        let delay = self.state.lock().local_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut out = Vec::new();
        let rollback = description.kind == SdpType::Rollback;
        let gather = {
            let mut state = self.state.lock();
            state.check("set_local_description")?;
            let current = state.signaling();
            match (description.kind, current) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.negotiation_dirty = false;
                    state.local = Some(description);
                    state.set_signaling(SignalingState::HaveLocalOffer, &mut out);
                }
                (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                    state.negotiation_dirty = false;
                    state.local = Some(description);
                    state.set_signaling(SignalingState::Stable, &mut out);
                    state.on_stable(&self.events, &mut out);
                }
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                    state.local = state.stable_local.clone();
                    state.set_signaling(SignalingState::Stable, &mut out);
                }
                (_, state_now) => {
                    return Err(Error::InvalidState {
                        operation: "set_local_description",
                        state: state_now,
                    });
                }
            }
            !rollback && !std::mem::replace(&mut state.gathered, true)
        };
        if gather {
            self.start_gathering();
        }
        self.dispatch(out);
        Ok(())
    }

    async fn set_remote_description(&self, description: Description) -> Result<()> {
        let delay = self.state.lock().remote_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            state.check("set_remote_description")?;
            let current = state.signaling();
            match (description.kind, current) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.remote = Some(description);
                    state.set_signaling(SignalingState::HaveRemoteOffer, &mut out);
                }
                (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                    state.remote = Some(description);
                    state.set_signaling(SignalingState::Stable, &mut out);
                    state.on_stable(&self.events, &mut out);
                }
                (SdpType::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.remote = state.stable_remote.clone();
                    state.set_signaling(SignalingState::Stable, &mut out);
                }
                (_, state_now) => {
                    return Err(Error::InvalidState {
                        operation: "set_remote_description",
                        state: state_now,
                    });
                }
            }
        }
        self.dispatch(out);
        Ok(())
    }

    async fn local_description(&self) -> Option<Description> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<Description> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        state.check("add_ice_candidate")?;
        if state.remote.is_none() {
            return Err(Error::transport(
                "add_ice_candidate",
                "remote description is not set",
            ));
        }
        trace!(candidate = %candidate.candidate, "Remote candidate accepted");
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            state.check("restart_ice")?;
            state.gathered = false;
            state.mark_dirty(&mut out);
        }
        self.dispatch(out);
        Ok(())
    }

    async fn create_channel(
        &self,
        label: &str,
        _options: &ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let mut out = Vec::new();
        let channel = {
            let mut state = self.state.lock();
            state.check("create_channel")?;
            let channel = Arc::new(MemoryChannel::new(label, self.events.clone()));
            let first = state.channels.is_empty();
            state.channels.push(Arc::clone(&channel));
            state.created_labels.push(label.to_owned());

            if first {
                state.mark_dirty(&mut out);
            } else if state.data_negotiated
                && matches!(
                    state.connection(),
                    ConnectionState::Connected | ConnectionState::Completed
                )
            {
                channel.set_state(ChannelState::Open);
                out.push(TransportEvent::Channel {
                    id: channel.id,
                    label: label.to_owned(),
                    event: ChannelEvent::Open,
                });
            }
            channel
        };
        debug!(label, "Memory channel created");
        self.dispatch(out);
        Ok(channel)
    }

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<SenderId> {
        let mut out = Vec::new();
        let id = {
            let mut state = self.state.lock();
            state.check("add_track")?;
            let id = SenderId(state.next_sender);
            state.next_sender += 1;
            state.senders.insert(
                id,
                MemorySender {
                    track: track.clone(),
                    stream_id: stream_id.to_owned(),
                },
            );
            state.enabled.insert(track.id.clone(), track.enabled);
            state.mark_dirty(&mut out);
            id
        };
        self.dispatch(out);
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            state.check("remove_track")?;
            let removed = state
                .senders
                .remove(&sender)
                .ok_or_else(|| Error::transport("remove_track", "unknown sender"))?;
            state.enabled.remove(&removed.track.id);
            state.mark_dirty(&mut out);
        }
        self.dispatch(out);
        Ok(())
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        state.check("replace_track")?;
        let slot = state
            .senders
            .get_mut(&sender)
            .ok_or_else(|| Error::transport("replace_track", "unknown sender"))?;
        let old = std::mem::replace(&mut slot.track, track.clone());
        state.enabled.remove(&old.id);
        state.enabled.insert(track.id.clone(), track.enabled);
        Ok(())
    }

    async fn set_track_enabled(&self, track_id: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.check("set_track_enabled")?;
        if let Some(flag) = state.enabled.get_mut(track_id) {
            *flag = enabled;
        }
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(id, s)| SenderInfo {
                id: *id,
                track_id: Some(s.track.id.clone()),
                kind: s.track.kind,
            })
            .collect()
    }

    async fn stats(&self) -> TransportStats {
        let state = self.state.lock();
        let connection = if state.closed {
            ConnectionState::Closed
        } else {
            state.connection()
        };
        let selected_pair = matches!(
            connection,
            ConnectionState::Connected | ConnectionState::Completed
        )
        .then(|| CandidatePairStats {
            local_candidate_id: "mem-local".into(),
            remote_candidate_id: "mem-remote".into(),
            state: "succeeded".into(),
            bytes_sent: state
                .channels
                .iter()
                .flat_map(|c| c.sent())
                .map(|data| data.len() as u64)
                .sum(),
            bytes_received: 0,
        });
        TransportStats {
            connection,
            selected_pair,
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        for channel in &state.channels {
            channel.set_state(ChannelState::Closed);
        }
        Ok(())
    }
}

fn parse_channels(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix(CHANNEL_LINE))
        .map(str::to_owned)
        .collect()
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix(TRACK_LINE))
        .filter_map(|rest| {
            let mut parts = rest.splitn(3, ':');
            let kind = match parts.next()? {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => return None,
            };
            Some(RemoteTrack {
                id: parts.next()?.to_owned(),
                stream_id: parts.next()?.to_owned(),
                kind,
            })
        })
        .collect()
}

/// Channel of a [`MemoryTransport`]; records what it sends
pub struct MemoryChannel {
    id: ChannelId,
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<ChannelData>>,
    events: TransportEvents,
}

impl MemoryChannel {
    fn new(label: &str, events: TransportEvents) -> Self {
        Self {
            id: ChannelId::next(),
            label: label.to_owned(),
            state: Mutex::new(ChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            events,
        }
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    fn raise(&self, event: ChannelEvent) {
        self.events.emit(TransportEvent::Channel {
            id: self.id,
            label: self.label.clone(),
            event,
        });
    }

    /// Payloads sent so far, oldest first
    pub fn sent(&self) -> Vec<ChannelData> {
        self.sent.lock().clone()
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: &ChannelData) -> Result<()> {
        if self.ready_state() != ChannelState::Open {
            return Err(Error::transport("send", "channel is not open"));
        }
        self.sent.lock().push(data.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = *state != ChannelState::Closed;
            *state = ChannelState::Closed;
            was_open
        };
        if was_open {
            self.raise(ChannelEvent::Close);
        }
        Ok(())
    }
}
