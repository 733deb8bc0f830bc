//! Transport capability consumed by sessions.
//!
//! A transport owns the actual peer connection: ICE gathering, DTLS, media and
//! SCTP. It raises asynchronous [`TransportEvent`]s through the
//! [`TransportEvents`] sink handed to it at creation. [`rtc`] backs it with
//! webrtc-rs; [`memory`] is an in-process stand-in used by tests.

pub mod memory;
pub mod rtc;

use crate::config::SessionConfig;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::peer::types::{
    AnswerOptions, ChannelData, ChannelOptions, ChannelState, ConnectionState, Description,
    IceCandidate, OfferOptions, SignalingState,
};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

pub use memory::{MemoryChannel, MemoryTransport, MemoryTransportFactory};
pub use rtc::{RtcDataChannel, RtcTransport, RtcTransportFactory};

/// Events a channel raises over its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Error(String),
    Message(ChannelData),
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate, or `None` once gathering is complete
    CandidateDiscovered(Option<IceCandidate>),
    TrackReceived(RemoteTrack),
    SignalingStateChanged(SignalingState),
    ConnectionStateChanged(ConnectionState),
    NegotiationNeeded,
    /// A channel created by the remote side
    ChannelReceived(Arc<dyn DataChannel>),
    /// Event of one channel handle. Both sides may use the same label, so
    /// `id` tells a local channel from a remote one.
    Channel {
        id: ChannelId,
        label: String,
        event: ChannelEvent,
    },
}

/// Sending half of a transport's event stream
#[derive(Clone)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            trace!("transport event dropped, session no longer listening");
        }
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(pub u64);

/// Identity of a channel handle, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// An outbound media sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub id: SenderId,
    pub track_id: Option<String>,
    pub kind: MediaKind,
}

/// Nominated candidate pair of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePairStats {
    pub local_candidate_id: String,
    pub remote_candidate_id: String,
    pub state: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub connection: ConnectionState,
    pub selected_pair: Option<CandidatePairStats>,
}

impl TransportStats {
    /// Stats of a session without a transport
    pub fn closed() -> Self {
        Self {
            connection: ConnectionState::Closed,
            selected_pair: None,
        }
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    async fn send(&self, data: &ChannelData) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// ICE connection state
    fn connection_state(&self) -> ConnectionState;

    async fn create_offer(&self, options: &OfferOptions) -> Result<Description>;

    async fn create_answer(&self, options: &AnswerOptions) -> Result<Description>;

    async fn set_local_description(&self, description: Description) -> Result<()>;

    async fn set_remote_description(&self, description: Description) -> Result<()>;

    async fn local_description(&self) -> Option<Description>;

    async fn remote_description(&self) -> Option<Description>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Request an ICE restart. The transport answers with a
    /// [`TransportEvent::NegotiationNeeded`].
    async fn restart_ice(&self) -> Result<()>;

    /// Create a channel. Its open/close/error/message events arrive as
    /// [`TransportEvent::Channel`].
    async fn create_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>>;

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<SenderId>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Swap the track carried by `sender` without renegotiating
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()>;

    async fn set_track_enabled(&self, _track_id: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo>;

    /// Snapshot of the connection, `getStats` style
    async fn stats(&self) -> TransportStats;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &SessionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>>;
}
