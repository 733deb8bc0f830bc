//! Two-party peer sessions over WebRTC.
//!
//! A [`Session`] owns one transport and runs perfect negotiation on top of
//! it: both sides may renegotiate at any time and offer collisions resolve by
//! role (one side polite, the other impolite). Local candidates are batched,
//! data channels are tracked by label, and everything observable comes out
//! through a typed event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod transport;
pub mod utils;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, ListenerId, SessionEvent, SessionFault};
pub use media::{LocalStream, LocalTrack, MediaKind, RemoteTrack};
pub use peer::codec::{SignalEnvelope, SignalMessage};
pub use peer::types::{
    ChannelData, ChannelOptions, ChannelState, ConnectionState, DataSource, Description,
    IceCandidate, SdpType, ServerConfig, SignalingState,
};
pub use session::{Session, StartOptions};
pub use transport::{
    CandidatePairStats, ChannelId, DataChannel, Transport, TransportFactory, TransportStats,
};
