pub mod codec;
pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod types;

pub use codec::{SignalEnvelope, SignalMessage};
pub use data_channel::ChannelRegistry;
pub use ice::{analyze_candidates, CandidateBatcher, CandidateStats};
pub use negotiation::{NegotiationState, RemoteDecision};
pub use types::{
    AnswerOptions, ChannelData, ChannelOptions, ChannelState, ConnectionState, DataSource,
    Description, IceCandidate, OfferOptions, SdpType, ServerConfig, SignalingState,
};
