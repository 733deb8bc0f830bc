//! Error types for peer sessions

use crate::peer::types::SignalingState;
use std::fmt::Display;
use thiserror::Error;

/// Errors produced by sessions and transports
#[derive(Debug, Error)]
pub enum Error {
    /// The transport rejected an operation
    #[error("{operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The session has no transport (destroyed or never initialized)
    #[error("session is closed")]
    SessionClosed,

    /// No outbound sender carries the given track
    #[error("no outbound sender for track {0}")]
    SenderNotFound(String),

    /// The local stream does not contain the given track
    #[error("unknown local track {0}")]
    TrackNotFound(String),

    /// Operation not allowed in the current signaling state
    #[error("{operation} not allowed in signaling state {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },

    /// Signal envelope could not be encoded or decoded
    #[error("signal codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl Error {
    /// Wrap any displayable cause as a transport fault for `operation`
    pub fn transport(operation: &'static str, cause: impl Display) -> Self {
        Error::Transport {
            operation,
            message: cause.to_string(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
