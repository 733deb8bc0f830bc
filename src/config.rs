// Конфигурация сессии и логирования

use crate::peer::types::{AnswerOptions, ChannelOptions, OfferOptions, ServerConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default label of the auxiliary data channel
pub const DEFAULT_CHANNEL_LABEL: &str = "peerlink";

/// Default countdown before a candidate batch is flushed
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(200);

// В режиме отладки логирование подробное
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peerlink=debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "peerlink=info";

/// Rewrites locally generated SDP before it is applied and sent
pub type SdpTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Session configuration
#[derive(Clone)]
pub struct SessionConfig {
    /// Batch locally discovered ICE candidates
    pub batch_candidates: bool,
    /// Quiet period before a candidate batch is flushed
    pub batch_timeout: Duration,
    /// Open the default channel on `start` and accept remote channels
    pub enable_data_channels: bool,
    pub channel_label: String,
    pub channel_options: ChannelOptions,
    pub ice_servers: Vec<ServerConfig>,
    pub offer_options: OfferOptions,
    pub answer_options: AnswerOptions,
    /// Role restored after every completed negotiation round
    pub polite: bool,
    pub sdp_transform: Option<SdpTransform>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_candidates: true,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            enable_data_channels: true,
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            channel_options: ChannelOptions::default(),
            ice_servers: default_ice_servers(),
            offer_options: OfferOptions::default(),
            answer_options: AnswerOptions::default(),
            polite: true,
            sdp_transform: None,
        }
    }
}

impl SessionConfig {
    pub fn with_polite(mut self, polite: bool) -> Self {
        self.polite = polite;
        self
    }

    pub fn with_batching(mut self, enabled: bool, timeout: Duration) -> Self {
        self.batch_candidates = enabled;
        self.batch_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_data_channels(mut self, enabled: bool) -> Self {
        self.enable_data_channels = enabled;
        self
    }

    pub fn with_sdp_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        self.sdp_transform = Some(Arc::new(transform));
        self
    }

    /// Apply the configured SDP transform, if any
    pub fn transform_sdp(&self, sdp: String) -> String {
        match &self.sdp_transform {
            Some(transform) => transform(sdp),
            None => sdp,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("batch_candidates", &self.batch_candidates)
            .field("batch_timeout", &self.batch_timeout)
            .field("enable_data_channels", &self.enable_data_channels)
            .field("channel_label", &self.channel_label)
            .field("channel_options", &self.channel_options)
            .field("ice_servers", &self.ice_servers)
            .field("offer_options", &self.offer_options)
            .field("answer_options", &self.answer_options)
            .field("polite", &self.polite)
            .field("sdp_transform", &self.sdp_transform.is_some())
            .finish()
    }
}

/// Дефолтные STUN серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}
