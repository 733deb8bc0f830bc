use crate::config::SessionConfig;
use crate::events::{EventBus, SessionEvent, SessionFault};
use crate::media::LocalStream;
use crate::peer::data_channel::ChannelRegistry;
use crate::peer::ice::CandidateBatcher;
use crate::peer::negotiation::NegotiationState;
use crate::transport::{Transport, TransportFactory};
use crate::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Shared core of a [`Session`](crate::Session)
pub struct SessionInner {
    pub config: SessionConfig,
    pub factory: Arc<dyn TransportFactory>,
    pub bus: EventBus,
    pub state: Mutex<SessionState>,
    /// Батчер живёт отдельно: flush вызывается под его блокировкой
    pub batcher: Mutex<Option<CandidateBatcher>>,
    /// Serialises transport (re)initialisation
    pub init_lock: tokio::sync::Mutex<()>,
    /// Operations chain: local offers and remote descriptions apply one
    /// at a time, remote ones in arrival order
    pub signal_lock: tokio::sync::Mutex<()>,
}

/// Mutable session state. Never held across an `.await`.
pub struct SessionState {
    pub transport: Option<Arc<dyn Transport>>,
    /// Bumped whenever the transport is created or torn down
    pub generation: u64,
    pub registry: ChannelRegistry,
    pub role: NegotiationState,
    pub active: bool,
    pub local_stream: LocalStream,
}

impl SessionInner {
    pub fn new(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let role = NegotiationState::new(config.polite);
        Self {
            config,
            factory,
            bus: EventBus::new(),
            state: Mutex::new(SessionState {
                transport: None,
                generation: 0,
                registry: ChannelRegistry::new(),
                role,
                active: false,
                local_stream: LocalStream::new(),
            }),
            batcher: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            signal_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        self.bus.emit(event);
    }

    /// Current transport and its generation
    pub fn current(&self) -> Option<(Arc<dyn Transport>, u64)> {
        let st = self.state.lock();
        st.transport.clone().map(|t| (t, st.generation))
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let st = self.state.lock();
        st.transport.is_some() && st.generation == generation
    }

    /// Report a failed operation through the `error` event and hand the error back
    pub fn fault(&self, operation: &'static str, err: Error) -> Error {
        warn!("{operation} failed: {err}");
        self.emit(SessionEvent::Error(SessionFault {
            operation: operation.to_owned(),
            message: err.to_string(),
        }));
        err
    }

    /// Misuse that is reported but otherwise ignored
    pub fn usage_fault(&self, operation: &'static str, message: impl Into<String>) {
        let message = message.into();
        warn!("{operation}: {message}");
        self.emit(SessionEvent::Error(SessionFault {
            operation: operation.to_owned(),
            message,
        }));
    }
}
