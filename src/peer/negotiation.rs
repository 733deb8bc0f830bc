//! Perfect negotiation.
//!
//! Both sides may offer at any time. On an offer collision the impolite side
//! drops the incoming offer and keeps its own; the polite side rolls its own
//! offer back and answers. With exactly one polite side the exchange always
//! converges without outside coordination.

use crate::events::SessionEvent;
use crate::logger::dump_candidate;
use crate::peer::connection::ensure_transport;
use crate::peer::data_channel::materialize_pending;
use crate::peer::state::SessionInner;
use crate::peer::types::{Description, IceCandidate, SdpType, SignalingState};
use crate::transport::Transport;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// What to do with an incoming description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDecision {
    Apply { collision: bool },
    Ignore,
}

/// Role flags of one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationState {
    default_polite: bool,
    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
}

impl NegotiationState {
    pub fn new(default_polite: bool) -> Self {
        Self {
            default_polite,
            polite: default_polite,
            making_offer: false,
            ignore_offer: false,
        }
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer
    }

    /// Override the role until the current round completes; `None` keeps the baseline
    pub fn set_polite(&mut self, polite: Option<bool>) {
        self.polite = polite.unwrap_or(self.default_polite);
    }

    /// Returns false if an offer is already being made
    pub fn begin_offer(&mut self) -> bool {
        if self.making_offer {
            return false;
        }
        self.making_offer = true;
        true
    }

    pub fn end_offer(&mut self) {
        self.making_offer = false;
    }

    pub fn on_remote_description(
        &mut self,
        kind: SdpType,
        signaling: SignalingState,
    ) -> RemoteDecision {
        let collision =
            kind == SdpType::Offer && (self.making_offer || signaling != SignalingState::Stable);
        self.ignore_offer = !self.polite && collision;
        if self.ignore_offer {
            RemoteDecision::Ignore
        } else {
            RemoteDecision::Apply { collision }
        }
    }

    pub fn complete_round(&mut self) {
        self.polite = self.default_polite;
    }

    pub fn reset(&mut self) {
        self.polite = self.default_polite;
        self.making_offer = false;
        self.ignore_offer = false;
    }

    /// Candidates trailing an ignored offer are expected to fail
    pub fn reports_candidate_errors(&self) -> bool {
        !self.ignore_offer
    }
}

/// Answer a negotiation-needed event of transport `generation`
pub(crate) async fn negotiate(inner: Arc<SessionInner>, generation: u64) {
    // offer и входящие описания не должны перемежаться
    let _chain = inner.signal_lock.lock().await;
    let transport = {
        let mut st = inner.state.lock();
        if st.generation != generation || !st.active {
            debug!(generation, "Negotiation needed but session is not active");
            return;
        }
        let Some(transport) = st.transport.clone() else {
            return;
        };
        if !st.role.begin_offer() {
            debug!("Offer already in progress");
            return;
        }
        transport
    };

    if let Err(e) = make_offer(&inner, &transport, generation).await {
        debug!("Offer abandoned: {e}");
    }

    let mut st = inner.state.lock();
    if st.generation == generation {
        st.role.end_offer();
    }
}

async fn make_offer(
    inner: &Arc<SessionInner>,
    transport: &Arc<dyn Transport>,
    generation: u64,
) -> Result<()> {
    // каналы должны попасть в offer
    materialize_pending(inner, transport, generation).await;

    let offer = transport
        .create_offer(&inner.config.offer_options)
        .await
        .map_err(|e| inner.fault("create_offer", e))?;

    let signaling = transport.signaling_state();
    if !inner.is_current(generation) || signaling != SignalingState::Stable {
        debug!(%signaling, "Signaling state changed while creating offer, dropping it");
        return Ok(());
    }

    let offer = Description {
        kind: offer.kind,
        sdp: inner.config.transform_sdp(offer.sdp),
    };
    if let Err(e) = transport.set_local_description(offer.clone()).await {
        if !inner.is_current(generation) {
            debug!("Transport retired while applying offer: {e}");
            return Ok(());
        }
        return Err(inner.fault("set_local_description", e));
    }

    if inner.is_current(generation) {
        info!("Local offer created");
        inner.emit(SessionEvent::Signal(offer));
    }
    Ok(())
}

/// Apply a description received from the remote side
pub(crate) async fn apply_signal(inner: &Arc<SessionInner>, description: Description) -> Result<()> {
    let _chain = inner.signal_lock.lock().await;
    let (transport, generation) = ensure_transport(inner).await?;

    let decision = {
        let mut st = inner.state.lock();
        if st.generation != generation {
            return Err(Error::SessionClosed);
        }
        st.active = true;
        st.role
            .on_remote_description(description.kind, transport.signaling_state())
    };

    let collision = match decision {
        RemoteDecision::Ignore => {
            debug!("Ignoring colliding remote offer");
            return Ok(());
        }
        RemoteDecision::Apply { collision } => collision,
    };

    let signaling = transport.signaling_state();
    if description.is_offer() && signaling == SignalingState::HaveLocalOffer {
        debug!(collision, "Remote offer over a local one, rolling back");
        transport
            .set_local_description(Description::rollback())
            .await
            .map_err(|e| inner.fault("rollback", e))?;
    }

    let is_offer = description.is_offer();
    debug!(kind = ?description.kind, "Applying remote description");
    transport
        .set_remote_description(description)
        .await
        .map_err(|e| inner.fault("set_remote_description", e))?;

    if is_offer && inner.is_current(generation) {
        materialize_pending(inner, &transport, generation).await;

        let answer = transport
            .create_answer(&inner.config.answer_options)
            .await
            .map_err(|e| inner.fault("create_answer", e))?;
        let answer = Description {
            kind: answer.kind,
            sdp: inner.config.transform_sdp(answer.sdp),
        };
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| inner.fault("set_local_description", e))?;

        if inner.is_current(generation) {
            info!("Local answer created");
            inner.emit(SessionEvent::Signal(answer));
        }
    }

    let mut st = inner.state.lock();
    if st.generation == generation {
        st.role.complete_round();
    }
    Ok(())
}

/// Hand a remote candidate to the transport
pub(crate) async fn add_remote_candidate(
    inner: &Arc<SessionInner>,
    candidate: IceCandidate,
) -> Result<()> {
    dump_candidate("remote", &candidate);
    let Some((transport, _)) = inner.current() else {
        return Err(inner.fault("add_ice_candidate", Error::SessionClosed));
    };

    match transport.add_ice_candidate(candidate).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let report = inner.state.lock().role.reports_candidate_errors();
            if report {
                Err(inner.fault("add_ice_candidate", e))
            } else {
                debug!("Candidate of an ignored offer rejected: {e}");
                Ok(())
            }
        }
    }
}
