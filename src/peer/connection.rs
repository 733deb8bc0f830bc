//! Transport lifecycle: creation, event pump, teardown

use crate::events::SessionEvent;
use crate::logger::dump_candidate;
use crate::peer::data_channel::{on_channel_event, on_inbound_channel};
use crate::peer::ice::{analyze_candidates, CandidateBatcher, FlushFn};
use crate::peer::negotiation::negotiate;
use crate::peer::state::SessionInner;
use crate::peer::types::{ConnectionState, IceCandidate};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::Result;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Current transport, created on first use
pub(crate) async fn ensure_transport(
    inner: &Arc<SessionInner>,
) -> Result<(Arc<dyn Transport>, u64)> {
    let _guard = inner.init_lock.lock().await;
    if let Some(current) = inner.current() {
        return Ok(current);
    }
    create_transport(inner).await
}

/// Hard reset: replace the transport with a fresh one
pub(crate) async fn reinit(inner: &Arc<SessionInner>) -> Result<(Arc<dyn Transport>, u64)> {
    let _guard = inner.init_lock.lock().await;
    teardown(inner, None).await;
    create_transport(inner).await
}

/// Tear down under the init lock
pub(crate) async fn shutdown(inner: &Arc<SessionInner>) -> bool {
    let _guard = inner.init_lock.lock().await;
    teardown(inner, None).await
}

async fn create_transport(inner: &Arc<SessionInner>) -> Result<(Arc<dyn Transport>, u64)> {
    let (events, rx) = TransportEvents::channel();
    let transport = inner
        .factory
        .create(&inner.config, events)
        .await
        .map_err(|e| inner.fault("init", e))?;

    let (generation, stream) = {
        let mut st = inner.state.lock();
        st.generation += 1;
        st.transport = Some(Arc::clone(&transport));
        st.role.reset();
        (st.generation, st.local_stream.clone())
    };
    *inner.batcher.lock() = Some(new_batcher(inner, generation));
    info!(generation, "Transport initialized");

    tokio::spawn(pump(Arc::downgrade(inner), generation, rx));

    // Локальные треки переживают пересоздание транспорта
    for track in stream.tracks() {
        if let Err(e) = transport.add_track(track, stream.id()).await {
            inner.fault("add_track", e);
        }
    }
    Ok((transport, generation))
}

fn new_batcher(inner: &Arc<SessionInner>, generation: u64) -> CandidateBatcher {
    let weak = Arc::downgrade(inner);
    let flush: FlushFn = Arc::new(move |batch: Vec<IceCandidate>| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }
        analyze_candidates(&batch);
        inner.emit(SessionEvent::IceCandidates(batch));
    });
    CandidateBatcher::new(
        inner.config.batch_candidates,
        inner.config.batch_timeout,
        flush,
    )
}

/// Close the transport and drop everything tied to it.
///
/// With `expected` set nothing happens unless that generation is still
/// current. Emits `disconnected` when a transport was actually closed.
pub(crate) async fn teardown(inner: &SessionInner, expected: Option<u64>) -> bool {
    let transport = {
        let mut st = inner.state.lock();
        if expected.is_some_and(|g| g != st.generation) {
            return false;
        }
        st.generation += 1;
        st.registry.clear();
        st.role.reset();
        st.active = false;
        st.transport.take()
    };
    if let Some(mut batcher) = inner.batcher.lock().take() {
        batcher.reset();
    }

    let Some(transport) = transport else {
        return false;
    };
    if let Err(e) = transport.close().await {
        warn!("Failed to close transport: {e}");
    }
    info!("Transport closed");
    inner.emit(SessionEvent::Disconnected);
    true
}

/// Forward transport events of one generation, in order
async fn pump(
    session: Weak<SessionInner>,
    generation: u64,
    mut rx: UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        if !inner.is_current(generation) {
            break;
        }
        handle_transport_event(&inner, generation, event).await;
    }
    debug!(generation, "Transport event pump stopped");
}

async fn handle_transport_event(inner: &Arc<SessionInner>, generation: u64, event: TransportEvent) {
    match event {
        TransportEvent::CandidateDiscovered(Some(candidate)) => {
            dump_candidate("local", &candidate);
            if let Some(batcher) = inner.batcher.lock().as_mut() {
                batcher.push(candidate);
            }
        }
        TransportEvent::CandidateDiscovered(None) => {
            debug!("ICE gathering complete");
            if let Some(batcher) = inner.batcher.lock().as_mut() {
                batcher.complete();
            }
        }
        TransportEvent::TrackReceived(track) => {
            info!(track_id = %track.id, kind = ?track.kind, "Remote track received");
            inner.emit(SessionEvent::StreamRemote(track));
        }
        TransportEvent::SignalingStateChanged(state) => {
            debug!(%state, "Signaling state changed");
        }
        TransportEvent::ConnectionStateChanged(state) => {
            info!(%state, "Connection state changed");
            inner.emit(SessionEvent::Status(state));
            match state {
                ConnectionState::Checking => inner.emit(SessionEvent::Connecting),
                ConnectionState::Connected => inner.emit(SessionEvent::Connected),
                s if s.is_terminal() => {
                    teardown(inner, Some(generation)).await;
                }
                _ => {}
            }
        }
        TransportEvent::NegotiationNeeded => {
            tokio::spawn(negotiate(Arc::clone(inner), generation));
        }
        TransportEvent::ChannelReceived(handle) => {
            on_inbound_channel(inner, generation, handle);
        }
        TransportEvent::Channel { id, label, event } => {
            on_channel_event(inner, id, label, event);
        }
    }
}
