//! Public session handle

use crate::config::SessionConfig;
use crate::events::{EventKind, ListenerId, SessionEvent};
use crate::media::{LocalStream, LocalTrack};
use crate::peer::codec::{self, SignalMessage};
use crate::peer::connection::{ensure_transport, reinit, shutdown};
use crate::peer::data_channel::{request_channel, send_data};
use crate::peer::negotiation::{add_remote_candidate, apply_signal};
use crate::peer::state::SessionInner;
use crate::peer::types::{
    ChannelData, ChannelOptions, ConnectionState, Description, IceCandidate, SignalingState,
};
use crate::transport::{
    DataChannel, RtcTransportFactory, Transport, TransportFactory, TransportStats,
};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Options for [`Session::start`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Role for the next negotiation round; `None` keeps the configured one
    pub polite: Option<bool>,
}

impl StartOptions {
    pub fn polite(polite: bool) -> Self {
        Self {
            polite: Some(polite),
        }
    }
}

/// One side of a peer-to-peer session.
///
/// Cloning is cheap and every clone drives the same session. Descriptions and
/// candidates produced locally come out as [`SessionEvent::Signal`] and
/// [`SessionEvent::IceCandidates`]; whatever the remote side produced goes in
/// through [`signal`](Self::signal) and [`add_ice_candidate`](Self::add_ice_candidate).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session and its transport
    pub async fn new(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let session = Self {
            inner: Arc::new(SessionInner::new(config, factory)),
        };
        session.init().await?;
        Ok(session)
    }

    /// Session over webrtc-rs
    pub async fn with_webrtc(config: SessionConfig) -> Result<Self> {
        Self::new(config, Arc::new(RtcTransportFactory)).await
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Create the transport if there is none. Local tracks are attached to it.
    pub async fn init(&self) -> Result<()> {
        ensure_transport(&self.inner).await.map(|_| ())
    }

    /// Begin negotiating.
    ///
    /// A local offer still waiting for its answer is discarded together with
    /// the transport first, so at most one local offer is ever outstanding.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        let inner = &self.inner;
        let stale_offer = inner
            .current()
            .is_some_and(|(t, _)| t.signaling_state() == SignalingState::HaveLocalOffer);

        let (transport, generation) = if stale_offer {
            info!("Unanswered local offer outstanding, resetting transport");
            reinit(inner).await?
        } else {
            ensure_transport(inner).await?
        };

        {
            let mut st = inner.state.lock();
            if st.generation != generation {
                return Err(Error::SessionClosed);
            }
            st.role.set_polite(options.polite);
            st.active = true;
            info!(polite = st.role.polite(), "Session started");
        }

        if inner.config.enable_data_channels {
            request_channel(
                inner,
                &inner.config.channel_label,
                inner.config.channel_options.clone(),
            )
            .await;
        }

        transport
            .restart_ice()
            .await
            .map_err(|e| inner.fault("restart_ice", e))
    }

    /// Apply a description received from the remote side
    pub async fn signal(&self, description: Description) -> Result<()> {
        apply_signal(&self.inner, description).await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        add_remote_candidate(&self.inner, candidate).await
    }

    /// Apply a batch of remote candidates; all are tried, the first error is returned
    pub async fn add_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        let mut first_err = None;
        for candidate in candidates {
            if let Err(e) = self.add_ice_candidate(candidate).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Route a message from the rendezvous channel
    pub async fn receive(&self, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Description(description) => self.signal(description).await,
            SignalMessage::Candidates(candidates) => self.add_ice_candidates(candidates).await,
        }
    }

    /// Decode an envelope produced by [`codec::encode`] and route it
    pub async fn receive_encoded(&self, text: &str) -> Result<()> {
        let envelope = codec::decode(text).map_err(|e| self.inner.fault("receive", e))?;
        debug!(id = %envelope.id, ts = envelope.ts, "Signal envelope received");
        self.receive(envelope.message).await
    }

    /// Add a track to the local stream and send it to the remote side
    pub async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let inner = &self.inner;
        let (transport, stream_id) = {
            let mut st = inner.state.lock();
            if !st.local_stream.add(track.clone()) {
                drop(st);
                inner.usage_fault("add_track", format!("track {} already added", track.id));
                return Ok(());
            }
            (st.transport.clone(), st.local_stream.id().to_owned())
        };

        if let Some(transport) = transport {
            if let Err(e) = transport.add_track(&track, &stream_id).await {
                inner.state.lock().local_stream.remove(&track.id);
                return Err(inner.fault("add_track", e));
            }
        }
        debug!(track_id = %track.id, kind = ?track.kind, "Local track added");
        inner.emit(SessionEvent::StreamLocal(self.local_stream()));
        Ok(())
    }

    /// Add several tracks; with `replace` the current ones are removed first
    pub async fn add_stream(&self, tracks: Vec<LocalTrack>, replace: bool) -> Result<LocalStream> {
        if replace {
            self.remove_tracks(true, true).await?;
        }
        for track in tracks {
            self.add_track(track).await?;
        }
        Ok(self.local_stream())
    }

    pub async fn remove_track(&self, track_id: &str) -> Result<()> {
        let inner = &self.inner;
        let (removed, transport) = {
            let mut st = inner.state.lock();
            (st.local_stream.remove(track_id), st.transport.clone())
        };
        let Some(track) = removed else {
            let err = Error::TrackNotFound(track_id.to_owned());
            return Err(inner.fault("remove_track", err));
        };

        if let Some(transport) = transport {
            if let Err(e) = self.detach(&transport, &[track.id.clone()]).await {
                self.restore_attached(&transport, vec![track]).await;
                return Err(e);
            }
        }
        inner.emit(SessionEvent::StreamLocal(self.local_stream()));
        Ok(())
    }

    /// Remove every local track of the selected kinds. Returns how many were removed.
    pub async fn remove_tracks(&self, video: bool, audio: bool) -> Result<usize> {
        let inner = &self.inner;
        let (removed, transport) = {
            let mut st = inner.state.lock();
            (
                st.local_stream.remove_kinds(video, audio),
                st.transport.clone(),
            )
        };
        if removed.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = removed.iter().map(|t| t.id.clone()).collect();
        if let Some(transport) = transport {
            if let Err(e) = self.detach(&transport, &ids).await {
                self.restore_attached(&transport, removed).await;
                return Err(e);
            }
        }
        inner.emit(SessionEvent::StreamLocal(self.local_stream()));
        Ok(ids.len())
    }

    /// Put back the removed tracks whose senders outlived a failed detach
    async fn restore_attached(&self, transport: &Arc<dyn Transport>, removed: Vec<LocalTrack>) {
        let attached: Vec<String> = transport
            .senders()
            .await
            .into_iter()
            .filter_map(|s| s.track_id)
            .collect();
        let mut st = self.inner.state.lock();
        for track in removed {
            if attached.contains(&track.id) {
                st.local_stream.add(track);
            }
        }
    }

    async fn detach(&self, transport: &Arc<dyn Transport>, track_ids: &[String]) -> Result<()> {
        let senders = transport.senders().await;
        for sender in senders {
            let Some(track_id) = sender.track_id.as_ref() else {
                continue;
            };
            if track_ids.contains(track_id) {
                transport
                    .remove_track(sender.id)
                    .await
                    .map_err(|e| self.inner.fault("remove_track", e))?;
                debug!(%track_id, "Local track removed");
            }
        }
        Ok(())
    }

    /// Swap the track sent for `old_track_id` without renegotiating
    pub async fn replace_track(&self, old_track_id: &str, track: LocalTrack) -> Result<()> {
        let inner = &self.inner;
        let sender = match inner.current() {
            Some((transport, _)) => transport
                .senders()
                .await
                .into_iter()
                .find(|s| s.track_id.as_deref() == Some(old_track_id))
                .map(|s| (transport, s.id)),
            None => None,
        };
        let Some((transport, sender)) = sender else {
            let err = Error::SenderNotFound(old_track_id.to_owned());
            return Err(inner.fault("replace_track", err));
        };

        transport
            .replace_track(sender, &track)
            .await
            .map_err(|e| inner.fault("replace_track", e))?;

        let replaced = inner
            .state
            .lock()
            .local_stream
            .replace(old_track_id, track);
        if replaced {
            inner.emit(SessionEvent::StreamLocal(self.local_stream()));
        }
        Ok(())
    }

    /// Stop sending media of the selected kinds without removing the tracks
    pub async fn pause_tracks(&self, video: bool, audio: bool) -> Result<usize> {
        self.set_tracks_enabled(video, audio, false).await
    }

    pub async fn resume_tracks(&self, video: bool, audio: bool) -> Result<usize> {
        self.set_tracks_enabled(video, audio, true).await
    }

    async fn set_tracks_enabled(&self, video: bool, audio: bool, enabled: bool) -> Result<usize> {
        let inner = &self.inner;
        let (changed, transport) = {
            let mut st = inner.state.lock();
            (
                st.local_stream.set_enabled(video, audio, enabled),
                st.transport.clone(),
            )
        };
        if changed.is_empty() {
            return Ok(0);
        }

        if let Some(transport) = transport {
            for track_id in &changed {
                transport
                    .set_track_enabled(track_id, enabled)
                    .await
                    .map_err(|e| inner.fault("set_track_enabled", e))?;
            }
        }
        inner.emit(SessionEvent::StreamLocal(self.local_stream()));
        Ok(changed.len())
    }

    /// Send on the default channel
    pub async fn send(&self, data: impl Into<ChannelData>) -> bool {
        send_data(&self.inner, &self.inner.config.channel_label, data.into()).await
    }

    /// Send on the channel named `label`. False unless it exists and is open.
    pub async fn send_to(&self, label: &str, data: impl Into<ChannelData>) -> bool {
        send_data(&self.inner, label, data.into()).await
    }

    /// Request a channel. Returns false if it already exists or the session is closed.
    pub async fn add_channel(&self, label: &str, options: ChannelOptions) -> bool {
        request_channel(&self.inner, label, options).await
    }

    pub fn get_channel(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.inner.state.lock().registry.get(label)
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.inner.state.lock().registry.labels()
    }

    /// Close the transport and forget channels and role flags.
    /// Local tracks are kept and re-attached by the next `init`/`start`.
    pub async fn destroy(&self) {
        if shutdown(&self.inner).await {
            info!("Session destroyed");
        }
    }

    /// ICE connection state, `closed` without a transport
    pub fn status(&self) -> ConnectionState {
        self.inner
            .current()
            .map_or(ConnectionState::Closed, |(t, _)| t.connection_state())
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner
            .current()
            .map_or(SignalingState::Closed, |(t, _)| t.signaling_state())
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn local_stream(&self) -> LocalStream {
        self.inner.state.lock().local_stream.clone()
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.current().map(|(t, _)| t)
    }

    /// Connection snapshot with the selected candidate pair
    pub async fn stats(&self) -> TransportStats {
        match self.inner.current() {
            Some((transport, _)) => transport.stats().await,
            None => TransportStats::closed(),
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_any(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    /// Every event from now on, through a channel
    pub fn listen(&self) -> (ListenerId, mpsc::UnboundedReceiver<SessionEvent>) {
        self.inner.bus.listen()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .field("signaling", &self.signaling_state())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEvent;
    use crate::media::MediaKind;
    use crate::transport::MemoryTransportFactory;
    use parking_lot::Mutex;

    async fn session() -> (Session, Arc<MemoryTransportFactory>) {
        let factory = MemoryTransportFactory::new();
        let session = Session::new(SessionConfig::default(), factory.clone())
            .await
            .unwrap();
        (session, factory)
    }

    fn errors(session: &Session) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on(EventKind::Error, move |event| {
            if let SessionEvent::Error(fault) = event {
                sink.lock().push(fault.operation.clone());
            }
        });
        seen
    }

    #[tokio::test]
    async fn construction_creates_transport() {
        let (session, factory) = session().await;
        assert_eq!(factory.created(), 1);
        assert_eq!(session.status(), ConnectionState::New);
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn replace_without_sender_fails() {
        let (session, _) = session().await;
        let seen = errors(&session);
        let err = session
            .replace_track("nope", LocalTrack::video())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SenderNotFound(_)));
        assert_eq!(*seen.lock(), vec!["replace_track".to_string()]);
    }

    #[tokio::test]
    async fn replace_track_keeps_sender() {
        let (session, factory) = session().await;
        session
            .add_track(LocalTrack::with_id("v1", MediaKind::Video))
            .await
            .unwrap();
        session
            .replace_track("v1", LocalTrack::with_id("v2", MediaKind::Video))
            .await
            .unwrap();

        let transport = factory.last().unwrap();
        let senders = transport.senders().await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].track_id.as_deref(), Some("v2"));
        assert!(session.local_stream().get("v2").is_some());
    }

    #[tokio::test]
    async fn pause_and_resume_reach_transport() {
        let (session, factory) = session().await;
        session
            .add_track(LocalTrack::with_id("a1", MediaKind::Audio))
            .await
            .unwrap();
        session
            .add_track(LocalTrack::with_id("v1", MediaKind::Video))
            .await
            .unwrap();

        assert_eq!(session.pause_tracks(false, true).await.unwrap(), 1);
        let transport = factory.last().unwrap();
        assert_eq!(transport.track_enabled("a1"), Some(false));
        assert_eq!(transport.track_enabled("v1"), Some(true));

        assert_eq!(session.resume_tracks(true, true).await.unwrap(), 1);
        assert_eq!(transport.track_enabled("a1"), Some(true));
    }

    #[tokio::test]
    async fn add_stream_with_replace_drops_old_tracks() {
        let (session, factory) = session().await;
        session.add_track(LocalTrack::audio()).await.unwrap();
        let stream = session
            .add_stream(vec![LocalTrack::with_id("v9", MediaKind::Video)], true)
            .await
            .unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.tracks()[0].id, "v9");
        assert_eq!(factory.last().unwrap().senders().await.len(), 1);
    }

    #[tokio::test]
    async fn removing_unknown_track_is_reported() {
        let (session, _) = session().await;
        let seen = errors(&session);
        assert!(matches!(
            session.remove_track("ghost").await,
            Err(Error::TrackNotFound(_))
        ));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn channel_request_after_destroy_is_a_usage_fault() {
        let (session, _) = session().await;
        session.destroy().await;
        let seen = errors(&session);
        assert!(!session.add_channel("chat", ChannelOptions::default()).await);
        assert_eq!(*seen.lock(), vec!["add_channel".to_string()]);
        assert_eq!(session.status(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn failed_removal_keeps_the_track() {
        let (session, factory) = session().await;
        session
            .add_track(LocalTrack::with_id("a1", MediaKind::Audio))
            .await
            .unwrap();
        let transport = factory.last().unwrap();
        transport.fail_on("remove_track");

        assert!(session.remove_track("a1").await.is_err());
        assert!(session.local_stream().get("a1").is_some());
        assert_eq!(transport.senders().await.len(), 1);

        assert!(session.remove_tracks(false, true).await.is_err());
        assert_eq!(session.local_stream().len(), 1);

        transport.recover("remove_track");
        session.remove_track("a1").await.unwrap();
        assert!(session.local_stream().is_empty());
    }

    #[tokio::test]
    async fn stats_without_transport_report_closed() {
        let (session, _) = session().await;
        assert_eq!(session.stats().await.connection, ConnectionState::New);
        session.destroy().await;
        assert_eq!(session.stats().await, TransportStats::closed());
    }

    #[tokio::test]
    async fn empty_payload_is_not_sent() {
        let (session, _) = session().await;
        assert!(!session.send("").await);
        assert!(!session.send_to("missing", "hi").await);
    }

    #[tokio::test]
    async fn destroy_keeps_tracks_for_next_init() {
        let (session, factory) = session().await;
        session
            .add_track(LocalTrack::with_id("a1", MediaKind::Audio))
            .await
            .unwrap();
        session.destroy().await;
        assert_eq!(session.local_stream().len(), 1);

        session.init().await.unwrap();
        assert_eq!(factory.created(), 2);
        let senders = factory.last().unwrap().senders().await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].track_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn encoded_signal_is_routed() {
        let (session, _) = session().await;
        let envelope = codec::SignalEnvelope::new(Description::offer("v=0\r\n"));
        let text = codec::encode(&envelope).unwrap();
        session.receive_encoded(&text).await.unwrap();
        assert!(session.is_active());
        assert_eq!(session.signaling_state(), SignalingState::Stable);
    }
}
