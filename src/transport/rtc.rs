//! webrtc-rs backed transport

use super::{
    CandidatePairStats, ChannelEvent, ChannelId, DataChannel, SenderId, SenderInfo, Transport,
    TransportEvent, TransportEvents, TransportFactory, TransportStats,
};
use crate::config::SessionConfig;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::peer::types::{
    AnswerOptions, ChannelData, ChannelOptions, ChannelState, ConnectionState, Description,
    IceCandidate, OfferOptions, SdpType, ServerConfig, SignalingState,
};
use crate::utils::add_ice_url_scheme;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Creates one [`RtcTransport`] per session (re)initialization
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &SessionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(RtcTransport::new(config, events).await?))
    }
}

struct RtcSender {
    sender: Arc<RTCRtpSender>,
    track_id: Option<String>,
    kind: MediaKind,
}

struct RtcLocalTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: bool,
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
    ice_restart: AtomicBool,
    next_sender: AtomicU64,
    senders: Mutex<HashMap<SenderId, RtcSender>>,
    tracks: Mutex<HashMap<String, RtcLocalTrack>>,
}

impl RtcTransport {
    /// Build a peer connection and bridge its callbacks into `events`
    pub async fn new(config: &SessionConfig, events: TransportEvents) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);
        attach_peer_events(&pc, &events);
        info!("Peer connection created");

        Ok(Self {
            pc,
            events,
            ice_restart: AtomicBool::new(false),
            next_sender: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
        })
    }

    /// Underlying webrtc-rs connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Feed a media sample into a local track. Samples for paused tracks are dropped.
    pub async fn write_sample(&self, track_id: &str, sample: &Sample) -> Result<()> {
        let track = {
            let tracks = self.tracks.lock();
            match tracks.get(track_id) {
                Some(t) if t.enabled => Arc::clone(&t.track),
                Some(_) => return Ok(()),
                None => return Err(Error::TrackNotFound(track_id.to_owned())),
            }
        };
        track.write_sample(sample).await?;
        Ok(())
    }

    fn local_track(&self, track: &LocalTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mime_type = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            stream_id.to_owned(),
        ));
        self.tracks.lock().insert(
            track.id.clone(),
            RtcLocalTrack {
                track: Arc::clone(&rtc_track),
                enabled: track.enabled,
            },
        );
        rtc_track
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .get(&id)
            .map(|s| Arc::clone(&s.sender))
            .ok_or_else(|| Error::transport("sender lookup", format!("unknown sender {}", id.0)))
    }
}

impl fmt::Debug for RtcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcTransport")
            .field("signaling", &self.signaling_state())
            .field("connection", &self.connection_state())
            .finish()
    }
}

#[async_trait]
impl Transport for RtcTransport {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.ice_connection_state())
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<Description> {
        let ice_restart = self.ice_restart.swap(false, Ordering::SeqCst) || options.ice_restart;
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                voice_activity_detection: options.voice_activity_detection,
                ice_restart,
            }))
            .await?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self, options: &AnswerOptions) -> Result<Description> {
        let answer = self
            .pc
            .create_answer(Some(RTCAnswerOptions {
                voice_activity_detection: options.voice_activity_detection,
            }))
            .await?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, description: Description) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: Description) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<Description> {
        self.pc.local_description().await.map(from_rtc_description)
    }

    async fn remote_description(&self) -> Option<Description> {
        self.pc.remote_description().await.map(from_rtc_description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn restart_ice(&self) -> Result<()> {
        // webrtc-rs restarts ICE through the next offer's options
        self.ice_restart.store(true, Ordering::SeqCst);
        self.events.emit(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            max_packet_life_time: options.max_packet_life_time,
            protocol: options.protocol.clone(),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(RtcDataChannel::attach(dc, &self.events))
    }

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<SenderId> {
        let rtc_track = self.local_track(track, stream_id);
        let sender = self
            .pc
            .add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be drained for interceptors to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(
            id,
            RtcSender {
                sender,
                track_id: Some(track.id.clone()),
                kind: track.kind,
            },
        );
        debug!(track_id = %track.id, sender = id.0, "Added local track");
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let rtc_sender = self.sender(sender)?;
        self.pc.remove_track(&rtc_sender).await?;
        let removed = self.senders.lock().remove(&sender);
        if let Some(track_id) = removed.and_then(|s| s.track_id) {
            self.tracks.lock().remove(&track_id);
        }
        Ok(())
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()> {
        let rtc_sender = self.sender(sender)?;
        let stream_id = {
            let tracks = self.tracks.lock();
            self.senders
                .lock()
                .get(&sender)
                .and_then(|s| s.track_id.as_ref())
                .and_then(|id| tracks.get(id))
                .map(|t| t.track.stream_id().to_owned())
                .unwrap_or_default()
        };
        let rtc_track = self.local_track(track, &stream_id);
        rtc_sender
            .replace_track(Some(rtc_track as Arc<dyn TrackLocal + Send + Sync>))
            .await?;

        let previous = self.senders.lock().get_mut(&sender).and_then(|s| {
            s.kind = track.kind;
            s.track_id.replace(track.id.clone())
        });
        if let Some(old) = previous.filter(|old| *old != track.id) {
            self.tracks.lock().remove(&old);
        }
        Ok(())
    }

    async fn set_track_enabled(&self, track_id: &str, enabled: bool) -> Result<()> {
        if let Some(track) = self.tracks.lock().get_mut(track_id) {
            track.enabled = enabled;
        }
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        let mut senders: Vec<SenderInfo> = self
            .senders
            .lock()
            .iter()
            .map(|(id, s)| SenderInfo {
                id: *id,
                track_id: s.track_id.clone(),
                kind: s.kind,
            })
            .collect();
        senders.sort_by_key(|s| s.id);
        senders
    }

    async fn stats(&self) -> TransportStats {
        let selected_pair = selected_pair(self.pc.get_stats().await);
        if let Some(pair) = &selected_pair {
            debug!(
                "Selected pair {}:{} bytes={}/{} state={}",
                pair.local_candidate_id,
                pair.remote_candidate_id,
                pair.bytes_sent,
                pair.bytes_received,
                pair.state
            );
        }
        TransportStats {
            connection: self.connection_state(),
            selected_pair,
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// Wires peer connection callbacks into transport events.
/// Handlers hold only the event sink so dropping the transport frees the connection.
fn attach_peer_events(pc: &RTCPeerConnection, events: &TransportEvents) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => tx.emit(TransportEvent::CandidateDiscovered(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }))),
                Err(e) => warn!("Failed to serialize local candidate: {e}"),
            },
            // cand == None означает конец сбора
            None => tx.emit(TransportEvent::CandidateDiscovered(None)),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        debug!("ICE connection state changed to: {:?}", st);
        tx.emit(TransportEvent::ConnectionStateChanged(map_connection_state(st)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |st: RTCSignalingState| {
        tx.emit(TransportEvent::SignalingStateChanged(map_signaling_state(st)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        tx.emit(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        tx.emit(TransportEvent::TrackReceived(RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        }));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        debug!("Remote opened data channel '{}'", dc.label());
        let channel = RtcDataChannel::attach(dc, &tx);
        tx.emit(TransportEvent::ChannelReceived(channel));
        Box::pin(async {})
    }));
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection_state(state: RTCIceConnectionState) -> ConnectionState {
    match state {
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected => ConnectionState::Connected,
        RTCIceConnectionState::Completed => ConnectionState::Completed,
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc_description(description: Description) -> Result<RTCSessionDescription> {
    let rtc = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    };
    Ok(rtc)
}

fn from_rtc_description(description: RTCSessionDescription) -> Description {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    Description {
        kind,
        sdp: description.sdp,
    }
}

/// Nominated candidate pair of a stats report
fn selected_pair(report: StatsReport) -> Option<CandidatePairStats> {
    report.reports.into_values().find_map(|report| match report {
        StatsReportType::CandidatePair(pair) if pair.nominated => Some(CandidatePairStats {
            local_candidate_id: pair.local_candidate_id,
            remote_candidate_id: pair.remote_candidate_id,
            state: format!("{:?}", pair.state),
            bytes_sent: pair.bytes_sent,
            bytes_received: pair.bytes_received,
        }),
        _ => None,
    })
}

/// Data channel backed by an `RTCDataChannel`
pub struct RtcDataChannel {
    id: ChannelId,
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// общий обработчик data-channel: пробрасывает события в транспорт
    pub fn attach(dc: Arc<RTCDataChannel>, events: &TransportEvents) -> Arc<dyn DataChannel> {
        let id = ChannelId::next();
        let label = dc.label().to_owned();

        let (tx, l) = (events.clone(), label.clone());
        dc.on_open(Box::new(move || {
            debug!("Data channel '{}' opened", l);
            tx.emit(TransportEvent::Channel {
                id,
                label: l.clone(),
                event: ChannelEvent::Open,
            });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label.clone());
        dc.on_close(Box::new(move || {
            debug!("Data channel '{}' closed", l);
            tx.emit(TransportEvent::Channel {
                id,
                label: l.clone(),
                event: ChannelEvent::Close,
            });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label.clone());
        dc.on_error(Box::new(move |err| {
            tx.emit(TransportEvent::Channel {
                id,
                label: l.clone(),
                event: ChannelEvent::Error(err.to_string()),
            });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label.clone());
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let data = if msg.is_string {
                ChannelData::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelData::Binary(msg.data)
            };
            tx.emit(TransportEvent::Channel {
                id,
                label: l.clone(),
                event: ChannelEvent::Message(data),
            });
            Box::pin(async {})
        }));

        Arc::new(Self {
            id,
            label,
            inner: dc,
        })
    }
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send(&self, data: &ChannelData) -> Result<()> {
        match data {
            ChannelData::Text(text) => self.inner.send_text(text.clone()).await?,
            ChannelData::Binary(bytes) => self.inner.send(bytes).await?,
        };
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}
