//! Viewer peer negotiation.
//!
//! One offer/answer round trip per viewer, non-trickle: the answer is only
//! returned after candidate gathering completes, so the HTTP response carries
//! everything the browser needs. Connection lifecycle after establishment is
//! reported through the session event channel; this module never touches the
//! registry itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::NegotiationError;
use crate::session::SessionEvent;

const KEEPALIVE_DEADLINE: Duration = Duration::from_secs(5);

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

pub struct NegotiatedPeer {
    pub peer: Arc<RTCPeerConnection>,
    pub track: Arc<TrackLocalStaticSample>,
    pub answer: RTCSessionDescription,
}

/// Media engine restricted to H.264. The capture pipeline emits nothing
/// else, and offering more codecs would let browsers negotiate one we
/// cannot produce.
pub(crate) fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Run the full negotiation for one viewer: build the connection, attach the
/// outbound video track, apply the offer, and return the gathered answer.
///
/// On any failure the connection is closed before the error propagates, so a
/// rejected request leaves no WebRTC state behind.
pub async fn negotiate(
    offer: RTCSessionDescription,
    session_id: Uuid,
    stun_urls: &[String],
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<NegotiatedPeer, NegotiationError> {
    let api = build_api().map_err(NegotiationError::PeerConnection)?;

    let ice_servers = if stun_urls.is_empty() {
        vec![]
    } else {
        vec![RTCIceServer {
            urls: stun_urls.to_vec(),
            ..Default::default()
        }]
    };
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let peer = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(NegotiationError::PeerConnection)?,
    );

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            ..Default::default()
        },
        "video".to_string(),
        "camgate".to_string(),
    ));

    let sender = match peer
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
    {
        Ok(sender) => sender,
        Err(e) => {
            let _ = peer.close().await;
            return Err(NegotiationError::Track(e));
        }
    };

    peer.on_ice_connection_state_change(Box::new(move |state| {
        debug!(%session_id, %state, "ICE connection state changed");
        Box::pin(async {})
    }));

    peer.on_peer_connection_state_change(Box::new(move |state| {
        info!(%session_id, %state, "peer connection state changed");
        let _ = events.send(SessionEvent::ConnectionState {
            id: session_id,
            state,
        });
        Box::pin(async {})
    }));

    if let Err(e) = peer.set_remote_description(offer).await {
        let _ = peer.close().await;
        return Err(NegotiationError::RemoteOffer(e));
    }

    let answer = match peer.create_answer(None).await {
        Ok(answer) => answer,
        Err(e) => {
            let _ = peer.close().await;
            return Err(NegotiationError::Answer(e));
        }
    };

    let mut gather_complete = peer.gathering_complete_promise().await;
    if let Err(e) = peer.set_local_description(answer).await {
        let _ = peer.close().await;
        return Err(NegotiationError::LocalDescription(e));
    }
    let _ = gather_complete.recv().await;

    let Some(answer) = peer.local_description().await else {
        let _ = peer.close().await;
        return Err(NegotiationError::MissingLocalDescription);
    };

    spawn_keepalive_reader(session_id, sender);

    Ok(NegotiatedPeer {
        peer,
        track,
        answer,
    })
}

/// Drain inbound RTCP from the viewer under a read deadline. A peer that
/// stops sending receiver reports is half-open; the reader gives up and the
/// connection-state callback drives the actual removal.
fn spawn_keepalive_reader(session_id: Uuid, sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(KEEPALIVE_DEADLINE, sender.read_rtcp()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(%session_id, "RTCP reader stopped: {e}");
                    break;
                }
                Err(_) => {
                    warn!(
                        %session_id,
                        deadline_secs = KEEPALIVE_DEADLINE.as_secs(),
                        "no RTCP within deadline, stopping keep-alive reads"
                    );
                    break;
                }
            }
        }
    });
}
