//! Viewer registry and streaming lifecycle.
//!
//! `SessionManager` is the single entry point for adding and removing
//! viewers. The registry map and the streaming flag live under one mutex:
//! "was the registry empty when this viewer arrived" and "is the registry
//! empty now that the distributor checked" are decided in single critical
//! sections, so exactly one distributor run exists whenever viewers do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::capture::CaptureSettings;
use crate::distributor;
use crate::error::NegotiationError;
use crate::peer;

/// Connection lifecycle notifications emitted from WebRTC callbacks.
/// Callbacks themselves never lock the registry; a single consumer task
/// applies the transitions one at a time.
pub enum SessionEvent {
    ConnectionState {
        id: Uuid,
        state: RTCPeerConnectionState,
    },
}

pub struct ViewerSession {
    pub id: Uuid,
    pub peer: Arc<RTCPeerConnection>,
    pub track: Arc<TrackLocalStaticSample>,
}

struct Registry {
    viewers: HashMap<Uuid, ViewerSession>,
    streaming: bool,
}

pub struct SessionManager {
    registry: Mutex<Registry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    capture: CaptureSettings,
    stun_urls: Vec<String>,
}

impl SessionManager {
    pub fn new(capture: CaptureSettings, stun_urls: Vec<String>) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            registry: Mutex::new(Registry {
                viewers: HashMap::new(),
                streaming: false,
            }),
            events,
            capture,
            stun_urls,
        });
        Self::spawn_event_task(Arc::downgrade(&manager), rx);
        manager
    }

    fn spawn_event_task(manager: Weak<SessionManager>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                match event {
                    SessionEvent::ConnectionState { id, state } => match state {
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            info!(%id, %state, "terminal connection state, removing session");
                            manager.remove_session(id).await;
                        }
                        RTCPeerConnectionState::Disconnected => {
                            // Transient: ICE may still recover the transport.
                            debug!(%id, "peer temporarily disconnected");
                        }
                        _ => {}
                    },
                }
            }
        });
    }

    /// Negotiate and register a new viewer. Negotiation happens entirely
    /// outside the registry lock; only the finished session is inserted.
    pub async fn create_session(
        self: &Arc<Self>,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, NegotiationError> {
        let id = Uuid::new_v4();
        let peer::NegotiatedPeer { peer, track, answer } =
            peer::negotiate(offer, id, &self.stun_urls, self.events.clone()).await?;

        let (viewers, start) = self.register(ViewerSession { id, peer, track });
        info!(%id, viewers, "viewer session added");
        if start {
            info!("first viewer arrived, starting capture pipeline");
            tokio::spawn(distributor::run(Arc::clone(self)));
        }
        Ok(answer)
    }

    /// Insert a fully negotiated session. Returns the new viewer count and
    /// whether this insertion must start a distributor run. The emptiness
    /// check and the flag flip are one critical section, so two racing
    /// registrations on an empty registry start exactly one run.
    fn register(&self, session: ViewerSession) -> (usize, bool) {
        let mut registry = self.lock_registry();
        registry.viewers.insert(session.id, session);
        let start = !registry.streaming;
        registry.streaming = true;
        (registry.viewers.len(), start)
    }

    /// Remove a viewer and close its connection. Idempotent: removal may be
    /// triggered by the state callback, a failed track write, or shutdown,
    /// in any order.
    pub async fn remove_session(&self, id: Uuid) {
        let removed = self.lock_registry().viewers.remove(&id);
        if let Some(session) = removed {
            // Close outside the lock: teardown is network I/O.
            if let Err(e) = session.peer.close().await {
                debug!(%id, "error closing peer connection: {e}");
            }
            info!(%id, viewers = self.count(), "viewer session removed");
        }
    }

    pub fn count(&self) -> usize {
        self.lock_registry().viewers.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_registry().streaming
    }

    /// End the current run iff no viewers remain. Emptiness check and flag
    /// clear are atomic: a viewer arriving concurrently either keeps the run
    /// alive or sees the flag already cleared and starts a fresh one.
    pub(crate) fn try_finish_run(&self) -> bool {
        let mut registry = self.lock_registry();
        if registry.viewers.is_empty() {
            registry.streaming = false;
            true
        } else {
            false
        }
    }

    /// Unconditionally clear the streaming flag. Used when a run aborts on a
    /// capture failure while viewers are still registered; the next arrival
    /// starts a fresh run.
    pub(crate) fn end_streaming_run(&self) {
        self.lock_registry().streaming = false;
    }

    pub(crate) fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }

    /// Tracks of all current viewers. The distributor broadcasts from this
    /// snapshot without holding the lock across track writes.
    pub(crate) fn snapshot_tracks(&self) -> Vec<(Uuid, Arc<TrackLocalStaticSample>)> {
        self.lock_registry()
            .viewers
            .values()
            .map(|s| (s.id, Arc::clone(&s.track)))
            .collect()
    }

    /// Close every session. The distributor notices the empty registry on
    /// its next tick and stops the capture process.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.lock_registry().viewers.keys().copied().collect();
        for id in ids {
            self.remove_session(id).await;
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl SessionManager {
    pub(crate) fn register_for_tests(&self, session: ViewerSession) -> (usize, bool) {
        self.register(session)
    }
}

#[cfg(test)]
impl ViewerSession {
    pub(crate) async fn for_tests() -> Self {
        use webrtc::api::media_engine::MIME_TYPE_H264;
        use webrtc::peer_connection::configuration::RTCConfiguration;
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

        let api = crate::peer::build_api().expect("api");
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .expect("peer connection");
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "camgate".to_string(),
        );
        Self {
            id: Uuid::new_v4(),
            peer: Arc::new(pc),
            track: Arc::new(track),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> Arc<SessionManager> {
        SessionManager::new(
            CaptureSettings {
                device: "/dev/video0".to_string(),
                resolution: "640x360".to_string(),
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn register_and_remove_update_count() {
        let manager = test_manager();
        assert_eq!(manager.count(), 0);

        let a = ViewerSession::for_tests().await;
        let b = ViewerSession::for_tests().await;
        let (a_id, b_id) = (a.id, b.id);

        manager.register(a);
        manager.register(b);
        assert_eq!(manager.count(), 2);

        manager.remove_session(a_id).await;
        assert_eq!(manager.count(), 1);
        manager.remove_session(b_id).await;
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let manager = test_manager();
        let session = ViewerSession::for_tests().await;
        let id = session.id;
        manager.register(session);

        manager.remove_session(id).await;
        manager.remove_session(id).await;
        manager.remove_session(Uuid::new_v4()).await;
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn only_first_registration_starts_a_run() {
        let manager = test_manager();

        let (count, start) = manager.register(ViewerSession::for_tests().await);
        assert_eq!(count, 1);
        assert!(start);
        assert!(manager.is_streaming());

        let (count, start) = manager.register(ViewerSession::for_tests().await);
        assert_eq!(count, 2);
        assert!(!start);
    }

    #[tokio::test]
    async fn concurrent_registrations_start_exactly_one_run() {
        let manager = test_manager();
        let a = ViewerSession::for_tests().await;
        let b = ViewerSession::for_tests().await;

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let t1 = tokio::spawn(async move { m1.register(a).1 });
        let t2 = tokio::spawn(async move { m2.register(b).1 });
        let starts = [t1.await.unwrap(), t2.await.unwrap()];

        assert_eq!(starts.iter().filter(|s| **s).count(), 1);
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test]
    async fn try_finish_run_only_succeeds_when_empty() {
        let manager = test_manager();
        let session = ViewerSession::for_tests().await;
        let id = session.id;
        manager.register(session);

        assert!(!manager.try_finish_run());
        assert!(manager.is_streaming());

        manager.remove_session(id).await;
        assert!(manager.try_finish_run());
        assert!(!manager.is_streaming());
    }

    #[tokio::test]
    async fn snapshot_matches_registry() {
        let manager = test_manager();
        let session = ViewerSession::for_tests().await;
        let id = session.id;
        manager.register(session);

        let tracks = manager.snapshot_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].0, id);
    }

    #[tokio::test]
    async fn shutdown_drains_the_registry() {
        let manager = test_manager();
        manager.register(ViewerSession::for_tests().await);
        manager.register(ViewerSession::for_tests().await);

        manager.shutdown().await;
        assert_eq!(manager.count(), 0);
        assert!(manager.try_finish_run());
    }
}
