use thiserror::Error;

/// Failure at any step of viewer negotiation before establishment.
///
/// Every variant maps to one transition of the negotiation state machine;
/// whichever step fails, the partially built connection has already been
/// closed by the time the error is returned.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to build peer connection: {0}")]
    PeerConnection(#[source] webrtc::Error),
    #[error("failed to attach video track: {0}")]
    Track(#[source] webrtc::Error),
    #[error("failed to apply remote offer: {0}")]
    RemoteOffer(#[source] webrtc::Error),
    #[error("failed to create answer: {0}")]
    Answer(#[source] webrtc::Error),
    #[error("failed to set local description: {0}")]
    LocalDescription(#[source] webrtc::Error),
    #[error("candidate gathering finished without a local description")]
    MissingLocalDescription,
}

/// Failure reading coded-picture units from the capture stream.
/// Both variants abort the current distributor run; neither is fatal to
/// the process.
#[derive(Debug, Error)]
pub enum H264Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("capture stream does not begin with an Annex B start code")]
    MissingStartCode,
}
