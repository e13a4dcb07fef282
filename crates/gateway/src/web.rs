//! HTTP surface: signaling endpoint, health and status probes, and the
//! static viewer page.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::session::SessionManager;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub web_root: String,
}

/// Wire format shared with the viewer page: a base64-wrapped JSON session
/// description, the same shape in both directions.
#[derive(Serialize, Deserialize)]
struct SdpPayload {
    #[serde(rename = "encodedSDP")]
    encoded_sdp: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new(&state.web_root);

    Router::new()
        .route("/streaming", post(streaming))
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .layer(RequestBodyLimitLayer::new(65_536))
        .fallback_service(serve_dir)
        .with_state(state)
}

/// One-round-trip signaling: the browser POSTs its offer, the response body
/// carries the fully gathered answer. A body that fails any decoding stage
/// is rejected before negotiation starts; a negotiation failure is the
/// server's problem, not the client's.
async fn streaming(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(offer) = decode_offer(&body) else {
        tracing::warn!("rejecting undecodable signaling request");
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.manager.create_session(offer).await {
        Ok(answer) => match encode_answer(&answer) {
            Ok(encoded_sdp) => {
                (StatusCode::OK, Json(SdpPayload { encoded_sdp })).into_response()
            }
            Err(e) => {
                tracing::error!("failed to encode session answer: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!(null))).into_response()
            }
        },
        Err(e) => {
            tracing::error!("session negotiation failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!(null))).into_response()
        }
    }
}

fn decode_offer(body: &[u8]) -> Option<RTCSessionDescription> {
    let payload: SdpPayload = serde_json::from_slice(body).ok()?;
    let raw = BASE64.decode(payload.encoded_sdp.trim()).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn encode_answer(answer: &RTCSessionDescription) -> serde_json::Result<String> {
    Ok(BASE64.encode(serde_json::to_vec(answer)?))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "viewers": state.manager.count(),
        "streaming": state.manager.is_streaming(),
    }))
}
