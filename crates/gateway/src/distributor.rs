//! Paced frame distribution.
//!
//! One run per streaming period: spawn the capture process, read one coded
//! unit per tick, rewrite parameter sets so late joiners can decode from the
//! next keyframe, and fan the payload out to every registered viewer track.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use webrtc::media::Sample;

use crate::capture::CapturePipeline;
use crate::h264::{AnnexBReader, NalUnit};
use crate::session::SessionManager;

/// Nominal source frame interval (~30 fps). An interval timer, not a
/// per-iteration sleep, anchors the schedule so parse time does not
/// accumulate as drift.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub async fn run(manager: Arc<SessionManager>) {
    let settings = manager.capture_settings().clone();
    let (pipeline, stdout) = match CapturePipeline::spawn(&settings) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("failed to spawn capture process: {e}");
            manager.end_streaming_run();
            return;
        }
    };

    let reader = AnnexBReader::new(BufReader::new(stdout));
    run_loop(&manager, reader).await;
    pipeline.shutdown().await;
}

async fn run_loop<R: AsyncRead + Unpin>(manager: &SessionManager, mut reader: AnnexBReader<R>) {
    let mut cache: Vec<u8> = Vec::new();
    let mut interval = tokio::time::interval(FRAME_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if manager.try_finish_run() {
            info!("no viewers remain, stopping frame distribution");
            return;
        }

        let unit = match reader.next_unit().await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                warn!("capture stream ended");
                manager.end_streaming_run();
                return;
            }
            Err(e) => {
                error!("capture stream read failed: {e}");
                manager.end_streaming_run();
                return;
            }
        };

        let Some(payload) = rewrite_unit(&mut cache, unit) else {
            continue;
        };
        broadcast(manager, payload.into()).await;
    }
}

/// Parameter-set rewrite: SPS/PPS units are held back rather than emitted,
/// and the cached set is replayed in front of the next keyframe. A viewer
/// joining mid-stream then decodes from the first keyframe it receives.
/// Returns the Annex B bytes to broadcast, or `None` when the unit was only
/// cached.
fn rewrite_unit(cache: &mut Vec<u8>, unit: NalUnit) -> Option<Vec<u8>> {
    if unit.is_parameter_set() {
        cache.extend_from_slice(&START_CODE);
        cache.extend_from_slice(&unit.data);
        return None;
    }

    let mut payload = Vec::with_capacity(cache.len() + START_CODE.len() + unit.data.len());
    if unit.is_idr() {
        // append() drains the cache; the next parameter sets rebuild it.
        payload.append(cache);
    }
    payload.extend_from_slice(&START_CODE);
    payload.extend_from_slice(&unit.data);
    Some(payload)
}

/// Deliver one payload to every viewer from a registry snapshot. A failed
/// write drops only that viewer; the run itself never aborts on a
/// per-viewer error.
async fn broadcast(manager: &SessionManager, payload: bytes::Bytes) {
    for (id, track) in manager.snapshot_tracks() {
        let sample = Sample {
            data: payload.clone(),
            duration: FRAME_INTERVAL,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!(%id, "dropping viewer after failed track write: {e}");
            manager.remove_session(id).await;
        }
    }
}
