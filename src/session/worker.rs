// Body of one participant's pipeline task.
//
// Publishes the derived track as soon as the participant is claimed, then
// subscribes to the participant's audio track if needed and pumps frames
// source -> pipeline -> derived track until the source ends, the sink fails or
// the task is cancelled. Every transport call races the cancel token, and the
// derived track is torn down on every exit path. Claim release belongs to the
// caller, which holds the claim guard for exactly as long as this future runs.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::protocol::{FrameStream, SessionConnection, TrackInfo};
use super::publisher::{derived_track_name, DerivedTrack, TrackPublisher};
use crate::audio::{AudioPipeline, EnhancementEngine, PipelineConfig};
use crate::error::{StreamTerminationError, SubscriptionError};

/// Log the input level every this many frames
const LEVEL_LOG_INTERVAL: u64 = 100;

/// Mean absolute level under which periodic level logs are skipped
const LEVEL_LOG_FLOOR: f64 = 10.0;

pub(crate) struct WorkerContext {
    pub connection: Arc<dyn SessionConnection>,
    pub pipeline: PipelineConfig,
    pub engine: Arc<dyn EnhancementEngine>,
    pub subscribe_delay: Duration,
    /// Frames processed, shared with the status snapshot
    pub frames: Arc<AtomicU64>,
}

pub(crate) async fn run_participant(
    ctx: WorkerContext,
    participant: &str,
    track: TrackInfo,
    cancel: CancellationToken,
) -> Result<StreamTerminationError> {
    let session = ctx.connection.session().to_string();

    let track_name = derived_track_name(participant);
    let publish = TrackPublisher::publish(
        Arc::clone(&ctx.connection),
        &track_name,
        ctx.pipeline.format,
    );
    let mut derived = tokio::select! {
        _ = cancel.cancelled() => return Ok(StreamTerminationError::Cancelled),
        derived = publish => derived?,
    };

    let outcome = match open_source(&ctx, participant, &track, &cancel).await {
        Ok(Some(source)) => {
            info!(
                "Starting enhancement for {} in session {} (engine {})",
                participant,
                session,
                ctx.engine.name()
            );
            let pipeline = AudioPipeline::new(ctx.pipeline.clone(), Arc::clone(&ctx.engine));
            Ok(pump(pipeline, source, &mut derived, &ctx.frames, participant, &cancel).await)
        }
        Ok(None) => Ok(StreamTerminationError::Cancelled),
        Err(e) => Err(e),
    };

    if let Err(e) = derived.teardown().await {
        error!("Failed to tear down track for {}: {:#}", participant, e);
    }

    outcome
}

/// Subscribe if needed and open the frame stream. `None` means cancelled while waiting.
async fn open_source(
    ctx: &WorkerContext,
    participant: &str,
    track: &TrackInfo,
    cancel: &CancellationToken,
) -> Result<Option<FrameStream>> {
    if !track.subscribed {
        info!("Subscribing to audio from {}", participant);
        let request = ctx.connection.request_subscribe(participant, &track.sid);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = request => result.map_err(|source| SubscriptionError::Request {
                participant: participant.to_string(),
                track: track.sid.clone(),
                source,
            })?,
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(ctx.subscribe_delay) => {}
        }
    }

    let opened = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        opened = ctx.connection.open_track(participant, &track.sid) => opened?,
    };

    match opened {
        Some(source) => Ok(Some(source)),
        None => Err(SubscriptionError::NotDeliverable {
            participant: participant.to_string(),
            track: track.sid.clone(),
        }
        .into()),
    }
}

async fn pump(
    mut pipeline: AudioPipeline,
    mut source: FrameStream,
    derived: &mut DerivedTrack,
    frames: &AtomicU64,
    participant: &str,
    cancel: &CancellationToken,
) -> StreamTerminationError {
    let expected = pipeline.config().format;
    let mut frame_count: u64 = 0;
    let mut format_warned = false;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return StreamTerminationError::Cancelled,
            frame = source.recv() => match frame {
                Some(frame) => frame,
                None => return StreamTerminationError::Ended,
            },
        };

        if frame.format() != expected {
            if !format_warned {
                warn!(
                    "Dropping frames from {}: {}Hz/{}ch, expected {}Hz/{}ch",
                    participant, frame.sample_rate, frame.channels, expected.sample_rate, expected.channels
                );
                format_warned = true;
            }
            continue;
        }

        if frame_count == 0 {
            info!(
                "First frame from {}: {} samples, {}Hz",
                participant,
                frame.samples.len(),
                frame.sample_rate
            );
        }
        frame_count += 1;

        if frame_count % LEVEL_LOG_INTERVAL == 0 {
            let level = frame.mean_abs_level();
            if level > LEVEL_LOG_FLOOR {
                info!("{} audio level: {:.1}", participant, level);
            }
        }

        let output = pipeline.ingest(&frame.samples);
        frames.fetch_add(1, Ordering::Relaxed);

        let pushed = tokio::select! {
            _ = cancel.cancelled() => return StreamTerminationError::Cancelled,
            pushed = derived.push(output, frame.timestamp_ms) => pushed,
        };
        if let Err(e) = pushed {
            return StreamTerminationError::Sink(e);
        }
    }
}
