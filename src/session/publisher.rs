use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::protocol::{SessionConnection, TrackSink, TrackSpec};
use crate::audio::{AudioFormat, AudioFrame};

/// Suffix appended to a participant identity to name its enhanced track
pub const DERIVED_TRACK_SUFFIX: &str = "_enhanced";

pub fn derived_track_name(participant: &str) -> String {
    format!("{}{}", participant, DERIVED_TRACK_SUFFIX)
}

/// Publishes derived tracks into a session
pub struct TrackPublisher;

impl TrackPublisher {
    /// Register the outgoing track before any frame exists, so early
    /// listeners find it in place
    pub async fn publish(
        connection: Arc<dyn SessionConnection>,
        track_name: &str,
        format: AudioFormat,
    ) -> Result<DerivedTrack> {
        let spec = TrackSpec {
            name: track_name.to_string(),
            format,
        };

        let sink = connection
            .publish_track(&spec)
            .await
            .with_context(|| format!("Failed to publish track {}", track_name))?;

        info!(
            "Publishing enhanced track {} ({}) in session {}",
            track_name,
            sink.sid(),
            connection.session()
        );

        Ok(DerivedTrack {
            name: track_name.to_string(),
            sid: sink.sid().to_string(),
            format,
            connection,
            sink: Some(sink),
            frames_published: 0,
        })
    }
}

/// The enhanced track republished for one pipeline
pub struct DerivedTrack {
    name: String,
    sid: String,
    format: AudioFormat,
    connection: Arc<dyn SessionConnection>,
    sink: Option<Box<dyn TrackSink>>,
    frames_published: u64,
}

impl DerivedTrack {
    /// Publish one frame of samples in the track's format
    pub async fn push(&mut self, samples: Vec<i16>, timestamp_ms: u64) -> Result<()> {
        self.push_frame(AudioFrame::new(samples, self.format, timestamp_ms))
            .await
    }

    pub async fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        if frame.format() != self.format {
            anyhow::bail!(
                "Frame format {}Hz/{}ch does not match track {} ({}Hz/{}ch)",
                frame.sample_rate,
                frame.channels,
                self.name,
                self.format.sample_rate,
                self.format.channels
            );
        }

        let sink = self
            .sink
            .as_mut()
            .with_context(|| format!("Track {} is already unpublished", self.name))?;

        sink.capture_frame(frame).await?;
        self.frames_published += 1;
        Ok(())
    }

    /// Unpublish the track. Later calls do nothing.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.sink.take().is_none() {
            return Ok(());
        }

        self.connection
            .unpublish_track(&self.sid)
            .await
            .with_context(|| format!("Failed to unpublish track {}", self.name))?;

        info!(
            "Unpublished enhanced track {} after {} frames",
            self.name, self.frames_published
        );
        Ok(())
    }

    pub fn is_published(&self) -> bool {
        self.sink.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published
    }
}

impl Drop for DerivedTrack {
    fn drop(&mut self) {
        if self.sink.is_some() {
            warn!("Enhanced track {} dropped without teardown", self.name);
        }
    }
}
