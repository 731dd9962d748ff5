//! Session transport abstraction
//!
//! The relay never talks to a conference server directly. Everything it needs
//! (listing sessions, joining, subscribing, pulling frames, publishing the
//! derived track) goes through these traits. `crate::nats` provides the
//! bundled implementation.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::credentials::Credential;
use crate::audio::{AudioFormat, AudioFrame};

/// A session as reported by the session directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub num_participants: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A track publication of a remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub sid: String,
    pub name: String,
    pub kind: TrackKind,
    /// Whether the local participant is subscribed to it
    #[serde(default)]
    pub subscribed: bool,
}

impl TrackInfo {
    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub identity: String,
    #[serde(default)]
    pub tracks: Vec<TrackInfo>,
}

impl RemoteParticipant {
    pub fn first_audio_track(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.is_audio())
    }
}

/// Events delivered by a joined session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A subscription took effect
    TrackSubscribed {
        participant: RemoteParticipant,
        track: TrackInfo,
    },
    /// A subscription ended (track unpublished or unsubscribed)
    TrackUnsubscribed { participant: String, track: TrackInfo },
    ParticipantLeft { participant: String },
    /// The transport lost the session
    Disconnected { reason: String },
}

/// Outgoing track registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub name: String,
    pub format: AudioFormat,
}

/// Ordered PCM frames from a subscribed track; closes when the track ends
pub type FrameStream = mpsc::Receiver<AudioFrame>;

/// Destination of a published track
#[async_trait]
pub trait TrackSink: Send {
    /// Track SID assigned at publish time
    fn sid(&self) -> &str;

    async fn capture_frame(&mut self, frame: AudioFrame) -> Result<()>;
}

/// A live connection to one session
#[async_trait]
pub trait SessionConnection: Send + Sync {
    fn session(&self) -> &str;

    /// Identity the relay joined with
    fn local_identity(&self) -> &str;

    /// Take the event receiver. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>>;

    async fn list_participants(&self) -> Result<Vec<RemoteParticipant>>;

    /// Ask for a subscription. It takes effect asynchronously.
    async fn request_subscribe(&self, participant: &str, track_sid: &str) -> Result<()>;

    /// Open the frame stream of a subscribed track, `None` if it is not deliverable yet
    async fn open_track(&self, participant: &str, track_sid: &str) -> Result<Option<FrameStream>>;

    async fn publish_track(&self, spec: &TrackSpec) -> Result<Box<dyn TrackSink>>;

    async fn unpublish_track(&self, sid: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Session directory and connection factory
#[async_trait]
pub trait SessionProtocol: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    async fn connect(&self, session: &str, credential: &Credential) -> Result<Arc<dyn SessionConnection>>;
}
