use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::audio::{AudioFormat, AudioFrame};
use crate::session::{RemoteParticipant, TrackInfo};

/// Request/reply subject of the session directory
pub const DIRECTORY_SUBJECT: &str = "relay.directory.sessions";

pub fn join_subject(session: &str) -> String {
    format!("session.{}.join", session)
}

pub fn events_subject(session: &str) -> String {
    format!("session.{}.events", session)
}

pub fn audio_subject(session: &str, participant: &str, track_sid: &str) -> String {
    format!("session.{}.audio.{}.{}", session, participant, track_sid)
}

/// Audio frame message carried on a track's audio subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    pub session_id: String,
    pub participant: String,
    pub track_sid: String,
    pub sequence: u64,
    pub pcm: String, // Base64-encoded little-endian i16 PCM
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_ms: u64,
    /// Last message of the track
    #[serde(rename = "final")]
    pub final_frame: bool,
}

impl AudioFrameMessage {
    pub fn to_frame(&self) -> Result<AudioFrame> {
        let samples = decode_pcm(&self.pcm)?;
        let format = AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        };
        Ok(AudioFrame::new(samples, format, self.timestamp_ms))
    }
}

/// Join handshake request sent to `session.<name>.join`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub identity: String,
    pub token: String,
}

/// Reply to a join request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAck {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Participants present at join time
    #[serde(default)]
    pub participants: Vec<RemoteParticipant>,
}

/// Room activity broadcast on `session.<name>.events`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    ParticipantJoined {
        participant: RemoteParticipant,
    },
    ParticipantLeft {
        participant: String,
    },
    TrackPublished {
        participant: String,
        track: TrackInfo,
    },
    TrackUnpublished {
        participant: String,
        track_sid: String,
    },
    SessionClosed,
}

pub fn encode_pcm(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_pcm(pcm: &str) -> Result<Vec<i16>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(pcm)
        .context("Invalid base64 PCM payload")?;

    if bytes.len() % 2 != 0 {
        anyhow::bail!("PCM payload has odd length {}", bytes.len());
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
