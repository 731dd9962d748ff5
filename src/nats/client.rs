//! NATS-backed session transport
//!
//! Sessions are namespaces of NATS subjects. The directory and the join
//! handshake are request/reply; room activity and audio are plain pub/sub.
//! Audio tracks of remote participants are auto-subscribed when published,
//! which mirrors the default behavior of conference SDKs.

use anyhow::{Context, Result};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{
    audio_subject, encode_pcm, events_subject, join_subject, AudioFrameMessage, JoinAck,
    JoinRequest, RoomEvent, DIRECTORY_SUBJECT,
};
use crate::audio::{AudioFormat, AudioFrame};
use crate::session::{
    Credential, FrameStream, RemoteParticipant, SessionConnection, SessionEvent, SessionInfo,
    SessionProtocol, TrackInfo, TrackKind, TrackSink, TrackSpec,
};
use crate::sync::lock;

/// Capacity of event and frame channels
const CHANNEL_CAPACITY: usize = 256;

pub struct NatsSessionProtocol {
    client: Client,
}

impl NatsSessionProtocol {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionProtocol for NatsSessionProtocol {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let reply = self
            .client
            .request(DIRECTORY_SUBJECT.to_string(), Vec::<u8>::new().into())
            .await
            .context("Session directory request failed")?;

        serde_json::from_slice(&reply.payload).context("Invalid session directory reply")
    }

    async fn connect(&self, session: &str, credential: &Credential) -> Result<Arc<dyn SessionConnection>> {
        // Subscribe before the handshake so no room event is missed
        let events_sub = self
            .client
            .subscribe(events_subject(session))
            .await
            .context("Failed to subscribe to session events")?;

        let request = JoinRequest {
            identity: credential.identity.clone(),
            token: credential.token.clone(),
        };
        let reply = self
            .client
            .request(join_subject(session), serde_json::to_vec(&request)?.into())
            .await
            .with_context(|| format!("Join request for session {} failed", session))?;

        let ack: JoinAck = serde_json::from_slice(&reply.payload).context("Invalid join reply")?;
        if !ack.accepted {
            anyhow::bail!(
                "Join rejected: {}",
                ack.reason.unwrap_or_else(|| "no reason given".to_string())
            );
        }

        let participants = ack
            .participants
            .into_iter()
            .filter(|p| p.identity != credential.identity)
            .map(|p| (p.identity.clone(), p))
            .collect();

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection = Arc::new(NatsSessionConnection {
            client: self.client.clone(),
            session: session.to_string(),
            identity: credential.identity.clone(),
            room: Arc::new(Mutex::new(participants)),
            events_tx: events_tx.clone(),
            events_rx: Mutex::new(Some(events_rx)),
            published: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(room_task(
            events_sub,
            Arc::clone(&connection.room),
            events_tx,
            connection.identity.clone(),
            connection.cancel.clone(),
        ));

        Ok(connection)
    }
}

type Room = Arc<Mutex<HashMap<String, RemoteParticipant>>>;

pub struct NatsSessionConnection {
    client: Client,
    session: String,
    identity: String,
    room: Room,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    /// Our published tracks, sid -> format
    published: Mutex<HashMap<String, AudioFormat>>,
    cancel: CancellationToken,
}

impl NatsSessionConnection {
    async fn publish_event(&self, event: &RoomEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(events_subject(&self.session), payload.into())
            .await
            .context("Failed to publish room event")
    }
}

/// Keep the room view current and translate room activity into session events
async fn room_task(
    mut events_sub: async_nats::Subscriber,
    room: Room,
    events_tx: mpsc::Sender<SessionEvent>,
    identity: String,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = events_sub.next() => msg,
        };

        let Some(msg) = msg else {
            let _ = events_tx
                .send(SessionEvent::Disconnected {
                    reason: "event subscription closed".to_string(),
                })
                .await;
            return;
        };

        let event: RoomEvent = match serde_json::from_slice(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to parse room event: {}", e);
                continue;
            }
        };

        for session_event in apply_room_event(&room, &identity, event) {
            let closing = matches!(session_event, SessionEvent::Disconnected { .. });
            if events_tx.send(session_event).await.is_err() || closing {
                return;
            }
        }
    }
}

/// Update the room view and return the session events the change produces
pub(crate) fn apply_room_event(
    room: &Mutex<HashMap<String, RemoteParticipant>>,
    identity: &str,
    event: RoomEvent,
) -> Vec<SessionEvent> {
    let mut room = lock(room);

    match event {
        RoomEvent::ParticipantJoined { mut participant } => {
            if participant.identity == identity {
                return Vec::new();
            }
            for track in participant.tracks.iter_mut().filter(|t| t.is_audio()) {
                track.subscribed = true;
            }
            let events = participant
                .tracks
                .iter()
                .filter(|t| t.is_audio())
                .map(|track| SessionEvent::TrackSubscribed {
                    participant: participant.clone(),
                    track: track.clone(),
                })
                .collect();
            room.insert(participant.identity.clone(), participant);
            events
        }
        RoomEvent::ParticipantLeft { participant } => {
            if room.remove(&participant).is_some() {
                vec![SessionEvent::ParticipantLeft { participant }]
            } else {
                Vec::new()
            }
        }
        RoomEvent::TrackPublished { participant, mut track } => {
            if participant == identity {
                return Vec::new();
            }
            let entry = room
                .entry(participant.clone())
                .or_insert_with(|| RemoteParticipant {
                    identity: participant.clone(),
                    tracks: Vec::new(),
                });
            entry.tracks.retain(|t| t.sid != track.sid);
            track.subscribed = track.is_audio();
            entry.tracks.push(track.clone());

            if track.is_audio() {
                vec![SessionEvent::TrackSubscribed {
                    participant: entry.clone(),
                    track,
                }]
            } else {
                Vec::new()
            }
        }
        RoomEvent::TrackUnpublished { participant, track_sid } => {
            let Some(entry) = room.get_mut(&participant) else {
                return Vec::new();
            };
            let Some(pos) = entry.tracks.iter().position(|t| t.sid == track_sid) else {
                return Vec::new();
            };
            let track = entry.tracks.remove(pos);
            if track.subscribed {
                vec![SessionEvent::TrackUnsubscribed { participant, track }]
            } else {
                Vec::new()
            }
        }
        RoomEvent::SessionClosed => vec![SessionEvent::Disconnected {
            reason: "session closed".to_string(),
        }],
    }
}

/// Decode audio messages into frames until the track ends, the reader goes
/// away or the connection is cancelled
async fn forward_frames<S, P>(
    mut messages: S,
    tx: mpsc::Sender<AudioFrame>,
    cancel: CancellationToken,
    subject: String,
) where
    S: Stream<Item = P> + Unpin,
    P: AsRef<[u8]>,
{
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            msg = messages.next() => match msg {
                Some(payload) => payload,
                None => break,
            },
        };

        let frame_msg: AudioFrameMessage = match serde_json::from_slice(payload.as_ref()) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to parse audio frame on {}: {}", subject, e);
                continue;
            }
        };
        if frame_msg.final_frame {
            break;
        }

        match frame_msg.to_frame() {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Dropping undecodable frame on {}: {:#}", subject, e),
        }
    }
    debug!("Frame stream {} closed", subject);
}

#[async_trait]
impl SessionConnection for NatsSessionConnection {
    fn session(&self) -> &str {
        &self.session
    }

    fn local_identity(&self) -> &str {
        &self.identity
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        lock(&self.events_rx).take()
    }

    async fn list_participants(&self) -> Result<Vec<RemoteParticipant>> {
        let mut participants: Vec<RemoteParticipant> = lock(&self.room).values().cloned().collect();
        participants.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(participants)
    }

    async fn request_subscribe(&self, participant: &str, track_sid: &str) -> Result<()> {
        let subscribed = {
            let mut room = lock(&self.room);
            let entry = room
                .get_mut(participant)
                .with_context(|| format!("Unknown participant {}", participant))?;
            let track = entry
                .tracks
                .iter_mut()
                .find(|t| t.sid == track_sid)
                .with_context(|| format!("Unknown track {} of {}", track_sid, participant))?;
            track.subscribed = true;
            let track = track.clone();
            (entry.clone(), track)
        };

        let (participant, track) = subscribed;
        self.events_tx
            .send(SessionEvent::TrackSubscribed { participant, track })
            .await
            .context("Session event channel closed")
    }

    async fn open_track(&self, participant: &str, track_sid: &str) -> Result<Option<FrameStream>> {
        let deliverable = lock(&self.room)
            .get(participant)
            .and_then(|p| p.tracks.iter().find(|t| t.sid == track_sid))
            .is_some_and(|t| t.subscribed && t.kind == TrackKind::Audio);
        if !deliverable {
            return Ok(None);
        }

        let subject = audio_subject(&self.session, participant, track_sid);
        let sub = self
            .client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to {}", subject))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();

        tokio::spawn(forward_frames(sub.map(|msg| msg.payload), tx, cancel, subject));

        Ok(Some(rx))
    }

    async fn publish_track(&self, spec: &TrackSpec) -> Result<Box<dyn TrackSink>> {
        let sid = format!("TR_{}", uuid::Uuid::new_v4().simple());
        let track = TrackInfo {
            sid: sid.clone(),
            name: spec.name.clone(),
            kind: TrackKind::Audio,
            subscribed: false,
        };

        self.publish_event(&RoomEvent::TrackPublished {
            participant: self.identity.clone(),
            track,
        })
        .await?;
        lock(&self.published).insert(sid.clone(), spec.format);

        Ok(Box::new(NatsTrackSink {
            client: self.client.clone(),
            subject: audio_subject(&self.session, &self.identity, &sid),
            session: self.session.clone(),
            identity: self.identity.clone(),
            sid,
            sequence: 0,
        }))
    }

    async fn unpublish_track(&self, sid: &str) -> Result<()> {
        let format = lock(&self.published).remove(sid);
        let Some(format) = format else {
            return Ok(());
        };

        // Closes the frame stream of anyone listening
        let last = AudioFrameMessage {
            session_id: self.session.clone(),
            participant: self.identity.clone(),
            track_sid: sid.to_string(),
            sequence: u64::MAX,
            pcm: String::new(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            timestamp_ms: 0,
            final_frame: true,
        };
        self.client
            .publish(
                audio_subject(&self.session, &self.identity, sid),
                serde_json::to_vec(&last)?.into(),
            )
            .await
            .context("Failed to publish final frame")?;

        self.publish_event(&RoomEvent::TrackUnpublished {
            participant: self.identity.clone(),
            track_sid: sid.to_string(),
        })
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from session {}", self.session);
        self.cancel.cancel();

        self.publish_event(&RoomEvent::ParticipantLeft {
            participant: self.identity.clone(),
        })
        .await?;

        self.client.flush().await.context("Failed to flush NATS connection")
    }
}

pub struct NatsTrackSink {
    client: Client,
    subject: String,
    session: String,
    identity: String,
    sid: String,
    sequence: u64,
}

#[async_trait]
impl TrackSink for NatsTrackSink {
    fn sid(&self) -> &str {
        &self.sid
    }

    async fn capture_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let message = AudioFrameMessage {
            session_id: self.session.clone(),
            participant: self.identity.clone(),
            track_sid: self.sid.clone(),
            sequence: self.sequence,
            pcm: encode_pcm(&frame.samples),
            sample_rate: frame.sample_rate,
            channels: frame.channels,
            timestamp_ms: frame.timestamp_ms,
            final_frame: false,
        };

        let payload = serde_json::to_vec(&message)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .context("Failed to publish audio frame")?;

        self.sequence += 1;
        Ok(())
    }
}
