// Shared fixtures for the integration tests: an in-memory session transport
// and scripted enhancement engines.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use denoise_relay::audio::engine::PassthroughEngine;
use denoise_relay::session::{
    Credential, CredentialIssuer, FrameStream, RemoteParticipant, SessionConnection, SessionEvent,
    SessionGrants, SessionInfo, SessionProtocol, TrackInfo, TrackKind, TrackSink, TrackSpec,
};
use denoise_relay::{
    AudioFormat, AudioFrame, EngineMode, EngineProvider, EnhanceParams, EnhancementEngine,
    PipelineConfig, SessionSupervisor, SupervisorSettings, TransformError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const FORMAT: AudioFormat = AudioFormat {
    sample_rate: 48000,
    channels: 1,
};

pub const FRAME: usize = 480;

pub fn pipeline_config(frame: usize, context: usize) -> PipelineConfig {
    PipelineConfig {
        format: FORMAT,
        frame_samples: frame,
        min_context_samples: context,
        post_gain: 1.0,
        attenuation_limit_db: 100.0,
    }
}

pub fn settings() -> SupervisorSettings {
    SupervisorSettings {
        identity_prefix: "deepfilter-agent".to_string(),
        rooms: Vec::new(),
        // Tests drive poll cycles by hand
        poll_interval: Duration::from_secs(3600),
        discovery_every: 6,
        subscribe_delay: Duration::from_millis(10),
        stop_timeout: Duration::from_millis(200),
        pipeline: pipeline_config(FRAME, FRAME * 3),
    }
}

pub fn supervisor(protocol: Arc<FakeProtocol>) -> SessionSupervisor {
    supervisor_with(settings(), protocol)
}

pub fn supervisor_with(settings: SupervisorSettings, protocol: Arc<FakeProtocol>) -> SessionSupervisor {
    SessionSupervisor::new(
        settings,
        protocol,
        Arc::new(StaticIssuer),
        EngineProvider::from_fn(EngineMode::Shared, || Arc::new(PassthroughEngine)),
    )
}

pub fn frame(value: i16, len: usize, timestamp_ms: u64) -> AudioFrame {
    AudioFrame::new(vec![value; len], FORMAT, timestamp_ms)
}

pub fn audio_track(sid: &str, subscribed: bool) -> TrackInfo {
    TrackInfo {
        sid: sid.to_string(),
        name: "microphone".to_string(),
        kind: TrackKind::Audio,
        subscribed,
    }
}

pub fn participant(identity: &str, track: TrackInfo) -> RemoteParticipant {
    RemoteParticipant {
        identity: identity.to_string(),
        tracks: vec![track],
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct StaticIssuer;

impl CredentialIssuer for StaticIssuer {
    fn issue(&self, identity: &str, session: &str, _grants: &SessionGrants) -> Result<Credential> {
        Ok(Credential {
            identity: identity.to_string(),
            token: format!("token-{}", session),
        })
    }
}

/// Passthrough engine that records buffer lengths and fails on chosen calls
#[derive(Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<usize>>,
    fail_on: HashSet<usize>,
    /// Truncate the output to this many samples
    truncate_to: Option<usize>,
}

impl ScriptedEngine {
    pub fn failing_on(calls: &[usize]) -> Self {
        Self {
            fail_on: calls.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn truncating(len: usize) -> Self {
        Self {
            truncate_to: Some(len),
            ..Self::default()
        }
    }

    /// Buffer length seen by each call
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

impl EnhancementEngine for ScriptedEngine {
    fn enhance(&self, buffer: &[f32], _params: &EnhanceParams) -> Result<Vec<f32>, TransformError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(buffer.len());
            calls.len() - 1
        };

        if self.fail_on.contains(&call) {
            return Err(TransformError::Engine(format!("scripted failure on call {}", call)));
        }

        let mut out = buffer.to_vec();
        if let Some(len) = self.truncate_to {
            out.truncate(len);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A derived track published by the relay
#[derive(Clone)]
pub struct PublishedTrack {
    pub name: String,
    pub sid: String,
    pub frames: Arc<Mutex<Vec<AudioFrame>>>,
    pub unpublished: Arc<AtomicBool>,
}

impl PublishedTrack {
    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn is_unpublished(&self) -> bool {
        self.unpublished.load(Ordering::SeqCst)
    }
}

/// In-memory room that a fake connection is attached to
pub struct FakeRoom {
    pub name: String,
    participants: Mutex<Vec<RemoteParticipant>>,
    feeds: Mutex<HashMap<String, Vec<mpsc::Sender<AudioFrame>>>>,
    published: Mutex<Vec<PublishedTrack>>,
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    pub subscribe_requests: AtomicUsize,
    pub unpublish_calls: AtomicUsize,
    pub disconnects: AtomicUsize,
    next_sid: AtomicUsize,
    undeliverable: AtomicBool,
    stall_publish: AtomicBool,
    stall_unpublish: AtomicBool,
    stall_capture: Arc<AtomicBool>,
}

impl FakeRoom {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            participants: Mutex::new(Vec::new()),
            feeds: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            subscribe_requests: AtomicUsize::new(0),
            unpublish_calls: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            next_sid: AtomicUsize::new(0),
            undeliverable: AtomicBool::new(false),
            stall_publish: AtomicBool::new(false),
            stall_unpublish: AtomicBool::new(false),
            stall_capture: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, `open_track` reports every track as not deliverable
    pub fn set_undeliverable(&self, on: bool) {
        self.undeliverable.store(on, Ordering::SeqCst);
    }

    /// While set, `publish_track` never completes
    pub fn stall_publish(&self, on: bool) {
        self.stall_publish.store(on, Ordering::SeqCst);
    }

    /// While set, `unpublish_track` never completes
    pub fn stall_unpublish(&self, on: bool) {
        self.stall_unpublish.store(on, Ordering::SeqCst);
    }

    /// While set, publishing a frame on any derived track never completes
    pub fn stall_capture(&self, on: bool) {
        self.stall_capture.store(on, Ordering::SeqCst);
    }

    pub fn add_participant(&self, participant: RemoteParticipant) {
        self.participants.lock().unwrap().push(participant);
    }

    pub fn remove_participant(&self, identity: &str) {
        self.participants
            .lock()
            .unwrap()
            .retain(|p| p.identity != identity);
        self.feeds.lock().unwrap().remove(identity);
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().unwrap().len()
    }

    /// Deliver an event to the connected relay
    pub async fn emit(&self, event: SessionEvent) {
        let tx = self.events.lock().unwrap().clone();
        let tx = tx.expect("no connection attached to the room");
        tx.send(event).await.expect("event receiver dropped");
    }

    /// Push a frame to every open stream of a participant's track
    pub async fn send_frame(&self, identity: &str, frame: AudioFrame) -> usize {
        let senders = self
            .feeds
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for tx in senders {
            if tx.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// End a participant's track: every open stream closes
    pub fn end_track(&self, identity: &str) {
        self.feeds.lock().unwrap().remove(identity);
    }

    /// Streams opened for a participant that are still being read
    pub fn open_streams(&self, identity: &str) -> usize {
        self.feeds
            .lock()
            .unwrap()
            .get(identity)
            .map_or(0, |feeds| feeds.iter().filter(|tx| !tx.is_closed()).count())
    }

    pub fn published(&self) -> Vec<PublishedTrack> {
        self.published.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> Vec<PublishedTrack> {
        self.published()
            .into_iter()
            .filter(|t| !t.is_unpublished())
            .collect()
    }
}

/// Session directory over in-memory rooms
#[derive(Default)]
pub struct FakeProtocol {
    rooms: Mutex<HashMap<String, Arc<FakeRoom>>>,
    refuse: Mutex<HashSet<String>>,
    pub connects: AtomicUsize,
}

impl FakeProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room(&self, name: &str) -> Arc<FakeRoom> {
        let mut rooms = self.rooms.lock().unwrap();
        Arc::clone(
            rooms
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(FakeRoom::new(name))),
        )
    }

    /// Make connects to `name` fail until `accept` is called
    pub fn refuse(&self, name: &str) {
        self.refuse.lock().unwrap().insert(name.to_string());
    }

    pub fn accept(&self, name: &str) {
        self.refuse.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl SessionProtocol for FakeProtocol {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let rooms: Vec<Arc<FakeRoom>> = self.rooms.lock().unwrap().values().cloned().collect();
        Ok(rooms
            .iter()
            .map(|room| SessionInfo {
                name: room.name.clone(),
                num_participants: room.participant_count() as u32,
            })
            .collect())
    }

    async fn connect(&self, session: &str, credential: &Credential) -> Result<Arc<dyn SessionConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.lock().unwrap().contains(session) {
            bail!("connection to {} refused", session);
        }

        let room = self.room(session);
        let (tx, rx) = mpsc::channel(64);
        *room.events.lock().unwrap() = Some(tx);

        Ok(Arc::new(FakeConnection {
            room,
            identity: credential.identity.clone(),
            events: Mutex::new(Some(rx)),
        }))
    }
}

pub struct FakeConnection {
    room: Arc<FakeRoom>,
    identity: String,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

#[async_trait]
impl SessionConnection for FakeConnection {
    fn session(&self) -> &str {
        &self.room.name
    }

    fn local_identity(&self) -> &str {
        &self.identity
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.lock().unwrap().take()
    }

    async fn list_participants(&self) -> Result<Vec<RemoteParticipant>> {
        Ok(self.room.participants.lock().unwrap().clone())
    }

    async fn request_subscribe(&self, participant: &str, track_sid: &str) -> Result<()> {
        self.room.subscribe_requests.fetch_add(1, Ordering::SeqCst);
        let mut participants = self.room.participants.lock().unwrap();
        for p in participants.iter_mut().filter(|p| p.identity == participant) {
            for track in p.tracks.iter_mut().filter(|t| t.sid == track_sid) {
                track.subscribed = true;
            }
        }
        Ok(())
    }

    async fn open_track(&self, participant: &str, track_sid: &str) -> Result<Option<FrameStream>> {
        if self.room.undeliverable.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let subscribed = self
            .room
            .participants
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.identity == participant)
            .flat_map(|p| p.tracks.iter())
            .any(|t| t.sid == track_sid && t.subscribed);
        if !subscribed {
            return Ok(None);
        }

        let (tx, rx) = mpsc::channel(256);
        self.room
            .feeds
            .lock()
            .unwrap()
            .entry(participant.to_string())
            .or_default()
            .push(tx);
        Ok(Some(rx))
    }

    async fn publish_track(&self, spec: &TrackSpec) -> Result<Box<dyn TrackSink>> {
        if self.room.stall_publish.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let n = self.room.next_sid.fetch_add(1, Ordering::SeqCst);
        let track = PublishedTrack {
            name: spec.name.clone(),
            sid: format!("TR_{}", n),
            frames: Arc::new(Mutex::new(Vec::new())),
            unpublished: Arc::new(AtomicBool::new(false)),
        };
        self.room.published.lock().unwrap().push(track.clone());
        Ok(Box::new(FakeSink {
            track,
            stall: Arc::clone(&self.room.stall_capture),
        }))
    }

    async fn unpublish_track(&self, sid: &str) -> Result<()> {
        self.room.unpublish_calls.fetch_add(1, Ordering::SeqCst);
        if self.room.stall_unpublish.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let published = self.room.published.lock().unwrap();
        match published.iter().find(|t| t.sid == sid) {
            Some(track) => {
                track.unpublished.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => bail!("unknown track {}", sid),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.room.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeSink {
    track: PublishedTrack,
    stall: Arc<AtomicBool>,
}

#[async_trait]
impl TrackSink for FakeSink {
    fn sid(&self) -> &str {
        &self.track.sid
    }

    async fn capture_frame(&mut self, frame: AudioFrame) -> Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.track.is_unpublished() {
            bail!("track {} is unpublished", self.track.sid);
        }
        self.track.frames.lock().unwrap().push(frame);
        Ok(())
    }
}
