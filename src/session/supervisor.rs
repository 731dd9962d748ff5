//! Session supervisor
//!
//! Owns every joined session and the pipelines running inside them. Two
//! independent sources start pipelines: the per-session event task
//! (subscription events) and the recurring poll loop (reconciliation of
//! participants without a claim). Both go through `start_participant`, and the
//! claim taken there makes duplicate triggers harmless.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialIssuer, SessionGrants};
use super::protocol::{
    RemoteParticipant, SessionConnection, SessionEvent, SessionInfo, SessionProtocol, TrackInfo,
};
use super::stats::{PipelineSnapshot, SessionSnapshot, SupervisorSnapshot};
use super::tracker::{Claim, ParticipantTracker};
use super::worker::{self, WorkerContext};
use crate::audio::{EngineProvider, PipelineConfig};
use crate::config::Config;
use crate::error::JoinError;
use crate::sync::lock;

/// The loop counts as alive while it ticked within this many poll intervals
const LIVENESS_INTERVALS: u32 = 3;

/// Runtime settings of the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Prefix of the relay's own identity; matching participants are skipped
    pub identity_prefix: String,
    /// Sessions to join. Empty means discover.
    pub rooms: Vec<String>,
    pub poll_interval: Duration,
    /// Discovery runs on every Nth poll cycle
    pub discovery_every: u64,
    pub subscribe_delay: Duration,
    /// How long `leave` waits for each pipeline and the disconnect before giving up on them
    pub stop_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            identity_prefix: cfg.session.identity_prefix.clone(),
            rooms: cfg.session.rooms.clone(),
            poll_interval: cfg.supervisor.poll_interval(),
            discovery_every: cfg.supervisor.discovery_every.max(1),
            subscribe_delay: cfg.supervisor.subscribe_delay(),
            stop_timeout: cfg.supervisor.stop_timeout(),
            pipeline: cfg.pipeline_config(),
        }
    }
}

/// Joins sessions and keeps exactly one pipeline per participant running
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SupervisorSettings,
    protocol: Arc<dyn SessionProtocol>,
    issuer: Arc<dyn CredentialIssuer>,
    engines: EngineProvider,
    tracker: Arc<ParticipantTracker>,
    sessions: Mutex<HashMap<String, Arc<ActiveSession>>>,
    /// Sessions with a join in flight
    joining: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<Instant>>,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    poll_count: AtomicU64,
    next_pipeline_id: AtomicU64,
}

/// One joined session
struct ActiveSession {
    name: String,
    connection: Arc<dyn SessionConnection>,
    joined_at: DateTime<Utc>,
    /// Cancels the event task and every pipeline of the session
    cancel: CancellationToken,
    /// Fired once teardown has completed
    closed: CancellationToken,
    leaving: AtomicBool,
    pipelines: Mutex<HashMap<String, PipelineHandle>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

struct PipelineHandle {
    id: u64,
    track_sid: String,
    started_at: DateTime<Utc>,
    frames: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSession {
    /// Drop a finished pipeline's handle, unless a newer pipeline replaced it
    fn remove_pipeline(&self, participant: &str, id: u64) {
        let mut pipelines = lock(&self.pipelines);
        if pipelines.get(participant).is_some_and(|h| h.id == id) {
            pipelines.remove(participant);
        }
    }

    /// Cancel a participant's pipeline; with `track_sid`, only if it processes that track
    fn stop_pipeline(&self, participant: &str, track_sid: Option<&str>) {
        let pipelines = lock(&self.pipelines);
        if let Some(handle) = pipelines.get(participant) {
            if track_sid.map_or(true, |sid| sid == handle.track_sid) {
                debug!("Cancelling pipeline for {} in {}", participant, self.name);
                handle.cancel.cancel();
            }
        }
    }
}

impl SessionSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        protocol: Arc<dyn SessionProtocol>,
        issuer: Arc<dyn CredentialIssuer>,
        engines: EngineProvider,
    ) -> Self {
        Self::with_tracker(settings, protocol, issuer, engines, ParticipantTracker::new_shared())
    }

    pub fn with_tracker(
        settings: SupervisorSettings,
        protocol: Arc<dyn SessionProtocol>,
        issuer: Arc<dyn CredentialIssuer>,
        engines: EngineProvider,
        tracker: Arc<ParticipantTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                protocol,
                issuer,
                engines,
                tracker,
                sessions: Mutex::new(HashMap::new()),
                joining: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
                loop_task: Mutex::new(None),
                heartbeat: Mutex::new(None),
                last_poll: Mutex::new(None),
                poll_count: AtomicU64::new(0),
                next_pipeline_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn tracker(&self) -> Arc<ParticipantTracker> {
        Arc::clone(&self.inner.tracker)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Identity the relay joins a session with
    pub fn identity_for(&self, session: &str) -> String {
        format!("{}-{}", self.inner.settings.identity_prefix, session)
    }

    fn is_own_identity(&self, identity: &str) -> bool {
        identity.starts_with(&self.inner.settings.identity_prefix)
    }

    /// Join the configured (or discovered) sessions and start the poll loop
    pub async fn start(&self) -> Result<()> {
        if lock(&self.inner.loop_task).is_some() {
            warn!("Supervisor already started");
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            anyhow::bail!("Supervisor has been stopped");
        }

        info!("Noise enhancement relay starting");
        *lock(&self.inner.heartbeat) = Some(Instant::now());

        if self.inner.settings.rooms.is_empty() {
            info!("Discovering active sessions...");
        } else {
            info!("Joining specific sessions: {:?}", self.inner.settings.rooms);
        }
        self.discovery_cycle().await;

        let this = self.clone();
        let task = tokio::spawn(async move { this.run_loop().await });
        *lock(&self.inner.loop_task) = Some(task);

        Ok(())
    }

    /// Stop the poll loop and leave every session through the regular leave path
    pub async fn stop(&self) {
        info!("Stopping supervisor");
        self.inner.shutdown.cancel();

        let task = lock(&self.inner.loop_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Supervisor loop panicked: {}", e);
            }
        }

        let names: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        for name in names {
            self.leave(&name).await;
        }

        info!("Supervisor stopped");
    }

    async fn run_loop(&self) {
        let period = self.inner.settings.poll_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut count: u64 = 0;

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    count += 1;
                    self.poll_cycle(count).await;
                }
            }
        }

        info!("Supervisor loop stopped after {} cycles", count);
    }

    /// One poll cycle: discovery on every Nth cycle, reconciliation on every cycle
    pub async fn poll_cycle(&self, count: u64) {
        let discovery = count % self.inner.settings.discovery_every == 0;
        if discovery {
            self.discovery_cycle().await;
        }

        self.reconcile(discovery).await;

        *lock(&self.inner.heartbeat) = Some(Instant::now());
        *lock(&self.inner.last_poll) = Some(Utc::now());
        self.inner.poll_count.store(count, Ordering::SeqCst);
    }

    /// Whether the poll loop is running and ticked recently
    pub fn is_alive(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let heartbeat = *lock(&self.inner.heartbeat);
        match heartbeat {
            Some(at) => at.elapsed() <= self.inner.settings.poll_interval * LIVENESS_INTERVALS,
            None => false,
        }
    }

    /// Sessions with participants that are neither joined nor being joined
    pub async fn discover_sessions(&self) -> Result<Vec<SessionInfo>> {
        let listed = self
            .inner
            .protocol
            .list_sessions()
            .await
            .context("Failed to list sessions")?;

        let sessions = lock(&self.inner.sessions);
        let joining = lock(&self.inner.joining);

        Ok(listed
            .into_iter()
            .filter(|s| s.num_participants > 0)
            .filter(|s| !sessions.contains_key(&s.name) && !joining.contains(&s.name))
            .collect())
    }

    async fn discovery_cycle(&self) {
        if !self.inner.settings.rooms.is_empty() {
            for room in &self.inner.settings.rooms {
                if !self.is_joined(room) {
                    self.join_logged(room).await;
                }
            }
            return;
        }

        match self.discover_sessions().await {
            Ok(found) => {
                for info in found {
                    info!(
                        "Discovered active session: {} ({} participants)",
                        info.name, info.num_participants
                    );
                    self.join_logged(&info.name).await;
                }
            }
            Err(e) => error!("Error discovering sessions: {:#}", e),
        }
    }

    async fn join_logged(&self, session: &str) {
        match self.join(session).await {
            Ok(()) => {}
            Err(JoinError::AlreadyJoined(_)) => debug!("Session {} already joined", session),
            Err(e) => error!("Failed to join session {}: {}", session, e),
        }
    }

    /// Join a session and start processing everyone already in it
    pub async fn join(&self, session: &str) -> Result<(), JoinError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JoinError::ShuttingDown);
        }

        {
            let sessions = lock(&self.inner.sessions);
            let mut joining = lock(&self.inner.joining);
            if sessions.contains_key(session) || !joining.insert(session.to_string()) {
                return Err(JoinError::AlreadyJoined(session.to_string()));
            }
        }

        let result = self.connect_session(session).await;
        lock(&self.inner.joining).remove(session);
        let active = result?;

        self.start_existing(&active).await;
        Ok(())
    }

    async fn connect_session(&self, session: &str) -> Result<Arc<ActiveSession>, JoinError> {
        info!("Joining session: {}", session);

        let identity = self.identity_for(session);
        let credential = self
            .inner
            .issuer
            .issue(&identity, session, &SessionGrants::relay(session))
            .map_err(|e| JoinError::Credential {
                session: session.to_string(),
                reason: format!("{:#}", e),
            })?;

        let connection = self
            .inner
            .protocol
            .connect(session, &credential)
            .await
            .map_err(|source| JoinError::Connect {
                session: session.to_string(),
                source,
            })?;

        let events = connection.take_events();
        let active = Arc::new(ActiveSession {
            name: session.to_string(),
            connection,
            joined_at: Utc::now(),
            cancel: self.inner.shutdown.child_token(),
            closed: CancellationToken::new(),
            leaving: AtomicBool::new(false),
            pipelines: Mutex::new(HashMap::new()),
            event_task: Mutex::new(None),
        });

        let registered = {
            let mut sessions = lock(&self.inner.sessions);
            if self.inner.shutdown.is_cancelled() {
                false
            } else {
                sessions.insert(session.to_string(), Arc::clone(&active));
                true
            }
        };
        if !registered {
            if let Err(e) = active.connection.disconnect().await {
                warn!("Failed to disconnect from {}: {:#}", session, e);
            }
            return Err(JoinError::ShuttingDown);
        }

        match events {
            Some(events) => {
                let this = self.clone();
                let target = Arc::clone(&active);
                let task = tokio::spawn(async move { this.handle_events(target, events).await });
                *lock(&active.event_task) = Some(task);
            }
            None => warn!("Session {} delivered no event stream", session),
        }

        info!("Connected to session: {}", session);
        Ok(active)
    }

    async fn start_existing(&self, session: &Arc<ActiveSession>) {
        match session.connection.list_participants().await {
            Ok(participants) => {
                info!(
                    "Found {} existing participants in {}",
                    participants.len(),
                    session.name
                );
                for participant in &participants {
                    self.start_participant(session, participant, None);
                }
            }
            Err(e) => warn!("Failed to list participants of {}: {:#}", session.name, e),
        }
    }

    async fn handle_events(&self, session: Arc<ActiveSession>, mut events: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                _ = session.cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(SessionEvent::TrackSubscribed { participant, mut track }) => {
                    if !track.is_audio() {
                        continue;
                    }
                    info!("Subscribed to audio from: {}", participant.identity);
                    track.subscribed = true;
                    self.start_participant(&session, &participant, Some(&track));
                }
                Some(SessionEvent::TrackUnsubscribed { participant, track }) => {
                    info!("Unsubscribed from: {}", participant);
                    session.stop_pipeline(&participant, Some(&track.sid));
                }
                Some(SessionEvent::ParticipantLeft { participant }) => {
                    info!("Participant left {}: {}", session.name, participant);
                    session.stop_pipeline(&participant, None);
                }
                Some(SessionEvent::Disconnected { reason }) => {
                    warn!("Session {} disconnected: {}", session.name, reason);
                    self.spawn_leave(&session.name);
                    break;
                }
                None => {
                    warn!("Event stream of session {} closed", session.name);
                    self.spawn_leave(&session.name);
                    break;
                }
            }
        }
    }

    /// Claim and start every unclaimed participant of every joined session
    async fn reconcile(&self, verbose: bool) {
        let sessions: Vec<Arc<ActiveSession>> = lock(&self.inner.sessions).values().cloned().collect();

        for session in sessions {
            if session.cancel.is_cancelled() {
                continue;
            }

            let participants = match session.connection.list_participants().await {
                Ok(participants) => participants,
                Err(e) => {
                    error!("Error polling session {}: {:#}", session.name, e);
                    continue;
                }
            };

            if verbose {
                info!(
                    "Session {}: {} participants, {} being processed",
                    session.name,
                    participants.len(),
                    self.inner.tracker.len()
                );
            }

            for participant in &participants {
                if self.is_own_identity(&participant.identity)
                    || self.inner.tracker.is_claimed(&session.name, &participant.identity)
                {
                    continue;
                }
                if participant.first_audio_track().is_some() {
                    info!("Found new participant: {}", participant.identity);
                    self.start_participant(&session, participant, None);
                }
            }
        }
    }

    /// Claim a participant and spawn its pipeline. Returns false if nothing was started.
    fn start_participant(
        &self,
        session: &Arc<ActiveSession>,
        participant: &RemoteParticipant,
        track: Option<&TrackInfo>,
    ) -> bool {
        if self.is_own_identity(&participant.identity) {
            debug!("Skipping agent participant: {}", participant.identity);
            return false;
        }

        let Some(track) = track.or_else(|| participant.first_audio_track()).cloned() else {
            debug!("Participant {} has no audio track yet", participant.identity);
            return false;
        };

        let Some(claim) = self.inner.tracker.claim(&session.name, &participant.identity) else {
            debug!("Already processing {}", participant.identity);
            return false;
        };

        self.spawn_pipeline(session, claim, participant.identity.clone(), track)
    }

    fn spawn_pipeline(
        &self,
        session: &Arc<ActiveSession>,
        claim: Claim,
        participant: String,
        track: TrackInfo,
    ) -> bool {
        let frames = Arc::new(AtomicU64::new(0));
        let ctx = WorkerContext {
            connection: Arc::clone(&session.connection),
            pipeline: self.inner.settings.pipeline.clone(),
            engine: self.inner.engines.engine(),
            subscribe_delay: self.inner.settings.subscribe_delay,
            frames: Arc::clone(&frames),
        };

        // Held across spawn + insert so a leave in progress either sees this
        // handle or this call sees the cancelled session
        let mut pipelines = lock(&session.pipelines);
        if session.cancel.is_cancelled() {
            return false;
        }

        let id = self.inner.next_pipeline_id.fetch_add(1, Ordering::Relaxed);
        let cancel = session.cancel.child_token();
        let track_sid = track.sid.clone();

        let task = {
            let session = Arc::clone(session);
            let participant = participant.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match worker::run_participant(ctx, &participant, track, cancel).await {
                    Ok(reason) => info!(
                        "Finished processing {} in {}: {}",
                        participant, session.name, reason
                    ),
                    Err(e) => warn!(
                        "Pipeline for {} in {} stopped: {:#}",
                        participant, session.name, e
                    ),
                }
                session.remove_pipeline(&participant, id);
                drop(claim);
            })
        };

        info!("Starting processing for {} in {}", participant, session.name);
        pipelines.insert(
            participant,
            PipelineHandle {
                id,
                track_sid,
                started_at: Utc::now(),
                frames,
                cancel,
                task,
            },
        );
        true
    }

    fn spawn_leave(&self, session: &str) {
        let this = self.clone();
        let session = session.to_string();
        tokio::spawn(async move {
            this.leave(&session).await;
        });
    }

    /// Tear down every pipeline of a session, disconnect, then forget it.
    /// Returns false if the session is unknown or another caller tore it down.
    pub async fn leave(&self, session: &str) -> bool {
        let active = lock(&self.inner.sessions).get(session).cloned();
        let Some(active) = active else {
            return false;
        };

        if active.leaving.swap(true, Ordering::SeqCst) {
            // Another caller is tearing it down; wait for it to finish
            active.closed.cancelled().await;
            return false;
        }

        info!("Leaving session: {}", session);
        active.cancel.cancel();

        let stop_timeout = self.inner.settings.stop_timeout;
        let handles: Vec<(String, PipelineHandle)> = lock(&active.pipelines).drain().collect();
        let stops = handles.into_iter().map(|(participant, mut handle)| async move {
            match tokio::time::timeout(stop_timeout, &mut handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Pipeline task for {} panicked: {}", participant, e),
                Err(_) => {
                    warn!(
                        "Pipeline for {} did not stop within {:?}, aborting",
                        participant, stop_timeout
                    );
                    handle.task.abort();
                    // Resolves once the task is dropped, and its claim with it
                    if let Err(e) = handle.task.await {
                        if e.is_panic() {
                            error!("Pipeline task for {} panicked: {}", participant, e);
                        }
                    }
                }
            }
        });
        futures::future::join_all(stops).await;

        let event_task = lock(&active.event_task).take();
        if let Some(task) = event_task {
            if let Err(e) = task.await {
                error!("Event task of {} panicked: {}", session, e);
            }
        }

        match tokio::time::timeout(stop_timeout, active.connection.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to disconnect from {}: {:#}", session, e),
            Err(_) => warn!("Disconnect from {} timed out after {:?}", session, stop_timeout),
        }

        lock(&self.inner.sessions).remove(session);
        active.closed.cancel();

        info!("Left session: {}", session);
        true
    }

    pub fn is_joined(&self, session: &str) -> bool {
        lock(&self.inner.sessions).contains_key(session)
    }

    pub fn joined_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        names.sort();
        names
    }

    /// Participants with a registered pipeline in a session
    pub fn active_pipelines(&self, session: &str) -> Vec<String> {
        let active = lock(&self.inner.sessions).get(session).cloned();
        let Some(active) = active else {
            return Vec::new();
        };
        let mut participants: Vec<String> = lock(&active.pipelines).keys().cloned().collect();
        participants.sort();
        participants
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let sessions: Vec<Arc<ActiveSession>> = lock(&self.inner.sessions).values().cloned().collect();

        let mut sessions: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|session| {
                let mut pipelines: Vec<PipelineSnapshot> = lock(&session.pipelines)
                    .iter()
                    .map(|(participant, handle)| PipelineSnapshot {
                        participant: participant.clone(),
                        track_sid: handle.track_sid.clone(),
                        started_at: handle.started_at,
                        frames: handle.frames.load(Ordering::Relaxed),
                    })
                    .collect();
                pipelines.sort_by(|a, b| a.participant.cmp(&b.participant));

                SessionSnapshot {
                    name: session.name.clone(),
                    joined_at: session.joined_at,
                    pipelines,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));

        SupervisorSnapshot {
            alive: self.is_alive(),
            poll_count: self.inner.poll_count.load(Ordering::SeqCst),
            last_poll: *lock(&self.inner.last_poll),
            claims: self.inner.tracker.len(),
            sessions,
        }
    }
}
