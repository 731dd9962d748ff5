use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the supervisor, served on `/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    /// Whether the poll loop has ticked recently
    pub alive: bool,

    /// Poll cycles completed
    pub poll_count: u64,

    /// When the last poll cycle ran
    pub last_poll: Option<DateTime<Utc>>,

    /// Processing claims held across all sessions
    pub claims: usize,

    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub name: String,
    pub joined_at: DateTime<Utc>,
    pub pipelines: Vec<PipelineSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub participant: String,
    pub track_sid: String,
    pub started_at: DateTime<Utc>,
    /// Frames run through the pipeline so far
    pub frames: u64,
}
