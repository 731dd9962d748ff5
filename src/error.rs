//! Error taxonomy for the relay.
//!
//! Each kind is contained at the smallest scope that can absorb it: a
//! `TransformError` stays inside one frame, a `StreamTerminationError` inside
//! one pipeline, a `JoinError` inside one discovery cycle. Only `ConfigError`
//! is fatal, and only at startup.

use thiserror::Error;

/// Failure to join a session. Retried on the next discovery cycle.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("failed to issue credential for session {session}: {reason}")]
    Credential { session: String, reason: String },

    #[error("failed to connect to session {session}")]
    Connect {
        session: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("session {0} is already joined")]
    AlreadyJoined(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// A subscribed track never became deliverable.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription request for {participant}/{track} failed")]
    Request {
        participant: String,
        track: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("track {participant}/{track} is not deliverable yet")]
    NotDeliverable { participant: String, track: String },
}

/// The enhancement engine failed on a single buffer.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("engine rejected buffer: {0}")]
    Engine(String),

    #[error("engine returned {got} samples, frame needs {needed}")]
    ShortOutput { got: usize, needed: usize },
}

/// The source track of a pipeline ended or failed.
#[derive(Debug, Error)]
pub enum StreamTerminationError {
    #[error("source track ended")]
    Ended,

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("derived track rejected a frame")]
    Sink(#[source] anyhow::Error),
}

/// Invalid or missing configuration, detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),
}
