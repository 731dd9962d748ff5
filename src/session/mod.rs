//! Session management
//!
//! This module provides everything between the transport and the audio
//! pipeline:
//! - Transport traits (`SessionProtocol`, `SessionConnection`, `TrackSink`)
//! - Join credentials
//! - Processing claims (one pipeline per participant)
//! - Derived track publishing
//! - The session supervisor and its status snapshot

pub mod credentials;
pub mod protocol;
pub mod publisher;
mod stats;
pub mod supervisor;
pub mod tracker;
mod worker;

pub use credentials::{Credential, CredentialIssuer, JwtIssuer, SessionGrants};
pub use protocol::{
    FrameStream, RemoteParticipant, SessionConnection, SessionEvent, SessionInfo, SessionProtocol,
    TrackInfo, TrackKind, TrackSink, TrackSpec,
};
pub use publisher::{derived_track_name, DerivedTrack, TrackPublisher, DERIVED_TRACK_SUFFIX};
pub use stats::{PipelineSnapshot, SessionSnapshot, SupervisorSnapshot};
pub use supervisor::{SessionSupervisor, SupervisorSettings};
pub use tracker::{Claim, ClaimKey, ParticipantTracker};
