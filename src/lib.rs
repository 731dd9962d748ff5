pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod nats;
pub mod session;
mod sync;

pub use audio::{
    AudioFormat, AudioFrame, AudioPipeline, EngineKind, EngineMode, EngineProvider, EnhanceParams,
    EnhancementEngine, PipelineConfig,
};
pub use config::Config;
pub use error::{ConfigError, JoinError, StreamTerminationError, SubscriptionError, TransformError};
pub use http::{create_router, AppState};
pub use nats::NatsSessionProtocol;
pub use session::{
    DerivedTrack, JwtIssuer, ParticipantTracker, SessionProtocol, SessionSupervisor,
    SupervisorSettings, SupervisorSnapshot, TrackPublisher,
};
