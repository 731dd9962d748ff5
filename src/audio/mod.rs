pub mod convert;
pub mod engine;
pub mod frame;
pub mod pipeline;

pub use engine::{
    EngineFactory, EngineKind, EngineMode, EngineProvider, EnhanceParams, EnhancementEngine,
    NoiseGateEngine, PassthroughEngine,
};
pub use frame::{AudioFormat, AudioFrame};
pub use pipeline::{AudioPipeline, FrameOutcome, PipelineConfig, PipelineCounters};
