use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::error::TransformError;

/// Parameters handed to the engine alongside each buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhanceParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// How far noise may be pulled down, in dB. Higher is more aggressive.
    pub attenuation_limit_db: f32,
}

/// Noise enhancement engine
///
/// Implementations transform a window of normalized samples and return a
/// buffer whose leading samples line up with the input. The relay only reads
/// the first frame's worth of the output.
///
/// Implementations must be reentrant: in shared mode one instance serves
/// every pipeline concurrently.
pub trait EnhancementEngine: Send + Sync {
    fn enhance(&self, buffer: &[f32], params: &EnhanceParams) -> Result<Vec<f32>, TransformError>;

    /// Engine name for logging
    fn name(&self) -> &str;
}

/// Built-in engine implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Returns the input unchanged
    Passthrough,
    /// Block RMS gate
    NoiseGate,
}

/// Whether pipelines share one engine instance or each build their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Shared,
    PerPipeline,
}

/// Engine factory
pub struct EngineFactory;

impl EngineFactory {
    pub fn create(kind: EngineKind) -> Arc<dyn EnhancementEngine> {
        match kind {
            EngineKind::Passthrough => Arc::new(PassthroughEngine),
            EngineKind::NoiseGate => Arc::new(NoiseGateEngine::default()),
        }
    }
}

type BuildEngine = dyn Fn() -> Arc<dyn EnhancementEngine> + Send + Sync;

/// Hands engine instances to pipelines according to the configured mode
#[derive(Clone)]
pub struct EngineProvider {
    mode: EngineMode,
    build: Arc<BuildEngine>,
    shared: Option<Arc<dyn EnhancementEngine>>,
}

impl EngineProvider {
    pub fn new(kind: EngineKind, mode: EngineMode) -> Self {
        Self::from_fn(mode, move || EngineFactory::create(kind))
    }

    /// Provider over a custom engine constructor
    pub fn from_fn<F>(mode: EngineMode, build: F) -> Self
    where
        F: Fn() -> Arc<dyn EnhancementEngine> + Send + Sync + 'static,
    {
        let shared = match mode {
            EngineMode::Shared => {
                let engine = build();
                info!("Loaded shared enhancement engine: {}", engine.name());
                Some(engine)
            }
            EngineMode::PerPipeline => None,
        };

        Self {
            mode,
            build: Arc::new(build),
            shared,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn engine(&self) -> Arc<dyn EnhancementEngine> {
        match &self.shared {
            Some(engine) => Arc::clone(engine),
            None => {
                let engine = (self.build)();
                info!("Loaded enhancement engine for pipeline: {}", engine.name());
                engine
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PassthroughEngine;

impl EnhancementEngine for PassthroughEngine {
    fn enhance(&self, buffer: &[f32], _params: &EnhanceParams) -> Result<Vec<f32>, TransformError> {
        Ok(buffer.to_vec())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Gate that attenuates quiet blocks
///
/// The buffer is split into fixed hops (10ms at 48kHz). A hop whose RMS is
/// under the threshold is scaled by `10^(-attenuation_limit_db / 20)`.
#[derive(Debug, Clone)]
pub struct NoiseGateEngine {
    pub hop_size: usize,
    /// Gate threshold in dBFS
    pub threshold_db: f32,
}

impl Default for NoiseGateEngine {
    fn default() -> Self {
        Self {
            hop_size: 480,
            threshold_db: -45.0,
        }
    }
}

impl EnhancementEngine for NoiseGateEngine {
    fn enhance(&self, buffer: &[f32], params: &EnhanceParams) -> Result<Vec<f32>, TransformError> {
        if self.hop_size == 0 {
            return Err(TransformError::Engine("hop size is zero".to_string()));
        }

        let threshold = 10f32.powf(self.threshold_db / 20.0);
        let floor = 10f32.powf(-params.attenuation_limit_db / 20.0);

        let mut out = Vec::with_capacity(buffer.len());
        for hop in buffer.chunks(self.hop_size) {
            let energy: f32 = hop.iter().map(|s| s * s).sum::<f32>() / hop.len() as f32;
            let gain = if energy.sqrt() < threshold { floor } else { 1.0 };
            out.extend(hop.iter().map(|s| s * gain));
        }

        Ok(out)
    }

    fn name(&self) -> &str {
        "noise_gate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: EnhanceParams = EnhanceParams {
        sample_rate: 48000,
        channels: 1,
        attenuation_limit_db: 100.0,
    };

    #[test]
    fn test_noise_gate_mutes_quiet_hops() {
        let engine = NoiseGateEngine {
            hop_size: 4,
            threshold_db: -40.0,
        };
        let mut buffer = vec![0.001; 4];
        buffer.extend([0.5, -0.5, 0.5, -0.5]);

        let out = engine.enhance(&buffer, &PARAMS).unwrap();

        assert_eq!(out.len(), 8);
        assert!(out[..4].iter().all(|s| s.abs() < 1e-7));
        assert_eq!(&out[4..], &buffer[4..]);
    }

    #[test]
    fn test_noise_gate_attenuation_limit() {
        let engine = NoiseGateEngine {
            hop_size: 2,
            threshold_db: -20.0,
        };
        let params = EnhanceParams {
            attenuation_limit_db: 20.0,
            ..PARAMS
        };

        let out = engine.enhance(&[0.01, 0.01], &params).unwrap();
        assert!((out[0] - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_shared_provider_reuses_instance() {
        let provider = EngineProvider::new(EngineKind::Passthrough, EngineMode::Shared);
        assert!(Arc::ptr_eq(&provider.engine(), &provider.engine()));
    }

    #[test]
    fn test_per_pipeline_provider_builds_fresh_instances() {
        let provider = EngineProvider::new(EngineKind::NoiseGate, EngineMode::PerPipeline);
        assert!(!Arc::ptr_eq(&provider.engine(), &provider.engine()));
    }
}
