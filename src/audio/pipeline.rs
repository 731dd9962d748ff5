// Per-participant enhancement pipeline
//
// Raw frames are appended to a rolling float buffer. Until the buffer holds
// the minimum context the pipeline emits silence of the input frame's length.
// From then on every frame runs the engine over the whole buffer, emits the
// first `len(frame)` samples of its output and drops `len(frame)` samples from
// the front of the buffer. The drain amount never depends on the engine, so
// output cadence and memory stay fixed for the life of the stream.

use std::sync::Arc;
use tracing::{debug, warn};

use super::convert;
use super::engine::{EnhanceParams, EnhancementEngine};
use super::frame::AudioFormat;
use crate::error::TransformError;

/// Cadence and tuning of a pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub format: AudioFormat,
    /// Expected samples per frame, all channels
    pub frame_samples: usize,
    /// Buffered samples required before the engine runs
    pub min_context_samples: usize,
    pub post_gain: f32,
    pub attenuation_limit_db: f32,
}

/// What happened to one ingested frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not enough context yet, silence emitted
    Priming,
    /// Engine output emitted
    Enhanced,
    /// Engine failed, the raw frame was passed through
    Passthrough,
}

/// Running totals for one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub frames_in: u64,
    pub priming: u64,
    pub enhanced: u64,
    pub passthrough: u64,
}

pub struct AudioPipeline {
    config: PipelineConfig,
    engine: Arc<dyn EnhancementEngine>,
    params: EnhanceParams,
    buffer: Vec<f32>,
    counters: PipelineCounters,
}

impl AudioPipeline {
    pub fn new(config: PipelineConfig, engine: Arc<dyn EnhancementEngine>) -> Self {
        let params = EnhanceParams {
            sample_rate: config.format.sample_rate,
            channels: config.format.channels,
            attenuation_limit_db: config.attenuation_limit_db,
        };

        debug!(
            "Audio pipeline initialized: {}Hz, {} channels, {} sample frames, {} sample context, engine {}",
            config.format.sample_rate,
            config.format.channels,
            config.frame_samples,
            config.min_context_samples,
            engine.name()
        );

        Self {
            buffer: Vec::with_capacity(config.min_context_samples + config.frame_samples),
            config,
            engine,
            params,
            counters: PipelineCounters::default(),
        }
    }

    /// Feed one frame and return the frame to publish, always of equal length
    pub fn ingest(&mut self, samples: &[i16]) -> Vec<i16> {
        self.process(samples).0
    }

    /// Like [`ingest`](Self::ingest), also reporting how the frame was produced
    pub fn process(&mut self, samples: &[i16]) -> (Vec<i16>, FrameOutcome) {
        self.counters.frames_in += 1;

        let frame_len = samples.len();
        convert::extend_normalized(&mut self.buffer, samples);

        if self.buffer.len() < self.config.min_context_samples {
            self.counters.priming += 1;
            return (vec![0; frame_len], FrameOutcome::Priming);
        }

        let result = self.transform(frame_len);

        // The buffer always holds the frame just appended, so this never underflows
        self.buffer.drain(..frame_len);

        match result {
            Ok(enhanced) => {
                self.counters.enhanced += 1;
                (enhanced, FrameOutcome::Enhanced)
            }
            Err(e) => {
                warn!("Enhancement failed, passing raw frame through: {}", e);
                self.counters.passthrough += 1;
                (samples.to_vec(), FrameOutcome::Passthrough)
            }
        }
    }

    fn transform(&self, frame_len: usize) -> Result<Vec<i16>, TransformError> {
        let output = self.engine.enhance(&self.buffer, &self.params)?;

        if output.len() < frame_len {
            return Err(TransformError::ShortOutput {
                got: output.len(),
                needed: frame_len,
            });
        }

        Ok(convert::to_pcm(&output[..frame_len], self.config.post_gain))
    }

    /// Samples currently held in the rolling buffer
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::PassthroughEngine;

    fn config(frame: usize, context: usize) -> PipelineConfig {
        PipelineConfig {
            format: AudioFormat {
                sample_rate: 48000,
                channels: 1,
            },
            frame_samples: frame,
            min_context_samples: context,
            post_gain: 1.0,
            attenuation_limit_db: 100.0,
        }
    }

    #[test]
    fn test_primes_with_silence() {
        let mut pipeline = AudioPipeline::new(config(4, 12), Arc::new(PassthroughEngine));

        for _ in 0..2 {
            let out = pipeline.ingest(&[100, 200, 300, 400]);
            assert_eq!(out, vec![0; 4]);
        }
        assert_eq!(pipeline.buffered_len(), 8);
        assert_eq!(pipeline.counters().priming, 2);
    }

    #[test]
    fn test_passthrough_engine_delays_by_context() {
        let mut pipeline = AudioPipeline::new(config(2, 6), Arc::new(PassthroughEngine));

        assert_eq!(pipeline.ingest(&[1, 2]), vec![0, 0]);
        assert_eq!(pipeline.ingest(&[3, 4]), vec![0, 0]);
        // Context reached: the oldest frame comes out first
        assert_eq!(pipeline.ingest(&[5, 6]), vec![1, 2]);
        assert_eq!(pipeline.buffered_len(), 4);
        assert_eq!(pipeline.ingest(&[7, 8]), vec![3, 4]);
        assert_eq!(pipeline.buffered_len(), 4);
    }

    #[test]
    fn test_empty_frame_yields_empty_output() {
        let mut pipeline = AudioPipeline::new(config(2, 2), Arc::new(PassthroughEngine));
        pipeline.ingest(&[1, 2]);
        let (out, outcome) = pipeline.process(&[]);
        assert!(out.is_empty());
        assert_eq!(outcome, FrameOutcome::Priming);
        assert_eq!(pipeline.buffered_len(), 0);
    }
}
