use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::audio::{AudioFormat, EngineKind, EngineMode, PipelineConfig};
use crate::error::ConfigError;

/// Environment variables understood for compatibility with older deployments.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("LIVEKIT_URL", "session.url"),
    ("LIVEKIT_API_KEY", "session.api_key"),
    ("LIVEKIT_API_SECRET", "session.api_secret"),
    ("POST_GAIN", "audio.post_gain"),
    ("ATTENUATION_LIMIT", "audio.attenuation_limit_db"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "denoise-relay".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Where and as whom the relay joins sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session endpoint (the NATS server for the bundled transport)
    pub url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Prefix of the relay's own identity; participants carrying it are never processed
    pub identity_prefix: String,
    /// Explicit sessions to join. Empty means discover.
    pub rooms: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            api_key: None,
            api_secret: None,
            identity_prefix: "deepfilter-agent".to_string(),
            rooms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per frame, all channels interleaved
    pub frame_samples: usize,
    pub min_context_ms: u64,
    pub post_gain: f32,
    pub attenuation_limit_db: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_samples: 480, // 10ms at 48kHz
            min_context_ms: 1000,
            post_gain: 1.0,
            attenuation_limit_db: 100.0,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Minimum buffered samples (all channels) before the engine runs
    pub fn min_context_samples(&self) -> usize {
        (self.sample_rate as u64 * self.channels as u64 * self.min_context_ms / 1000) as usize
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub mode: EngineMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::NoiseGate,
            mode: EngineMode::Shared,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    /// Discovery runs on every Nth poll cycle
    pub discovery_every: u64,
    /// Wait after requesting a subscription before trusting the track
    pub subscribe_delay_ms: u64,
    /// Grace period for each pipeline to stop when leaving a session
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            discovery_every: 6,
            subscribe_delay_ms: 500,
            stop_timeout_ms: 5000,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Config {
    /// Load from a TOML file (optional) layered with `DENOISE_RELAY__*` and legacy env vars
    pub fn load(path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("DENOISE_RELAY").separator("__"));

        Self::finish(Self::with_legacy_env(builder)?)
    }

    /// Load from an in-memory TOML document, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));

        Self::finish(builder)
    }

    fn with_legacy_env(
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        for (var, key) in LEGACY_ENV {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        if let Ok(rooms) = std::env::var("LIVEKIT_ROOMS") {
            let rooms = parse_room_list(&rooms);
            if !rooms.is_empty() {
                builder = builder.set_override("session.rooms", rooms)?;
            }
        }

        Ok(builder)
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings = builder.build().map_err(ConfigError::from)?;
        let cfg: Config = settings.try_deserialize().map_err(ConfigError::from)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.url.trim().is_empty() {
            return Err(ConfigError::Missing("session.url"));
        }
        if session.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("session.api_key"));
        }
        if session.api_secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("session.api_secret"));
        }
        if session.identity_prefix.is_empty() {
            return Err(ConfigError::Missing("session.identity_prefix"));
        }

        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if audio.channels == 0 {
            return Err(invalid("audio.channels", "must be positive"));
        }
        if audio.frame_samples == 0 || audio.frame_samples % audio.channels as usize != 0 {
            return Err(invalid(
                "audio.frame_samples",
                format!("must be a positive multiple of {} channels", audio.channels),
            ));
        }
        if audio.min_context_samples() < audio.frame_samples {
            return Err(invalid(
                "audio.min_context_ms",
                format!(
                    "{}ms is shorter than one {}-sample frame",
                    audio.min_context_ms, audio.frame_samples
                ),
            ));
        }
        if !audio.post_gain.is_finite() || audio.post_gain <= 0.0 {
            return Err(invalid("audio.post_gain", "must be a positive number"));
        }
        if !audio.attenuation_limit_db.is_finite() || audio.attenuation_limit_db < 0.0 {
            return Err(invalid("audio.attenuation_limit_db", "must not be negative"));
        }

        if self.supervisor.poll_interval_ms == 0 {
            return Err(invalid("supervisor.poll_interval_ms", "must be positive"));
        }
        if self.supervisor.discovery_every == 0 {
            return Err(invalid("supervisor.discovery_every", "must be positive"));
        }
        if self.supervisor.stop_timeout_ms == 0 {
            return Err(invalid("supervisor.stop_timeout_ms", "must be positive"));
        }

        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            format: self.audio.format(),
            frame_samples: self.audio.frame_samples,
            min_context_samples: self.audio.min_context_samples(),
            post_gain: self.audio.post_gain,
            attenuation_limit_db: self.audio.attenuation_limit_db,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Split a comma-separated room list, dropping blanks
pub fn parse_room_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}
