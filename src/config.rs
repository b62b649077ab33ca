//! Synth Configuration
//!
//! [`SynthConfig`] describes a complete polyphonic synth: audio settings, pool
//! size and the voice preset. [`SynthConfig::build`] turns it into the
//! realtime [`Engine`], its control [`EngineHandle`] and the [`VoicePool`]
//! used to play notes.

use crate::context::AudioContext;
use crate::engine::{Engine, EngineHandle};
use crate::graph::{Graph, GraphError};
use crate::modules::Gain;
use crate::polyphony::{VoiceParams, VoicePool};
use serde::{Deserialize, Serialize};

/// Error types for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    InvalidSampleRate(f32),
    InvalidBlockSize(usize),
    InvalidVoiceCount(usize),
    InvalidQueueCapacity(usize),
    Graph(GraphError),
    #[cfg(feature = "json")]
    Json(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidSampleRate(rate) => write!(f, "Invalid sample rate: {}", rate),
            ConfigError::InvalidBlockSize(size) => write!(f, "Invalid block size: {}", size),
            ConfigError::InvalidVoiceCount(count) => write!(f, "Invalid voice count: {}", count),
            ConfigError::InvalidQueueCapacity(capacity) => {
                write!(f, "Invalid command queue capacity: {}", capacity)
            }
            ConfigError::Graph(err) => write!(f, "Graph error: {}", err),
            #[cfg(feature = "json")]
            ConfigError::Json(err) => write!(f, "JSON error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Graph(err) => Some(err),
            #[cfg(feature = "json")]
            ConfigError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GraphError> for ConfigError {
    fn from(err: GraphError) -> Self {
        ConfigError::Graph(err)
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

/// Complete synth description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    pub sample_rate: f32,
    /// Largest block the driver will request; buffers are pre-grown to it
    pub max_block_size: usize,
    pub voices: usize,
    /// Slots in the control-to-audio command queue
    pub command_capacity: usize,
    /// Gain of the output stage after the voice pool
    pub master_gain: f32,
    pub voice: VoiceParams,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            max_block_size: 512,
            voices: 32,
            command_capacity: 256,
            master_gain: 0.5,
            voice: VoiceParams::default(),
        }
    }
}

/// The two halves of a built synth plus its voice pool
pub struct Synth {
    pub engine: Engine,
    pub handle: EngineHandle,
    pub voices: VoicePool,
}

impl SynthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.max_block_size == 0 {
            return Err(ConfigError::InvalidBlockSize(self.max_block_size));
        }
        if self.voices == 0 {
            return Err(ConfigError::InvalidVoiceCount(self.voices));
        }
        if self.command_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(self.command_capacity));
        }
        Ok(())
    }

    /// Build the engine, its handle and the voice pool
    pub fn build(&self) -> Result<Synth, ConfigError> {
        if let Err(err) = self.validate() {
            tracing::warn!(%err, "rejecting synth configuration");
            return Err(err);
        }

        let mut graph = Graph::new();
        let voices = VoicePool::build(&mut graph, self.voices, &self.voice)?;
        let master = graph.add("master", Gain::new(self.master_gain));
        graph.connect(voices.output(), master)?;

        let context = AudioContext::new(self.sample_rate);
        let (mut engine, handle) = Engine::new(context, graph, master, self.command_capacity);
        engine.prepare(self.max_block_size);

        tracing::info!(
            sample_rate = self.sample_rate,
            voices = self.voices,
            max_block_size = self.max_block_size,
            command_capacity = self.command_capacity,
            "synth built"
        );
        Ok(Synth {
            engine,
            handle,
            voices,
        })
    }

    /// Load from a JSON string; missing fields take their defaults
    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SynthConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Render;

    #[test]
    fn test_default_config_is_valid() {
        let config = SynthConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.voices, 32);
        assert_eq!(config.master_gain, 0.5);
    }

    #[test]
    fn test_validation_errors() {
        let config = SynthConfig {
            sample_rate: 0.0,
            ..SynthConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSampleRate(_))));

        let config = SynthConfig {
            voices: 0,
            ..SynthConfig::default()
        };
        assert!(matches!(config.build(), Err(ConfigError::InvalidVoiceCount(0))));

        let config = SynthConfig {
            max_block_size: 0,
            ..SynthConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBlockSize(0))));

        let config = SynthConfig {
            command_capacity: 0,
            ..SynthConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQueueCapacity(0))
        ));
    }

    #[test]
    fn test_build_presizes_buffers() {
        let config = SynthConfig {
            voices: 4,
            max_block_size: 1024,
            ..SynthConfig::default()
        };
        let synth = config.build().unwrap();
        let graph = synth.engine.graph();
        // 9 nodes per voice, the pool mixer and the master gain
        assert_eq!(graph.len(), 4 * 9 + 2);
        assert_eq!(graph.buffer_capacity(synth.engine.root()), Some(1024));
        assert_eq!(synth.voices.len(), 4);
    }

    #[test]
    fn test_built_synth_plays_notes() {
        let config = SynthConfig {
            voices: 2,
            voice: VoiceParams::default().with_envelope(0.0, 0.0, 1.0, 0.0),
            ..SynthConfig::default()
        };
        let Synth {
            mut engine,
            voices: mut pool,
            ..
        } = config.build().unwrap();

        assert!(engine.render(256).iter().all(|&s| s == 0.0));
        pool.note_on(60);
        let block = engine.render(256);
        assert!(block.iter().any(|&s| s != 0.0));
        // Master gain of 0.5 over at most 0.9 + 0.6 (+ tremolo) per voice
        assert!(block.iter().all(|&s| s.abs() <= 0.5 * 1.7));
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_config() {
        use crate::modules::Waveform;

        let config = SynthConfig::from_json(
            r#"{
                "sample_rate": 48000.0,
                "voices": 8,
                "voice": { "mod_waveform": "triangle", "envelope": { "release": 0.25 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.sample_rate, 48000.0);
        assert_eq!(config.voices, 8);
        assert_eq!(config.max_block_size, 512);
        assert_eq!(config.voice.mod_waveform, Waveform::Triangle);
        assert_eq!(config.voice.envelope.release, 0.25);

        let reloaded = SynthConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_rejects_invalid() {
        assert!(matches!(
            SynthConfig::from_json(r#"{ "voices": 0 }"#),
            Err(ConfigError::InvalidVoiceCount(0))
        ));
        assert!(matches!(
            SynthConfig::from_json("not json"),
            Err(ConfigError::Json(_))
        ));
    }
}
