// src/audio/config.rs
// Driver configuration loaded from TOML

use std::path::Path;

use serde::Deserialize;

use super::error::ConfigError;

/// Which hardware abstraction opens the cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpal,
    Alsa,
    Memory,
}

/// Whether the engines run on their own threads or are stepped by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Threaded,
    Freewheel,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub sample_rate: u32,
    /// Largest accepted distance between requested and negotiated rate, in Hz.
    pub sample_rate_tolerance: u32,
    /// Frames per period requested from hardware.
    pub period_size: usize,
    pub period_quantity: u32,
    /// Aggregate channel count requested per PCM; defaults to two per port.
    pub channels_per_pcm: Option<u16>,
    pub max_cards: usize,
    pub max_ports: usize,
    pub max_streams: usize,
    /// Capacity in bytes of each play and record ring.
    pub ring_buffer_size: usize,
    pub fade_interval_ms: u32,
    pub meter_window_ms: u32,
    pub backend: BackendKind,
    /// ALSA device name; `{card}` is replaced by the card index.
    pub alsa_device_pattern: String,
    pub engine_mode: EngineMode,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            sample_rate_tolerance: 100,
            period_size: 256,
            period_quantity: 4,
            channels_per_pcm: None,
            max_cards: 8,
            max_ports: 8,
            max_streams: 32,
            ring_buffer_size: 262_144,
            fade_interval_ms: 10,
            meter_window_ms: 330,
            backend: BackendKind::default(),
            alsa_device_pattern: "rd{card}".to_string(),
            engine_mode: EngineMode::default(),
        }
    }
}

impl DriverConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.sample_rate == 0 {
            return invalid("sample_rate must be positive");
        }
        if self.period_size == 0 || self.period_quantity == 0 {
            return invalid("period_size and period_quantity must be positive");
        }
        if self.max_ports == 0 || self.max_streams == 0 {
            return invalid("max_ports and max_streams must be positive");
        }
        if self.fade_interval_ms == 0 {
            return invalid("fade_interval_ms must be positive");
        }
        if self.ring_buffer_size < 4 * self.period_size {
            return invalid("ring_buffer_size must hold at least one stereo 16-bit period");
        }
        if self.ring_buffer_size % 8 != 0 {
            return invalid("ring_buffer_size must be a multiple of 8 bytes");
        }
        Ok(())
    }

    /// Channel count requested from each PCM.
    pub fn aggregate_channels(&self) -> u16 {
        self.channels_per_pcm
            .unwrap_or_else(|| (2 * self.max_ports).min(u16::MAX as usize) as u16)
    }

    /// Number of periods averaged by each peak meter at the given geometry.
    pub fn meter_window_periods(&self, sample_rate: u32, period_frames: usize) -> usize {
        let periods = self.meter_window_ms as u64 * sample_rate as u64
            / (1000 * period_frames.max(1) as u64);
        (periods as usize).max(1)
    }

    pub fn alsa_device_name(&self, card: usize) -> String {
        self.alsa_device_pattern.replace("{card}", &card.to_string())
    }
}
