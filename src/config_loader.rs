use crate::backends::piper::PIPER_VOICES_URL;
use crate::backends::{VoiceMethod, DEFAULT_NEURAL_VOICE};
use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Storage
    pub data_dir: String,
    pub reset_retry_ms: u64,
    // Voice selection
    pub voice_method: String, // "device" or "neural"
    pub voice_id: String,     // neural voice, e.g. "en_US-hfc_female-medium"
    pub voice_locale: String, // preferred device voice language prefix
    // Device speech
    pub speech_rate: f32,
    pub speech_pitch: f32,
    pub speech_volume: f32,
    pub espeak_binary: String,
    pub catalog_retry_ms: u64,
    pub speech_timeout_secs: u64,
    // Neural voices
    pub piper_binary: String,
    pub models_dir: String,
    pub voice_repository_url: String,
    pub download_connect_timeout_secs: u64,
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spellfun")
}

impl Default for Settings {
    fn default() -> Self {
        let root = default_data_root();
        Self {
            data_dir: root.join("store").to_string_lossy().to_string(),
            reset_retry_ms: 1000,
            voice_method: "device".to_string(),
            voice_id: DEFAULT_NEURAL_VOICE.to_string(),
            voice_locale: "en".to_string(),
            speech_rate: 0.8,
            speech_pitch: 1.0,
            speech_volume: 1.0,
            espeak_binary: "espeak-ng".to_string(),
            catalog_retry_ms: 500,
            speech_timeout_secs: 30,
            piper_binary: "piper".to_string(),
            models_dir: root.join("voices").to_string_lossy().to_string(),
            voice_repository_url: PIPER_VOICES_URL.to_string(),
            download_connect_timeout_secs: 15,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            .set_default("data_dir", defaults.data_dir)?
            .set_default("reset_retry_ms", defaults.reset_retry_ms)?
            .set_default("voice_method", defaults.voice_method)?
            .set_default("voice_id", defaults.voice_id)?
            .set_default("voice_locale", defaults.voice_locale)?
            .set_default("speech_rate", defaults.speech_rate as f64)?
            .set_default("speech_pitch", defaults.speech_pitch as f64)?
            .set_default("speech_volume", defaults.speech_volume as f64)?
            .set_default("espeak_binary", defaults.espeak_binary)?
            .set_default("catalog_retry_ms", defaults.catalog_retry_ms)?
            .set_default("speech_timeout_secs", defaults.speech_timeout_secs)?
            .set_default("piper_binary", defaults.piper_binary)?
            .set_default("models_dir", defaults.models_dir)?
            .set_default("voice_repository_url", defaults.voice_repository_url)?
            .set_default(
                "download_connect_timeout_secs",
                defaults.download_connect_timeout_secs,
            )?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Spellfun").required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.config/spellfun/Spellfun",
                    std::env::var("HOME").unwrap_or_default()
                ))
                .required(false),
            )
            // Merge with environment variables (e.g. SPELLFUN_VOICE_METHOD)
            .add_source(config::Environment::with_prefix("SPELLFUN"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        self.method()?;
        if self.voice_id.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "voice_id must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speech_volume) {
            return Err(config::ConfigError::Message(format!(
                "Invalid speech_volume: {}. Must be between 0.0 and 1.0",
                self.speech_volume
            )));
        }
        for (name, value) in [("speech_rate", self.speech_rate), ("speech_pitch", self.speech_pitch)] {
            if value <= 0.0 || value > 10.0 {
                return Err(config::ConfigError::Message(format!(
                    "Invalid {}: {}. Must be in (0, 10]",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn method(&self) -> Result<VoiceMethod, config::ConfigError> {
        self.voice_method
            .parse()
            .map_err(config::ConfigError::Message)
    }

    pub fn reset_retry(&self) -> Duration {
        Duration::from_millis(self.reset_retry_ms)
    }

    pub fn catalog_retry(&self) -> Duration {
        Duration::from_millis(self.catalog_retry_ms)
    }

    pub fn speech_timeout(&self) -> Duration {
        Duration::from_secs(self.speech_timeout_secs)
    }

    pub fn download_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.download_connect_timeout_secs)
    }
}
