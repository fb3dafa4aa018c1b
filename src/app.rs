//! Wires settings into a ready-to-use store and voice stack.

use crate::backends::device::{DeviceVoice, SpeechParams, SpeechPlatform};
use crate::backends::espeak::EspeakPlatform;
use crate::backends::neural::NeuralVoice;
use crate::backends::piper::PiperEngine;
use crate::backends::{Voice, VoiceError, NEURAL_VOICES};
use crate::config_loader::Settings;
use crate::coordinator::VoiceCoordinator;
use crate::engine::RodioSink;
use crate::persistence::{PersistenceService, SCHEMA};
use crate::store::{StoreError, StructuredStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("voice error: {0}")]
    Voice(#[from] VoiceError),
    #[error("{0}")]
    Invalid(String),
}

pub struct AppContext {
    pub settings: Settings,
    pub persistence: PersistenceService,
    pub voice: VoiceCoordinator,
    platform: Arc<EspeakPlatform>,
    piper: Arc<PiperEngine>,
}

impl AppContext {
    pub fn from_settings(settings: Settings) -> Result<Self, AppError> {
        settings.validate()?;

        let store = StructuredStore::new(&settings.data_dir, SCHEMA).with_reset_retry_delay(settings.reset_retry());
        let persistence = PersistenceService::new(store);

        let platform = Arc::new(EspeakPlatform::new(&settings.espeak_binary, settings.speech_timeout()));
        let device = DeviceVoice::new(platform.clone(), &settings.voice_locale)
            .with_params(SpeechParams {
                rate: settings.speech_rate,
                pitch: settings.speech_pitch,
                volume: settings.speech_volume,
            })
            .with_catalog_retry(settings.catalog_retry());

        let piper = Arc::new(PiperEngine::new(
            &settings.piper_binary,
            &settings.models_dir,
            &settings.voice_repository_url,
            settings.download_connect_timeout(),
        )?);
        let neural = NeuralVoice::new(piper.clone(), Arc::new(RodioSink::new()));

        let voice = VoiceCoordinator::new(Arc::new(device), Arc::new(neural), settings.method()?);
        info!(
            data_dir = %settings.data_dir,
            method = %voice.method(),
            "spellfun context ready"
        );

        Ok(Self {
            settings,
            persistence,
            voice,
            platform,
            piper,
        })
    }

    pub fn load() -> Result<Self, AppError> {
        Self::from_settings(Settings::new()?)
    }

    /// The configured voice id for the active method: the neural voice id, or
    /// an empty preference so device selection falls back to the locale.
    pub fn default_voice_id(&self) -> &str {
        match self.voice.method() {
            crate::backends::VoiceMethod::Neural => &self.settings.voice_id,
            crate::backends::VoiceMethod::Device => "",
        }
    }

    pub async fn device_voices(&self) -> Vec<Voice> {
        self.platform.voices().await
    }

    /// Bundled neural voices, marking the ones already cached on disk.
    pub fn neural_voices(&self) -> Vec<(Voice, bool)> {
        NEURAL_VOICES
            .iter()
            .map(|id| {
                let voice = Voice {
                    id: id.to_string(),
                    name: id.to_string(),
                    language: id.split('-').next().unwrap_or_default().to_string(),
                };
                (voice, self.piper.is_cached(id))
            })
            .collect()
    }

    pub async fn downloadable_voices(&self) -> Result<Vec<Voice>, AppError> {
        Ok(self.piper.list_downloadable_voices().await?)
    }
}
