//! Device-native speech: no download, always available.

use super::{ProgressCallback, SynthesisBackend, Voice, VoiceError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One request handed to the platform speech engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// `None` lets the platform use its default voice.
    pub voice: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

/// The operating system's speech engine.
#[async_trait]
pub trait SpeechPlatform: Send + Sync {
    /// Installed voices. May be empty shortly after startup.
    async fn voices(&self) -> Vec<Voice>;

    /// Resolves when the voice catalog changes. Platforms without such a
    /// notification never resolve.
    async fn voices_changed(&self);

    /// Resolves at end of utterance, including when cancelled.
    async fn speak(&self, utterance: Utterance) -> Result<(), VoiceError>;

    fn cancel(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct SpeechParams {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for SpeechParams {
    fn default() -> Self {
        Self {
            rate: 0.8, // slightly slower for spelling practice
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

pub struct DeviceVoice {
    platform: Arc<dyn SpeechPlatform>,
    locale: String,
    params: SpeechParams,
    catalog_retry: Duration,
    selected: RwLock<Option<Voice>>,
}

impl DeviceVoice {
    pub fn new(platform: Arc<dyn SpeechPlatform>, locale: impl Into<String>) -> Self {
        Self {
            platform,
            locale: locale.into().to_lowercase(),
            params: SpeechParams::default(),
            catalog_retry: Duration::from_millis(500),
            selected: RwLock::new(None),
        }
    }

    pub fn with_params(mut self, params: SpeechParams) -> Self {
        self.params = params;
        self
    }

    /// Upper bound on waiting for an empty voice catalog to populate.
    pub fn with_catalog_retry(mut self, delay: Duration) -> Self {
        self.catalog_retry = delay;
        self
    }

    pub fn selected_voice(&self) -> Option<Voice> {
        self.selected.read().clone()
    }

    /// Explicitly requested voice first, then the locale, then anything installed.
    fn choose(&self, voices: &[Voice], requested: &str) -> Option<Voice> {
        voices
            .iter()
            .find(|v| !requested.is_empty() && v.id == requested)
            .or_else(|| {
                voices
                    .iter()
                    .find(|v| v.language.to_lowercase().starts_with(&self.locale))
            })
            .or_else(|| voices.first())
            .cloned()
    }

    async fn select_voice(&self, requested: &str) {
        let mut voices = self.platform.voices().await;
        if voices.is_empty() {
            debug!("voice catalog empty, waiting up to {:?}", self.catalog_retry);
            tokio::select! {
                _ = tokio::time::sleep(self.catalog_retry) => {}
                _ = self.platform.voices_changed() => {}
            }
            voices = self.platform.voices().await;
        }

        let chosen = self.choose(&voices, requested);
        match &chosen {
            Some(voice) => info!(voice = %voice.id, "device voice selected"),
            None => warn!("no device voice available, using platform default"),
        }
        *self.selected.write() = chosen;
    }
}

#[async_trait]
impl SynthesisBackend for DeviceVoice {
    async fn initialize(&self, voice_id: &str, _on_progress: Option<ProgressCallback>) -> Result<(), VoiceError> {
        self.select_voice(voice_id).await;
        Ok(())
    }

    async fn speak(&self, text: &str, _voice_id: &str) -> Result<(), VoiceError> {
        let utterance = Utterance {
            text: text.to_string(),
            voice: self.selected.read().as_ref().map(|v| v.id.clone()),
            rate: self.params.rate,
            pitch: self.params.pitch,
            volume: self.params.volume,
        };
        self.platform.speak(utterance).await
    }

    async fn stop(&self) {
        self.platform.cancel();
    }

    fn is_ready(&self) -> bool {
        self.selected.read().is_some()
    }

    fn current_voice(&self) -> Option<String> {
        self.selected.read().as_ref().map(|v| v.id.clone())
    }
}
