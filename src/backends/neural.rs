//! Neural voice backend: download-gated, produces audio buffers.

use super::{ProgressCallback, SynthesisBackend, VoiceError};
use crate::engine::AudioSink;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// The model runtime: fetches voice assets into its own persistent cache and
/// turns text into WAV audio.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Returns once `voice_id` is cached locally. Already cached voices return
    /// without reporting progress.
    async fn download(&self, voice_id: &str, on_progress: Option<ProgressCallback>) -> Result<(), VoiceError>;

    async fn predict(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, VoiceError>;
}

pub struct NeuralVoice {
    engine: Arc<dyn InferenceEngine>,
    sink: Arc<dyn AudioSink>,
    initialized: RwLock<Option<String>>,
    // Bumped by stop(); a prediction that finishes under an old epoch is discarded
    epoch: AtomicU64,
}

impl NeuralVoice {
    pub fn new(engine: Arc<dyn InferenceEngine>, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            engine,
            sink,
            initialized: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SynthesisBackend for NeuralVoice {
    async fn initialize(&self, voice_id: &str, on_progress: Option<ProgressCallback>) -> Result<(), VoiceError> {
        if self.initialized.read().as_deref() == Some(voice_id) {
            return Ok(());
        }

        info!(voice = voice_id, "preparing neural voice");
        self.engine.download(voice_id, on_progress).await?;
        *self.initialized.write() = Some(voice_id.to_string());
        info!(voice = voice_id, "neural voice ready");
        Ok(())
    }

    async fn speak(&self, text: &str, voice_id: &str) -> Result<(), VoiceError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let wav = self.engine.predict(text, voice_id).await?;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(text, "discarding audio stopped during synthesis");
            return Ok(());
        }
        self.sink.play(wav).await
    }

    async fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
    }

    fn is_ready(&self) -> bool {
        self.initialized.read().is_some()
    }

    fn current_voice(&self) -> Option<String> {
        self.initialized.read().clone()
    }
}
