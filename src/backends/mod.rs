pub mod device;
pub mod espeak;
pub mod neural;
pub mod piper;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Neural voices offered to the user.
pub const NEURAL_VOICES: &[&str] = &["en_US-hfc_female-medium", "en_US-hfc_male-medium"];
pub const DEFAULT_NEURAL_VOICE: &str = "en_US-hfc_female-medium";

/// Represents a text-to-speech voice
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub language: String,
}

/// Which synthesis backend is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMethod {
    #[default]
    Device,
    Neural,
}

impl FromStr for VoiceMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "device" | "built-in" => Ok(VoiceMethod::Device),
            "neural" | "vits-web" => Ok(VoiceMethod::Neural),
            other => Err(format!("unknown voice method: {}", other)),
        }
    }
}

impl fmt::Display for VoiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceMethod::Device => f.write_str("device"),
            VoiceMethod::Neural => f.write_str("neural"),
        }
    }
}

/// Bytes transferred so far for one downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub url: String,
    pub loaded: u64,
    /// Zero when the server did not announce a length.
    pub total: u64,
}

impl DownloadProgress {
    /// Rounded percentage, or `None` when the total is unknown.
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let pct = (self.loaded.min(self.total) as f64 * 100.0 / self.total as f64).round();
        Some(pct as u8)
    }
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("speech platform error: {0}")]
    Speech(String),

    #[error("voice download failed: {0}")]
    Download(String),

    #[error("voice {0} not found in catalog")]
    UnknownVoice(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("audio playback failed: {0}")]
    Playback(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VoiceError {
    fn from(e: std::io::Error) -> Self {
        VoiceError::Io(e.to_string())
    }
}

/// Capability shared by every synthesis backend. The coordinator only talks
/// to backends through this trait.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Prepares `voice_id`. Backends that download assets report progress through `on_progress`.
    async fn initialize(&self, voice_id: &str, on_progress: Option<ProgressCallback>) -> Result<(), VoiceError>;

    /// Resolves once the utterance has finished playing, or was stopped.
    async fn speak(&self, text: &str, voice_id: &str) -> Result<(), VoiceError>;

    /// Halts any audio in flight. A no-op when nothing is playing.
    async fn stop(&self);

    fn is_ready(&self) -> bool;

    /// The voice currently initialized, for backends that cache one.
    fn current_voice(&self) -> Option<String>;
}
