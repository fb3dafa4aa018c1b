use super::neural::InferenceEngine;
use super::{DownloadProgress, ProgressCallback, Voice, VoiceError};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const PIPER_VOICES_URL: &str = "https://huggingface.co/rhasspy/piper-voices/resolve/main";

/// Piper voices: assets are fetched from the voices repository into
/// `models_dir` and synthesized by the `piper` binary.
pub struct PiperEngine {
    binary_path: String,
    models_dir: PathBuf,
    repository_url: String,
    client: reqwest::Client,
}

impl PiperEngine {
    pub fn new(
        binary_path: impl Into<String>,
        models_dir: impl Into<PathBuf>,
        repository_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| VoiceError::Download(e.to_string()))?;
        Ok(Self {
            binary_path: binary_path.into(),
            models_dir: models_dir.into(),
            repository_url: repository_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn model_files(&self, voice_id: &str) -> (PathBuf, PathBuf) {
        (
            self.models_dir.join(format!("{}.onnx", voice_id)),
            self.models_dir.join(format!("{}.onnx.json", voice_id)),
        )
    }

    pub fn is_cached(&self, voice_id: &str) -> bool {
        let (onnx, config) = self.model_files(voice_id);
        onnx.exists() && config.exists()
    }

    async fn catalog(&self) -> Result<Catalog, VoiceError> {
        let url = format!("{}/voices.json", self.repository_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VoiceError::Download(format!("failed to fetch voices.json: {}", e)))?;
        resp.json()
            .await
            .map_err(|e| VoiceError::Download(format!("failed to parse voices.json: {}", e)))
    }

    /// Voices offered by the repository, sorted by language then name.
    pub async fn list_downloadable_voices(&self) -> Result<Vec<Voice>, VoiceError> {
        Ok(catalog_voices(&self.catalog().await?))
    }

    /// Streams one file to `dest` through a `.part` file, reporting progress.
    async fn fetch_file(
        &self,
        url: &str,
        dest: &Path,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<(), VoiceError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VoiceError::Download(format!("{}: {}", url, e)))?;

        let total = resp.content_length().unwrap_or(0);
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut loaded = 0u64;
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| VoiceError::Download(format!("{}: {}", url, e)))?;
            file.write_all(&chunk).await?;
            loaded += chunk.len() as u64;
            if let Some(cb) = on_progress {
                cb(DownloadProgress {
                    url: url.to_string(),
                    loaded,
                    total,
                });
            }
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await?;
        debug!(url, bytes = loaded, "file downloaded");
        Ok(())
    }
}

/// `voices.json`: voice id to catalog entry.
type Catalog = BTreeMap<String, CatalogEntry>;

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: Option<String>,
    quality: Option<String>,
    language: Option<CatalogLanguage>,
    /// Repository-relative paths; values carry sizes and checksums we ignore.
    #[serde(default)]
    files: BTreeMap<String, serde::de::IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct CatalogLanguage {
    name_english: Option<String>,
}

impl CatalogEntry {
    fn voice(&self, id: &str) -> Voice {
        Voice {
            id: id.to_string(),
            name: format!(
                "{} ({})",
                self.name.as_deref().unwrap_or(id),
                self.quality.as_deref().unwrap_or("unknown")
            ),
            language: self
                .language
                .as_ref()
                .and_then(|l| l.name_english.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Model and config paths for this voice.
    fn model_paths(&self, id: &str) -> Result<(String, String), VoiceError> {
        let onnx = self.files.keys().find(|p| p.ends_with(".onnx"));
        let config = self.files.keys().find(|p| p.ends_with(".onnx.json"));
        match (onnx, config) {
            (Some(onnx), Some(config)) => Ok((onnx.clone(), config.clone())),
            _ => Err(VoiceError::Download(format!("catalog entry for {} lacks model files", id))),
        }
    }
}

fn catalog_voices(catalog: &Catalog) -> Vec<Voice> {
    let mut voices: Vec<Voice> = catalog.iter().map(|(id, entry)| entry.voice(id)).collect();
    voices.sort_by(|a, b| a.language.cmp(&b.language).then(a.name.cmp(&b.name)));
    voices
}

fn voice_files(catalog: &Catalog, voice_id: &str) -> Result<(String, String), VoiceError> {
    catalog
        .get(voice_id)
        .ok_or_else(|| VoiceError::UnknownVoice(voice_id.to_string()))?
        .model_paths(voice_id)
}

#[async_trait]
impl InferenceEngine for PiperEngine {
    async fn download(&self, voice_id: &str, on_progress: Option<ProgressCallback>) -> Result<(), VoiceError> {
        if self.is_cached(voice_id) {
            debug!(voice = voice_id, "voice already cached");
            return Ok(());
        }

        let catalog = self.catalog().await?;
        let (onnx_path, config_path) = voice_files(&catalog, voice_id)?;
        tokio::fs::create_dir_all(&self.models_dir).await?;

        info!(voice = voice_id, "downloading voice");
        let (onnx_dest, config_dest) = self.model_files(voice_id);
        // Config last: its presence marks the voice as cached
        for (path, dest) in [(onnx_path, onnx_dest), (config_path, config_dest)] {
            let url = format!("{}/{}", self.repository_url, path);
            self.fetch_file(&url, &dest, on_progress.as_ref()).await?;
        }
        info!(voice = voice_id, "voice cached");
        Ok(())
    }

    async fn predict(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, VoiceError> {
        if !self.is_cached(voice_id) {
            return Err(VoiceError::Synthesis(format!(
                "Piper model not found locally for voice: {}. Please download it first.",
                voice_id
            )));
        }
        let (onnx_path, _config_path) = self.model_files(voice_id);

        let mut child = Command::new(&self.binary_path)
            .arg("-m")
            .arg(&onnx_path)
            .arg("--output_file")
            .arg("-") // WAV to stdout
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Synthesis(format!("failed to start {}: {}", self.binary_path, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // dropping stdin closes the pipe
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Synthesis(format!("Piper error: {}", err.trim())));
        }

        {
            let reader = hound::WavReader::new(Cursor::new(&output.stdout))
                .map_err(|e| VoiceError::Synthesis(format!("Piper produced invalid audio: {}", e)))?;
            let spec = reader.spec();
            if spec.sample_rate == 0 {
                warn!("Piper returned audio without a sample rate");
            } else {
                let secs = reader.duration() as f32 / spec.sample_rate as f32;
                debug!(voice = voice_id, secs, "synthesized");
            }
        }
        Ok(output.stdout)
    }
}
